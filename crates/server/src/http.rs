//! HTTP surface.
//!
//! Routes:
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/` | banner |
//! | GET | `/healthz` | liveness |
//! | GET | `/api/v1/pods/{namespace}/{label}` | pod names matching a selector |
//! | GET | `/api/v1/sessions` | live sessions |
//! | GET | `/api/v1/terminals/{namespace}/{pod}/{container}?jwtToken=` | WebSocket terminal |

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::WireMessage;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::{JwtValidator, TokenValidator};
use crate::config::Config;
use crate::discovery::{self, DiscoveryError, WorkloadDiscovery};
use crate::exec::{ExecTarget, PtyExecutor, RemoteExecutor};
use crate::session::{
    ExecTerminal, SessionInfo, SessionRegistry, SocketSink, SocketSource, TransportError,
};

/// Body of `GET /`.
pub const BANNER: &str = "Hello! This is terminal server.\n";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub bridge: ExecTerminal,
    pub validator: Arc<dyn TokenValidator>,
    pub discovery: Arc<dyn WorkloadDiscovery>,
}

impl AppState {
    pub fn new(
        bridge: ExecTerminal,
        validator: Arc<dyn TokenValidator>,
        discovery: Arc<dyn WorkloadDiscovery>,
    ) -> Self {
        Self {
            bridge,
            validator,
            discovery,
        }
    }

    /// Wires the production collaborators described by `config`.
    pub fn from_config(config: &Config) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session.max_sessions));
        let executor: Arc<dyn RemoteExecutor> = Arc::new(PtyExecutor::from_config(&config.exec));
        let bridge = ExecTerminal::new(
            registry,
            executor,
            config.session.shells.clone(),
            config.session.initial_size(),
        );
        let validator = JwtValidator::new(
            config.auth.jwt_secret.as_bytes(),
            Duration::from_secs(config.auth.leeway_secs),
        );
        let discovery = discovery::from_config(&config.discovery, &config.exec);

        Self::new(bridge, Arc::new(validator), Arc::from(discovery))
    }
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/healthz", get(healthz))
        .route("/api/v1/pods/{namespace}/{label}", get(list_pods))
        .route("/api/v1/sessions", get(list_sessions))
        .route(
            "/api/v1/terminals/{namespace}/{pod}/{container}",
            get(open_terminal),
        )
        .with_state(state)
}

/// Serves on `listener` until `shutdown` is cancelled.
///
/// Upgraded terminals outlive their HTTP connection, so on shutdown the
/// bridge closes them separately and this returns once they are all gone.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Terminal server listening");
    }

    let bridge = state.bridge.clone();
    let closing = shutdown.clone();
    let sessions = async move {
        closing.cancelled().await;
        bridge.shutdown().await;
    };

    let server = async move {
        let served = axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await;
        // Also wind the sessions down if the server stopped on its own.
        shutdown.cancel();
        served
    };

    let (served, ()) = tokio::join!(server, sessions);
    served
}

/// Request errors.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("token is missing, invalid or expired")]
    Unauthorized,

    #[error("session limit reached")]
    SessionLimit,

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Upgrade(#[from] WebSocketUpgradeRejection),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Upgrade(rejection) = self {
            return rejection.into_response();
        }

        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::SessionLimit => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Discovery(DiscoveryError::InvalidSelector(_)) => StatusCode::BAD_REQUEST,
            ApiError::Discovery(_) => StatusCode::BAD_GATEWAY,
            ApiError::Upgrade(_) => StatusCode::BAD_REQUEST,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn banner() -> &'static str {
    BANNER
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_pods(
    State(state): State<AppState>,
    Path((namespace, label)): Path<(String, String)>,
) -> Result<Json<Vec<String>>, ApiError> {
    let pods = state.discovery.list_pods(&namespace, &label).await?;
    tracing::debug!(namespace = %namespace, selector = %label, count = pods.len(), "Listed pods");
    Ok(Json(pods))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.bridge.registry().list())
}

#[derive(Debug, Deserialize)]
struct TerminalQuery {
    #[serde(rename = "jwtToken")]
    jwt_token: Option<String>,
}

async fn open_terminal(
    State(state): State<AppState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    Query(query): Query<TerminalQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let target = ExecTarget::new(namespace, pod, container);
    tracing::info!(workload = %target, "Terminal requested");

    let authorized = query
        .jwt_token
        .as_deref()
        .is_some_and(|token| state.validator.is_valid(token));
    if !authorized {
        tracing::warn!(workload = %target, "Rejected terminal request: token is invalid or expired");
        return Err(ApiError::Unauthorized);
    }

    if !state.bridge.registry().has_capacity() {
        tracing::warn!(workload = %target, "Rejected terminal request: session limit reached");
        return Err(ApiError::SessionLimit);
    }

    let ws = ws?;
    let bridge = state.bridge.clone();
    let failed_target = target.clone();

    Ok(ws
        .on_failed_upgrade(move |e| {
            tracing::warn!(workload = %failed_target, error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| run_terminal(socket, bridge, target)))
}

async fn run_terminal(socket: WebSocket, bridge: ExecTerminal, target: ExecTarget) {
    let (sink, source) = socket.split();

    let handle = match bridge.create_session(
        target,
        Box::new(WsSink::new(sink)),
        Box::new(WsSource::new(source)),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(error = %e, "Could not create terminal session");
            return;
        }
    };

    // The orchestrator logs the outcome.
    let _ = handle.run().await;
}

/// Outbound half of an axum WebSocket.
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
    closed: bool,
}

impl WsSink {
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self {
            inner,
            closed: false,
        }
    }
}

impl SocketSink for WsSink {
    fn send(&mut self, message: WireMessage) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.closed {
                return Err(TransportError::Closed);
            }
            self.inner
                .send(Message::Binary(Bytes::from(message.encode())))
                .await
                .map_err(|e| TransportError::Send(e.to_string()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if std::mem::replace(&mut self.closed, true) {
                return Err(TransportError::Closed);
            }
            self.inner
                .close()
                .await
                .map_err(|e| TransportError::Send(e.to_string()))
        })
    }
}

/// Inbound half of an axum WebSocket.
///
/// Binary frames carry the envelope. Text frames are taken as keystrokes.
pub struct WsSource {
    inner: SplitStream<WebSocket>,
}

impl WsSource {
    pub fn new(inner: SplitStream<WebSocket>) -> Self {
        Self { inner }
    }
}

impl SocketSource for WsSource {
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<WireMessage, TransportError>>> {
        Box::pin(async move {
            loop {
                let frame = match self.inner.next().await {
                    None => return None,
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Some(Err(TransportError::Receive(e.to_string()))),
                };
                match frame {
                    Message::Binary(bytes) => {
                        return Some(WireMessage::decode(&bytes).map_err(TransportError::from))
                    }
                    Message::Text(text) => {
                        return Some(Ok(WireMessage::Data(text.as_str().as_bytes().to_vec())))
                    }
                    Message::Close(_) => return None,
                    Message::Ping(_) | Message::Pong(_) => continue,
                }
            }
        })
    }
}
