//! # podterm Server Library
//!
//! Browser terminals attached to running workload containers.
//!
//! ## Overview
//!
//! A client opens a WebSocket to
//! `/api/v1/terminals/{namespace}/{pod}/{container}?jwtToken=...`. Once the
//! token checks out, the server registers a terminal session, starts the first
//! shell that works in the target container, and relays bytes both ways until
//! either side goes away.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        http (axum)                           │
//! │   auth ─► upgrade ─► WsSink / WsSource                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                        session                               │
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │  Registry  │  │ Reader loop  │  │ ExecTerminal         │  │
//! │  │ (DashMap)  │  │ socket ─► ch │  │ shell fallback, guard│  │
//! │  └────────────┘  └──────────────┘  └──────────────────────┘  │
//! ├──────────────────────────────────────────────────────────────┤
//! │                         exec                                 │
//! │   RemoteExecutor ─► PtyExecutor (kubectl exec | local)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use server::{AppState, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let listener = tokio::net::TcpListener::bind(config.listen_addr()?).await?;
//!     server::http::serve(listener, AppState::from_config(&config), CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`auth`]: Token validation
//! - [`session`]: Terminal sessions, registry, reader loop, orchestration
//! - [`exec`]: Starting shells in containers
//! - [`discovery`]: Pod listing
//! - [`http`]: Routes and the WebSocket adapter

pub mod auth;
pub mod config;
pub mod discovery;
pub mod exec;
pub mod http;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use auth::{JwtValidator, TokenValidator};
pub use config::Config;
pub use discovery::{KubectlDiscovery, StaticDiscovery, StaticWorkload, WorkloadDiscovery};
pub use exec::{ExecError, ExecProcess, ExecTarget, PtyExecutor, PtyPeer, RemoteExecutor};
pub use http::AppState;
pub use session::{
    ExecTerminal, SessionError, SessionId, SessionRegistry, SessionState, TerminalSession,
};
