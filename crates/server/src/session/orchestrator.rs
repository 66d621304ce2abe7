//! Session orchestration.
//!
//! [`ExecTerminal`] turns an accepted socket into a running terminal:
//!
//! ```text
//! Created ──► Attaching ──► Streaming ──► Closed
//!                 │   ▲          │           ▲
//!                 │   └──────────┘           │
//!                 │  shell exited 126/127    │
//!                 │  before any input        │
//!                 └──── no shell started ────┘
//! ```
//!
//! The connection is closed and the registry entry removed exactly once,
//! whichever way the session ends. [`ExecTerminal::shutdown`] ends every live
//! session the same way.

use std::sync::Arc;

use protocol::TerminalSize;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;

use super::id::{generate_session_id, SessionId};
use super::reader::spawn_reader_loop;
use super::registry::SessionRegistry;
use super::terminal::{ClientExit, SessionFeed, SocketSink, SocketSource, TerminalSession};
use super::SessionError;
use crate::exec::{ExecError, ExecProcess, ExecTarget, PtyPeer, RemoteExecutor};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Built and registered.
    Created,
    /// Reader loop running, trying shell candidates.
    Attaching,
    /// A shell is running and bytes are flowing.
    Streaming,
    /// Connection closed and session unregistered.
    Closed,
}

/// How a streamed session ended.
#[derive(Debug)]
pub enum StreamEnd {
    /// The shell exited with this code.
    Exited(u32),
    /// The client went away first.
    ClientGone(ClientExit),
    /// The server is shutting down.
    Shutdown,
}

/// Result of a session that reached `Streaming`.
#[derive(Debug)]
pub struct SessionOutcome {
    /// The shell candidate that started.
    pub shell: String,
    /// How streaming ended.
    pub end: StreamEnd,
}

/// Creates sessions and drives them through their lifecycle.
#[derive(Clone)]
pub struct ExecTerminal {
    registry: Arc<SessionRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    shells: Arc<[String]>,
    initial_size: TerminalSize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ExecTerminal {
    /// Creates an orchestrator that tries `shells` in order.
    pub fn new(
        registry: Arc<SessionRegistry>,
        executor: Arc<dyn RemoteExecutor>,
        shells: Vec<String>,
        initial_size: TerminalSize,
    ) -> Self {
        Self {
            registry,
            executor,
            shells: shells.into(),
            initial_size,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Ends every live session and waits until each one has closed its
    /// connection and left the registry. New sessions are refused afterwards.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        tracing::info!(sessions = self.registry.len(), "Closing terminal sessions");
        self.tasks.wait().await;
    }

    /// Builds a session around an accepted socket and registers it.
    ///
    /// On error the socket halves are dropped, which closes the connection.
    pub fn create_session(
        &self,
        target: ExecTarget,
        sink: Box<dyn SocketSink>,
        source: Box<dyn SocketSource>,
    ) -> Result<SessionHandle, SessionError> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }
        let task = self.tasks.token();
        let id = generate_session_id()?;
        let (session, feed) = TerminalSession::new(id, target, sink);
        let session = Arc::new(session);

        self.registry.insert(Arc::clone(&session))?;

        let (state_tx, _) = watch::channel(SessionState::Created);

        tracing::info!(
            session_id = %session.id(),
            workload = %session.target(),
            "Created terminal session"
        );

        Ok(SessionHandle {
            session,
            source,
            feed,
            state: state_tx,
            bridge: self.clone(),
            _task: task,
        })
    }
}

/// A registered session that has not started running yet.
pub struct SessionHandle {
    session: Arc<TerminalSession>,
    source: Box<dyn SocketSource>,
    feed: SessionFeed,
    state: watch::Sender<SessionState>,
    bridge: ExecTerminal,
    _task: TaskTrackerToken,
}

impl SessionHandle {
    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        self.session.id()
    }

    /// Returns the session.
    pub fn session(&self) -> &Arc<TerminalSession> {
        &self.session
    }

    /// Subscribes to state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Runs the session to completion.
    ///
    /// Returns an error if no shell could be started or the stream failed.
    /// Either way the connection is closed and the session unregistered
    /// before this returns.
    pub async fn run(self) -> Result<SessionOutcome, SessionError> {
        let SessionHandle {
            session,
            source,
            feed,
            state,
            bridge,
            _task,
        } = self;

        let guard = SessionGuard::new(Arc::clone(&session), Arc::clone(&bridge.registry));
        let session_id = session.id().clone();

        let mut termination = session.take_termination();
        let reader = spawn_reader_loop(session_id.clone(), source, feed);

        state.send_replace(SessionState::Attaching);
        let result = attach(&bridge, &session, termination.as_mut(), &state).await;

        match &result {
            Err(SessionError::Stream(e)) => {
                // Best effort: the client may already be gone.
                let _ = session.toast(&format!("terminal session ended: {e}")).await;
            }
            Ok(SessionOutcome {
                end: StreamEnd::Shutdown,
                ..
            }) => {
                let _ = session.toast("terminal server is shutting down").await;
            }
            _ => {}
        }

        if let Err(e) = guard.release().await {
            tracing::debug!(session_id = %session_id, error = %e, "Closing connection failed");
        }
        reader.abort();
        state.send_replace(SessionState::Closed);

        match &result {
            Ok(outcome) => {
                tracing::info!(session_id = %session_id, end = ?outcome.end, "Terminal was closed")
            }
            Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Terminal session failed"),
        }

        result
    }
}

/// Tries each shell candidate in order and streams the first one that runs.
///
/// A candidate fails if it cannot be started, or if it exits as not runnable
/// before the client typed anything.
async fn attach(
    bridge: &ExecTerminal,
    session: &Arc<TerminalSession>,
    mut termination: Option<&mut oneshot::Receiver<ClientExit>>,
    state: &watch::Sender<SessionState>,
) -> Result<SessionOutcome, SessionError> {
    let mut last_error = None;

    for shell in bridge.shells.iter() {
        let command = [shell.clone()];
        let process = match bridge
            .executor
            .start(session.target(), &command, bridge.initial_size)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                tracing::debug!(
                    session_id = %session.id(),
                    shell = %shell,
                    error = %e,
                    "Shell candidate failed to start"
                );
                last_error = Some(e);
                continue;
            }
        };

        state.send_replace(SessionState::Streaming);
        tracing::info!(session_id = %session.id(), shell = %shell, "Terminal streaming");

        match stream(bridge, session, process, termination.as_deref_mut()).await {
            Err(e) if e.is_start_failure() => {
                tracing::debug!(
                    session_id = %session.id(),
                    shell = %shell,
                    error = %e,
                    "Shell candidate exited before it ran"
                );
                state.send_replace(SessionState::Attaching);
                last_error = Some(e);
            }
            Err(e) => return Err(SessionError::Stream(e)),
            Ok(end) => {
                return Ok(SessionOutcome {
                    shell: shell.clone(),
                    end,
                })
            }
        }
    }

    Err(SessionError::ShellStart {
        candidates: bridge.shells.to_vec(),
        last: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no shell candidates configured".to_string()),
    })
}

/// Streams until the process ends, the client goes away, or the server shuts
/// down.
async fn stream(
    bridge: &ExecTerminal,
    session: &Arc<TerminalSession>,
    process: Box<dyn ExecProcess>,
    termination: Option<&mut oneshot::Receiver<ClientExit>>,
) -> Result<StreamEnd, ExecError> {
    let peer: Arc<dyn PtyPeer> = Arc::clone(session) as Arc<dyn PtyPeer>;
    let streaming = process.stream(peer);
    let client_gone = async {
        match termination {
            Some(termination) => termination.await.unwrap_or(ClientExit::SessionClosed),
            None => std::future::pending::<ClientExit>().await,
        }
    };

    tokio::select! {
        result = streaming => result.map(StreamEnd::Exited),
        exit = client_gone => {
            tracing::debug!(session_id = %session.id(), exit = ?exit, "Client side ended first");
            Ok(StreamEnd::ClientGone(exit))
        }
        _ = bridge.shutdown.cancelled() => Ok(StreamEnd::Shutdown),
    }
}

/// Owns the single close of a session.
///
/// [`SessionGuard::release`] closes the connection and unregisters the
/// session. If the guard is dropped without being released (the owning task
/// was cancelled), `Drop` unregisters synchronously and schedules the close.
pub struct SessionGuard {
    session: Arc<TerminalSession>,
    registry: Arc<SessionRegistry>,
    released: bool,
}

impl SessionGuard {
    pub fn new(session: Arc<TerminalSession>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            session,
            registry,
            released: false,
        }
    }

    /// Closes the connection and removes the session from the registry.
    pub async fn release(mut self) -> Result<(), crate::session::TransportError> {
        self.released = true;
        let result = self.session.close().await;
        self.registry.remove(self.session.id());
        result
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.registry.remove(self.session.id());
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let session = Arc::clone(&self.session);
            runtime.spawn(async move {
                let _ = session.close().await;
            });
        }
    }
}
