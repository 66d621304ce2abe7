//! Terminal session bridge.
//!
//! This module owns the per-client terminal sessions: identifier generation,
//! the session object handed to the remote executor, the registry of live
//! sessions, the socket reader loop, and the orchestrator that ties them
//! together.

pub mod id;
pub mod memory;
pub mod orchestrator;
pub mod reader;
pub mod registry;
pub mod terminal;

use thiserror::Error;

use crate::exec::ExecError;

pub use id::{generate_session_id, EntropySourceError, SessionId, SESSION_ID_LEN};
pub use memory::{memory_socket, MemoryClient, MemorySink, MemorySource};
pub use orchestrator::{
    ExecTerminal, SessionGuard, SessionHandle, SessionOutcome, SessionState, StreamEnd,
};
pub use registry::{RegistryError, SessionInfo, SessionRegistry};
pub use terminal::{ClientExit, SocketSink, SocketSource, TerminalSession, TransportError};

/// Errors that end a session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No session ID could be generated.
    #[error(transparent)]
    Entropy(#[from] EntropySourceError),

    /// The session could not be registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// None of the shell candidates could be started.
    #[error("no shell could be started (tried {candidates:?}): {last}")]
    ShellStart { candidates: Vec<String>, last: String },

    /// The server is shutting down and takes no new sessions.
    #[error("terminal server is shutting down")]
    ShuttingDown,

    /// The remote command's stream failed.
    #[error("stream error: {0}")]
    Stream(ExecError),
}
