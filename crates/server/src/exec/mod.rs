//! Remote execution boundary.
//!
//! The bridge does not know how a command reaches the workload. It asks a
//! [`RemoteExecutor`] to start a command in a target container and then
//! hands the started [`ExecProcess`] a [`PtyPeer`] to stream through until
//! the command exits.

pub mod pty;

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use protocol::TerminalSize;
use thiserror::Error;

use crate::session::TransportError;

pub use pty::{ExecMode, PtyExecutor};

/// The container a terminal is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl ExecTarget {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Errors reported by a remote executor.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The command could not be started in the target.
    #[error("failed to start `{command}`: {reason}")]
    Start { command: String, reason: String },

    /// The stream to a started command failed.
    #[error("exec stream failed: {0}")]
    Stream(String),

    /// The client socket failed while streaming.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ExecError {
    pub fn start(command: impl Into<String>, reason: impl ToString) -> Self {
        Self::Start {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error happened before any streaming took place.
    pub fn is_start_failure(&self) -> bool {
        matches!(self, Self::Start { .. })
    }
}

/// The pseudo-terminal side an executor streams to and from.
///
/// Implemented by `TerminalSession`; tests substitute in-memory fakes.
pub trait PtyPeer: Send + Sync {
    /// Reads keystrokes into `buf`. Returns `0` at end of stream.
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, TransportError>>;

    /// Writes process output. Returns the number of bytes written.
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<usize, TransportError>>;

    /// Sends an out-of-band notice to the user.
    fn toast<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Waits for the next terminal resize. `None` means no more resizes will
    /// arrive.
    fn next_resize(&self) -> BoxFuture<'_, Option<TerminalSize>>;

    /// Closes the peer's connection.
    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Starts commands inside workload containers.
pub trait RemoteExecutor: Send + Sync {
    /// Starts `command` in `target` with a terminal of the given size.
    ///
    /// A [`ExecError::Start`] means nothing was streamed and the caller may
    /// try another command.
    fn start<'a>(
        &'a self,
        target: &'a ExecTarget,
        command: &'a [String],
        size: TerminalSize,
    ) -> BoxFuture<'a, Result<Box<dyn ExecProcess>, ExecError>>;
}

/// A started command.
pub trait ExecProcess: Send {
    /// Streams the command's terminal to and from `peer` until the command
    /// exits. Returns the exit code.
    ///
    /// Dropping the returned future terminates the command.
    fn stream(self: Box<Self>, peer: Arc<dyn PtyPeer>) -> BoxFuture<'static, Result<u32, ExecError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_display() {
        let target = ExecTarget::new("default", "web-1", "app");
        assert_eq!(target.to_string(), "default/web-1/app");
    }

    #[test]
    fn test_start_failure_classification() {
        assert!(ExecError::start("bash", "not found").is_start_failure());
        assert!(!ExecError::Stream("reset".into()).is_start_failure());
        assert!(!ExecError::Transport(TransportError::Closed).is_start_failure());
    }

    #[test]
    fn test_start_error_display() {
        let err = ExecError::start("bash", "exit code 127");
        assert_eq!(err.to_string(), "failed to start `bash`: exit code 127");
    }
}
