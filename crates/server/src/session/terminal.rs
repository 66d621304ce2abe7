//! Per-client terminal session.
//!
//! A [`TerminalSession`] owns the outbound half of a client socket and the
//! consumer ends of the channels fed by the socket reader loop. It is handed
//! to the remote-exec collaborator as its [`PtyPeer`]: the collaborator reads
//! keystrokes from it, writes process output to it, and polls it for resize
//! requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use protocol::{ProtocolError, TerminalSize, WireMessage};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::id::SessionId;
use crate::exec::{ExecTarget, PtyPeer};

/// Capacity of the inbound keystroke channel.
///
/// At most two frames are in flight: one queued here and one held by the
/// reader loop while it waits for the slot. The loop stops reading the socket
/// until the collaborator takes the queued frame.
const INBOUND_CAPACITY: usize = 1;

/// Errors raised by the client socket.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The session's connection has already been closed.
    #[error("connection closed")]
    Closed,

    /// Sending a frame to the client failed.
    #[error("socket send failed: {0}")]
    Send(String),

    /// Receiving a frame from the client failed.
    #[error("socket receive failed: {0}")]
    Receive(String),

    /// The client sent a frame that is not a valid envelope.
    #[error("malformed frame: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Outbound half of a client socket.
pub trait SocketSink: Send {
    /// Sends one message as a single frame.
    fn send(&mut self, message: WireMessage) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Closes the connection.
    fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Inbound half of a client socket.
pub trait SocketSource: Send {
    /// Receives the next message.
    ///
    /// Returns `None` once the peer has closed the connection.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<WireMessage, TransportError>>>;
}

/// Why the client side of a session ended.
#[derive(Debug)]
pub enum ClientExit {
    /// The peer closed the socket.
    PeerClosed,
    /// Reading from the socket failed.
    Failed(TransportError),
    /// The session was closed from the server side.
    SessionClosed,
}

/// Producer ends of a session's channels, owned by the socket reader loop.
pub struct SessionFeed {
    pub(crate) inbound: mpsc::Sender<Vec<u8>>,
    pub(crate) resize: watch::Sender<Option<TerminalSize>>,
    pub(crate) termination: oneshot::Sender<ClientExit>,
    pub(crate) closing: CancellationToken,
}

/// Consumer side of the inbound channel plus bytes left over from a chunk
/// that did not fit the caller's buffer.
struct Inbound {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

/// One client's live attachment to a remote process.
pub struct TerminalSession {
    id: SessionId,
    target: ExecTarget,
    created_at: Instant,
    sink: Mutex<Box<dyn SocketSink>>,
    inbound: Mutex<Inbound>,
    resize: Mutex<watch::Receiver<Option<TerminalSize>>>,
    termination: StdMutex<Option<oneshot::Receiver<ClientExit>>>,
    closing: CancellationToken,
    closed: AtomicBool,
}

impl TerminalSession {
    /// Builds a session around the outbound socket half.
    ///
    /// Returns the session and the feed that the socket reader loop uses to
    /// deliver keystrokes, resize requests and the termination signal.
    pub fn new(id: SessionId, target: ExecTarget, sink: Box<dyn SocketSink>) -> (Self, SessionFeed) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (resize_tx, resize_rx) = watch::channel(None);
        let (termination_tx, termination_rx) = oneshot::channel();
        let closing = CancellationToken::new();

        let session = Self {
            id,
            target,
            created_at: Instant::now(),
            sink: Mutex::new(sink),
            inbound: Mutex::new(Inbound {
                rx: inbound_rx,
                pending: Vec::new(),
            }),
            resize: Mutex::new(resize_rx),
            termination: StdMutex::new(Some(termination_rx)),
            closing: closing.clone(),
            closed: AtomicBool::new(false),
        };

        let feed = SessionFeed {
            inbound: inbound_tx,
            resize: resize_tx,
            termination: termination_tx,
            closing,
        };

        (session, feed)
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the workload this session is attached to.
    pub fn target(&self) -> &ExecTarget {
        &self.target
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Returns whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Takes the termination signal. Only the first caller gets it.
    pub fn take_termination(&self) -> Option<oneshot::Receiver<ClientExit>> {
        self.termination
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Sends a message to the client.
    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(message).await
    }

    /// Reads keystrokes into `buf`, waiting for the next chunk if none is
    /// pending. Returns `0` at end of stream.
    pub async fn read_input(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut inbound = self.inbound.lock().await;
        while inbound.pending.is_empty() {
            if self.is_closed() {
                return Ok(0);
            }
            let chunk = tokio::select! {
                chunk = inbound.rx.recv() => chunk,
                _ = self.closing.cancelled() => None,
            };
            match chunk {
                Some(chunk) => inbound.pending = chunk,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(inbound.pending.len());
        buf[..n].copy_from_slice(&inbound.pending[..n]);
        inbound.pending.drain(..n);
        Ok(n)
    }

    /// Forwards process output to the client as one data frame.
    pub async fn write_output(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.send(WireMessage::Data(data.to_vec())).await?;
        Ok(data.len())
    }

    /// Sends an out-of-band notice to the client.
    pub async fn toast(&self, text: &str) -> Result<(), TransportError> {
        self.send(WireMessage::Toast(text.to_string())).await
    }

    /// Waits for the next resize request. Returns `None` once the session is
    /// closing or the reader loop has ended.
    pub async fn next_resize(&self) -> Option<TerminalSize> {
        let mut resize = self.resize.lock().await;
        loop {
            if self.is_closed() {
                return None;
            }
            let changed = tokio::select! {
                changed = resize.changed() => changed,
                _ = self.closing.cancelled() => return None,
            };
            if changed.is_err() {
                return None;
            }
            if let Some(size) = *resize.borrow_and_update() {
                return Some(size);
            }
        }
    }

    /// Closes the client connection.
    ///
    /// Not idempotent: a second call fails with [`TransportError::Closed`].
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.closing.cancel();

        let mut sink = self.sink.lock().await;
        let result = sink.close().await;

        tracing::debug!(session_id = %self.id, "Terminal session closed");
        result
    }
}

impl PtyPeer for TerminalSession {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, TransportError>> {
        Box::pin(self.read_input(buf))
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<usize, TransportError>> {
        Box::pin(self.write_output(data))
    }

    fn toast<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(TerminalSession::toast(self, text))
    }

    fn next_resize(&self) -> BoxFuture<'_, Option<TerminalSize>> {
        Box::pin(TerminalSession::next_resize(self))
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(TerminalSession::close(self))
    }
}
