//! Socket reader loop.
//!
//! One loop runs per session. It pulls frames off the client socket and
//! feeds them into the session: keystrokes into the bounded inbound
//! channel, resize requests into the resize feed. When the socket ends it
//! fires the session's termination signal and drops the feed, which turns
//! into end-of-stream for `read` and `next_resize`. It never closes the
//! session; that belongs to the orchestrator.

use protocol::WireMessage;
use tokio::task::JoinHandle;

use super::id::SessionId;
use super::terminal::{ClientExit, SessionFeed, SocketSource, TransportError};

/// Spawns the reader loop for a session.
pub fn spawn_reader_loop(
    session_id: SessionId,
    source: Box<dyn SocketSource>,
    feed: SessionFeed,
) -> JoinHandle<()> {
    tokio::spawn(run_reader_loop(session_id, source, feed))
}

/// Runs the reader loop until the socket ends or the session closes.
pub async fn run_reader_loop(
    session_id: SessionId,
    mut source: Box<dyn SocketSource>,
    feed: SessionFeed,
) {
    let SessionFeed {
        inbound,
        resize,
        termination,
        closing,
    } = feed;

    let exit = loop {
        let frame = tokio::select! {
            biased;
            _ = closing.cancelled() => break ClientExit::SessionClosed,
            frame = source.recv() => frame,
        };

        match frame {
            None => break ClientExit::PeerClosed,
            Some(Ok(WireMessage::Data(bytes))) => {
                if bytes.is_empty() {
                    continue;
                }
                // Waits here until the collaborator has consumed the previous frame.
                let delivered = tokio::select! {
                    biased;
                    _ = closing.cancelled() => break ClientExit::SessionClosed,
                    sent = inbound.send(bytes) => sent,
                };
                if delivered.is_err() {
                    break ClientExit::SessionClosed;
                }
            }
            Some(Ok(WireMessage::Resize(size))) => {
                tracing::trace!(
                    session_id = %session_id,
                    cols = size.cols,
                    rows = size.rows,
                    "Resize requested"
                );
                resize.send_replace(Some(size));
            }
            Some(Ok(WireMessage::Toast(_))) => {
                tracing::debug!(session_id = %session_id, "Ignoring toast sent by client");
            }
            Some(Err(TransportError::Protocol(e))) => {
                tracing::warn!(session_id = %session_id, error = %e, "Dropping malformed frame");
            }
            Some(Err(e)) => {
                tracing::warn!(session_id = %session_id, error = %e, "Socket read failed");
                break ClientExit::Failed(e);
            }
        }
    };

    match &exit {
        ClientExit::PeerClosed => {
            tracing::info!(session_id = %session_id, "Client closed the connection")
        }
        ClientExit::Failed(_) => {}
        ClientExit::SessionClosed => {
            tracing::debug!(session_id = %session_id, "Reader loop stopping: session closed")
        }
    }

    // The orchestrator may already be gone.
    let _ = termination.send(exit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecTarget;
    use crate::session::memory::memory_socket;
    use crate::session::terminal::TerminalSession;
    use protocol::TerminalSize;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn setup() -> (
        Arc<TerminalSession>,
        JoinHandle<()>,
        crate::session::memory::MemoryClient,
    ) {
        let (sink, source, client) = memory_socket();
        let id = "feedfacefeedfacefeedfacefeedface".to_string();
        let (session, feed) = TerminalSession::new(
            id.clone(),
            ExecTarget::new("default", "web-1", "app"),
            Box::new(sink),
        );
        let handle = spawn_reader_loop(id, Box::new(source), feed);
        (Arc::new(session), handle, client)
    }

    async fn read_string(session: &TerminalSession) -> String {
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(1), session.read_input(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_with_resizes_interleaved() {
        let (session, _handle, client) = setup();

        let sender = tokio::spawn(async move {
            for (i, chunk) in ["a", "b", "c"].iter().enumerate() {
                client
                    .send(WireMessage::Resize(TerminalSize::new(80 + i as u16, 24)))
                    .await
                    .unwrap();
                client
                    .send(WireMessage::Data(chunk.as_bytes().to_vec()))
                    .await
                    .unwrap();
            }
            client
        });

        let mut received = String::new();
        while received.len() < 3 {
            received.push_str(&read_string(&session).await);
        }
        assert_eq!(received, "abc");

        let _client = sender.await.unwrap();
        let size = timeout(Duration::from_secs(1), session.next_resize())
            .await
            .unwrap();
        assert_eq!(size, Some(TerminalSize::new(82, 24)));
    }

    #[tokio::test]
    async fn test_client_disconnect_fires_termination() {
        let (session, handle, mut client) = setup();
        let termination = session.take_termination().unwrap();

        client.disconnect();

        let exit = timeout(Duration::from_secs(1), termination)
            .await
            .expect("termination not signalled")
            .unwrap();
        assert!(matches!(exit, ClientExit::PeerClosed));
        handle.await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(session.read_input(&mut buf).await.unwrap(), 0);
        assert_eq!(session.next_resize().await, None);
    }

    #[tokio::test]
    async fn test_session_close_stops_loop() {
        let (session, handle, _client) = setup();
        let termination = session.take_termination().unwrap();

        session.close().await.unwrap();

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("reader loop did not stop")
            .unwrap();
        assert!(matches!(
            termination.await.unwrap(),
            ClientExit::SessionClosed
        ));
    }

    /// Counts the frames the reader loop has pulled off the socket.
    struct CountingSource {
        inner: crate::session::memory::MemorySource,
        pulled: Arc<AtomicUsize>,
    }

    impl SocketSource for CountingSource {
        fn recv(&mut self) -> BoxFuture<'_, Option<Result<WireMessage, TransportError>>> {
            Box::pin(async move {
                let frame = self.inner.recv().await;
                if frame.is_some() {
                    self.pulled.fetch_add(1, Ordering::SeqCst);
                }
                frame
            })
        }
    }

    async fn pulled_after_settling(pulled: &AtomicUsize) -> usize {
        tokio::time::sleep(Duration::from_millis(50)).await;
        pulled.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_reader_applies_backpressure() {
        let (sink, source, client) = memory_socket();
        let pulled = Arc::new(AtomicUsize::new(0));
        let id = "feedfacefeedfacefeedfacefeedface".to_string();
        let (session, feed) = TerminalSession::new(
            id.clone(),
            ExecTarget::new("default", "web-1", "app"),
            Box::new(sink),
        );
        let _handle = spawn_reader_loop(
            id,
            Box::new(CountingSource {
                inner: source,
                pulled: Arc::clone(&pulled),
            }),
            feed,
        );

        for chunk in ["1", "2", "3", "4", "5"] {
            client
                .send(WireMessage::Data(chunk.as_bytes().to_vec()))
                .await
                .unwrap();
        }

        // One frame queued in the channel and one held by the loop.
        assert_eq!(pulled_after_settling(&pulled).await, 2);

        assert_eq!(read_string(&session).await, "1");
        assert_eq!(pulled_after_settling(&pulled).await, 3);

        for expected in ["2", "3", "4", "5"] {
            assert_eq!(read_string(&session).await, expected);
        }
    }
}
