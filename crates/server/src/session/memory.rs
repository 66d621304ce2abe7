//! In-memory socket pair.
//!
//! Stands in for a WebSocket when a session should be driven without a
//! network: the server side gets a [`MemorySink`] and [`MemorySource`], the
//! test or embedding code drives the [`MemoryClient`].

use futures_util::future::BoxFuture;
use protocol::WireMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::terminal::{SocketSink, SocketSource, TransportError};

/// Client-to-server frames buffered before the client's `send` waits.
const CLIENT_SEND_CAPACITY: usize = 16;

/// Creates a connected in-memory socket.
pub fn memory_socket() -> (MemorySink, MemorySource, MemoryClient) {
    let (to_server_tx, to_server_rx) = mpsc::channel(CLIENT_SEND_CAPACITY);
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    let sink = MemorySink {
        tx: Some(to_client_tx),
        closed: closed.clone(),
    };
    let source = MemorySource {
        rx: to_server_rx,
        closed,
    };
    let client = MemoryClient {
        tx: Some(to_server_tx),
        rx: to_client_rx,
    };

    (sink, source, client)
}

/// Server-side outbound half.
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<WireMessage>>,
    closed: CancellationToken,
}

impl SocketSink for MemorySink {
    fn send(&mut self, message: WireMessage) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
            tx.send(message).map_err(|_| TransportError::Closed)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.closed.cancel();
            match self.tx.take() {
                Some(_) => Ok(()),
                None => Err(TransportError::Closed),
            }
        })
    }
}

/// Server-side inbound half.
pub struct MemorySource {
    rx: mpsc::Receiver<WireMessage>,
    closed: CancellationToken,
}

impl SocketSource for MemorySource {
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<WireMessage, TransportError>>> {
        Box::pin(async move {
            tokio::select! {
                _ = self.closed.cancelled() => None,
                message = self.rx.recv() => message.map(Ok),
            }
        })
    }
}

/// The remote end of an in-memory socket.
pub struct MemoryClient {
    tx: Option<mpsc::Sender<WireMessage>>,
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

impl MemoryClient {
    /// Sends a message to the server. Waits while the server is not reading.
    pub async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message).await.map_err(|_| TransportError::Closed)
    }

    /// Receives the next server frame, or `None` once the server closed the
    /// connection and every frame has been drained.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }

    /// Closes the client side of the connection.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (mut sink, mut source, mut client) = memory_socket();

        client.send(WireMessage::Data(b"in".to_vec())).await.unwrap();
        let received = source.recv().await.unwrap().unwrap();
        assert_eq!(received, WireMessage::Data(b"in".to_vec()));

        sink.send(WireMessage::Data(b"out".to_vec())).await.unwrap();
        assert_eq!(client.recv().await, Some(WireMessage::Data(b"out".to_vec())));
    }

    #[tokio::test]
    async fn test_close_ends_both_directions() {
        let (mut sink, mut source, mut client) = memory_socket();

        sink.close().await.unwrap();

        assert!(source.recv().await.is_none());
        assert!(client.recv().await.is_none());
        assert!(matches!(
            sink.send(WireMessage::Data(vec![1])).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_client_disconnect_ends_source() {
        let (_sink, mut source, mut client) = memory_socket();

        client.disconnect();

        assert!(source.recv().await.is_none());
    }
}
