//! Transport seam for the telemetry link
//!
//! The supervisor talks to a [`Transport`] that opens [`Connection`]s carrying
//! text messages. Production uses [`WebSocketTransport`].

use crate::error::ConnectionError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Opens connections to a telemetry endpoint
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// One open, bidirectional text link
#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;

    /// Next inbound text message. `Ok(None)` means the peer closed the link.
    ///
    /// Must be cancel safe: the supervisor polls it inside `select!`.
    async fn recv_text(&mut self) -> Result<Option<String>, ConnectionError>;

    /// Best-effort close handshake
    async fn close(&mut self);
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket transport backed by `tokio-tungstenite`
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

struct WebSocketConnection {
    stream: WsStream,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, ConnectionError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ConnectionError::handshake(url, e.to_string()))?;
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn recv_text(&mut self) -> Result<Option<String>, ConnectionError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket close frame received: {:?}", frame);
                    return Ok(None);
                }
                // Ping/pong are answered by tungstenite; binary frames carry no telemetry
                Some(Ok(_)) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}

/// In-process transport for driving the supervisor without sockets
#[cfg(any(test, feature = "test-util"))]
pub mod memory {
    use super::{Connection, Transport};
    use crate::error::ConnectionError;
    use crate::frame::TelemetryFrame;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::{mpsc, Notify};

    enum PeerEvent {
        Text(String),
        Close,
        Fail(String),
    }

    struct MemoryState {
        attempts: AtomicU32,
        refuse: AtomicBool,
        hold: AtomicBool,
        release: Notify,
        accepted: mpsc::UnboundedSender<MemoryPeer>,
    }

    /// Client side handed to the supervisor.
    #[derive(Clone)]
    pub struct MemoryTransport {
        state: Arc<MemoryState>,
    }

    /// Receives the server side of every accepted connection
    pub struct MemoryListener {
        accepted: mpsc::UnboundedReceiver<MemoryPeer>,
    }

    /// Server side of one in-memory connection
    pub struct MemoryPeer {
        to_client: mpsc::UnboundedSender<PeerEvent>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    struct MemoryConnection {
        inbound: mpsc::UnboundedReceiver<PeerEvent>,
        outbound: mpsc::UnboundedSender<String>,
    }

    impl MemoryTransport {
        pub fn new() -> (Self, MemoryListener) {
            let (tx, rx) = mpsc::unbounded_channel();
            let state = MemoryState {
                attempts: AtomicU32::new(0),
                refuse: AtomicBool::new(false),
                hold: AtomicBool::new(false),
                release: Notify::new(),
                accepted: tx,
            };
            (
                Self {
                    state: Arc::new(state),
                },
                MemoryListener { accepted: rx },
            )
        }

        /// Fail every following handshake
        pub fn refuse_connections(&self, refuse: bool) {
            self.state.refuse.store(refuse, Ordering::SeqCst);
        }

        /// Keep following handshakes pending until released
        pub fn hold_connections(&self, hold: bool) {
            self.state.hold.store(hold, Ordering::SeqCst);
            if !hold {
                self.state.release.notify_waiters();
            }
        }

        pub fn connect_attempts(&self) -> u32 {
            self.state.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, ConnectionError> {
            self.state.attempts.fetch_add(1, Ordering::SeqCst);
            loop {
                let released = self.state.release.notified();
                if !self.state.hold.load(Ordering::SeqCst) {
                    break;
                }
                released.await;
            }
            if self.state.refuse.load(Ordering::SeqCst) {
                return Err(ConnectionError::handshake(url, "connection refused"));
            }

            let (to_client, inbound) = mpsc::unbounded_channel();
            let (outbound, from_client) = mpsc::unbounded_channel();
            self.state
                .accepted
                .send(MemoryPeer {
                    to_client,
                    from_client,
                })
                .map_err(|_| ConnectionError::handshake(url, "listener dropped"))?;
            Ok(Box::new(MemoryConnection { inbound, outbound }))
        }
    }

    impl MemoryListener {
        pub async fn accept(&mut self) -> Option<MemoryPeer> {
            self.accepted.recv().await
        }
    }

    impl MemoryPeer {
        pub fn push_text(&self, text: impl Into<String>) -> bool {
            self.to_client.send(PeerEvent::Text(text.into())).is_ok()
        }

        pub fn push_frame(&self, frame: &TelemetryFrame) -> bool {
            self.push_text(frame.encode())
        }

        /// Close the link from the server side
        pub fn close(&self) {
            let _ = self.to_client.send(PeerEvent::Close);
        }

        /// Break the link with a transport error
        pub fn fail(&self, reason: impl Into<String>) {
            let _ = self.to_client.send(PeerEvent::Fail(reason.into()));
        }

        /// Next message the client sent, `None` once the client is gone
        pub async fn next_sent(&mut self) -> Option<String> {
            self.from_client.recv().await
        }
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
            self.outbound
                .send(text)
                .map_err(|_| ConnectionError::Transport("peer gone".to_string()))
        }

        async fn recv_text(&mut self) -> Result<Option<String>, ConnectionError> {
            match self.inbound.recv().await {
                Some(PeerEvent::Text(text)) => Ok(Some(text)),
                Some(PeerEvent::Close) | None => Ok(None),
                Some(PeerEvent::Fail(reason)) => Err(ConnectionError::Transport(reason)),
            }
        }

        async fn close(&mut self) {
            self.inbound.close();
        }
    }
}
