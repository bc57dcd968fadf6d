//! Connection supervisor
//!
//! Keeps one telemetry session alive. A single session task owns the link,
//! the reader loop and the reconnect delay, so restarting or stopping the
//! supervisor cancels exactly one thing and at most one reconnect timer can
//! ever be armed.
//!
//! State machine:
//!
//! ```text
//! Connecting --handshake--> Open --remote close--> Closed --interval--> Connecting
//!     |                       |
//!     +--handshake failed--> Error <--transport error
//!                              +--------------interval--------------> Connecting
//! ```

use crate::error::ProtocolError;
use crate::frame::{FrameKind, TelemetryFrame};
use crate::transport::{Connection, Transport};
use crate::{DEFAULT_RECONNECT_INTERVAL_MS, DEFAULT_TELEMETRY_URL};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `stop()` waits for the session to close gracefully before aborting it
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Link status as seen by the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Supervisor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Endpoint used by `start_default`
    pub url: String,
    /// Fixed delay before each reconnect attempt (no backoff growth)
    pub reconnect_interval_ms: u64,
    /// When false the supervisor stays in `Closed`/`Error` after a loss
    pub auto_reconnect: bool,
    /// Capacity of the outbound queue feeding the writer
    pub outbound_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TELEMETRY_URL.to_string(),
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            auto_reconnect: true,
            outbound_buffer: 64,
        }
    }
}

impl SupervisorConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Receives decoded frames from the supervisor.
///
/// Frames are delivered in arrival order from the single session task.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    /// Handle one known frame. An error drops the frame and is logged.
    async fn on_frame(&self, frame: TelemetryFrame) -> Result<(), ProtocolError>;
}

/// Counters for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub connect_attempts: u64,
    pub reconnects_scheduled: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub messages_sent: u64,
}

#[derive(Default)]
struct StatsCounters {
    connect_attempts: AtomicU64,
    reconnects_scheduled: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    messages_sent: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> SupervisorStats {
        SupervisorStats {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the supervisor handle and its session task
struct Shared {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn FrameSink>,
    state_tx: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    reconnect_pending: AtomicBool,
    stats: StatsCounters,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("Telemetry connection state: {}", next);
        }
    }

    fn set_outbound(&self, sender: Option<mpsc::Sender<String>>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = sender;
    }

    fn outbound(&self) -> Option<mpsc::Sender<String>> {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn handle_text(&self, text: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame = match TelemetryFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping telemetry frame: {}", e);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if let FrameKind::Unknown(kind) = &frame.kind {
            warn!("Dropping telemetry frame: {}", ProtocolError::UnknownKind(kind.clone()));
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let kind = frame.kind.clone();
        if let Err(e) = self.sink.on_frame(frame).await {
            warn!("Dropping '{}' telemetry frame: {}", kind, e);
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct Session {
    url: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the telemetry link and its reconnect policy
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: SupervisorConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            config,
            shared: Arc::new(Shared {
                transport,
                sink,
                state_tx,
                outbound: Mutex::new(None),
                reconnect_pending: AtomicBool::new(false),
                stats: StatsCounters::default(),
            }),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start supervising `url`.
    ///
    /// Never fails: connection problems surface as `Error` state. A session
    /// that is already running is shut down first.
    pub async fn start(&self, url: impl Into<String>) {
        let url = url.into();
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            info!("Restarting telemetry session ({} -> {})", previous.url, url);
            self.shutdown_session(previous).await;
        }

        info!("Starting telemetry session for {}", url);
        self.shared.set_state(ConnectionState::Connecting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_session(
            self.shared.clone(),
            url.clone(),
            self.config.clone(),
            shutdown_rx,
        ));
        *session = Some(Session {
            url,
            shutdown: shutdown_tx,
            handle,
        });
    }

    /// Start supervising the configured URL
    pub async fn start_default(&self) {
        let url = self.config.url.clone();
        self.start(url).await;
    }

    /// Queue a message for the open link.
    ///
    /// Returns false, logging a warning, when the link is not open or the
    /// outbound queue is full. Never blocks.
    pub fn send(&self, message: impl Into<String>) -> bool {
        let state = self.state();
        if state != ConnectionState::Open {
            warn!("Telemetry send ignored: connection is {}", state);
            return false;
        }
        let Some(sender) = self.shared.outbound() else {
            warn!("Telemetry send ignored: no writer attached");
            return false;
        };
        match sender.try_send(message.into()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Telemetry send ignored: outbound queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Telemetry send ignored: writer closed");
                false
            }
        }
    }

    /// Close the link and cancel any pending reconnect.
    ///
    /// Idempotent. No frame reaches the sink after this returns.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if let Some(current) = session.take() {
            info!("Stopping telemetry session for {}", current.url);
            self.shutdown_session(current).await;
        }
        self.shared.set_state(ConnectionState::Closed);
    }

    async fn shutdown_session(&self, session: Session) {
        let Session {
            shutdown,
            mut handle,
            ..
        } = session;
        let _ = shutdown.send(true);
        if tokio::time::timeout(STOP_GRACE_PERIOD, &mut handle).await.is_err() {
            warn!("Telemetry session did not stop within {:?}, aborting", STOP_GRACE_PERIOD);
            handle.abort();
            let _ = handle.await;
        }
        self.shared.set_outbound(None);
        self.shared.reconnect_pending.store(false, Ordering::SeqCst);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether a reconnect delay is currently running
    pub fn reconnect_pending(&self) -> bool {
        self.shared.reconnect_pending.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SupervisorStats {
        self.shared.stats.snapshot()
    }
}

/// Session loop: connect, pump, wait, repeat.
async fn run_session(
    shared: Arc<Shared>,
    url: String,
    config: SupervisorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = config.reconnect_interval();

    loop {
        shared.set_state(ConnectionState::Connecting);
        shared.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let connected = tokio::select! {
            result = shared.transport.connect(&url) => result,
            _ = shutdown.changed() => return,
        };

        let end_state = match connected {
            Ok(connection) => {
                info!("Telemetry connected to {}", url);
                shared.set_state(ConnectionState::Open);
                match pump(&shared, connection, config.outbound_buffer, &mut shutdown).await {
                    Some(state) => state,
                    None => return,
                }
            }
            Err(e) => {
                warn!("Telemetry connection failed: {}", e);
                ConnectionState::Error
            }
        };
        if !config.auto_reconnect {
            shared.set_state(end_state);
            info!("Auto-reconnect disabled, telemetry session ends");
            return;
        }

        shared.stats.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
        shared.reconnect_pending.store(true, Ordering::SeqCst);
        shared.set_state(end_state);
        info!("Reconnecting to {} in {}ms", url, interval.as_millis());
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            _ = shutdown.changed() => true,
        };
        shared.reconnect_pending.store(false, Ordering::SeqCst);
        if cancelled {
            return;
        }
    }
}

/// Move messages both ways until the link ends.
///
/// Returns the state the link ended in, or `None` when shut down locally.
async fn pump(
    shared: &Shared,
    mut connection: Box<dyn Connection>,
    outbound_buffer: usize,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<ConnectionState> {
    let (tx, mut rx) = mpsc::channel::<String>(outbound_buffer.max(1));
    shared.set_outbound(Some(tx));

    let end = loop {
        tokio::select! {
            inbound = connection.recv_text() => match inbound {
                Ok(Some(text)) => shared.handle_text(&text).await,
                Ok(None) => {
                    info!("Telemetry connection closed by remote");
                    break Some(ConnectionState::Closed);
                }
                Err(e) => {
                    warn!("Telemetry connection lost: {}", e);
                    break Some(ConnectionState::Error);
                }
            },
            Some(message) = rx.recv() => {
                if let Err(e) = connection.send_text(message).await {
                    warn!("Telemetry send failed: {}", e);
                    break Some(ConnectionState::Error);
                }
                shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            _ = shutdown.changed() => break None,
        }
    };

    shared.set_outbound(None);
    connection.close().await;
    end
}
