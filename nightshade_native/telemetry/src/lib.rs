//! Telemetry link for the Nightshade observatory backend
//!
//! Owns the wire side of the dashboard: the JSON frame envelope pushed by the
//! backend and the supervisor that keeps one WebSocket session alive.
//!
//! ## Features
//!
//! - Closed set of frame kinds with an explicit `Unknown` arm
//! - Fixed-interval reconnection with a single pending timer
//! - Connection state published through a `watch` channel
//! - Pluggable transport (WebSocket in production, in-memory for tests)

mod error;
mod frame;
mod supervisor;
pub mod transport;

pub use error::{ConnectionError, ProtocolError};
pub use frame::{DeviceClass, FrameKind, TelemetryFrame};
pub use supervisor::{
    ConnectionState, ConnectionSupervisor, FrameSink, SupervisorConfig, SupervisorStats,
};
pub use transport::{Connection, Transport, WebSocketTransport};

/// Default telemetry endpoint of the dashboard backend
pub const DEFAULT_TELEMETRY_URL: &str = "ws://localhost:3001";

/// Default delay between a lost connection and the next attempt
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;
