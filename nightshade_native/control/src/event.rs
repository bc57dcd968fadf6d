//! Event bus for control-side notifications
//!
//! Lets the UI follow connection changes, motion progress and command
//! outcomes without polling the registry.
//!
//! # Features
//!
//! - **Sequence Numbers**: Each event has a unique, monotonically increasing ID
//! - **Device Attribution**: Device events carry the device id
//! - **Overflow Handling**: Slow subscribers skip ahead; drops are counted

use chrono::Utc;
use nightshade_telemetry::ConnectionState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Default event buffer size.
///
/// A receiver that falls behind by more than this many events gets a
/// `Lagged` error and continues from the oldest retained event.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 4096;

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// Categories of events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    Connection,
    Motion,
    Command,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MotionEvent {
    Started { target: f64, speed: f64, reverse: bool },
    Completed { position: f64 },
    Stopped { position: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandEvent {
    Succeeded { verb: String },
    Failed { verb: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SystemEvent {
    Initialized,
    ShuttingDown,
}

/// Event payload, one per category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Connection { state: ConnectionState },
    Motion(MotionEvent),
    Command(CommandEvent),
    System(SystemEvent),
}

impl EventPayload {
    pub fn category(&self) -> EventCategory {
        match self {
            EventPayload::Connection { .. } => EventCategory::Connection,
            EventPayload::Motion(_) => EventCategory::Motion,
            EventPayload::Command(_) => EventCategory::Command,
            EventPayload::System(_) => EventCategory::System,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEvent {
    /// Unique event ID (monotonically increasing sequence number)
    pub event_id: u64,
    /// Milliseconds since Unix epoch
    pub timestamp: i64,
    pub severity: EventSeverity,
    pub category: EventCategory,
    pub payload: EventPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBusStats {
    pub events_published: u64,
    pub events_dropped: u64,
    pub subscriber_count: usize,
}

pub struct EventBus {
    sender: broadcast::Sender<ControlEvent>,
    sequence: AtomicU64,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
}

pub type SharedEventBus = Arc<EventBus>;

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    /// Publish an event, returning its ID
    pub fn publish(
        &self,
        severity: EventSeverity,
        payload: EventPayload,
        device_id: Option<&str>,
    ) -> u64 {
        let event_id = self.sequence.fetch_add(1, Ordering::SeqCst);
        let event = ControlEvent {
            event_id,
            timestamp: Utc::now().timestamp_millis(),
            severity,
            category: payload.category(),
            payload,
            device_id: device_id.map(str::to_string),
        };
        self.events_published.fetch_add(1, Ordering::Relaxed);
        // No receivers is fine
        let _ = self.sender.send(event);
        event_id
    }

    pub fn publish_motion(&self, device_id: &str, event: MotionEvent) -> u64 {
        self.publish(EventSeverity::Info, EventPayload::Motion(event), Some(device_id))
    }

    pub fn publish_command(&self, device_id: &str, event: CommandEvent) -> u64 {
        let severity = match event {
            CommandEvent::Succeeded { .. } => EventSeverity::Info,
            CommandEvent::Failed { .. } => EventSeverity::Error,
        };
        self.publish(severity, EventPayload::Command(event), Some(device_id))
    }

    pub fn publish_connection(&self, state: ConnectionState) -> u64 {
        let severity = match state {
            ConnectionState::Error => EventSeverity::Warning,
            _ => EventSeverity::Info,
        };
        self.publish(severity, EventPayload::Connection { state }, None)
    }

    pub fn publish_system(&self, event: SystemEvent) -> u64 {
        self.publish(EventSeverity::Info, EventPayload::System(event), None)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.sender.subscribe()
    }

    /// Record events a subscriber skipped after lagging
    pub fn record_dropped(&self, count: u64) {
        let total = self.events_dropped.fetch_add(count, Ordering::Relaxed) + count;
        warn!("Event subscriber lagged: {} events dropped ({} total)", count, total);
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            subscriber_count: self.sender.receiver_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}
