//! Nightshade device control
//!
//! Keeps one authoritative snapshot per observatory device, fed by the
//! telemetry link and by local motion simulation, and sends user commands to
//! the dashboard backend.
//!
//! ## Components
//!
//! - [`DeviceRegistry`]: snapshots and change subscriptions
//! - [`MotionController`]: tick-driven motion toward a target
//! - [`CommandDispatcher`]: validation, REST dispatch and response merging
//! - [`ObservatoryService`]: wires the above to the telemetry supervisor

pub mod backend;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod logging;
pub mod motion;
pub mod registry;
pub mod service;

pub use backend::{BackendConfig, BackendError, CommandBackend, CommandRequest, HttpBackend};
pub use config::{ControlSettings, DeviceCatalog};
pub use device::{
    Bounds, DeviceClass, DeviceDetail, DeviceProfile, DeviceSnapshot, ShutterState,
    SnapshotPatch, WrapMode,
};
pub use dispatcher::{CommandDispatcher, DeviceCommand};
pub use error::{CommandError, ConfigError, MotionError, RegistryError, ServiceError, ValidationError};
pub use event::{
    CommandEvent, ControlEvent, EventBus, EventCategory, EventPayload, EventSeverity,
    MotionEvent, SharedEventBus, SystemEvent,
};
pub use logging::init_logging;
pub use motion::{MotionConfig, MotionController, MotionRequest, MotionTask};
pub use registry::{ChangeSource, DeviceRegistry, DeviceSubscription, RegistryChange};
pub use service::{ObservatoryService, SystemTelemetry, TelemetryRouter};
