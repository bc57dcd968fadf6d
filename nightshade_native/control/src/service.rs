//! Control service
//!
//! Wires the telemetry supervisor, device registry, motion controller and
//! command dispatcher together. The UI talks to one [`ObservatoryService`].

use crate::backend::{CommandBackend, HttpBackend};
use crate::config::ControlSettings;
use crate::device::SnapshotPatch;
use crate::dispatcher::{CommandDispatcher, DeviceCommand};
use crate::error::{CommandError, ServiceError};
use crate::event::{EventBus, SharedEventBus, SystemEvent};
use crate::motion::MotionController;
use crate::registry::DeviceRegistry;
use async_trait::async_trait;
use nightshade_telemetry::{
    ConnectionSupervisor, FrameKind, FrameSink, ProtocolError, TelemetryFrame, Transport,
    WebSocketTransport,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Latest host-level telemetry, replaced wholesale by each frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemTelemetry {
    pub system_info: Option<Value>,
    pub processes: Option<Value>,
}

/// Routes decoded frames into the registry
pub struct TelemetryRouter {
    registry: Arc<DeviceRegistry>,
    system: watch::Sender<SystemTelemetry>,
}

impl TelemetryRouter {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let (system, _) = watch::channel(SystemTelemetry::default());
        Self { registry, system }
    }

    pub fn subscribe_system(&self) -> watch::Receiver<SystemTelemetry> {
        self.system.subscribe()
    }
}

#[async_trait]
impl FrameSink for TelemetryRouter {
    async fn on_frame(&self, frame: TelemetryFrame) -> Result<(), ProtocolError> {
        match &frame.kind {
            FrameKind::Device(class) => {
                let class = *class;
                let Some((_, id)) = frame.device_target() else {
                    return Err(ProtocolError::invalid_payload(class.as_str(), "no device target"));
                };
                let patch: SnapshotPatch = serde_json::from_value(frame.payload)
                    .map_err(|e| ProtocolError::invalid_payload(class.as_str(), e.to_string()))?;
                self.registry.apply_telemetry(&id, class, &patch).await;
            }
            FrameKind::SystemInfo => {
                self.system
                    .send_modify(|system| system.system_info = Some(frame.payload));
            }
            FrameKind::Processes => {
                self.system
                    .send_modify(|system| system.processes = Some(frame.payload));
            }
            FrameKind::Unknown(kind) => return Err(ProtocolError::UnknownKind(kind.clone())),
        }
        Ok(())
    }
}

/// Owns every control component for one dashboard session
pub struct ObservatoryService {
    settings: ControlSettings,
    events: SharedEventBus,
    registry: Arc<DeviceRegistry>,
    motion: Arc<MotionController>,
    dispatcher: CommandDispatcher,
    router: Arc<TelemetryRouter>,
    supervisor: ConnectionSupervisor,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ObservatoryService {
    /// Service talking WebSocket telemetry and REST commands
    pub fn new(settings: ControlSettings) -> Result<Self, ServiceError> {
        settings.validate()?;
        let backend = HttpBackend::new(settings.backend.clone())?;
        Ok(Self::with_parts(
            settings,
            Arc::new(WebSocketTransport),
            Arc::new(backend),
        ))
    }

    /// Service over the given telemetry transport and command backend
    pub fn with_parts(
        settings: ControlSettings,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn CommandBackend>,
    ) -> Self {
        let events: SharedEventBus = Arc::new(EventBus::default());
        let registry = Arc::new(DeviceRegistry::new(settings.devices.clone()));
        let motion = Arc::new(MotionController::new(
            settings.motion.clone(),
            registry.clone(),
            events.clone(),
        ));
        let dispatcher =
            CommandDispatcher::new(registry.clone(), motion.clone(), backend, events.clone());
        let router = Arc::new(TelemetryRouter::new(registry.clone()));
        let supervisor =
            ConnectionSupervisor::new(settings.telemetry.clone(), transport, router.clone());

        Self {
            settings,
            events,
            registry,
            motion,
            dispatcher,
            router,
            supervisor,
            forwarder: Mutex::new(None),
        }
    }

    /// Connect telemetry and start publishing connection events.
    ///
    /// Calling it again restarts the telemetry session.
    pub async fn start(&self) {
        {
            let mut forwarder = self.forwarder.lock().await;
            if forwarder.is_none() {
                let mut states = self.supervisor.subscribe_state();
                let events = self.events.clone();
                *forwarder = Some(tokio::spawn(async move {
                    while states.changed().await.is_ok() {
                        let state = *states.borrow_and_update();
                        debug!("Telemetry connection {}", state);
                        events.publish_connection(state);
                    }
                }));
            }
        }

        self.supervisor.start_default().await;
        self.events.publish_system(SystemEvent::Initialized);
        info!(
            "Control service started (telemetry {}, backend {})",
            self.settings.telemetry.url, self.settings.backend.base_url
        );
    }

    /// Stop telemetry and all motion. Safe to call more than once.
    pub async fn shutdown(&self) {
        let forwarder = self.forwarder.lock().await.take();
        // Motion can be started by dispatch without a telemetry session
        self.motion.stop_all().await;
        let Some(forwarder) = forwarder else {
            return;
        };

        self.events.publish_system(SystemEvent::ShuttingDown);
        self.supervisor.stop().await;

        forwarder.abort();
        let _ = forwarder.await;
        info!("Control service stopped");
    }

    pub async fn dispatch(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<SnapshotPatch, CommandError> {
        self.dispatcher.dispatch(device_id, command).await
    }

    pub async fn dispatch_verb(
        &self,
        device_id: &str,
        verb: &str,
        params: &Value,
    ) -> Result<SnapshotPatch, CommandError> {
        self.dispatcher.dispatch_verb(device_id, verb, params).await
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn motion(&self) -> &Arc<MotionController> {
        &self.motion
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn subscribe_system(&self) -> watch::Receiver<SystemTelemetry> {
        self.router.subscribe_system()
    }
}
