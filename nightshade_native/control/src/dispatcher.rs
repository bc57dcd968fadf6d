//! Command dispatcher
//!
//! Turns a user intent into one backend request and, when the backend
//! accepts it, into a registry update and possibly a motion. Commands are
//! validated against the device snapshot first; an invalid command never
//! reaches the network and leaves the registry untouched.

use crate::backend::{BackendError, CommandBackend, CommandRequest};
use crate::device::{DeviceClass, DeviceSnapshot, ShutterState, SnapshotPatch};
use crate::error::{CommandError, ValidationError};
use crate::event::{CommandEvent, SharedEventBus};
use crate::motion::{MotionController, MotionRequest};
use crate::registry::DeviceRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything the dashboard can ask a device to do
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Rotate the dome. Direction defaults to the shorter arc.
    SetAzimuth {
        azimuth: f64,
        speed: Option<f64>,
        reverse: Option<bool>,
    },
    OpenShutter,
    CloseShutter,
    /// Turn the rotator. Direction defaults to the device's reverse setting.
    RotateTo {
        position: f64,
        speed: Option<f64>,
        reverse: Option<bool>,
    },
    SetReverse {
        reverse: bool,
    },
    /// Select a filter slot, starting at 1
    ChangeFilter {
        index: u32,
    },
    /// Select a mount slew-speed step, starting at 0
    SetSlewRate {
        index: u32,
    },
    Park,
    Unpark,
    /// Halt any motion of the device
    Stop,
}

impl DeviceCommand {
    /// Every verb name [`DeviceCommand::from_verb`] understands
    pub const VERBS: [&'static str; 10] = [
        "setAzimuth",
        "openShutter",
        "closeShutter",
        "rotateTo",
        "setReverse",
        "changeFilter",
        "setSlewRate",
        "park",
        "unpark",
        "stop",
    ];

    pub fn verb(&self) -> &'static str {
        match self {
            DeviceCommand::SetAzimuth { .. } => "setAzimuth",
            DeviceCommand::OpenShutter => "openShutter",
            DeviceCommand::CloseShutter => "closeShutter",
            DeviceCommand::RotateTo { .. } => "rotateTo",
            DeviceCommand::SetReverse { .. } => "setReverse",
            DeviceCommand::ChangeFilter { .. } => "changeFilter",
            DeviceCommand::SetSlewRate { .. } => "setSlewRate",
            DeviceCommand::Park => "park",
            DeviceCommand::Unpark => "unpark",
            DeviceCommand::Stop => "stop",
        }
    }

    fn applies_to(&self, class: DeviceClass) -> bool {
        match self {
            DeviceCommand::SetAzimuth { .. }
            | DeviceCommand::OpenShutter
            | DeviceCommand::CloseShutter => class == DeviceClass::Dome,
            DeviceCommand::RotateTo { .. } | DeviceCommand::SetReverse { .. } => {
                class == DeviceClass::Rotator
            }
            DeviceCommand::ChangeFilter { .. } => class == DeviceClass::FilterWheel,
            DeviceCommand::SetSlewRate { .. } | DeviceCommand::Park | DeviceCommand::Unpark => {
                class == DeviceClass::Mount
            }
            DeviceCommand::Stop => true,
        }
    }

    /// Build a command from a verb name and JSON parameters
    pub fn from_verb(verb: &str, params: &Value) -> Result<Self, ValidationError> {
        let command = match verb {
            "setAzimuth" => DeviceCommand::SetAzimuth {
                azimuth: required_number(params, "setAzimuth", "azimuth")?,
                speed: number(params, "speed"),
                reverse: params.get("reverse").and_then(Value::as_bool),
            },
            "openShutter" => DeviceCommand::OpenShutter,
            "closeShutter" => DeviceCommand::CloseShutter,
            "rotateTo" => DeviceCommand::RotateTo {
                position: required_number(params, "rotateTo", "position")?,
                speed: number(params, "speed"),
                reverse: params.get("reverse").and_then(Value::as_bool),
            },
            "setReverse" => DeviceCommand::SetReverse {
                reverse: params.get("reverse").and_then(Value::as_bool).ok_or(
                    ValidationError::MissingParameter {
                        verb: "setReverse",
                        name: "reverse",
                    },
                )?,
            },
            "changeFilter" => DeviceCommand::ChangeFilter {
                index: required_index(params, "changeFilter")?,
            },
            "setSlewRate" => DeviceCommand::SetSlewRate {
                index: required_index(params, "setSlewRate")?,
            },
            "park" => DeviceCommand::Park,
            "unpark" => DeviceCommand::Unpark,
            "stop" => DeviceCommand::Stop,
            other => return Err(ValidationError::UnknownVerb(other.to_string())),
        };
        Ok(command)
    }
}

fn number(params: &Value, name: &str) -> Option<f64> {
    params.get(name).and_then(Value::as_f64)
}

fn required_number(
    params: &Value,
    verb: &'static str,
    name: &'static str,
) -> Result<f64, ValidationError> {
    number(params, name).ok_or(ValidationError::MissingParameter { verb, name })
}

fn required_index(params: &Value, verb: &'static str) -> Result<u32, ValidationError> {
    let value = required_number(params, verb, "index")?;
    if value.fract() != 0.0 || value < 0.0 || value > u32::MAX as f64 {
        return Err(ValidationError::NotAnIndex(value));
    }
    Ok(value as u32)
}

/// A validated command, ready to send
struct CommandPlan {
    request: CommandRequest,
    /// State implied by success
    fragment: SnapshotPatch,
    motion: Option<MotionRequest>,
}

pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    motion: Arc<MotionController>,
    backend: Arc<dyn CommandBackend>,
    events: SharedEventBus,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        motion: Arc<MotionController>,
        backend: Arc<dyn CommandBackend>,
        events: SharedEventBus,
    ) -> Self {
        Self {
            registry,
            motion,
            backend,
            events,
        }
    }

    /// Validate, send and apply a command.
    ///
    /// On success returns the fragment that was merged into the registry. On
    /// failure nothing was changed and nothing is retried.
    pub async fn dispatch(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<SnapshotPatch, CommandError> {
        let verb = command.verb();

        let plan = match self.plan(device_id, &command).await {
            Ok(plan) => plan,
            Err(source) => {
                return Err(self.fail(CommandError::Validation {
                    device_id: device_id.to_string(),
                    verb,
                    source,
                }))
            }
        };

        debug!("{} on '{}' -> POST {}", verb, device_id, plan.request.path);
        let remote = match self.backend.post(&plan.request).await {
            Ok(remote) => remote,
            Err(e) => return Err(self.fail(command_error(device_id, verb, e))),
        };

        let fragment = self.apply(device_id, &command, plan, remote).await;
        info!("{} on '{}' accepted", verb, device_id);
        self.events.publish_command(
            device_id,
            CommandEvent::Succeeded {
                verb: verb.to_string(),
            },
        );
        Ok(fragment)
    }

    /// Dispatch a command given as verb name plus JSON parameters
    pub async fn dispatch_verb(
        &self,
        device_id: &str,
        verb: &str,
        params: &Value,
    ) -> Result<SnapshotPatch, CommandError> {
        match DeviceCommand::from_verb(verb, params) {
            Ok(command) => self.dispatch(device_id, command).await,
            Err(source) => {
                let verb = DeviceCommand::VERBS
                    .into_iter()
                    .find(|known| *known == verb)
                    .unwrap_or("unknown");
                Err(self.fail(CommandError::Validation {
                    device_id: device_id.to_string(),
                    verb,
                    source,
                }))
            }
        }
    }

    fn fail(&self, err: CommandError) -> CommandError {
        warn!("{}", err);
        self.events.publish_command(
            err.device_id(),
            CommandEvent::Failed {
                verb: err.verb().to_string(),
                message: err.to_string(),
            },
        );
        err
    }

    async fn plan(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<CommandPlan, ValidationError> {
        let snapshot = self
            .registry
            .snapshot(device_id)
            .await
            .ok_or_else(|| ValidationError::UnknownDevice(device_id.to_string()))?;
        if !command.applies_to(snapshot.class) {
            return Err(ValidationError::UnsupportedVerb {
                verb: command.verb(),
                class: snapshot.class,
            });
        }

        let class = snapshot.class.api_segment();
        let endpoint = |action: &str| format!("/api/{}/{}", class, action);

        let plan = match *command {
            DeviceCommand::SetAzimuth {
                azimuth,
                speed,
                reverse,
            } => {
                check_bounds(&snapshot, azimuth)?;
                let speed = self.resolve_speed(&snapshot, speed)?;
                let reverse = reverse.unwrap_or_else(|| shorter_arc_is_reverse(&snapshot, azimuth));
                moving_plan(
                    endpoint("azimuth"),
                    json!({ "deviceId": device_id, "azimuth": azimuth }),
                    MotionRequest {
                        target: azimuth,
                        speed,
                        reverse,
                    },
                )
            }
            DeviceCommand::RotateTo {
                position,
                speed,
                reverse,
            } => {
                check_bounds(&snapshot, position)?;
                let speed = self.resolve_speed(&snapshot, speed)?;
                moving_plan(
                    endpoint("position"),
                    json!({ "deviceId": device_id, "position": position }),
                    MotionRequest {
                        target: position,
                        speed,
                        reverse: reverse.unwrap_or_else(|| snapshot.reverse()),
                    },
                )
            }
            DeviceCommand::ChangeFilter { index } => {
                let target = f64::from(index);
                check_bounds(&snapshot, target)?;
                let speed = self.resolve_speed(&snapshot, None)?;
                moving_plan(
                    endpoint("position"),
                    json!({ "deviceId": device_id, "position": index }),
                    MotionRequest {
                        target,
                        speed,
                        reverse: false,
                    },
                )
            }
            DeviceCommand::SetSlewRate { index } => {
                let target = f64::from(index);
                check_bounds(&snapshot, target)?;
                let speed = self.resolve_speed(&snapshot, None)?;
                moving_plan(
                    endpoint("slew-rate"),
                    json!({ "deviceId": device_id, "index": index }),
                    MotionRequest {
                        target,
                        speed,
                        reverse: false,
                    },
                )
            }
            DeviceCommand::OpenShutter => state_plan(
                endpoint("shutter/open"),
                json!({ "deviceId": device_id }),
                SnapshotPatch {
                    shutter: Some(ShutterState::Open),
                    ..Default::default()
                },
            ),
            DeviceCommand::CloseShutter => state_plan(
                endpoint("shutter/close"),
                json!({ "deviceId": device_id }),
                SnapshotPatch {
                    shutter: Some(ShutterState::Closed),
                    ..Default::default()
                },
            ),
            DeviceCommand::SetReverse { reverse } => state_plan(
                endpoint("reverse"),
                json!({ "deviceId": device_id, "reverse": reverse }),
                SnapshotPatch {
                    reverse: Some(reverse),
                    ..Default::default()
                },
            ),
            DeviceCommand::Park => state_plan(
                endpoint("park"),
                json!({ "deviceId": device_id }),
                SnapshotPatch {
                    parked: Some(true),
                    tracking: Some(false),
                    ..Default::default()
                },
            ),
            DeviceCommand::Unpark => state_plan(
                endpoint("unpark"),
                json!({ "deviceId": device_id }),
                SnapshotPatch {
                    parked: Some(false),
                    ..Default::default()
                },
            ),
            DeviceCommand::Stop => state_plan(
                endpoint("stop"),
                json!({ "deviceId": device_id }),
                SnapshotPatch {
                    is_moving: Some(false),
                    ..Default::default()
                },
            ),
        };
        Ok(plan)
    }

    fn resolve_speed(
        &self,
        snapshot: &DeviceSnapshot,
        speed: Option<f64>,
    ) -> Result<f64, ValidationError> {
        let speed = speed.unwrap_or_else(|| {
            self.registry
                .catalog()
                .default_speed(&snapshot.id, snapshot.class)
        });
        if speed.is_finite() && speed > 0.0 {
            Ok(speed)
        } else {
            Err(ValidationError::InvalidSpeed(speed))
        }
    }

    /// Merge the accepted command into the registry and start or stop motion
    async fn apply(
        &self,
        device_id: &str,
        command: &DeviceCommand,
        plan: CommandPlan,
        remote: Option<SnapshotPatch>,
    ) -> SnapshotPatch {
        let mut remote = remote.unwrap_or_default();
        if plan.motion.is_some() || *command == DeviceCommand::Stop {
            // Position and motion state belong to the motion controller
            remote.position = None;
            remote.target = None;
            remote.is_moving = None;
        }
        let fragment = plan.fragment.overlay(remote);

        let mut state = fragment.clone();
        state.target = None;
        state.is_moving = None;
        if !state.is_empty() {
            if let Err(e) = self.registry.apply_command_patch(device_id, &state).await {
                warn!("Could not apply {} result to '{}': {}", command.verb(), device_id, e);
            }
        }

        if let Some(request) = plan.motion {
            if let Err(e) = self.motion.move_to(device_id, request).await {
                warn!("Could not start motion of '{}': {}", device_id, e);
            }
        } else if *command == DeviceCommand::Stop {
            if let Err(e) = self.motion.stop(device_id).await {
                warn!("Could not stop '{}': {}", device_id, e);
            }
        }
        fragment
    }
}

fn moving_plan(path: String, body: Value, motion: MotionRequest) -> CommandPlan {
    CommandPlan {
        request: CommandRequest::new(path, body),
        fragment: SnapshotPatch {
            target: Some(motion.target),
            is_moving: Some(true),
            ..Default::default()
        },
        motion: Some(motion),
    }
}

fn state_plan(path: String, body: Value, fragment: SnapshotPatch) -> CommandPlan {
    CommandPlan {
        request: CommandRequest::new(path, body),
        fragment,
        motion: None,
    }
}

fn check_bounds(snapshot: &DeviceSnapshot, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && snapshot.contains(value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfBounds {
            value,
            min: snapshot.bounds.min,
            max: snapshot.bounds.max,
        })
    }
}

/// Whether turning backwards reaches `target` sooner
fn shorter_arc_is_reverse(snapshot: &DeviceSnapshot, target: f64) -> bool {
    let span = snapshot.bounds.span();
    let forward = (target - snapshot.position).rem_euclid(span);
    forward > span / 2.0
}

fn command_error(device_id: &str, verb: &'static str, err: BackendError) -> CommandError {
    match err {
        BackendError::Http { status, message } => CommandError::Rejected {
            device_id: device_id.to_string(),
            verb,
            status,
            message,
        },
        other => CommandError::Transport {
            device_id: device_id.to_string(),
            verb,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceCatalog;
    use crate::event::EventBus;
    use crate::motion::MotionConfig;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Records requests and answers with a canned result
    #[derive(Default)]
    struct FakeBackend {
        requests: Mutex<Vec<CommandRequest>>,
        status: Option<u16>,
        reply: Option<SnapshotPatch>,
    }

    #[async_trait]
    impl CommandBackend for FakeBackend {
        async fn post(
            &self,
            request: &CommandRequest,
        ) -> Result<Option<SnapshotPatch>, BackendError> {
            self.requests.lock().await.push(request.clone());
            match self.status {
                Some(status) => Err(BackendError::Http {
                    status,
                    message: "rejected".to_string(),
                }),
                None => Ok(self.reply.clone()),
            }
        }
    }

    struct Fixture {
        dispatcher: CommandDispatcher,
        registry: Arc<DeviceRegistry>,
        motion: Arc<MotionController>,
        backend: Arc<FakeBackend>,
    }

    fn fixture(backend: FakeBackend) -> Fixture {
        let registry = Arc::new(DeviceRegistry::new(DeviceCatalog::default()));
        let events = Arc::new(EventBus::default());
        let motion = Arc::new(MotionController::new(
            MotionConfig::default(),
            registry.clone(),
            events.clone(),
        ));
        let backend = Arc::new(backend);
        let dispatcher = CommandDispatcher::new(
            registry.clone(),
            motion.clone(),
            backend.clone(),
            events,
        );
        Fixture {
            dispatcher,
            registry,
            motion,
            backend,
        }
    }

    #[tokio::test]
    async fn test_out_of_range_azimuth_never_reaches_backend() {
        let f = fixture(FakeBackend::default());
        let before = f.registry.snapshot("dome").await.unwrap();

        let err = f
            .dispatcher
            .dispatch(
                "dome",
                DeviceCommand::SetAzimuth {
                    azimuth: 400.0,
                    speed: None,
                    reverse: None,
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.device_id(), "dome");
        assert_eq!(err.verb(), "setAzimuth");
        assert!(matches!(
            err.validation(),
            Some(ValidationError::OutOfBounds { value, .. }) if *value == 400.0
        ));
        assert!(f.backend.requests.lock().await.is_empty());
        assert_eq!(f.registry.snapshot("dome").await.unwrap(), before);
        assert!(!f.motion.is_active("dome").await);
    }

    #[tokio::test]
    async fn test_verb_must_match_class() {
        let f = fixture(FakeBackend::default());
        let err = f
            .dispatcher
            .dispatch("rotator", DeviceCommand::OpenShutter)
            .await
            .unwrap_err();
        assert_eq!(
            err.validation(),
            Some(&ValidationError::UnsupportedVerb {
                verb: "openShutter",
                class: DeviceClass::Rotator
            })
        );

        let err = f
            .dispatcher
            .dispatch("camera", DeviceCommand::Stop)
            .await
            .unwrap_err();
        assert_eq!(
            err.validation(),
            Some(&ValidationError::UnknownDevice("camera".to_string()))
        );
        assert!(f.backend.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_command_changes_nothing() {
        let f = fixture(FakeBackend {
            status: Some(500),
            ..Default::default()
        });
        let before = f.registry.snapshot("rotator").await.unwrap();

        let err = f
            .dispatcher
            .dispatch(
                "rotator",
                DeviceCommand::RotateTo {
                    position: 90.0,
                    speed: None,
                    reverse: None,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CommandError::Rejected { status: 500, verb: "rotateTo", .. }
        ));
        assert_eq!(f.backend.requests.lock().await.len(), 1);
        assert_eq!(f.registry.snapshot("rotator").await.unwrap(), before);
        assert!(!f.motion.is_active("rotator").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_filter_posts_and_moves() {
        let f = fixture(FakeBackend::default());

        let fragment = f
            .dispatcher
            .dispatch("filterWheel", DeviceCommand::ChangeFilter { index: 3 })
            .await
            .unwrap();
        assert_eq!(fragment.target, Some(3.0));
        assert_eq!(fragment.is_moving, Some(true));

        let requests = f.backend.requests.lock().await.clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/api/filterwheel/position");
        assert_eq!(
            requests[0].body,
            json!({ "deviceId": "filterWheel", "position": 3 })
        );

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        let wheel = f.registry.snapshot("filterWheel").await.unwrap();
        assert_eq!(wheel.position, 3.0);
        assert_eq!(wheel.current_filter(), Some("Green"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_azimuth_takes_shorter_arc() {
        let f = fixture(FakeBackend::default());
        f.dispatcher
            .dispatch(
                "dome",
                DeviceCommand::SetAzimuth {
                    azimuth: 300.0,
                    speed: None,
                    reverse: None,
                },
            )
            .await
            .unwrap();

        let task = f.motion.active_task("dome").await.unwrap();
        assert!(task.reverse);
        assert_eq!(task.speed, 50.0);

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(f.registry.snapshot("dome").await.unwrap().position, 355.0);
        f.motion.stop("dome").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_echoed_position_does_not_teleport() {
        let f = fixture(FakeBackend {
            reply: Some(SnapshotPatch {
                position: Some(90.0),
                ..Default::default()
            }),
            ..Default::default()
        });
        f.dispatcher
            .dispatch(
                "dome",
                DeviceCommand::SetAzimuth {
                    azimuth: 90.0,
                    speed: None,
                    reverse: None,
                },
            )
            .await
            .unwrap();
        let dome = f.registry.snapshot("dome").await.unwrap();
        assert_eq!(dome.position, 0.0);
        assert!(dome.is_moving);
        f.motion.stop("dome").await.unwrap();
    }

    #[tokio::test]
    async fn test_state_commands_merge_fragment() {
        let f = fixture(FakeBackend::default());

        f.dispatcher.dispatch("dome", DeviceCommand::OpenShutter).await.unwrap();
        let dome = f.registry.snapshot("dome").await.unwrap();
        assert!(matches!(
            dome.detail,
            crate::device::DeviceDetail::Dome { shutter: ShutterState::Open, .. }
        ));

        f.dispatcher.dispatch("mount", DeviceCommand::Park).await.unwrap();
        let mount = f.registry.snapshot("mount").await.unwrap();
        assert!(matches!(
            mount.detail,
            crate::device::DeviceDetail::Mount { parked: true, tracking: false, .. }
        ));

        f.dispatcher
            .dispatch("rotator", DeviceCommand::SetReverse { reverse: true })
            .await
            .unwrap();
        assert!(f.registry.snapshot("rotator").await.unwrap().reverse());

        let paths: Vec<String> = f
            .backend
            .requests
            .lock()
            .await
            .iter()
            .map(|r| r.path.clone())
            .collect();
        assert_eq!(
            paths,
            vec!["/api/dome/shutter/open", "/api/mount/park", "/api/rotator/reverse"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_local_motion() {
        let f = fixture(FakeBackend::default());
        f.dispatcher
            .dispatch(
                "rotator",
                DeviceCommand::RotateTo {
                    position: 120.0,
                    speed: Some(10.0),
                    reverse: None,
                },
            )
            .await
            .unwrap();
        assert!(f.motion.is_active("rotator").await);

        f.dispatcher.dispatch("rotator", DeviceCommand::Stop).await.unwrap();
        assert!(!f.motion.is_active("rotator").await);
        assert!(!f.registry.snapshot("rotator").await.unwrap().is_moving);
        assert_eq!(
            f.backend.requests.lock().await.last().map(|r| r.path.clone()),
            Some("/api/rotator/stop".to_string())
        );
    }

    #[tokio::test]
    async fn test_invalid_speed_is_rejected() {
        let f = fixture(FakeBackend::default());
        let err = f
            .dispatcher
            .dispatch(
                "rotator",
                DeviceCommand::RotateTo {
                    position: 10.0,
                    speed: Some(-1.0),
                    reverse: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.validation(), Some(&ValidationError::InvalidSpeed(-1.0)));
    }

    #[test]
    fn test_from_verb() {
        assert_eq!(
            DeviceCommand::from_verb("changeFilter", &json!({ "index": 2 })).unwrap(),
            DeviceCommand::ChangeFilter { index: 2 }
        );
        assert_eq!(
            DeviceCommand::from_verb("setAzimuth", &json!({ "azimuth": 12.5, "speed": 20 }))
                .unwrap(),
            DeviceCommand::SetAzimuth {
                azimuth: 12.5,
                speed: Some(20.0),
                reverse: None
            }
        );
        assert_eq!(
            DeviceCommand::from_verb("changeFilter", &json!({ "index": 2.5 })),
            Err(ValidationError::NotAnIndex(2.5))
        );
        assert_eq!(
            DeviceCommand::from_verb("rotateTo", &json!({})),
            Err(ValidationError::MissingParameter {
                verb: "rotateTo",
                name: "position"
            })
        );
        assert_eq!(
            DeviceCommand::from_verb("selfDestruct", &json!({})),
            Err(ValidationError::UnknownVerb("selfDestruct".to_string()))
        );
    }

    #[tokio::test]
    async fn test_dispatch_verb_reports_unknown_verb() {
        let f = fixture(FakeBackend::default());
        let err = f
            .dispatcher
            .dispatch_verb("dome", "selfDestruct", &json!({}))
            .await
            .unwrap_err();
        assert!(err.validation().is_some());
        assert_eq!(err.verb(), "unknown");
        assert!(f.backend.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_verb_keeps_verb_on_bad_parameters() {
        let f = fixture(FakeBackend::default());
        let err = f
            .dispatcher
            .dispatch_verb("rotator", "rotateTo", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.device_id(), "rotator");
        assert_eq!(err.verb(), "rotateTo");
        assert_eq!(
            err.validation(),
            Some(&ValidationError::MissingParameter {
                verb: "rotateTo",
                name: "position"
            })
        );

        let err = f
            .dispatcher
            .dispatch_verb("filterWheel", "changeFilter", &json!({ "index": 1.5 }))
            .await
            .unwrap_err();
        assert_eq!(err.verb(), "changeFilter");
        assert!(f.backend.requests.lock().await.is_empty());
    }

    #[test]
    fn test_verb_table_matches_commands() {
        let params = json!({ "azimuth": 1.0, "position": 1.0, "index": 1, "reverse": true });
        for verb in DeviceCommand::VERBS {
            let command = DeviceCommand::from_verb(verb, &params).unwrap();
            assert_eq!(command.verb(), verb);
        }
    }
}
