//! Tick-driven motion simulation
//!
//! Each moving device gets one task that advances its position every tick
//! until it reaches the target. Per tick:
//!
//! 1. `step = speed / speed_divisor`, negated when moving in reverse
//! 2. `candidate = position + step`, wrapped back into `[min, max)`
//! 3. if the wrapped position is within `|step|` of the target, commit the
//!    target exactly and finish; otherwise commit the wrapped position
//!
//! Indexed devices (filter wheels, slew-speed selectors) reach the target in
//! a single tick.

use crate::device::{wrap_into, Bounds, DeviceSnapshot};
use crate::error::MotionError;
use crate::event::{MotionEvent, SharedEventBus};
use crate::registry::DeviceRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Timing of the simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MotionConfig {
    pub tick_period_ms: u64,
    /// Speed units covered per tick are `speed / speed_divisor`
    pub speed_divisor: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 100,
            speed_divisor: 10.0,
        }
    }
}

impl MotionConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms.max(1))
    }

    /// Signed distance covered in one tick
    pub fn step(&self, speed: f64, reverse: bool) -> f64 {
        let direction = if reverse { -1.0 } else { 1.0 };
        speed / self.speed_divisor * direction
    }
}

/// Boundary behavior of a moving device
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WrapPolicy {
    /// Positions in `[min, max)`, crossing one end re-enters at the other
    Circular(Bounds),
    /// Integer slots in `[min, max]`
    Indexed(Bounds),
}

impl WrapPolicy {
    pub fn for_snapshot(snapshot: &DeviceSnapshot) -> Self {
        if snapshot.wrap_mode.is_continuous() {
            WrapPolicy::Circular(snapshot.bounds)
        } else {
            WrapPolicy::Indexed(snapshot.bounds)
        }
    }

    /// Map a candidate position back into range
    pub fn wrap(&self, candidate: f64) -> f64 {
        match *self {
            WrapPolicy::Circular(Bounds { min, max }) => {
                let wrapped = if candidate >= max {
                    min + (candidate - max)
                } else if candidate < min {
                    max - (min - candidate)
                } else {
                    candidate
                };
                // Steps larger than the whole span still land in range
                wrap_into(wrapped, Bounds::new(min, max))
            }
            WrapPolicy::Indexed(Bounds { min, max }) => candidate.round().clamp(min, max),
        }
    }

    /// Distance between two positions, the short way round for circular ranges
    pub fn distance(&self, a: f64, b: f64) -> f64 {
        let direct = (a - b).abs();
        match self {
            WrapPolicy::Circular(bounds) => direct.min(bounds.span() - direct),
            WrapPolicy::Indexed(_) => direct,
        }
    }
}

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Advance {
    pub position: f64,
    pub converged: bool,
}

/// Compute the next position of a moving device
pub fn advance(current: f64, target: f64, step: f64, policy: WrapPolicy) -> Advance {
    match policy {
        WrapPolicy::Indexed(_) => Advance {
            position: policy.wrap(target),
            converged: true,
        },
        WrapPolicy::Circular(_) => {
            let next = policy.wrap(current + step);
            if policy.distance(next, target) <= step.abs() {
                Advance {
                    position: target,
                    converged: true,
                }
            } else {
                Advance {
                    position: next,
                    converged: false,
                }
            }
        }
    }
}

/// Parameters of a move
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionRequest {
    pub target: f64,
    pub speed: f64,
    pub reverse: bool,
}

/// A live motion
#[derive(Debug, Clone, PartialEq)]
pub struct MotionTask {
    pub device_id: String,
    pub target: f64,
    pub speed: f64,
    pub reverse: bool,
    pub policy: WrapPolicy,
}

struct ActiveMotion {
    task: MotionTask,
    epoch: u64,
    handle: JoinHandle<()>,
}

type TaskMap = Arc<RwLock<HashMap<String, ActiveMotion>>>;

/// Runs at most one motion task per device
pub struct MotionController {
    config: MotionConfig,
    registry: Arc<DeviceRegistry>,
    events: SharedEventBus,
    tasks: TaskMap,
    /// Serializes start/stop so replacing a task is atomic per caller
    control: Mutex<()>,
}

impl MotionController {
    pub fn new(config: MotionConfig, registry: Arc<DeviceRegistry>, events: SharedEventBus) -> Self {
        Self {
            config,
            registry,
            events,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            control: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Start moving a device toward `request.target`.
    ///
    /// Any motion already running on the device is cancelled first. The
    /// target is wrapped (continuous) or clamped (indexed) into range.
    pub async fn move_to(
        &self,
        device_id: &str,
        request: MotionRequest,
    ) -> Result<MotionTask, MotionError> {
        if !(request.speed.is_finite() && request.speed > 0.0) {
            return Err(MotionError::InvalidSpeed(request.speed));
        }

        let _control = self.control.lock().await;
        if self.cancel_task(device_id).await {
            debug!("Replacing active motion of '{}'", device_id);
        }

        let snapshot = self
            .registry
            .snapshot(device_id)
            .await
            .ok_or_else(|| MotionError::UnknownDevice(device_id.to_string()))?;
        let policy = WrapPolicy::for_snapshot(&snapshot);
        let target = snapshot.normalize(request.target);
        let epoch = self.registry.begin_motion(device_id, target).await?;

        let task = MotionTask {
            device_id: device_id.to_string(),
            target,
            speed: request.speed,
            reverse: request.reverse,
            policy,
        };
        let step = self.config.step(request.speed, request.reverse);
        info!(
            "Moving '{}' from {} to {} (step {})",
            device_id, snapshot.position, target, step
        );

        let period = self.config.tick_period();
        let first_tick = Instant::now() + period;
        {
            let mut tasks = self.tasks.write().await;
            let handle = tokio::spawn(run_motion(
                self.registry.clone(),
                self.tasks.clone(),
                self.events.clone(),
                task.clone(),
                epoch,
                step,
                first_tick,
                period,
            ));
            tasks.insert(
                device_id.to_string(),
                ActiveMotion {
                    task: task.clone(),
                    epoch,
                    handle,
                },
            );
        }

        self.events.publish_motion(
            device_id,
            MotionEvent::Started {
                target,
                speed: request.speed,
                reverse: request.reverse,
            },
        );
        Ok(task)
    }

    /// Stop a device where it stands.
    ///
    /// Idempotent: stopping an idle device only clears `is_moving`. Returns
    /// whether a running motion was cancelled.
    pub async fn stop(&self, device_id: &str) -> Result<bool, MotionError> {
        let _control = self.control.lock().await;
        let cancelled = self.cancel_task(device_id).await;
        let snapshot = self.registry.halt_motion(device_id).await?;
        if cancelled {
            info!("Stopped '{}' at {}", device_id, snapshot.position);
            self.events.publish_motion(
                device_id,
                MotionEvent::Stopped {
                    position: snapshot.position,
                },
            );
        }
        Ok(cancelled)
    }

    /// Stop every moving device
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.tasks.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!("Failed to stop '{}': {}", id, e);
            }
        }
    }

    pub async fn is_active(&self, device_id: &str) -> bool {
        self.tasks.read().await.contains_key(device_id)
    }

    pub async fn active_task(&self, device_id: &str) -> Option<MotionTask> {
        self.tasks
            .read()
            .await
            .get(device_id)
            .map(|active| active.task.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Remove and abort the device's task, waiting until it has ended
    async fn cancel_task(&self, device_id: &str) -> bool {
        let active = {
            let mut tasks = self.tasks.write().await;
            tasks.remove(device_id)
        };
        match active {
            Some(active) => {
                active.handle.abort();
                let _ = active.handle.await;
                trace!("Motion task of '{}' ended", device_id);
                true
            }
            None => false,
        }
    }
}

async fn run_motion(
    registry: Arc<DeviceRegistry>,
    tasks: TaskMap,
    events: SharedEventBus,
    task: MotionTask,
    epoch: u64,
    step: f64,
    first_tick: Instant,
    period: Duration,
) {
    let id = task.device_id.as_str();
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(snapshot) = registry.snapshot(id).await else {
            warn!("Device '{}' vanished during motion", id);
            break;
        };
        let next = advance(snapshot.position, task.target, step, task.policy);
        if !registry
            .apply_motion_step(id, epoch, next.position, !next.converged)
            .await
        {
            debug!("Motion of '{}' superseded", id);
            break;
        }
        trace!("'{}' at {}", id, next.position);

        if next.converged {
            info!("'{}' reached {}", id, task.target);
            events.publish_motion(
                id,
                MotionEvent::Completed {
                    position: task.target,
                },
            );
            break;
        }
    }

    let mut tasks = tasks.write().await;
    if tasks.get(id).map(|active| active.epoch) == Some(epoch) {
        tasks.remove(id);
    }
}
