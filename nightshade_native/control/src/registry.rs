//! Device registry
//!
//! Single source of truth for device snapshots. Telemetry, the motion
//! controller and the command dispatcher write through it; the UI reads
//! snapshots and subscribes to changes.
//!
//! Each device sits behind its own lock. Change notifications are published
//! while that lock is held, so per device the notification order equals the
//! write order.

use crate::config::DeviceCatalog;
use crate::device::{DeviceClass, DeviceProfile, DeviceSnapshot, SnapshotPatch};
use crate::error::RegistryError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// Capacity of the change channel; slower subscribers skip ahead
pub const DEFAULT_CHANGE_BUFFER_SIZE: usize = 1024;

/// Who wrote a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeSource {
    Telemetry,
    Motion,
    Command,
}

/// One committed snapshot change
#[derive(Debug, Clone, Serialize)]
pub struct RegistryChange {
    /// Monotonically increasing across the registry
    pub sequence: u64,
    pub device_id: String,
    pub source: ChangeSource,
    pub snapshot: DeviceSnapshot,
}

struct DeviceEntry {
    snapshot: DeviceSnapshot,
    /// Bumped whenever motion starts or halts; stale motion writes are refused
    motion_epoch: u64,
}

pub struct DeviceRegistry {
    catalog: DeviceCatalog,
    devices: RwLock<HashMap<String, Arc<Mutex<DeviceEntry>>>>,
    changes: broadcast::Sender<RegistryChange>,
    sequence: AtomicU64,
}

impl DeviceRegistry {
    /// Create a registry holding one snapshot per catalog entry
    pub fn new(catalog: DeviceCatalog) -> Self {
        let devices = catalog
            .devices
            .iter()
            .map(|profile| {
                let entry = DeviceEntry {
                    snapshot: DeviceSnapshot::from_profile(profile.id.clone(), profile),
                    motion_epoch: 0,
                };
                (profile.id.clone(), Arc::new(Mutex::new(entry)))
            })
            .collect::<HashMap<_, _>>();
        info!("Device registry initialized with {} devices", devices.len());

        let (changes, _) = broadcast::channel(DEFAULT_CHANGE_BUFFER_SIZE);
        Self {
            catalog,
            devices: RwLock::new(devices),
            changes,
            sequence: AtomicU64::new(1),
        }
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    async fn entry(&self, id: &str) -> Option<Arc<Mutex<DeviceEntry>>> {
        self.devices.read().await.get(id).cloned()
    }

    fn publish(&self, source: ChangeSource, snapshot: &DeviceSnapshot) {
        let change = RegistryChange {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            device_id: snapshot.id.clone(),
            source,
            snapshot: snapshot.clone(),
        };
        // No subscribers is fine
        let _ = self.changes.send(change);
    }

    /// Current snapshot of a device, `None` when unknown
    pub async fn snapshot(&self, id: &str) -> Option<DeviceSnapshot> {
        let entry = self.entry(id).await?;
        let entry = entry.lock().await;
        Some(entry.snapshot.clone())
    }

    /// All snapshots ordered by id
    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let entries: Vec<_> = self.devices.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(entry.lock().await.snapshot.clone());
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Merge a telemetry update, creating the device on first sight.
    ///
    /// Returns the snapshot after the merge.
    pub async fn apply_telemetry(
        &self,
        id: &str,
        class: DeviceClass,
        patch: &SnapshotPatch,
    ) -> DeviceSnapshot {
        let entry = match self.entry(id).await {
            Some(entry) => entry,
            None => {
                let mut devices = self.devices.write().await;
                devices
                    .entry(id.to_string())
                    .or_insert_with(|| {
                        info!("Registering {} device '{}' from telemetry", class, id);
                        let profile = self.profile_for(id, class);
                        Arc::new(Mutex::new(DeviceEntry {
                            snapshot: DeviceSnapshot::from_profile(id, &profile),
                            motion_epoch: 0,
                        }))
                    })
                    .clone()
            }
        };

        let mut entry = entry.lock().await;
        if entry.snapshot.class != class {
            warn!(
                "Telemetry for '{}' claims class {}, registered as {}",
                id, class, entry.snapshot.class
            );
        }
        let bounds = entry.snapshot.bounds;
        if entry.snapshot.merge(patch) {
            if entry.snapshot.bounds != bounds && entry.snapshot.is_moving {
                // Local motion was planned against the old range
                debug!("Range of '{}' changed mid-motion, halting", id);
                entry.motion_epoch += 1;
                entry.snapshot.is_moving = false;
            }
            trace!("Telemetry updated '{}'", id);
            self.publish(ChangeSource::Telemetry, &entry.snapshot);
        }
        entry.snapshot.clone()
    }

    /// Merge a command response fragment into an existing device
    pub async fn apply_command_patch(
        &self,
        id: &str,
        patch: &SnapshotPatch,
    ) -> Result<DeviceSnapshot, RegistryError> {
        let entry = self
            .entry(id)
            .await
            .ok_or_else(|| RegistryError::UnknownDevice(id.to_string()))?;
        let mut entry = entry.lock().await;
        if entry.snapshot.merge(patch) {
            debug!("Command fragment applied to '{}'", id);
            self.publish(ChangeSource::Command, &entry.snapshot);
        }
        Ok(entry.snapshot.clone())
    }

    /// Mark a device as moving toward `target` and hand out the write token
    /// for the new motion.
    pub async fn begin_motion(&self, id: &str, target: f64) -> Result<u64, RegistryError> {
        let entry = self
            .entry(id)
            .await
            .ok_or_else(|| RegistryError::UnknownDevice(id.to_string()))?;
        let mut entry = entry.lock().await;
        entry.motion_epoch += 1;
        let target = entry.snapshot.normalize(target);
        entry.snapshot.target = target;
        entry.snapshot.is_moving = true;
        self.publish(ChangeSource::Motion, &entry.snapshot);
        Ok(entry.motion_epoch)
    }

    /// Commit one motion tick.
    ///
    /// Only accepted while `epoch` is the device's current motion; returns
    /// false for unknown devices and stale writers.
    pub async fn apply_motion_step(
        &self,
        id: &str,
        epoch: u64,
        new_position: f64,
        still_moving: bool,
    ) -> bool {
        let Some(entry) = self.entry(id).await else {
            return false;
        };
        let mut entry = entry.lock().await;
        if entry.motion_epoch != epoch {
            trace!(
                "Ignoring stale motion step for '{}' (epoch {} != {})",
                id,
                epoch,
                entry.motion_epoch
            );
            return false;
        }

        let snapshot = &mut entry.snapshot;
        snapshot.position = snapshot.normalize(new_position);
        snapshot.is_moving = still_moving;
        snapshot.refresh_labels();
        self.publish(ChangeSource::Motion, &entry.snapshot);
        true
    }

    /// End any motion of a device where it stands
    pub async fn halt_motion(&self, id: &str) -> Result<DeviceSnapshot, RegistryError> {
        let entry = self
            .entry(id)
            .await
            .ok_or_else(|| RegistryError::UnknownDevice(id.to_string()))?;
        let mut entry = entry.lock().await;
        entry.motion_epoch += 1;
        if entry.snapshot.is_moving {
            entry.snapshot.is_moving = false;
            self.publish(ChangeSource::Motion, &entry.snapshot);
        }
        Ok(entry.snapshot.clone())
    }

    /// Changes of every device
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    /// Changes of one device
    pub fn subscribe_device(&self, id: impl Into<String>) -> DeviceSubscription {
        DeviceSubscription {
            device_id: id.into(),
            receiver: self.changes.subscribe(),
        }
    }

    fn profile_for(&self, id: &str, class: DeviceClass) -> DeviceProfile {
        let mut profile = self
            .catalog
            .default_profile(class)
            .cloned()
            .unwrap_or_else(|| DeviceProfile::default_for(class));
        profile.id = id.to_string();
        profile
    }
}

/// Change stream filtered to one device
pub struct DeviceSubscription {
    device_id: String,
    receiver: broadcast::Receiver<RegistryChange>,
}

impl DeviceSubscription {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Next change of the device; `None` once the registry is gone
    pub async fn recv(&mut self) -> Option<RegistryChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) if change.device_id == self.device_id => return Some(change),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscriber for '{}' lagged, skipped {} changes",
                        self.device_id, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceDetail, ShutterState};

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(DeviceCatalog::default())
    }

    #[tokio::test]
    async fn test_catalog_devices_exist() {
        let registry = registry();
        assert_eq!(
            registry.device_ids().await,
            vec!["dome", "filterWheel", "mount", "rotator"]
        );
        let dome = registry.snapshot("dome").await.unwrap();
        assert_eq!(dome.class, DeviceClass::Dome);
        assert!(!dome.is_moving);
        assert!(registry.snapshot("camera").await.is_none());
    }

    #[tokio::test]
    async fn test_apply_telemetry_merges_and_notifies() {
        let registry = registry();
        let mut changes = registry.subscribe();

        let patch = SnapshotPatch {
            is_connected: Some(true),
            position: Some(90.0),
            shutter: Some(ShutterState::Open),
            ..Default::default()
        };
        let snapshot = registry.apply_telemetry("dome", DeviceClass::Dome, &patch).await;
        assert!(snapshot.is_connected);
        assert_eq!(snapshot.position, 90.0);

        let change = changes.recv().await.unwrap();
        assert_eq!(change.device_id, "dome");
        assert_eq!(change.source, ChangeSource::Telemetry);
        assert!(matches!(
            change.snapshot.detail,
            DeviceDetail::Dome { shutter: ShutterState::Open, .. }
        ));

        // Identical update changes nothing and publishes nothing
        registry.apply_telemetry("dome", DeviceClass::Dome, &patch).await;
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_apply_telemetry_upserts_unknown_device() {
        let registry = registry();
        let patch = SnapshotPatch {
            position: Some(45.0),
            ..Default::default()
        };
        let snapshot = registry
            .apply_telemetry("rotator-2", DeviceClass::Rotator, &patch)
            .await;
        assert_eq!(snapshot.id, "rotator-2");
        assert_eq!(snapshot.position, 45.0);
        assert_eq!(snapshot.bounds.min, -180.0);
        assert!(registry.snapshot("rotator-2").await.is_some());
    }

    #[tokio::test]
    async fn test_stale_motion_steps_are_refused() {
        let registry = registry();
        let first = registry.begin_motion("dome", 90.0).await.unwrap();
        assert!(registry.apply_motion_step("dome", first, 5.0, true).await);

        let second = registry.begin_motion("dome", 180.0).await.unwrap();
        assert!(!registry.apply_motion_step("dome", first, 10.0, true).await);
        assert!(registry.apply_motion_step("dome", second, 10.0, true).await);

        registry.halt_motion("dome").await.unwrap();
        assert!(!registry.apply_motion_step("dome", second, 15.0, true).await);

        let dome = registry.snapshot("dome").await.unwrap();
        assert_eq!(dome.position, 10.0);
        assert_eq!(dome.target, 180.0);
        assert!(!dome.is_moving);
    }

    #[tokio::test]
    async fn test_motion_for_unknown_device() {
        let registry = registry();
        assert_eq!(
            registry.begin_motion("nope", 1.0).await,
            Err(RegistryError::UnknownDevice("nope".to_string()))
        );
        assert!(!registry.apply_motion_step("nope", 1, 1.0, false).await);
        assert!(registry.halt_motion("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_device_subscription_filters_and_orders() {
        let registry = registry();
        let mut rotator = registry.subscribe_device("rotator");
        assert_eq!(rotator.device_id(), "rotator");

        let epoch = registry.begin_motion("rotator", 30.0).await.unwrap();
        registry
            .apply_telemetry(
                "dome",
                DeviceClass::Dome,
                &SnapshotPatch {
                    position: Some(1.0),
                    ..Default::default()
                },
            )
            .await;
        registry.apply_motion_step("rotator", epoch, 5.0, true).await;
        registry.apply_motion_step("rotator", epoch, 10.0, true).await;

        let a = rotator.recv().await.unwrap();
        let b = rotator.recv().await.unwrap();
        let c = rotator.recv().await.unwrap();
        assert!(a.sequence < b.sequence && b.sequence < c.sequence);
        assert_eq!(c.snapshot.position, 10.0);
        assert_eq!(c.device_id, "rotator");
    }

    #[tokio::test]
    async fn test_motion_step_updates_filter_label() {
        let registry = registry();
        let epoch = registry.begin_motion("filterWheel", 3.0).await.unwrap();
        registry.apply_motion_step("filterWheel", epoch, 3.0, false).await;
        let wheel = registry.snapshot("filterWheel").await.unwrap();
        assert_eq!(wheel.current_filter(), Some("Green"));
    }
}
