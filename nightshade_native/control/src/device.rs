//! Device model
//!
//! Snapshots describe one device as the dashboard sees it. Continuous devices
//! (dome azimuth, rotator angle) live in the half-open range `[min, max)`;
//! indexed devices (filter wheel slot, mount slew-speed step) use the
//! inclusive integer range `[min, max]`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

pub use nightshade_telemetry::DeviceClass;

/// Mechanical range of a device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

/// How positions behave at the ends of the range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WrapMode {
    /// Full circle, `max - min == 360`
    Full360,
    /// Circular over a narrower mechanical span
    LimitedRange,
    /// Discrete slots, reached in one step
    Indexed,
}

impl WrapMode {
    pub fn is_continuous(&self) -> bool {
        !matches!(self, WrapMode::Indexed)
    }
}

impl fmt::Display for WrapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WrapMode::Full360 => "full360",
            WrapMode::LimitedRange => "limitedRange",
            WrapMode::Indexed => "indexed",
        };
        f.write_str(s)
    }
}

/// Dome shutter status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShutterState {
    Open,
    Closed,
    Opening,
    Closing,
    Error,
}

impl fmt::Display for ShutterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutterState::Open => "Open",
            ShutterState::Closed => "Closed",
            ShutterState::Opening => "Opening",
            ShutterState::Closing => "Closing",
            ShutterState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Class-specific part of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DeviceDetail {
    #[serde(rename_all = "camelCase")]
    Mount {
        parked: bool,
        tracking: bool,
        /// Labels of the slew-speed steps, indexed by position
        slew_rates: Vec<String>,
        slew_rate: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Dome { shutter: ShutterState, slaved: bool },
    #[serde(rename_all = "camelCase")]
    Rotator { reverse: bool },
    #[serde(rename_all = "camelCase")]
    FilterWheel {
        /// Filter names, slot `n` is `filters[n - 1]`
        filters: Vec<String>,
        current_filter: Option<String>,
    },
}

/// Catalog entry used to create a device's initial snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub id: String,
    pub class: DeviceClass,
    pub wrap_mode: WrapMode,
    pub bounds: Bounds,
    /// Speed used when a command does not give one
    pub default_speed: f64,
    /// Filter names or slew-rate labels
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub reverse: bool,
}

impl DeviceProfile {
    /// Built-in profile for a class
    pub fn default_for(class: DeviceClass) -> Self {
        let labels = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        match class {
            DeviceClass::Mount => Self {
                id: class.default_device_id().to_string(),
                class,
                wrap_mode: WrapMode::Indexed,
                bounds: Bounds::new(0.0, 3.0),
                default_speed: 10.0,
                labels: labels(&["Guide", "Centering", "Find", "Slew"]),
                reverse: false,
            },
            DeviceClass::Dome => Self {
                id: class.default_device_id().to_string(),
                class,
                wrap_mode: WrapMode::Full360,
                bounds: Bounds::new(0.0, 360.0),
                default_speed: 50.0,
                labels: Vec::new(),
                reverse: false,
            },
            DeviceClass::Rotator => Self {
                id: class.default_device_id().to_string(),
                class,
                wrap_mode: WrapMode::LimitedRange,
                bounds: Bounds::new(-180.0, 180.0),
                default_speed: 50.0,
                labels: Vec::new(),
                reverse: false,
            },
            DeviceClass::FilterWheel => Self {
                id: class.default_device_id().to_string(),
                class,
                wrap_mode: WrapMode::Indexed,
                bounds: Bounds::new(1.0, 4.0),
                default_speed: 10.0,
                labels: labels(&["Luminance", "Red", "Green", "Blue"]),
                reverse: false,
            },
        }
    }
}

/// Partial snapshot update.
///
/// Used for both telemetry payloads and command response fragments; every
/// field is optional and only present fields are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SnapshotPatch {
    #[serde(alias = "connected", skip_serializing_if = "Option::is_none")]
    pub is_connected: Option<bool>,
    #[serde(alias = "moving", alias = "slewing", skip_serializing_if = "Option::is_none")]
    pub is_moving: Option<bool>,
    #[serde(
        alias = "currentPosition",
        alias = "azimuth",
        alias = "angle",
        alias = "currentIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub position: Option<f64>,
    #[serde(
        alias = "targetPosition",
        alias = "targetIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,

    // Mount
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slew_rates: Option<Vec<String>>,

    // Dome
    #[serde(alias = "shutterStatus", skip_serializing_if = "Option::is_none")]
    pub shutter: Option<ShutterState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slaved: Option<bool>,

    // Rotator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse: Option<bool>,

    // Filter wheel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_filter: Option<String>,
}

impl SnapshotPatch {
    pub fn is_empty(&self) -> bool {
        *self == SnapshotPatch::default()
    }

    /// Overlay `other` on top of `self`, fields in `other` win
    pub fn overlay(mut self, other: SnapshotPatch) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            is_connected, is_moving, position, target, bounds, parked, tracking, slew_rates,
            shutter, slaved, reverse, filters, current_filter
        );
        self
    }
}

/// State of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub id: String,
    pub class: DeviceClass,
    pub is_connected: bool,
    pub is_moving: bool,
    pub position: f64,
    pub target: f64,
    pub bounds: Bounds,
    pub wrap_mode: WrapMode,
    pub detail: DeviceDetail,
}

impl DeviceSnapshot {
    /// Initial snapshot at rest at zero, or at `min` when zero is out of range
    pub fn from_profile(id: impl Into<String>, profile: &DeviceProfile) -> Self {
        let bounds = profile.bounds;
        let start = if profile.wrap_mode.is_continuous() && bounds.min <= 0.0 && 0.0 < bounds.max {
            0.0
        } else {
            bounds.min
        };
        let detail = match profile.class {
            DeviceClass::Mount => DeviceDetail::Mount {
                parked: false,
                tracking: false,
                slew_rates: profile.labels.clone(),
                slew_rate: None,
            },
            DeviceClass::Dome => DeviceDetail::Dome {
                shutter: ShutterState::Closed,
                slaved: false,
            },
            DeviceClass::Rotator => DeviceDetail::Rotator {
                reverse: profile.reverse,
            },
            DeviceClass::FilterWheel => DeviceDetail::FilterWheel {
                filters: profile.labels.clone(),
                current_filter: None,
            },
        };

        let mut snapshot = Self {
            id: id.into(),
            class: profile.class,
            is_connected: false,
            is_moving: false,
            position: start,
            target: start,
            bounds,
            wrap_mode: profile.wrap_mode,
            detail,
        };
        snapshot.refresh_labels();
        snapshot
    }

    /// Whether `value` is a reachable position
    pub fn contains(&self, value: f64) -> bool {
        if self.wrap_mode.is_continuous() {
            self.bounds.min <= value && value < self.bounds.max
        } else {
            self.bounds.min <= value && value <= self.bounds.max
        }
    }

    /// Bring a position into range: wrap continuous values, round and clamp indices
    pub fn normalize(&self, value: f64) -> f64 {
        if self.wrap_mode.is_continuous() {
            wrap_into(value, self.bounds)
        } else {
            value.round().clamp(self.bounds.min, self.bounds.max)
        }
    }

    /// Name of the filter in the current slot
    pub fn current_filter(&self) -> Option<&str> {
        match &self.detail {
            DeviceDetail::FilterWheel { current_filter, .. } => current_filter.as_deref(),
            _ => None,
        }
    }

    pub fn reverse(&self) -> bool {
        matches!(self.detail, DeviceDetail::Rotator { reverse: true })
    }

    /// Re-derive labels that follow the position
    pub(crate) fn refresh_labels(&mut self) {
        let index = self.position.round();
        match &mut self.detail {
            DeviceDetail::FilterWheel {
                filters,
                current_filter,
            } => {
                *current_filter = label_at(filters, index - 1.0);
            }
            DeviceDetail::Mount {
                slew_rates,
                slew_rate,
                ..
            } => {
                *slew_rate = label_at(slew_rates, index);
            }
            _ => {}
        }
    }

    /// Apply a partial update. Returns true when anything changed.
    pub fn merge(&mut self, patch: &SnapshotPatch) -> bool {
        let before = self.clone();

        if let Some(connected) = patch.is_connected {
            self.is_connected = connected;
        }
        if let Some(moving) = patch.is_moving {
            self.is_moving = moving;
        }
        if let Some(bounds) = patch.bounds {
            if bounds.span() > 0.0 {
                self.bounds = bounds;
            } else {
                debug!("Ignoring empty bounds {:?} for '{}'", bounds, self.id);
            }
        }

        let mut position = patch.position;
        match &mut self.detail {
            DeviceDetail::Mount {
                parked,
                tracking,
                slew_rates,
                ..
            } => {
                if let Some(v) = patch.parked {
                    *parked = v;
                }
                if let Some(v) = patch.tracking {
                    *tracking = v;
                }
                if let Some(rates) = &patch.slew_rates {
                    *slew_rates = rates.clone();
                    if !rates.is_empty() {
                        self.bounds = Bounds::new(0.0, (rates.len() - 1) as f64);
                    }
                }
            }
            DeviceDetail::Dome { shutter, slaved } => {
                if let Some(v) = patch.shutter {
                    *shutter = v;
                }
                if let Some(v) = patch.slaved {
                    *slaved = v;
                }
            }
            DeviceDetail::Rotator { reverse } => {
                if let Some(v) = patch.reverse {
                    *reverse = v;
                }
            }
            DeviceDetail::FilterWheel { filters, .. } => {
                if let Some(names) = &patch.filters {
                    *filters = names.clone();
                    if !names.is_empty() {
                        self.bounds = Bounds::new(1.0, names.len() as f64);
                    }
                }
                if position.is_none() {
                    if let Some(name) = &patch.current_filter {
                        match filters.iter().position(|f| f == name) {
                            Some(slot) => position = Some((slot + 1) as f64),
                            None => debug!("Unknown filter '{}' reported for '{}'", name, self.id),
                        }
                    }
                }
            }
        }

        // A new range re-homes positions the patch leaves untouched
        let resized = self.bounds != before.bounds;
        if let Some(p) = position.or(resized.then_some(self.position)) {
            self.position = self.normalize(p);
        }
        if let Some(t) = patch.target.or(resized.then_some(self.target)) {
            self.target = self.normalize(t);
        }
        self.refresh_labels();

        *self != before
    }
}

/// Wrap `value` into `[min, max)`
pub(crate) fn wrap_into(value: f64, bounds: Bounds) -> f64 {
    if bounds.min <= value && value < bounds.max {
        return value;
    }
    let span = bounds.span();
    if span <= 0.0 {
        return bounds.min;
    }
    let wrapped = bounds.min + (value - bounds.min).rem_euclid(span);
    if wrapped >= bounds.max {
        bounds.min
    } else {
        wrapped
    }
}

fn label_at(labels: &[String], index: f64) -> Option<String> {
    if index < 0.0 {
        return None;
    }
    labels.get(index as usize).cloned()
}
