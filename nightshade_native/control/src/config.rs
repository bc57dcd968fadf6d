//! Control settings
//!
//! Settings come from an optional JSON file and are then overridden by
//! environment variables:
//!
//! | variable | setting |
//! |---|---|
//! | `NIGHTSHADE_TELEMETRY_URL` | `telemetry.url` |
//! | `NIGHTSHADE_RECONNECT_MS` | `telemetry.reconnectIntervalMs` |
//! | `NIGHTSHADE_AUTO_RECONNECT` | `telemetry.autoReconnect` |
//! | `NIGHTSHADE_BACKEND_URL` | `backend.baseUrl` |
//! | `NIGHTSHADE_TICK_MS` | `motion.tickPeriodMs` |

use crate::backend::BackendConfig;
use crate::device::{DeviceClass, DeviceProfile, WrapMode};
use crate::error::ConfigError;
use crate::motion::MotionConfig;
use nightshade_telemetry::SupervisorConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

pub const ENV_TELEMETRY_URL: &str = "NIGHTSHADE_TELEMETRY_URL";
pub const ENV_RECONNECT_MS: &str = "NIGHTSHADE_RECONNECT_MS";
pub const ENV_AUTO_RECONNECT: &str = "NIGHTSHADE_AUTO_RECONNECT";
pub const ENV_BACKEND_URL: &str = "NIGHTSHADE_BACKEND_URL";
pub const ENV_TICK_MS: &str = "NIGHTSHADE_TICK_MS";

/// Static table of the devices the dashboard drives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCatalog {
    pub devices: Vec<DeviceProfile>,
}

impl Default for DeviceCatalog {
    fn default() -> Self {
        Self {
            devices: DeviceClass::ALL
                .iter()
                .map(|class| DeviceProfile::default_for(*class))
                .collect(),
        }
    }
}

impl DeviceCatalog {
    pub fn profile(&self, id: &str) -> Option<&DeviceProfile> {
        self.devices.iter().find(|p| p.id == id)
    }

    /// First profile of a class, used for devices first seen in telemetry
    pub fn default_profile(&self, class: DeviceClass) -> Option<&DeviceProfile> {
        self.devices.iter().find(|p| p.class == class)
    }

    /// Default command speed for a device, falling back to its class
    pub fn default_speed(&self, id: &str, class: DeviceClass) -> f64 {
        self.profile(id)
            .or_else(|| self.default_profile(class))
            .map(|p| p.default_speed)
            .unwrap_or_else(|| DeviceProfile::default_for(class).default_speed)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for profile in &self.devices {
            let key = format!("devices.{}", profile.id);
            if profile.id.is_empty() {
                return Err(ConfigError::invalid("devices", "device id must not be empty"));
            }
            if !seen.insert(profile.id.as_str()) {
                return Err(ConfigError::invalid(key, "duplicate device id"));
            }
            if !(profile.bounds.span() > 0.0) {
                return Err(ConfigError::invalid(
                    key,
                    format!("empty range {}..{}", profile.bounds.min, profile.bounds.max),
                ));
            }
            if profile.wrap_mode == WrapMode::Full360 && profile.bounds.span() != 360.0 {
                return Err(ConfigError::invalid(key, "full360 devices need a 360 degree range"));
            }
            if profile.wrap_mode.is_continuous()
                != matches!(profile.class, DeviceClass::Dome | DeviceClass::Rotator)
            {
                return Err(ConfigError::invalid(
                    key,
                    format!("{} devices cannot use {} wrapping", profile.class, profile.wrap_mode),
                ));
            }
            if !(profile.default_speed > 0.0) {
                return Err(ConfigError::invalid(key, "default speed must be positive"));
            }
        }
        Ok(())
    }
}

/// All settings of the control service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControlSettings {
    pub telemetry: SupervisorConfig,
    pub backend: BackendConfig,
    pub motion: MotionConfig,
    pub devices: DeviceCatalog,
}

impl ControlSettings {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a settings file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_json(&json)?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Defaults or the given file, then environment overrides, then validation
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_TELEMETRY_URL) {
            debug!("{} overrides telemetry url", ENV_TELEMETRY_URL);
            self.telemetry.url = url;
        }
        if let Some(ms) = lookup(ENV_RECONNECT_MS) {
            self.telemetry.reconnect_interval_ms = parse_env(ENV_RECONNECT_MS, &ms)?;
        }
        if let Some(flag) = lookup(ENV_AUTO_RECONNECT) {
            self.telemetry.auto_reconnect = parse_env(ENV_AUTO_RECONNECT, &flag)?;
        }
        if let Some(url) = lookup(ENV_BACKEND_URL) {
            debug!("{} overrides backend url", ENV_BACKEND_URL);
            self.backend.base_url = url;
        }
        if let Some(ms) = lookup(ENV_TICK_MS) {
            self.motion.tick_period_ms = parse_env(ENV_TICK_MS, &ms)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.url.is_empty() {
            return Err(ConfigError::invalid("telemetry.url", "must not be empty"));
        }
        if self.telemetry.reconnect_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "telemetry.reconnectIntervalMs",
                "must be greater than zero",
            ));
        }
        if self.backend.base_url.is_empty() {
            return Err(ConfigError::invalid("backend.baseUrl", "must not be empty"));
        }
        if self.motion.tick_period_ms == 0 {
            return Err(ConfigError::invalid("motion.tickPeriodMs", "must be greater than zero"));
        }
        if !(self.motion.speed_divisor > 0.0) {
            return Err(ConfigError::invalid("motion.speedDivisor", "must be positive"));
        }
        self.devices.validate()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("cannot parse '{}'", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Bounds;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = ControlSettings::default();
        assert_eq!(settings.telemetry.url, "ws://localhost:3001");
        assert_eq!(settings.telemetry.reconnect_interval_ms, 5000);
        assert_eq!(settings.backend.base_url, "http://localhost:3001");
        assert_eq!(settings.motion.tick_period_ms, 100);
        assert_eq!(settings.motion.speed_divisor, 10.0);
        assert_eq!(settings.devices.devices.len(), 4);
        settings.validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings = ControlSettings::from_json(
            r#"{ "telemetry": { "reconnectIntervalMs": 2500 }, "motion": { "tickPeriodMs": 50 } }"#,
        )
        .unwrap();
        assert_eq!(settings.telemetry.reconnect_interval_ms, 2500);
        assert_eq!(settings.telemetry.url, "ws://localhost:3001");
        assert_eq!(settings.motion.tick_period_ms, 50);
        assert_eq!(settings.motion.speed_divisor, 10.0);
    }

    #[test]
    fn test_custom_catalog() {
        let settings = ControlSettings::from_json(
            r#"{ "devices": { "devices": [
                { "id": "wheel-a", "class": "filterWheel", "wrapMode": "indexed",
                  "bounds": { "min": 1, "max": 5 }, "defaultSpeed": 10,
                  "labels": ["L", "R", "G", "B", "Ha"] }
            ] } }"#,
        )
        .unwrap();
        settings.validate().unwrap();
        let profile = settings.devices.profile("wheel-a").unwrap();
        assert_eq!(profile.bounds, Bounds::new(1.0, 5.0));
        assert_eq!(settings.devices.default_speed("wheel-a", DeviceClass::FilterWheel), 10.0);
        assert_eq!(settings.devices.default_speed("dome", DeviceClass::Dome), 50.0);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_TELEMETRY_URL, "ws://observatory:9000"),
            (ENV_RECONNECT_MS, "1000"),
            (ENV_AUTO_RECONNECT, "false"),
            (ENV_BACKEND_URL, "http://observatory:9000"),
            (ENV_TICK_MS, "20"),
        ]);
        let mut settings = ControlSettings::default();
        settings
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.telemetry.url, "ws://observatory:9000");
        assert_eq!(settings.telemetry.reconnect_interval_ms, 1000);
        assert!(!settings.telemetry.auto_reconnect);
        assert_eq!(settings.backend.base_url, "http://observatory:9000");
        assert_eq!(settings.motion.tick_period_ms, 20);
    }

    #[test]
    fn test_bad_env_value() {
        let mut settings = ControlSettings::default();
        let err = settings
            .apply_overrides(|key| (key == ENV_TICK_MS).then(|| "fast".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_TICK_MS));
    }

    #[test]
    fn test_validation_failures() {
        let mut settings = ControlSettings::default();
        settings.telemetry.reconnect_interval_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = ControlSettings::default();
        settings.devices.devices[1].bounds = Bounds::new(0.0, 180.0);
        assert!(settings.validate().is_err());

        let mut settings = ControlSettings::default();
        let duplicate = settings.devices.devices[0].clone();
        settings.devices.devices.push(duplicate);
        assert!(settings.validate().is_err());

        let mut settings = ControlSettings::default();
        settings.devices.devices[3].wrap_mode = WrapMode::LimitedRange;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ControlSettings::load(Path::new("/nonexistent/nightshade.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
