//! Telemetry frame envelope
//!
//! Every inbound message is a JSON text frame of the form
//! `{ "type": "<kind>", "payload": { ... } }`. Device frames may name the
//! device they describe with `payload.deviceId`; when they don't, the class's
//! default id is used.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

/// Device classes the dashboard knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceClass {
    Mount,
    Dome,
    Rotator,
    #[serde(alias = "filterwheel", alias = "filter_wheel")]
    FilterWheel,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 4] = [
        DeviceClass::Mount,
        DeviceClass::Dome,
        DeviceClass::Rotator,
        DeviceClass::FilterWheel,
    ];

    /// Wire name used in the frame `type` field
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Mount => "mount",
            DeviceClass::Dome => "dome",
            DeviceClass::Rotator => "rotator",
            DeviceClass::FilterWheel => "filterWheel",
        }
    }

    /// Id assumed for frames that don't carry a `deviceId`
    pub fn default_device_id(&self) -> &'static str {
        self.as_str()
    }

    /// Path segment of the REST command endpoints
    pub fn api_segment(&self) -> &'static str {
        match self {
            DeviceClass::Mount => "mount",
            DeviceClass::Dome => "dome",
            DeviceClass::Rotator => "rotator",
            DeviceClass::FilterWheel => "filterwheel",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "mount" => Some(DeviceClass::Mount),
            "dome" => Some(DeviceClass::Dome),
            "rotator" => Some(DeviceClass::Rotator),
            "filterWheel" | "filterwheel" | "filter_wheel" => Some(DeviceClass::FilterWheel),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceClass::from_wire(s).ok_or_else(|| ProtocolError::UnknownKind(s.to_string()))
    }
}

/// Frame discriminator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FrameKind {
    SystemInfo,
    Processes,
    Device(DeviceClass),
    /// Anything else; kept so the caller can log what it drops
    Unknown(String),
}

impl FrameKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "systemInfo" => FrameKind::SystemInfo,
            "processes" => FrameKind::Processes,
            other => match DeviceClass::from_wire(other) {
                Some(class) => FrameKind::Device(class),
                None => FrameKind::Unknown(other.to_string()),
            },
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FrameKind::SystemInfo => "systemInfo",
            FrameKind::Processes => "processes",
            FrameKind::Device(class) => class.as_str(),
            FrameKind::Unknown(kind) => kind,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded telemetry message.
///
/// Frames are immutable after decode; consumers take the payload by value.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    pub kind: FrameKind,
    pub payload: Value,
}

impl TelemetryFrame {
    pub fn new(kind: FrameKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// Build a device frame addressed to `device_id`
    pub fn device(class: DeviceClass, device_id: &str, mut payload: Map<String, Value>) -> Self {
        payload.insert("deviceId".to_string(), Value::String(device_id.to_string()));
        Self::new(FrameKind::Device(class), Value::Object(payload))
    }

    /// Decode a text frame.
    ///
    /// Unrecognized kinds decode successfully as [`FrameKind::Unknown`];
    /// device frames must carry an object payload.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let mut envelope = match value {
            Value::Object(map) => map,
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "expected a JSON object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let kind = match envelope.get("type") {
            Some(Value::String(kind)) => FrameKind::parse(kind),
            _ => return Err(ProtocolError::MissingKind),
        };
        let payload = envelope.remove("payload").unwrap_or(Value::Null);

        if let FrameKind::Device(class) = &kind {
            if !payload.is_object() {
                return Err(ProtocolError::invalid_payload(
                    class.as_str(),
                    format!("expected an object, got {}", json_type_name(&payload)),
                ));
            }
        }

        Ok(Self { kind, payload })
    }

    pub fn encode(&self) -> String {
        json!({ "type": self.kind.as_str(), "payload": self.payload }).to_string()
    }

    /// Device class and id addressed by a device frame
    pub fn device_target(&self) -> Option<(DeviceClass, String)> {
        let FrameKind::Device(class) = self.kind else {
            return None;
        };
        let id = self
            .payload
            .get("deviceId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .unwrap_or(class.default_device_id())
            .to_string();
        Some((class, id))
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_device_frame() {
        let frame =
            TelemetryFrame::decode(r#"{"type":"dome","payload":{"deviceId":"dome-1","azimuth":12.5}}"#)
                .unwrap();
        assert_eq!(frame.kind, FrameKind::Device(DeviceClass::Dome));
        assert_eq!(frame.payload["azimuth"], 12.5);
        assert_eq!(
            frame.device_target(),
            Some((DeviceClass::Dome, "dome-1".to_string()))
        );
    }

    #[test]
    fn test_device_id_defaults_to_class() {
        let frame = TelemetryFrame::decode(r#"{"type":"filterWheel","payload":{"position":2}}"#).unwrap();
        assert_eq!(
            frame.device_target(),
            Some((DeviceClass::FilterWheel, "filterWheel".to_string()))
        );
    }

    #[test]
    fn test_system_frames() {
        let frame = TelemetryFrame::decode(r#"{"type":"systemInfo","payload":{"cpu":0.4}}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::SystemInfo);
        assert_eq!(frame.device_target(), None);

        let frame = TelemetryFrame::decode(r#"{"type":"processes","payload":[]}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Processes);
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let frame = TelemetryFrame::decode(r#"{"type":"weather","payload":{}}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Unknown("weather".to_string()));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            TelemetryFrame::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            TelemetryFrame::decode("[1,2,3]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            TelemetryFrame::decode(r#"{"payload":{}}"#),
            Err(ProtocolError::MissingKind)
        );
        assert!(matches!(
            TelemetryFrame::decode(r#"{"type":"rotator","payload":42}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_device_class_names() {
        for class in DeviceClass::ALL {
            assert_eq!(class.as_str().parse::<DeviceClass>().unwrap(), class);
        }
        assert_eq!("filter_wheel".parse::<DeviceClass>().unwrap(), DeviceClass::FilterWheel);
        assert_eq!(DeviceClass::FilterWheel.api_segment(), "filterwheel");
        assert!("camera".parse::<DeviceClass>().is_err());

        let json = serde_json::to_string(&DeviceClass::FilterWheel).unwrap();
        assert_eq!(json, "\"filterWheel\"");
    }

    #[test]
    fn test_encode_uses_wire_kind() {
        let mut payload = Map::new();
        payload.insert("angle".to_string(), json!(10.0));
        let frame = TelemetryFrame::device(DeviceClass::Rotator, "rot", payload);
        let decoded = TelemetryFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }
}
