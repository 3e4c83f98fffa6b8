//! Actuator commands on the publish-only path

use super::error::PublishError;
use crate::registry::{DeviceKind, DeviceRecord};
use bytes::Bytes;
use serde_json::json;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCommand {
    Switch(bool),
    /// Percentage, clamped to 0..=100
    Slider(u8),
    /// `#rrggbb`
    Color(String),
}

impl DeviceCommand {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceCommand::Switch(_) => DeviceKind::Switch,
            DeviceCommand::Slider(_) => DeviceKind::Slider,
            DeviceCommand::Color(_) => DeviceKind::Color,
        }
    }

    pub fn color_from_rgb(r: u8, g: u8, b: u8) -> Self {
        DeviceCommand::Color(format!("#{:02x}{:02x}{:02x}", r, g, b))
    }

    pub fn encode(&self) -> Result<Bytes, PublishError> {
        let value = match self {
            DeviceCommand::Switch(on) => json!({ "switch": if *on { "ON" } else { "OFF" } }),
            DeviceCommand::Slider(level) => json!({ "slider": (*level).min(100) }),
            DeviceCommand::Color(hex) => {
                let valid = hex.len() == 7
                    && hex.starts_with('#')
                    && hex[1..].chars().all(|c| c.is_ascii_hexdigit());
                if !valid {
                    return Err(PublishError::KindMismatch(format!("not an rgb color: {}", hex)));
                }
                json!({ "color": hex.to_ascii_lowercase() })
            }
        };
        Ok(Bytes::from(value.to_string()))
    }

    /// Payload for `record`, or why the command cannot go there
    pub fn encode_for(&self, record: &DeviceRecord) -> Result<Bytes, PublishError> {
        if record.is_sensor {
            return Err(PublishError::KindMismatch(format!("{} is a sensor", record.topic)));
        }
        if record.device_kind != self.kind() {
            return Err(PublishError::KindMismatch(format!(
                "{} command sent to {} device {}",
                self.kind(),
                record.device_kind,
                record.topic
            )));
        }
        self.encode()
    }
}
