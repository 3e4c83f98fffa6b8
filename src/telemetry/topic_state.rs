//! Topic-State Index
//!
//! Maps a topic to the slot that holds its device's latest reading and
//! decodes payloads into typed readings. An index is immutable once built;
//! every refresh builds a new one tagged with the refresh epoch and the old
//! one is dropped whole, so a slot id is only meaningful together with the
//! epoch of the index that produced it.

use super::topic_resolver::TopicSet;
use crate::registry::{ConnectionType, DeviceKind, ParseFieldError};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Position of a device inside one index epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic {0:?} does not have connectionType/deviceKind/deviceId segments")]
    TooFewSegments(String),

    #[error(transparent)]
    Field(#[from] ParseFieldError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("no reading schema for device kind {0}")]
    UnknownDeviceKind(String),
}

/// `<connectionType>/<deviceKind>/<deviceId>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPath {
    pub connection_type: ConnectionType,
    pub device_kind: DeviceKind,
    /// Everything after the second separator
    pub device_id: String,
}

impl TopicPath {
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let mut parts = topic.splitn(3, '/');
        let (Some(connection), Some(kind), Some(device_id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(TopicError::TooFewSegments(topic.to_string()));
        };
        if device_id.is_empty() {
            return Err(TopicError::TooFewSegments(topic.to_string()));
        }

        Ok(Self {
            connection_type: connection.parse()?,
            device_kind: kind.parse()?,
            device_id: device_id.to_string(),
        })
    }
}

/// A decoded sensor value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub kind: DeviceKind,
    pub value: f64,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            DeviceKind::Temperature => write!(f, "{}°C", self.value),
            DeviceKind::Humidity => write!(f, "{}%", self.value),
            other => write!(f, "{} {}", other, self.value),
        }
    }
}

/// Decodes `{"<kind>": number}`; numeric strings are accepted too
pub fn decode(kind: DeviceKind, payload: &[u8]) -> Result<Reading, DecodeError> {
    if !kind.is_sensor_kind() {
        return Err(DecodeError::UnknownDeviceKind(kind.to_string()));
    }

    let document: Value = serde_json::from_slice(payload)
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;
    let field = document
        .get(kind.as_str())
        .ok_or_else(|| DecodeError::MalformedPayload(format!("missing field {:?}", kind.as_str())))?;

    let value = match field {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
    .ok_or_else(|| DecodeError::MalformedPayload(format!("{:?} is not a number", field)))?;

    Ok(Reading { kind, value })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEntry {
    pub topic: String,
    pub path: TopicPath,
}

#[derive(Debug, Default)]
pub struct TopicStateIndex {
    epoch: u64,
    slots: Vec<SlotEntry>,
    by_topic: HashMap<String, SlotId>,
}

impl TopicStateIndex {
    /// The index before the first refresh: tracks nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a fresh index; topics that violate the schema get no slot
    pub fn build(epoch: u64, topics: &TopicSet) -> Self {
        let mut slots = Vec::with_capacity(topics.len());
        let mut by_topic = HashMap::with_capacity(topics.len());

        for topic in topics.iter() {
            match TopicPath::parse(topic) {
                Ok(path) => {
                    by_topic.insert(topic.to_string(), SlotId(slots.len()));
                    slots.push(SlotEntry {
                        topic: topic.to_string(),
                        path,
                    });
                }
                Err(e) => warn!("Registered topic left untracked: {}", e),
            }
        }

        Self {
            epoch,
            slots,
            by_topic,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// `None` for untracked or schema-violating topics
    pub fn resolve(&self, topic: &str) -> Option<SlotId> {
        TopicPath::parse(topic).ok()?;
        self.by_topic.get(topic).copied()
    }

    pub fn slot(&self, slot: SlotId) -> Option<&SlotEntry> {
        self.slots.get(slot.0)
    }

    pub fn slots(&self) -> impl Iterator<Item = (SlotId, &SlotEntry)> {
        self.slots.iter().enumerate().map(|(n, e)| (SlotId(n), e))
    }
}
