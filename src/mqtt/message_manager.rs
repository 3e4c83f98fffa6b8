use bytes::Bytes;
use chrono::{DateTime, Local};
use std::fmt;

/// One publish received from the broker, stamped on arrival
///
/// Transient: the router consumes it and discards it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetryMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for TelemetryMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(32).collect();
        write!(f, "{} - {}: {}", self.received_at.format("%H:%M:%S"), self.topic, preview)
    }
}

impl TelemetryMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        TelemetryMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }
}
