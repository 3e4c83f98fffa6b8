//! # MQTT Session Module
//!
//! Owns the one long-lived publish/subscribe session with the broker.
//! Everything that touches the network lives here; the telemetry layer above
//! only sees [`mqtt_handler::SessionHandle`] and the stream of
//! [`message_manager::TelemetryMessage`]s it forwards.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker address, credentials, QoS and timeouts
//! ├── error.rs            - Connect/subscribe/publish/refresh error taxonomy
//! ├── message_manager.rs  - Inbound message representation
//! ├── transport.rs        - Transport seam and the rumqttc implementation
//! ├── mqtt_handler.rs     - Session worker and its handle
//! └── command.rs          - Actuator command payloads
//! ```
//!
//! ## Delivery Semantics
//!
//! Subscriptions request the configured QoS, but the bus itself relies on
//! nothing beyond best effort. Publishing is at-most-once from the bus's
//! point of view: without a live session a publish fails with
//! `NotConnected` and is not queued. There is no automatic reconnect; a lost
//! link stays down until the next explicit refresh.

pub mod command;
pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock_transport;
