//! # Device Registry Boundary
//!
//! The registry is the durable store of device records. It is owned by the
//! surrounding application (a remote object store in production); the
//! telemetry bus only ever reads it through [`DeviceRegistry::list_devices`].
//!
//! ```text
//! registry/
//! ├── mod.rs            - DeviceRecord model, DeviceRegistry trait, MemoryRegistry
//! └── file_registry.rs  - TOML-file backed registry used by the binary
//! ```
//!
//! A record's topic is derived once, when the record is created, as
//! `connectionType/deviceKind/deviceId`. It is the join key between the
//! registry and the broker.

pub mod file_registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub use file_registry::FileRegistry;

/// Stored for location/note when the user left them empty
pub const UNDEFINED_FIELD: &str = "undefined";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("device not found: {0}")]
    NotFound(DeviceId),

    #[error("a device with topic {0} is already registered")]
    DuplicateTopic(String),

    #[error("registry storage error: {0}")]
    Storage(String),
}

/// Unrecognised value for one of the topic fields
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {field}: {value:?}")]
pub struct ParseFieldError {
    pub field: &'static str,
    pub value: String,
}

/// Radio link the device uses to reach the broker
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Nbiot,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Wifi => "wifi",
            ConnectionType::Nbiot => "nbiot",
        }
    }
}

impl FromStr for ConnectionType {
    type Err = ParseFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wifi" => Ok(ConnectionType::Wifi),
            "nbiot" => Ok(ConnectionType::Nbiot),
            other => Err(ParseFieldError {
                field: "connection type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Switch,
    #[serde(alias = "slide")]
    Slider,
    Color,
    Humidity,
    Temperature,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Switch => "switch",
            DeviceKind::Slider => "slider",
            DeviceKind::Color => "color",
            DeviceKind::Humidity => "humidity",
            DeviceKind::Temperature => "temperature",
        }
    }

    /// Kinds that report readings rather than accept commands
    pub fn is_sensor_kind(&self) -> bool {
        matches!(self, DeviceKind::Humidity | DeviceKind::Temperature)
    }
}

impl FromStr for DeviceKind {
    type Err = ParseFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "switch" => Ok(DeviceKind::Switch),
            // older actuator firmware announces itself as "slide"
            "slider" | "slide" => Ok(DeviceKind::Slider),
            "color" => Ok(DeviceKind::Color),
            "humidity" => Ok(DeviceKind::Humidity),
            "temperature" => Ok(DeviceKind::Temperature),
            other => Err(ParseFieldError {
                field: "device kind",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle of a record inside the registry store
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One registered device as stored by the registry
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub topic: String,
    pub connection_type: ConnectionType,
    pub device_kind: DeviceKind,
    /// Hardware id, the last topic segment
    pub device_id: String,
    pub is_sensor: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl DeviceRecord {
    pub fn topic_for(connection_type: ConnectionType, kind: DeviceKind, device_id: &str) -> String {
        format!("{}/{}/{}", connection_type, kind, device_id)
    }
}

/// Query filter for [`DeviceRegistry::list_devices`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub is_sensor: Option<bool>,
}

impl DeviceFilter {
    pub fn all() -> Self {
        Self { is_sensor: None }
    }

    pub fn sensors() -> Self {
        Self {
            is_sensor: Some(true),
        }
    }

    pub fn actuators() -> Self {
        Self {
            is_sensor: Some(false),
        }
    }

    pub fn matches(&self, record: &DeviceRecord) -> bool {
        self.is_sensor.map_or(true, |s| record.is_sensor == s)
    }
}

/// Editable fields of an existing record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub location: Option<String>,
    pub note: Option<String>,
}

/// A freshly commissioned device, before the registry assigns it an id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewDevice {
    pub connection_type: ConnectionType,
    pub device_kind: DeviceKind,
    pub device_id: String,
    pub is_sensor: bool,
    pub location: Option<String>,
    pub note: Option<String>,
}

impl NewDevice {
    /// A device whose sensor flag follows its kind
    pub fn new(connection_type: ConnectionType, device_kind: DeviceKind, device_id: &str) -> Self {
        Self {
            connection_type,
            device_kind,
            device_id: device_id.to_string(),
            is_sensor: device_kind.is_sensor_kind(),
            location: None,
            note: None,
        }
    }

    pub fn topic(&self) -> String {
        DeviceRecord::topic_for(self.connection_type, self.device_kind, &self.device_id)
    }
}

/// Narrow interface to the externally owned device store
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn list_devices(&self, filter: DeviceFilter) -> Result<Vec<DeviceRecord>, RegistryError>;

    async fn add_device(&self, device: NewDevice) -> Result<DeviceRecord, RegistryError>;

    async fn update_device(&self, id: &DeviceId, update: DeviceUpdate) -> Result<(), RegistryError>;

    async fn delete_device(&self, id: &DeviceId) -> Result<(), RegistryError>;
}

// Record list operations shared by the in-memory and file registries.

fn insert_record(records: &mut Vec<DeviceRecord>, device: NewDevice) -> Result<DeviceRecord, RegistryError> {
    let topic = device.topic();
    if records.iter().any(|r| r.topic == topic) {
        return Err(RegistryError::DuplicateTopic(topic));
    }

    let next = records
        .iter()
        .filter_map(|r| r.id.0.strip_prefix("dev-").and_then(|n| n.parse::<u64>().ok()))
        .max()
        .map_or(1, |n| n + 1);

    let record = DeviceRecord {
        id: DeviceId(format!("dev-{}", next)),
        topic,
        connection_type: device.connection_type,
        device_kind: device.device_kind,
        device_id: device.device_id,
        is_sensor: device.is_sensor,
        location: Some(device.location.unwrap_or_else(|| UNDEFINED_FIELD.to_string())),
        note: Some(device.note.unwrap_or_else(|| UNDEFINED_FIELD.to_string())),
    };
    records.push(record.clone());
    Ok(record)
}

fn apply_update(records: &mut [DeviceRecord], id: &DeviceId, update: DeviceUpdate) -> Result<(), RegistryError> {
    let record = records
        .iter_mut()
        .find(|r| &r.id == id)
        .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

    if let Some(location) = update.location {
        record.location = Some(location);
    }
    if let Some(note) = update.note {
        record.note = Some(note);
    }
    Ok(())
}

fn remove_record(records: &mut Vec<DeviceRecord>, id: &DeviceId) -> Result<(), RegistryError> {
    let before = records.len();
    records.retain(|r| &r.id != id);
    if records.len() == before {
        return Err(RegistryError::NotFound(id.clone()));
    }
    Ok(())
}

/// Registry kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: RwLock<Vec<DeviceRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn list_devices(&self, filter: DeviceFilter) -> Result<Vec<DeviceRecord>, RegistryError> {
        let guard = self.records.read().await;
        Ok(guard.iter().filter(|r| filter.matches(r)).cloned().collect())
    }

    async fn add_device(&self, device: NewDevice) -> Result<DeviceRecord, RegistryError> {
        let record = insert_record(&mut *self.records.write().await, device)?;
        info!("Registered device {} on {}", record.id, record.topic);
        Ok(record)
    }

    async fn update_device(&self, id: &DeviceId, update: DeviceUpdate) -> Result<(), RegistryError> {
        debug!("Updating device {}", id);
        apply_update(&mut self.records.write().await, id, update)
    }

    async fn delete_device(&self, id: &DeviceId) -> Result<(), RegistryError> {
        remove_record(&mut *self.records.write().await, id)?;
        info!("Deleted device {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_derives_topic_and_defaults_fields() {
        let registry = MemoryRegistry::new();
        let record = registry
            .add_device(NewDevice::new(ConnectionType::Wifi, DeviceKind::Temperature, "17"))
            .await
            .unwrap();

        assert_eq!(record.topic, "wifi/temperature/17");
        assert!(record.is_sensor);
        assert_eq!(record.location.as_deref(), Some(UNDEFINED_FIELD));
        assert_eq!(record.note.as_deref(), Some(UNDEFINED_FIELD));
    }

    #[tokio::test]
    async fn duplicate_topic_is_rejected() {
        let registry = MemoryRegistry::new();
        let device = NewDevice::new(ConnectionType::Nbiot, DeviceKind::Humidity, "3");
        registry.add_device(device.clone()).await.unwrap();

        let err = registry.add_device(device).await.unwrap_err();
        assert_eq!(err, RegistryError::DuplicateTopic("nbiot/humidity/3".into()));
    }

    #[tokio::test]
    async fn filter_update_and_delete() {
        let registry = MemoryRegistry::new();
        let sensor = registry
            .add_device(NewDevice::new(ConnectionType::Wifi, DeviceKind::Humidity, "22"))
            .await
            .unwrap();
        registry
            .add_device(NewDevice::new(ConnectionType::Wifi, DeviceKind::Switch, "5"))
            .await
            .unwrap();

        assert_eq!(registry.list_devices(DeviceFilter::sensors()).await.unwrap().len(), 1);
        assert_eq!(registry.list_devices(DeviceFilter::actuators()).await.unwrap().len(), 1);

        registry
            .update_device(
                &sensor.id,
                DeviceUpdate {
                    location: Some("desk".into()),
                    note: None,
                },
            )
            .await
            .unwrap();
        let listed = registry.list_devices(DeviceFilter::sensors()).await.unwrap();
        assert_eq!(listed[0].location.as_deref(), Some("desk"));
        assert_eq!(listed[0].note.as_deref(), Some(UNDEFINED_FIELD));

        registry.delete_device(&sensor.id).await.unwrap();
        assert!(registry.list_devices(DeviceFilter::sensors()).await.unwrap().is_empty());
        assert_eq!(
            registry.delete_device(&sensor.id).await.unwrap_err(),
            RegistryError::NotFound(sensor.id.clone())
        );
    }

    #[test]
    fn slide_is_an_alias_for_slider() {
        assert_eq!("slide".parse::<DeviceKind>().unwrap(), DeviceKind::Slider);
        assert!("lamp".parse::<DeviceKind>().is_err());
    }
}
