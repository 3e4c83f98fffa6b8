//! Device registry persisted as a TOML list on disk
//!
//! The file is read on every query and rewritten on every change, so edits
//! made by other tools show up on the next refresh.

use super::{
    apply_update, insert_record, remove_record, DeviceFilter, DeviceId, DeviceRecord,
    DeviceRegistry, DeviceUpdate, NewDevice, RegistryError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Deserialize, Serialize, Default, Debug)]
struct DeviceFile {
    #[serde(default, rename = "device")]
    devices: Vec<DeviceRecord>,
}

#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    // serialises read-modify-write cycles from this process
    write_lock: Mutex<()>,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<DeviceRecord>, RegistryError> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| RegistryError::Storage(format!("Failed to check registry file: {}", e)))?;
        if !exists {
            warn!("Registry file {} does not exist, treating as empty", self.path.display());
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RegistryError::Storage(format!("Failed to read registry file: {}", e)))?;
        let file: DeviceFile = toml::from_str(&content)
            .map_err(|e| RegistryError::Storage(format!("Failed to parse registry file: {}", e)))?;

        debug!("Loaded {} devices from {}", file.devices.len(), self.path.display());
        Ok(file.devices)
    }

    async fn store(&self, devices: Vec<DeviceRecord>) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RegistryError::Storage(format!("Failed to create registry directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(&DeviceFile { devices })
            .map_err(|e| RegistryError::Storage(format!("Failed to serialize registry: {}", e)))?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| RegistryError::Storage(format!("Failed to write registry file: {}", e)))
    }
}

#[async_trait]
impl DeviceRegistry for FileRegistry {
    async fn list_devices(&self, filter: DeviceFilter) -> Result<Vec<DeviceRecord>, RegistryError> {
        let devices = self.load().await?;
        Ok(devices.into_iter().filter(|r| filter.matches(r)).collect())
    }

    async fn add_device(&self, device: NewDevice) -> Result<DeviceRecord, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut devices = self.load().await?;
        let record = insert_record(&mut devices, device)?;
        self.store(devices).await?;
        info!("Registered device {} on {}", record.id, record.topic);
        Ok(record)
    }

    async fn update_device(&self, id: &DeviceId, update: DeviceUpdate) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut devices = self.load().await?;
        apply_update(&mut devices, id, update)?;
        self.store(devices).await
    }

    async fn delete_device(&self, id: &DeviceId) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut devices = self.load().await?;
        remove_record(&mut devices, id)?;
        self.store(devices).await?;
        info!("Deleted device {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionType, DeviceKind};

    #[tokio::test]
    async fn missing_file_is_an_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("devices.toml"));
        assert!(registry.list_devices(DeviceFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn changes_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("devices.toml");

        let registry = FileRegistry::new(&path);
        let temp = registry
            .add_device(NewDevice::new(ConnectionType::Wifi, DeviceKind::Temperature, "17"))
            .await
            .unwrap();
        registry
            .add_device(NewDevice::new(ConnectionType::Nbiot, DeviceKind::Color, "9"))
            .await
            .unwrap();
        registry
            .update_device(
                &temp.id,
                DeviceUpdate {
                    location: None,
                    note: Some("by the window".into()),
                },
            )
            .await
            .unwrap();

        let reopened = FileRegistry::new(&path);
        let sensors = reopened.list_devices(DeviceFilter::sensors()).await.unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].topic, "wifi/temperature/17");
        assert_eq!(sensors[0].note.as_deref(), Some("by the window"));

        reopened.delete_device(&temp.id).await.unwrap();
        assert!(registry.list_devices(DeviceFilter::sensors()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.toml");
        tokio::fs::write(&path, "[[device]]\ntopic = 5\n").await.unwrap();

        let err = FileRegistry::new(&path)
            .list_devices(DeviceFilter::all())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
    }
}
