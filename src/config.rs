use crate::mqtt::config::MqttConfig;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/dormlink";
const CONFIG_FILE: &str = "config.toml";
const DEVICES_FILE: &str = "devices.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    /// Minimum spacing between two refresh cycles
    pub min_refresh_interval_ms: u64,
    /// Inbound queue between the session worker and the router
    pub router_capacity: usize,
    /// Per-consumer event queue
    pub consumer_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            min_refresh_interval_ms: 500,
            router_capacity: 256,
            consumer_capacity: 64,
        }
    }
}

impl BusConfig {
    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.min_refresh_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let mut path = config_dir();
        path.push(DEVICES_FILE);
        Self { path }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub bus: BusConfig,
    pub registry: RegistryConfig,
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        let mut path = config_dir();
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let config: AppConfig = if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| eyre!("Failed to read config file: {}", e))?;
            toml::from_str(&content).map_err(|e| eyre!("Failed to parse config file: {}", e))?
        } else {
            warn!("Config file {} does not exist, using default", path.display());
            AppConfig::default()
        };

        config
            .mqtt
            .validate()
            .map_err(|e| eyre!("Invalid mqtt config: {}", e))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }
}

/// Writes a default config file when none exists yet
pub async fn ensure_default_config(path: &Path) -> Result<()> {
    if !tokio::fs::try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
    {
        info!("Creating default configuration at {}", path.display());
        AppConfig::default().save(path).await?;
    }
    Ok(())
}

fn config_dir() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_config_is_written_once_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        ensure_default_config(&path).await.unwrap();
        let loaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(loaded, AppConfig::default());

        let mut changed = loaded.clone();
        changed.bus.min_refresh_interval_ms = 0;
        changed.save(&path).await.unwrap();
        ensure_default_config(&path).await.unwrap();
        assert_eq!(AppConfig::load(&path).await.unwrap(), changed);
    }

    #[tokio::test]
    async fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(
            &path,
            "[mqtt]\nbroker_url = \"tcp://broker.local:1884\"\n\n[bus]\nconsumer_capacity = 8\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.mqtt.broker_url, "tcp://broker.local:1884");
        assert_eq!(config.mqtt.client_id, MqttConfig::default().client_id);
        assert_eq!(config.bus.consumer_capacity, 8);
        assert_eq!(config.bus.min_refresh_interval(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn invalid_qos_is_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[mqtt]\nsubscribe_qos = 3\n")
            .await
            .unwrap();

        assert!(AppConfig::load(&path).await.is_err());
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join(CONFIG_FILE)).await.unwrap();
        assert_eq!(config.bus, BusConfig::default());
    }
}
