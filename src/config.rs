use crate::background::BackgroundMedianCache;
use crate::hal::FrameGeometry;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub bind_host: String,
    pub controller_port: u16,
    pub detector_port: u16,
    /// Largest chunk read from a socket in one go
    pub buffer_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            controller_port: 8089,
            detector_port: 5678,
            buffer_size: 65536,
        }
    }
}

impl RelaySettings {
    pub fn controller_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.controller_port)
    }

    pub fn detector_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.detector_port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub relay_address: String,
    pub write_dir: PathBuf,
    pub arm_delay_ms: u64,
    pub idle_timeout_ms: u64,
    pub cache_path: Option<PathBuf>,
    pub frame_rows: usize,
    pub frame_columns: usize,
    pub ring_frames: usize,
    pub exposure_ms: u64,
    pub buffer_size: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            relay_address: "172.21.43.21:5678".to_string(),
            write_dir: PathBuf::from("./Runs"),
            arm_delay_ms: 6000,
            idle_timeout_ms: 15000,
            cache_path: None,
            frame_rows: 2880,
            frame_columns: 2880,
            ring_frames: 50,
            exposure_ms: 100,
            buffer_size: 65536,
        }
    }
}

impl HostSettings {
    pub fn arm_delay(&self) -> Duration {
        Duration::from_millis(self.arm_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry {
            rows: self.frame_rows,
            columns: self.frame_columns,
        }
    }

    /// Configured cache file, else the per-user default
    pub fn resolved_cache_path(&self) -> Result<PathBuf> {
        match &self.cache_path {
            Some(path) => Ok(path.clone()),
            None => BackgroundMedianCache::default_path()
                .context("No per-user cache directory; set host.cache_path"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub enabled: bool,
    /// scp remote prefix for the source, e.g. `user@host`
    pub source_prefix: Option<String>,
    pub destination_host: String,
    pub destination_dir: PathBuf,
    pub grant_group_read: bool,
    pub chmod_passes: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            source_prefix: None,
            destination_host: "localhost".to_string(),
            destination_dir: PathBuf::from("/data/panel"),
            grant_group_read: true,
            chmod_passes: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    pub relay: RelaySettings,
    pub host: HostSettings,
    pub transfer: TransferSettings,
}

/// Loads and persists the on-disk `DaqConfig`
pub struct ConfigManager {
    config_path: PathBuf,
    state: Arc<RwLock<DaqConfig>>,
}

impl ConfigManager {
    /// Starts from defaults; call `load()` to read the file.
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            state: Arc::new(RwLock::new(DaqConfig::default())),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.config_path
    }

    pub async fn ensure_config_file(&self) -> Result<()> {
        if !self.config_path.exists() {
            if let Some(parent) = self.config_path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }

            self.save().await.context("Failed to write default config")?;
        }

        Ok(())
    }

    pub async fn load(&self) -> Result<()> {
        self.ensure_config_file().await?;

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read config file")?;

        let config: DaqConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        *self.state.write().await = config;
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let config = self.state.read().await;
        let json = serde_json::to_string_pretty(&*config)?;

        let temp_path = self.config_path.with_extension("tmp");
        fs::write(&temp_path, json)
            .await
            .context("Failed to write temporary config file")?;

        fs::rename(&temp_path, &self.config_path)
            .await
            .context("Failed to atomically update config file")?;

        Ok(())
    }

    pub async fn config(&self) -> DaqConfig {
        self.state.read().await.clone()
    }
}
