use std::path::Path;

use anyhow::{anyhow, ensure, Context};
use directories::ProjectDirs;
use log::info;
use serde::{Deserialize, Serialize};

use crate::api::DEFAULT_NAMESPACE;
use crate::error::Result;

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_device_name() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().to_string(),
        Err(_) => "Unknown".to_owned(),
    }
}

fn default_max_ranging_sessions() -> usize {
    4
}

fn default_buffer_size() -> usize {
    64
}

fn default_uwb_supported() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UwbConfig {
    /// Prefix of every channel name.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Name advertised while discovering.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default = "default_max_ranging_sessions")]
    pub max_ranging_sessions: usize,

    /// Capacity of the message endpoint queues.
    #[serde(default = "default_buffer_size")]
    pub request_buffer_size: usize,

    /// Capacity of the radio signal and undelivered event queues.
    #[serde(default = "default_buffer_size")]
    pub event_buffer_size: usize,

    /// Capability reported by the simulated radio.
    #[serde(default = "default_uwb_supported")]
    pub uwb_supported: bool,
}

impl Default for UwbConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            device_name: default_device_name(),
            max_ranging_sessions: default_max_ranging_sessions(),
            request_buffer_size: default_buffer_size(),
            event_buffer_size: default_buffer_size(),
            uwb_supported: default_uwb_supported(),
        }
    }
}

impl UwbConfig {
    /// Loads `config_file` from the per-user configuration directory, writing
    /// the defaults first if it does not exist yet.
    pub async fn load(config_file: &str) -> Result<Self> {
        let proj_dirs = ProjectDirs::from("dev", "uwb", "uwb-bridge")
            .ok_or_else(|| anyhow!("No home directory for the configuration"))?;

        let config_file_path = proj_dirs.config_dir().join(config_file);

        if config_file_path.exists() {
            return Self::from_path(&config_file_path).await;
        }

        Self::create(&config_file_path).await
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let config_str = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Reading {}", path.display()))?;

        let config: Self = serde_json::from_str(&config_str)
            .with_context(|| format!("Parsing {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Validating {}", path.display()))?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Queues cannot be created with a zero capacity.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.request_buffer_size > 0,
            "request_buffer_size must be positive"
        );
        ensure!(
            self.event_buffer_size > 0,
            "event_buffer_size must be positive"
        );
        Ok(())
    }

    async fn create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let config = Self::default();
        tokio::fs::write(path, serde_json::to_string_pretty(&config)?).await?;

        info!("Default configuration written to {}", path.display());
        Ok(config)
    }
}
