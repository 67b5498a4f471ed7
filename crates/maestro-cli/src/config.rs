//! `maestro.toml` loading.

use maestro_channels::WebhookConfig;
use maestro_orchestrator::OrchestratorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level configuration file.
#[derive(Debug, Deserialize)]
pub struct MaestroConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Deserialize)]
pub struct NotificationsConfig {
    /// Mirror every event into the log.
    #[serde(default = "default_true")]
    pub log: bool,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            log: true,
            webhooks: Vec::new(),
        }
    }
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            orchestrator: OrchestratorConfig::default(),
            notifications: NotificationsConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_true() -> bool {
    true
}

impl MaestroConfig {
    /// Parse and validate a config document.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: MaestroConfig = toml::from_str(raw)?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    /// Read `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::parse(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config file '{}': {e}",
                path.display()
            )),
        }
    }
}
