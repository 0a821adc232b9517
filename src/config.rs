//! Service configuration loaded from TOML
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(300);

/// Where a loaded [`Config`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    Defaults,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub payment: PaymentConfig,
    pub email: EmailConfig,
    pub agreements: AgreementConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between notification passes. Unset or zero means every 5 minutes.
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PaymentConfig {
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmailConfig {
    pub provider: String,
    pub from_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgreementConfig {
    pub base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/loans.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            from_address: "noreply@lending.local".to_string(),
        }
    }
}

impl Default for AgreementConfig {
    fn default() -> Self {
        Self {
            base_url: "https://storage.example.com/agreements".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        match self.interval_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                tracing::warn!(
                    interval_secs = DEFAULT_SCHEDULER_INTERVAL.as_secs(),
                    "using default notification schedule"
                );
                DEFAULT_SCHEDULER_INTERVAL
            }
        }
    }
}

impl Config {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Reads `path`, or falls back to defaults when the file does not exist.
    /// Runs before logging is up, so the caller reports the fallback.
    pub fn load(path: &Path) -> anyhow::Result<(Self, ConfigSource)> {
        if !path.exists() {
            return Ok((Self::default(), ConfigSource::Defaults));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Ok((Self::from_toml(&content)?, ConfigSource::File))
    }
}
