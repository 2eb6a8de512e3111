use std::{collections::HashMap, path::PathBuf, time::Duration};

use config::{Config as ConfigLib, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub http: HttpConfig,
    pub scheduler: SchedulerConfig,
    pub journal: JournalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the certificate and CRL files.
    pub files_root: PathBuf,
    /// URL prefix the files are served under.
    pub base_url: String,
    /// JSON snapshot of the store. Without one the store lives in memory only.
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
    /// Directory scanned for certificate and CRL files at startup.
    #[serde(default)]
    pub import_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Bodies above this many bytes are spooled to a temporary file.
    pub max_memory_size: usize,
    /// Downloads above this many bytes fail as a connection error.
    pub max_body_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    pub retention_days: u32,
}

impl JournalConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .set_default("storage.files_root", "media")?
            .set_default("storage.base_url", "/media/")?
            .set_default("http.timeout_secs", 30)?
            .set_default("http.user_agent", "PKIManager/0.1")?
            .set_default("http.max_memory_size", 2_621_440)?
            .set_default("http.max_body_size", 67_108_864)?
            .set_default("scheduler.enabled", true)?
            .set_default("scheduler.interval_secs", 60)?
            .set_default("journal.retention_days", 365)?
            .add_source(File::with_name("config/settings").required(false));

        // Explicit variables replace the process environment so tests
        // do not see each other's settings.
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Format: APP_HTTP__TIMEOUT_SECS, APP_STORAGE__SNAPSHOT
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }
}
