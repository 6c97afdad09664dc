use std::path::{Path, PathBuf};
use std::time::Duration;

use rollout_platform::AppPaths;
use serde::{Deserialize, Serialize};

fn default_http_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_stamp_retry_delays() -> Vec<u64> {
    vec![250, 500, 1000, 2000]
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

/// Updater settings read from `settings.json` in the per-user config
/// directory. Every field falls back to its default when missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterSettings {
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_stamp_retry_delays")]
    pub stamp_retry_delays_ms: Vec<u64>,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default)]
    pub signtool_path: Option<PathBuf>,

    #[serde(default)]
    pub rcedit_path: Option<PathBuf>,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            stamp_retry_delays_ms: default_stamp_retry_delays(),
            max_log_size_bytes: default_max_log_size_bytes(),
            debug_logging: false,
            signtool_path: None,
            rcedit_path: None,
        }
    }
}

impl UpdaterSettings {
    pub fn load() -> Self {
        let Ok(paths) = AppPaths::new() else {
            return Self::default();
        };
        Self::load_from(&paths.settings_file())
    }

    /// Unreadable or malformed files yield the defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!("Ignoring malformed settings {}: {error}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn stamp_retry_delays(&self) -> Vec<Duration> {
        self.stamp_retry_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    pub fn http_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.http_timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .user_agent(format!("rollout/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default()
    }
}
