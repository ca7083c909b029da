use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::constants::{scheduler, storage};

/// Application configuration, persisted as `settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Global default base path for downloaded files
    pub download_dir: String,
    /// Per-profile base paths, keyed by `"service:username"`
    #[serde(default)]
    pub profile_dirs: HashMap<String, PathBuf>,
    /// Per-profile parallelism ceiling
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Process-wide parallelism ceiling; `CU_GLOBAL_MAX` overrides it
    #[serde(default = "default_global_max")]
    pub global_max: usize,
    /// SHA-verify finished files during restore
    #[serde(default)]
    pub strict_restore: bool,
    /// Session cookie for authenticated API access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_cookie: Option<String>,
    /// Extra cookies (DDG and friends) sent with API requests
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra_cookies: HashMap<String, String>,
}

fn default_max_concurrent() -> usize {
    scheduler::DEFAULT_MAX_CONCURRENT
}

fn default_global_max() -> usize {
    scheduler::DEFAULT_GLOBAL_MAX
}

impl Config {
    /// Load configuration from file or create default
    pub fn load_or_default(custom_path: Option<&String>) -> Result<Self> {
        let config_path = match custom_path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(storage::SETTINGS_FILE),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// The process-wide ceiling, environment override included.
    pub fn effective_global_max(&self) -> usize {
        std::env::var(scheduler::GLOBAL_MAX_ENV)
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(self.global_max)
    }

    /// The download base directory with any tilde expanded.
    pub fn download_dir_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.download_dir).to_string())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: storage::DEFAULT_DOWNLOAD_DIR.to_string(),
            profile_dirs: HashMap::new(),
            max_concurrent: scheduler::DEFAULT_MAX_CONCURRENT,
            global_max: scheduler::DEFAULT_GLOBAL_MAX,
            strict_restore: false,
            session_cookie: None,
            extra_cookies: HashMap::new(),
        }
    }
}
