//! Configuration manager

use crate::logging::warn_log;
use crate::models::AppConfig;
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct ConfigManager {
    path: PathBuf,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        let path = if let Some(dirs) = ProjectDirs::from("com", "udpxyfast", "udpxyfast") {
            let config_dir = dirs.config_dir();
            fs::create_dir_all(config_dir).ok();
            config_dir.join("config.json")
        } else {
            PathBuf::from("config.json")
        };

        Self { path }
    }

    /// Use an explicit config file (CLI `--config`, tests)
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file → defaults; corrupt file → defaults with a warning
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        if self.path.exists() {
            let content = fs::read_to_string(&self.path)?;
            match serde_json::from_str::<AppConfig>(&content) {
                Ok(config) => Ok(config.sanitized()),
                Err(e) => {
                    warn_log!("配置文件损坏，使用默认配置: {}", e);
                    Ok(AppConfig::default())
                }
            }
        } else {
            Ok(AppConfig::default())
        }
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}
