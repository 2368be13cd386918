//! Configuration management for the backup tool.
//!
//! Loads configuration from a TOML file, with sensible defaults for every
//! field so the tool runs without one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Number of worker threads pulling store jobs off the queue
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// zstd compression level for archived items (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Default archive output directory
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_worker_count() -> usize {
    4
}

fn default_compression_level() -> i32 {
    3
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            worker_count: default_worker_count(),
            compression_level: default_compression_level(),
            output_dir: default_output_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.backup.worker_count, 4);
        assert_eq!(config.backup.compression_level, 3);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_file() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[backup]\nworker_count = 2\n")?;

        let config = Config::from_file(&path)?;
        assert_eq!(config.backup.worker_count, 2);
        // Unspecified fields fall back to defaults
        assert_eq!(config.backup.compression_level, 3);
        Ok(())
    }
}
