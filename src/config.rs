//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MBOXMIGRATE_CONFIG` (environment variable)
//! 2. `~/.config/mboxmigrate/config.toml` (Linux/macOS)
//!    `%APPDATA%\mboxmigrate\config.toml` (Windows)
//! 3. Built-in defaults
//!
//! Command-line flags take precedence over every value here.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::parser::decoder::DEFAULT_MAX_DEPTH;
use crate::parser::mbox::{DEFAULT_CHUNK_SIZE, DEFAULT_SKIP_PROGRESS_INTERVAL};

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV: &str = "MBOXMIGRATE_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Migration run defaults.
    pub migration: MigrationConfig,
    /// Performance tuning.
    pub performance: PerformanceConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for checkpoints and logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Migration run defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Destination folder messages are moved into.
    pub default_folder: String,
    /// Commits between checkpoint writes (and progress log lines).
    pub checkpoint_interval: u64,
    /// The run aborts once more than this many messages have failed.
    pub max_errors: u64,
    /// Messages between throttle pauses (0 disables throttling).
    pub throttle_every: u64,
    /// Length of each throttle pause in milliseconds.
    pub throttle_delay_ms: u64,
}

/// Performance tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Read chunk size in bytes (default: 1048576 = 1 MB).
    pub read_chunk_size: usize,
    /// Bytes between progress reports while skipping to the resume point.
    pub skip_progress_interval: u64,
    /// Maximum MIME nesting depth decoded per message.
    pub max_mime_depth: usize,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            default_folder: "Gmail Archive".to_string(),
            checkpoint_interval: 100,
            max_errors: 500,
            throttle_every: 100,
            throttle_delay_ms: 50,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_CHUNK_SIZE,
            skip_progress_interval: DEFAULT_SKIP_PROGRESS_INTERVAL,
            max_mime_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

// ── Load ────────────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    match config_file_path() {
        Some(path) if path.exists() => load_config_from(&path),
        _ => Config::default(),
    }
}

/// Load configuration from an explicit file, falling back to defaults.
pub fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(cfg) => {
                tracing::info!(path = %path.display(), "Loaded config");
                cfg
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to parse config, using defaults"
                );
                Config::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to read config file, using defaults"
            );
            Config::default()
        }
    }
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mboxmigrate").join("config.toml"))
}

/// Return the cache directory for checkpoints and logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mboxmigrate")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("migration.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.migration.default_folder, "Gmail Archive");
        assert_eq!(cfg.migration.checkpoint_interval, 100);
        assert_eq!(cfg.migration.max_errors, 500);
        assert_eq!(cfg.migration.throttle_delay_ms, 50);
        assert_eq!(cfg.performance.read_chunk_size, 1024 * 1024);
        assert_eq!(cfg.performance.max_mime_depth, 32);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[migration]
default_folder = "Imported"
max_errors = 10

[performance]
read_chunk_size = 65536
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.migration.default_folder, "Imported");
        assert_eq!(cfg.migration.max_errors, 10);
        assert_eq!(cfg.performance.read_chunk_size, 65536);
        // Other fields use defaults
        assert_eq!(cfg.migration.checkpoint_interval, 100);
        assert_eq!(cfg.general.log_level, "info");
    }

    #[test]
    fn test_load_invalid_file_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[migration]\nmax_errors = \"lots\"\n").unwrap();
        assert_eq!(load_config_from(&path), Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[general]\ncache_dir = \"/tmp/mm\"\n").unwrap();
        let cfg = load_config_from(&path);
        assert_eq!(cache_dir(&cfg), PathBuf::from("/tmp/mm"));
        assert_eq!(log_file_path(&cfg), PathBuf::from("/tmp/mm/migration.log"));
    }
}
