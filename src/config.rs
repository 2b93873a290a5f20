//! Immutable runtime configuration.
//!
//! Loaded once at startup from `config.json` in the platform config directory
//! (or an explicit `--config` path), then overridden by CLI flags. The capture
//! loop, frame decoder and log writer each receive the section they need at
//! construction time.
//!
//! On Linux the default file is `~/.config/qrlog/config.json`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Top-level configuration (read from config.json).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub decompressor: DecompressorConfig,
}

/// Location and schema of the scan history database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file written by the scanner app.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_table")]
    pub table: String,
    /// Monotonic integer primary key.
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Raw payload column (BLOB bytes or hex TEXT).
    #[serde(default = "default_raw_column")]
    pub raw_column: String,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    /// How long a query waits on a writer's lock before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("history.db")
}

fn default_table() -> String {
    "scans".to_string()
}

fn default_id_column() -> String {
    "_id".to_string()
}

fn default_raw_column() -> String {
    "raw".to_string()
}

fn default_timestamp_column() -> String {
    "_datetime".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    1_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            table: default_table(),
            id_column: default_id_column(),
            raw_column: default_raw_column(),
            timestamp_column: default_timestamp_column(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Capture loop timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Sleep between store polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Sleep after a failed store query before polling again.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Idle time after the last decoded fragment before a session is flushed.
    #[serde(default = "default_inactivity_ms")]
    pub inactivity_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_error_backoff_ms() -> u64 {
    5_000
}

fn default_inactivity_ms() -> u64 {
    10_000
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            inactivity_ms: default_inactivity_ms(),
        }
    }
}

impl CaptureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_millis(self.inactivity_ms)
    }
}

/// Where flushed sessions are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Always write to `overwrite_name` instead of the next free `<n>.log`.
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default = "default_overwrite_name")]
    pub overwrite_name: String,
    /// Apply ANSI kernel-level colors to flushed text.
    #[serde(default = "default_colorize")]
    pub colorize: bool,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_overwrite_name() -> String {
    "latest.log".to_string()
}

fn default_colorize() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            overwrite: false,
            overwrite_name: default_overwrite_name(),
            colorize: default_colorize(),
        }
    }
}

/// External decompressor invocation. The compressed artifact path is
/// appended after `args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompressorConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// A run that takes longer than this is killed and the row counts as failed.
    #[serde(default = "default_decompress_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_program() -> String {
    "zstd".to_string()
}

fn default_args() -> Vec<String> {
    vec!["-d".to_string(), "-c".to_string()]
}

fn default_decompress_timeout_ms() -> u64 {
    30_000
}

impl Default for DecompressorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            timeout_ms: default_decompress_timeout_ms(),
        }
    }
}

impl DecompressorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

/// qrlog config directory (e.g. `~/.config/qrlog/`).
fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("qrlog"))
}

/// Default config file path, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default location, returning defaults if the file is
/// missing or invalid.
pub fn load_config() -> Config {
    let Some(path) = default_config_path() else {
        return Config::default();
    };
    Config::load_from(&path)
}

impl Config {
    /// Load config from `path`, returning defaults if the file is missing or invalid.
    pub fn load_from(path: &Path) -> Config {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn config_default_values() {
        let config = Config::default();
        assert_eq!(config.store.table, "scans");
        assert_eq!(config.store.id_column, "_id");
        assert_eq!(config.capture.inactivity(), Duration::from_secs(10));
        assert_eq!(config.output.log_dir, PathBuf::from("logs"));
        assert!(!config.output.overwrite);
        assert_eq!(config.decompressor.program, "zstd");
        assert_eq!(config.decompressor.args, vec!["-d", "-c"]);
        assert_eq!(config.decompressor.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn config_serialize_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.output.overwrite = true;
        config.capture.poll_interval_ms = 250;
        config.store.path = PathBuf::from("/data/history.db");
        config.decompressor.timeout_ms = 2_500;
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = Config::load_from(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_invalid_json_returns_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        fs::write(&path, "not valid json!!!").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        fs::write(
            &path,
            r#"{"capture":{"inactivity_ms":500},"output":{"overwrite":true},"unknown":1}"#,
        )
        .unwrap();
        let config = Config::load_from(&path);
        assert_eq!(config.capture.inactivity_ms, 500);
        assert_eq!(config.capture.poll_interval_ms, 1_000);
        assert!(config.output.overwrite);
        assert_eq!(config.output.overwrite_name, "latest.log");
        assert_eq!(config.store, StoreConfig::default());
    }
}
