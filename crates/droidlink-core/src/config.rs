//! Persistent configuration for droidlink.
//!
//! Stores user settings in `~/.droidlink/config.json`: which adb binary and
//! server to use, which device to target, and how the log stream is filtered.
//! Anything missing from the file falls back to the built-in defaults.
//!
//! # Example
//!
//! ```no_run
//! use droidlink_core::config::DroidlinkConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = DroidlinkConfig::load();
//!
//! let device = config.device_handle();
//! println!("adb prefix: {}", device.command_prefix().join(" "));
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{DeviceHandle, DEFAULT_PROMPT, DEFAULT_SERVER_PORT};
use crate::logcat::{LogFilter, LogcatConfig};
use crate::retry::{RetryPolicy, SessionPolicy, DEFAULT_TIMEOUT};

const CONFIG_FILENAME: &str = "config.json";

/// Returns the droidlink state directory (`~/.droidlink`), creating it if
/// needed.
///
/// Falls back to the system temp directory when no home directory is known.
pub fn droidlink_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".droidlink");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        debug!(dir = %dir.display(), error = %e, "could not create droidlink directory");
    }
    dir
}

/// Persistent droidlink configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroidlinkConfig {
    /// Path to the `adb` binary.
    pub adb_path: PathBuf,
    /// Port of the adb server.
    pub server_port: u16,
    /// Device serial to target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Regular expression matching the idle shell prompt.
    pub shell_prompt: String,
    /// Timeout for commands that do not set one, in seconds.
    pub default_timeout_secs: u64,
    /// `tag:level` filters for the log stream.
    pub log_filters: Vec<LogFilter>,
    /// Echo every log line.
    pub print_all_lines: bool,
}

impl Default for DroidlinkConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            server_port: DEFAULT_SERVER_PORT,
            device_id: None,
            shell_prompt: DEFAULT_PROMPT.to_string(),
            default_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            log_filters: Vec::new(),
            print_all_lines: false,
        }
    }
}

impl DroidlinkConfig {
    /// Load config from `~/.droidlink/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&droidlink_dir().join(CONFIG_FILENAME))
    }

    /// Load config from an explicit path, with the same fallback as [`load`](Self::load).
    pub fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.droidlink/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(&droidlink_dir().join(CONFIG_FILENAME))
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// The device identity described by this config.
    pub fn device_handle(&self) -> DeviceHandle {
        let mut device = DeviceHandle::new(&self.adb_path)
            .with_server_port(self.server_port)
            .with_prompt(&self.shell_prompt);
        if let Some(device_id) = &self.device_id {
            device = device.with_device(device_id);
        }
        device
    }

    /// The default shell retry budget with this config's default timeout.
    pub fn retry_policy(&self) -> SessionPolicy {
        let timeout = self.default_timeout();
        SessionPolicy {
            init: RetryPolicy::shell_init().with_default_timeout(timeout),
            send: RetryPolicy::shell_send().with_default_timeout(timeout),
        }
    }

    pub fn logcat_config(&self) -> LogcatConfig {
        LogcatConfig {
            filters: self.log_filters.clone(),
            print_all_lines: self.print_all_lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logcat::LogLevel;

    #[test]
    fn defaults_match_adb_conventions() {
        let config = DroidlinkConfig::default();
        let device = config.device_handle();
        assert_eq!(device.command_prefix(), vec!["adb", "-P", "5037"]);
        assert_eq!(config.default_timeout(), Duration::from_secs(120));
        assert_eq!(config.retry_policy(), SessionPolicy::default());
    }

    #[test]
    fn deserialize_partial_json() {
        let loaded: DroidlinkConfig =
            serde_json::from_str(r#"{"device_id": "emulator-5554", "log_filters": ["AndroidRLTask:V"]}"#)
                .unwrap();
        assert_eq!(loaded.server_port, 5037);
        assert_eq!(loaded.device_id.as_deref(), Some("emulator-5554"));
        assert_eq!(
            loaded.logcat_config().filters,
            vec![LogFilter::new("AndroidRLTask", LogLevel::Verbose)]
        );
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        let config = DroidlinkConfig {
            server_port: 6000,
            device_id: Some("emulator-5556".to_string()),
            default_timeout_secs: 30,
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(DroidlinkConfig::load_from(&path), config);
        assert_eq!(
            config.retry_policy().send.default_timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(DroidlinkConfig::load_from(&path), DroidlinkConfig::default());
        assert_eq!(
            DroidlinkConfig::load_from(&dir.path().join("missing.json")),
            DroidlinkConfig::default()
        );
    }
}
