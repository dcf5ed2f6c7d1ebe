//! Device addressing and spawn configuration.
//!
//! A [`DeviceHandle`] is the immutable identity every invocation is built from:
//! which `adb` binary to run, which server port to talk to, and optionally
//! which device serial to target. It outlives any shell session created for it.
//!
//! # Example
//!
//! ```
//! use droidlink_core::device::DeviceHandle;
//!
//! let device = DeviceHandle::new("adb").with_device("emulator-5554");
//! assert_eq!(
//!     device.command_prefix(),
//!     vec!["adb", "-P", "5037", "-s", "emulator-5554"]
//! );
//! ```

use std::path::PathBuf;

use regex::bytes::Regex;

use crate::error::Result;
use crate::logcat::LogFilter;

/// Port the adb server listens on unless configured otherwise.
pub const DEFAULT_SERVER_PORT: u16 = 5037;

/// Prompt printed by an idle shell on the stock x86 emulator images.
pub const DEFAULT_PROMPT: &str = r"generic_x86:/ \$";

/// Environment variables that make adb talk to the wrong server when
/// inherited from an IDE session.
pub const CONFLICTING_ENV_VARS: [&str; 2] = ["ANDROID_HOME", "ANDROID_ADB_SERVER_PORT"];

/// Immutable identity of a device reachable through an adb server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Path to the `adb` binary.
    pub binary: PathBuf,
    /// Port of the adb server (`-P`).
    pub server_port: u16,
    /// Device serial (`-s`); `None` lets adb pick the only attached device.
    pub device_id: Option<String>,
    /// Regular expression matching the idle shell prompt.
    pub prompt: String,
}

impl Default for DeviceHandle {
    fn default() -> Self {
        Self::new("adb")
    }
}

impl DeviceHandle {
    /// Creates a handle for the given adb binary with default port and prompt.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            server_port: DEFAULT_SERVER_PORT,
            device_id: None,
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }

    /// Targets a specific device serial.
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Talks to an adb server on a non-default port.
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    /// Overrides the shell prompt pattern.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Returns a copy addressing the server only, without `-s`.
    ///
    /// Used for device-independent calls such as starting the server daemon.
    pub fn without_device(&self) -> Self {
        Self {
            device_id: None,
            ..self.clone()
        }
    }

    /// The `<binary> -P <port> [-s <device>]` prefix of every invocation.
    pub fn command_prefix(&self) -> Vec<String> {
        let mut prefix = vec![
            self.binary.to_string_lossy().into_owned(),
            "-P".to_string(),
            self.server_port.to_string(),
        ];
        if let Some(device_id) = self.device_id.as_deref().filter(|id| !id.is_empty()) {
            prefix.push("-s".to_string());
            prefix.push(device_id.to_string());
        }
        prefix
    }

    /// The command that opens an interactive shell on the device.
    pub fn shell_command(&self) -> Vec<String> {
        let mut command = self.command_prefix();
        command.push("shell".to_string());
        command
    }

    /// The command that streams the device log in epoch format.
    ///
    /// With filters, only the given `tag:level` pairs are shown and
    /// everything else is silenced with a trailing `*:S`. Without filters the
    /// whole log is streamed.
    pub fn logcat_command(&self, filters: &[LogFilter]) -> Vec<String> {
        let mut command = self.command_prefix();
        command.extend(["logcat".to_string(), "-v".to_string(), "epoch".to_string()]);
        if !filters.is_empty() {
            command.extend(filters.iter().map(|f| f.to_string()));
            command.push("*:S".to_string());
        }
        command
    }

    /// Compiles [`Self::prompt`] for matching against raw shell output.
    pub fn prompt_regex(&self) -> Result<Regex> {
        Ok(Regex::new(&self.prompt)?)
    }
}

/// Process-level settings applied to every subprocess droidlink spawns.
///
/// The parent environment is never modified; variables listed in
/// [`env_remove`](Self::env_remove) are stripped from each child only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Variables removed from the child's environment.
    pub env_remove: Vec<String>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            env_remove: CONFLICTING_ENV_VARS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl SpawnConfig {
    /// A configuration that leaves the inherited environment untouched.
    pub fn inherit() -> Self {
        Self { env_remove: Vec::new() }
    }

    /// Applies the configuration to a tokio command.
    pub fn apply(&self, command: &mut tokio::process::Command) {
        for key in &self.env_remove {
            command.env_remove(key);
        }
    }

    /// Applies the configuration to a pty command.
    pub fn apply_pty(&self, command: &mut portable_pty::CommandBuilder) {
        for key in &self.env_remove {
            command.env_remove(key);
        }
    }
}
