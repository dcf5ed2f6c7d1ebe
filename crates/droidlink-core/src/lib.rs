//! # droidlink-core
//!
//! Reliable command and log channel to Android devices over `adb`.
//!
//! This crate turns adb's line-buffered, prompt-driven subprocess interface
//! into two dependable primitives: "run this command and get its output" and
//! "tell me when a log line matching this pattern appears".
//!
//! ## Modules
//!
//! - [`device`] - Device addressing and subprocess environment
//! - [`transport`] - Interactive process backends (pty and pipes) and the one-shot runner
//! - [`shell`] - Long-lived `adb shell` session with bounded recovery
//! - [`executor`] - Serialized command execution, shell and one-shot
//! - [`logcat`] - Log-stream monitor with pattern listeners and waits
//! - [`readiness`] - Polls system services until the device is usable
//! - [`probes`] - Screen size, orientation and foreground activity probes
//! - [`retry`] - Retry budgets shared by the components above
//! - [`config`] - Persistent settings in `~/.droidlink/config.json`
//! - [`error`] - The error type every operation returns
//!
//! ## External Dependencies
//!
//! This crate requires the Android platform tools (`adb`) to be installed and
//! an adb server reachable on the configured port.
//!
//! ## Example
//!
//! ```no_run
//! use droidlink_core::config::DroidlinkConfig;
//! use droidlink_core::executor::CommandExecutor;
//!
//! #[tokio::main]
//! async fn main() -> droidlink_core::error::Result<()> {
//!     let config = DroidlinkConfig::load();
//!     let executor = CommandExecutor::new(config.device_handle())?;
//!
//!     let size = executor.screen_dimensions(None).await?;
//!     println!("screen: {size}");
//!
//!     let output = executor.run(["shell", "getprop", "ro.build.version.sdk"]).await?;
//!     println!("sdk: {}", String::from_utf8_lossy(&output).trim());
//!
//!     executor.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod logcat;
pub mod probes;
pub mod readiness;
pub mod retry;
pub mod shell;
pub mod transport;
