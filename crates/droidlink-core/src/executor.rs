//! Serialized command execution against one device.
//!
//! [`CommandExecutor`] is the single entry point higher layers use. It routes
//! each [`PendingCommand`] either through the long-lived interactive shell
//! (when the first argument is `shell`) or through a one-shot adb invocation,
//! and guarantees that at most one command is in flight at a time.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use droidlink_core::device::DeviceHandle;
//! use droidlink_core::executor::{CommandExecutor, PendingCommand};
//!
//! #[tokio::main]
//! async fn main() -> droidlink_core::error::Result<()> {
//!     let executor = CommandExecutor::new(DeviceHandle::new("adb").with_device("emulator-5554"))?;
//!     executor.init_server(None).await?;
//!
//!     let output = executor
//!         .execute(
//!             PendingCommand::new(["shell", "wm", "size"])
//!                 .timeout(Duration::from_secs(10))
//!                 .check(r"Physical\ssize:\s([0-9]+x[0-9]+)"),
//!         )
//!         .await?;
//!     println!("{}", String::from_utf8_lossy(&output));
//!
//!     executor.close().await;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::bytes::Regex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::device::{DeviceHandle, SpawnConfig};
use crate::error::{DeviceError, Result};
use crate::retry::SessionPolicy;
use crate::shell::{SessionState, ShellSession};
use crate::transport::{CommandRunner, NativeSpawner, ProcessRunner, ShellSpawner};

/// Settle time after the server daemon has been started.
const SERVER_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// One command waiting to be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    /// adb arguments, e.g. `["shell", "wm", "size"]` or `["install", "app.apk"]`.
    pub args: Vec<String>,
    /// Overrides the executor's default timeout.
    pub timeout: Option<Duration>,
    /// Regular expression that signals completion on shells without a
    /// reliable prompt.
    pub check_pattern: Option<String>,
}

impl PendingCommand {
    /// Creates a command from its adb arguments.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
            check_pattern: None,
        }
    }

    /// Sets the timeout for this command.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the completion check pattern.
    pub fn check(mut self, pattern: impl Into<String>) -> Self {
        self.check_pattern = Some(pattern.into());
        self
    }

    /// Returns true if this command goes through the interactive shell.
    pub fn is_shell(&self) -> bool {
        self.args.first().is_some_and(|a| a == "shell")
    }
}

impl fmt::Display for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args.join(" "))
    }
}

/// Executes adb commands against one device, one at a time.
pub struct CommandExecutor {
    device: DeviceHandle,
    spawn_config: SpawnConfig,
    runner: Arc<dyn CommandRunner>,
    shell: Mutex<ShellSession>,
    interrupt: std::sync::Mutex<CancellationToken>,
    default_timeout: Duration,
}

impl fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("device", &self.device)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl CommandExecutor {
    /// Creates an executor that spawns real adb processes.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::InvalidPattern`] if the device's prompt does not compile
    pub fn new(device: DeviceHandle) -> Result<Self> {
        Self::with_parts(
            device,
            SpawnConfig::default(),
            Arc::new(NativeSpawner::default()),
            Arc::new(ProcessRunner),
            SessionPolicy::default(),
        )
    }

    /// Creates an executor from explicit collaborators.
    pub fn with_parts(
        device: DeviceHandle,
        spawn_config: SpawnConfig,
        spawner: Arc<dyn ShellSpawner>,
        runner: Arc<dyn CommandRunner>,
        policy: SessionPolicy,
    ) -> Result<Self> {
        let shell = ShellSession::new(&device, spawner, spawn_config.clone(), policy)?;
        Ok(Self {
            device,
            spawn_config,
            runner,
            shell: Mutex::new(shell),
            interrupt: std::sync::Mutex::new(CancellationToken::new()),
            default_timeout: policy.send.default_timeout,
        })
    }

    /// The device this executor talks to.
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Timeout used for commands that do not set their own.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Current state of the underlying shell session.
    ///
    /// Waits for any in-flight command to finish first.
    pub async fn shell_state(&self) -> SessionState {
        self.shell.lock().await.state()
    }

    /// Executes one command and returns its output.
    ///
    /// Commands whose first argument is `shell` run on the interactive shell
    /// (the `shell` token itself is not sent). Anything else runs as a
    /// separate adb invocation. Concurrent callers are served one at a time.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::InvalidPattern`] if the check pattern does not compile
    /// - [`DeviceError::SessionInit`] or [`DeviceError::SessionRecoveryExhausted`]
    ///   for shell commands that could not be delivered
    /// - [`DeviceError::ProcessExecution`] for one-shot commands that failed
    /// - [`DeviceError::Closed`] if [`close`](Self::close) ran meanwhile
    pub async fn execute(&self, command: PendingCommand) -> Result<Vec<u8>> {
        let span = info_span!("adb_command", command = %command, shell = command.is_shell());
        async {
            let start = Instant::now();
            let result = self.execute_inner(&command).await;
            debug!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                success = result.is_ok(),
                "command complete"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn execute_inner(&self, command: &PendingCommand) -> Result<Vec<u8>> {
        let timeout = command.timeout.unwrap_or(self.default_timeout);
        let check = command
            .check_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        let interrupt = self.current_interrupt();

        let mut shell = self.shell.lock().await;

        if command.is_shell() {
            return shell
                .send(&command.args[1..], timeout, check.as_ref(), &interrupt)
                .await;
        }

        let mut full = self.device.command_prefix();
        full.extend(command.args.iter().cloned());
        info!(command = %full.join(" "), "executing adb command");

        let result = tokio::select! {
            r = self.runner.run(&full, &self.spawn_config, timeout) => r,
            _ = interrupt.cancelled() => Err(DeviceError::Closed),
        };
        drop(shell);
        result
    }

    /// Shorthand for [`execute`](Self::execute) with default timeout and no
    /// check pattern.
    pub async fn run<I, S>(&self, args: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.execute(PendingCommand::new(args)).await
    }

    /// Starts the adb server daemon with a device-independent call.
    ///
    /// Call once before the device is launched. Subsequent commands address
    /// the configured device again.
    pub async fn init_server(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let server = self.device.without_device();
        info!(port = server.server_port, "initialising the adb server");

        let mut command = server.command_prefix();
        command.push("devices".to_string());

        let interrupt = self.current_interrupt();
        let _shell = self.shell.lock().await;
        tokio::select! {
            r = self.runner.run(&command, &self.spawn_config, timeout) => { r?; }
            _ = interrupt.cancelled() => return Err(DeviceError::Closed),
        }
        tokio::time::sleep(SERVER_SETTLE_DELAY).await;
        Ok(())
    }

    /// Interrupts any in-flight command and kills the shell.
    ///
    /// The executor stays usable: the next shell command spawns a new shell.
    pub async fn close(&self) {
        info!("closing adb executor");
        {
            let mut token = self
                .interrupt
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            token.cancel();
            *token = CancellationToken::new();
        }
        self.shell.lock().await.close().await;
        info!("adb executor closed");
    }

    fn current_interrupt(&self) -> CancellationToken {
        self.interrupt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_command_builder() {
        let command = PendingCommand::new(["shell", "wm", "size"])
            .timeout(Duration::from_secs(10))
            .check("Physical size");
        assert!(command.is_shell());
        assert_eq!(command.timeout, Some(Duration::from_secs(10)));
        assert_eq!(command.check_pattern.as_deref(), Some("Physical size"));
        assert_eq!(command.to_string(), "shell wm size");
    }

    #[test]
    fn non_shell_command() {
        assert!(!PendingCommand::new(["install", "app.apk"]).is_shell());
        assert!(!PendingCommand::new(Vec::<String>::new()).is_shell());
    }

    #[tokio::test]
    async fn invalid_check_pattern_is_rejected_before_locking() {
        let executor = CommandExecutor::new(DeviceHandle::new("adb")).unwrap();
        let result = executor
            .execute(PendingCommand::new(["shell", "ls"]).check("(unclosed"))
            .await;
        assert!(matches!(result, Err(DeviceError::InvalidPattern(_))));
        assert_eq!(executor.shell_state().await, SessionState::Unstarted);
    }
}
