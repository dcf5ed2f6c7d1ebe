//! Interactive `adb shell` session with bounded recovery.
//!
//! A [`ShellSession`] owns at most one interactive process. It spawns the
//! process lazily, waits for the idle prompt, then sends one command at a time
//! and returns whatever the device printed before the next prompt.
//!
//! End-of-stream and prompt timeouts are treated as transport instability: the
//! session tears the process down, spawns a fresh one, and resends the command,
//! up to the budget in its [`SessionPolicy`]. Only when that budget is spent
//! does the caller see an error.
//!
//! Every wait also watches a [`CancellationToken`]; cancelling it makes the
//! in-flight operation return [`DeviceError::Closed`] promptly.

use std::sync::Arc;
use std::time::Duration;

use regex::bytes::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceHandle, SpawnConfig};
use crate::error::{DeviceError, Result};
use crate::retry::SessionPolicy;
use crate::transport::{ExpectError, InteractiveProcess, ShellFlavor, ShellSpawner};

/// Lifecycle of a [`ShellSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No process has been spawned yet.
    Unstarted,
    /// A process is being spawned and its first prompt awaited.
    Spawning,
    /// The shell is idle at its prompt.
    Ready,
    /// A command is in flight.
    Busy,
    /// The last operation exhausted its retry budget. The next command
    /// starts over from spawning.
    Failed,
    /// The session was closed explicitly.
    Closed,
}

/// One interactive shell on one device.
pub struct ShellSession {
    spawner: Arc<dyn ShellSpawner>,
    command: Vec<String>,
    spawn_config: SpawnConfig,
    prompt: Regex,
    policy: SessionPolicy,
    process: Option<Box<dyn InteractiveProcess>>,
    state: SessionState,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("command", &self.command)
            .field("prompt", &self.prompt.as_str())
            .field("policy", &self.policy)
            .field("state", &self.state)
            .finish()
    }
}

impl ShellSession {
    /// Creates a session for `device`. Nothing is spawned until the first
    /// call to [`ensure_ready`](Self::ensure_ready) or [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// - [`DeviceError::InvalidPattern`] if the device's prompt does not compile
    pub fn new(
        device: &DeviceHandle,
        spawner: Arc<dyn ShellSpawner>,
        spawn_config: SpawnConfig,
        policy: SessionPolicy,
    ) -> Result<Self> {
        Ok(Self {
            spawner,
            command: device.shell_command(),
            spawn_config,
            prompt: device.prompt_regex()?,
            policy,
            process: None,
            state: SessionState::Unstarted,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns true if a command may be sent right now.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready && self.process.is_some()
    }

    /// The retry budget this session runs under.
    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Spawns the shell and consumes its first prompt, unless already ready.
    ///
    /// Each attempt waits up to `timeout` for the prompt. Failed attempts are
    /// retried after the init policy's delay.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::SessionInit`] once every attempt has failed
    /// - [`DeviceError::Closed`] if `interrupt` is cancelled meanwhile
    pub async fn ensure_ready(
        &mut self,
        timeout: Duration,
        interrupt: &CancellationToken,
    ) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        self.teardown().await;

        let init = self.policy.init;
        info!(command = %self.command.join(" "), "initialising adb shell");

        for attempt in 1..=init.max_attempts {
            if interrupt.is_cancelled() {
                self.state = SessionState::Closed;
                return Err(DeviceError::Closed);
            }
            self.state = SessionState::Spawning;

            match self.spawn_once(timeout, interrupt).await {
                Ok(process) => {
                    self.process = Some(process);
                    self.state = SessionState::Ready;
                    info!(attempt, "adb shell ready");
                    return Ok(());
                }
                Err(DeviceError::Closed) => {
                    self.state = SessionState::Closed;
                    return Err(DeviceError::Closed);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = init.max_attempts,
                        error = %e,
                        "could not start adb shell"
                    );
                }
            }

            if init.has_next(attempt) && !init.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(init.delay) => {}
                    _ = interrupt.cancelled() => {
                        self.state = SessionState::Closed;
                        return Err(DeviceError::Closed);
                    }
                }
            }
        }

        self.state = SessionState::Failed;
        error!(attempts = init.max_attempts, "giving up on adb shell");
        Err(DeviceError::SessionInit {
            attempts: init.max_attempts,
        })
    }

    async fn spawn_once(
        &mut self,
        timeout: Duration,
        interrupt: &CancellationToken,
    ) -> Result<Box<dyn InteractiveProcess>> {
        let mut process = self.spawner.spawn(&self.command, &self.spawn_config).await?;

        let outcome = tokio::select! {
            r = process.expect(&self.prompt, timeout) => Some(r),
            _ = interrupt.cancelled() => None,
        };

        match outcome {
            Some(Ok(_)) => Ok(process),
            Some(Err(e)) => {
                if let ExpectError::Eof { before } | ExpectError::Timeout { before } = &e {
                    debug!(output = %String::from_utf8_lossy(before), "shell output before failure");
                }
                process.terminate().await;
                Err(e.into())
            }
            None => {
                process.terminate().await;
                Err(DeviceError::Closed)
            }
        }
    }

    /// Sends one command line and returns the output printed before the next
    /// prompt, with the echoed command removed.
    ///
    /// On shells that do not echo (see [`ShellFlavor::Pipe`]) completion is
    /// detected by `check_pattern` when one is supplied. If the wait times out
    /// while some output beyond the echoed command has arrived and a check
    /// pattern was supplied, that partial output is returned as the result.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::SessionInit`] if the shell cannot be (re)started
    /// - [`DeviceError::SessionRecoveryExhausted`] if every send attempt failed
    /// - [`DeviceError::Closed`] if `interrupt` is cancelled meanwhile
    pub async fn send(
        &mut self,
        args: &[String],
        timeout: Duration,
        check_pattern: Option<&Regex>,
        interrupt: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let line = args.join(" ");
        let flavor = self.spawner.flavor();
        let send = self.policy.send;

        for attempt in 1..=send.max_attempts {
            self.ensure_ready(timeout, interrupt).await?;
            debug!(attempt, command = %line, ?timeout, "sending shell command");

            match self.send_once(&line, flavor, timeout, check_pattern, interrupt).await {
                Ok(output) => {
                    self.state = SessionState::Ready;
                    debug!(command = %line, "shell command done");
                    return Ok(output);
                }
                Err(DeviceError::Closed) => {
                    self.teardown().await;
                    self.state = SessionState::Closed;
                    return Err(DeviceError::Closed);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = send.max_attempts,
                        command = %line,
                        error = %e,
                        "shell command failed; reinitialising the shell"
                    );
                    self.teardown().await;
                    self.state = SessionState::Spawning;
                }
            }

            if send.has_next(attempt) && !send.delay.is_zero() {
                tokio::time::sleep(send.delay).await;
            }
        }

        self.state = SessionState::Failed;
        error!(command = %line, "reinitialising the shell did not solve the issue");
        Err(DeviceError::SessionRecoveryExhausted {
            command: line,
            attempts: send.max_attempts,
        })
    }

    async fn send_once(
        &mut self,
        line: &str,
        flavor: ShellFlavor,
        timeout: Duration,
        check_pattern: Option<&Regex>,
        interrupt: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let Some(process) = self.process.as_mut() else {
            return Err(DeviceError::Closed);
        };
        self.state = SessionState::Busy;
        tokio::select! {
            r = process.send_line(line) => r?,
            _ = interrupt.cancelled() => return Err(DeviceError::Closed),
        }

        let via_check = flavor.waits_for_check_pattern() && check_pattern.is_some();
        let pattern = match check_pattern {
            Some(check) if via_check => check,
            _ => &self.prompt,
        };

        let outcome = tokio::select! {
            r = process.expect(pattern, timeout) => Some(r),
            _ = interrupt.cancelled() => None,
        };

        match outcome {
            None => Err(DeviceError::Closed),
            Some(Ok(found)) => Ok(flavor.extract_output(found, via_check)),
            Some(Err(ExpectError::Timeout { before })) if check_pattern.is_some() => {
                // The pty echo alone is not output.
                let partial = flavor.extract_partial(before.clone());
                if partial.is_empty() {
                    return Err(ExpectError::Timeout { before }.into());
                }
                warn!(command = %line, "timed out with partial output; returning it");
                process.take_buffer();
                Ok(partial)
            }
            Some(Err(e)) => {
                if let ExpectError::Eof { before } = &e {
                    debug!(output = %String::from_utf8_lossy(before), "shell reached end of stream");
                }
                Err(e.into())
            }
        }
    }

    /// Kills the shell process and clears readiness. Idempotent.
    pub async fn close(&mut self) {
        if self.process.is_some() {
            info!("killing adb shell");
        }
        self.teardown().await;
        self.state = SessionState::Closed;
    }

    async fn teardown(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate().await;
        }
    }
}
