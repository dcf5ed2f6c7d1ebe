//! Polls required system services until the device is usable.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{DeviceError, Result};
use crate::executor::{CommandExecutor, PendingCommand};
use crate::retry::RetryPolicy;

/// Services that must be registered before the device accepts commands.
pub const REQUIRED_SERVICES: [&str; 4] = ["window", "package", "input", "display"];

/// Checks [`REQUIRED_SERVICES`] through a [`CommandExecutor`].
#[derive(Debug)]
pub struct DeviceReadinessProbe<'a> {
    executor: &'a CommandExecutor,
    policy: RetryPolicy,
}

impl<'a> DeviceReadinessProbe<'a> {
    pub fn new(executor: &'a CommandExecutor, policy: RetryPolicy) -> Self {
        Self { executor, policy }
    }

    /// Runs `service check` once for every required service.
    ///
    /// Returns false as soon as one service is missing. A shell failure for
    /// one service counts as "missing" for this round.
    ///
    /// # Errors
    ///
    /// Only errors a later round cannot fix, such as
    /// [`DeviceError::SessionInit`] or [`DeviceError::Closed`].
    pub async fn check_once(&self, timeout: Option<Duration>) -> Result<bool> {
        for service in REQUIRED_SERVICES {
            let expected = format!("Service {service}: found");
            let mut command = PendingCommand::new(["shell", "service", "check", service])
                .check(regex::escape(&expected));
            if let Some(timeout) = timeout {
                command = command.timeout(timeout);
            }

            let output = match self.executor.execute(command).await {
                Ok(output) => output,
                Err(e) if e.is_retryable() => {
                    warn!(service, error = %e, "service check failed");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };

            let output = String::from_utf8_lossy(&output);
            if !output.lines().any(|line| line.trim() == expected) {
                debug!(service, output = %output.trim(), "service not found");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Repeats [`check_once`](Self::check_once) until every service is found.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::DeviceReadinessTimeout`] after the policy's attempts
    pub async fn wait_until_ready(&self, timeout: Option<Duration>) -> Result<()> {
        let policy = self.policy;
        for attempt in 1..=policy.max_attempts {
            if self.check_once(timeout).await? {
                info!(attempt, "device is ready");
                return Ok(());
            }
            warn!(attempt, max_attempts = policy.max_attempts, "device is not ready");
            if policy.has_next(attempt) {
                tokio::time::sleep(policy.delay).await;
            }
        }
        error!(attempts = policy.max_attempts, "device timed out");
        Err(DeviceError::DeviceReadinessTimeout {
            attempts: policy.max_attempts,
        })
    }
}
