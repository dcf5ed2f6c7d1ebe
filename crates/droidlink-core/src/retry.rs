//! Bounded retry configuration shared by the shell session and the
//! readiness probe.

use std::time::Duration;

/// Timeout applied to device commands when the caller does not supply one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// How many times and how often an operation is attempted.
///
/// Policies are plain values: build one, hand it to a component, and it is
/// never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Sleep between two consecutive attempts.
    pub delay: Duration,
    /// Timeout used when an operation is called without an explicit one.
    pub default_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::shell_init()
    }
}

impl RetryPolicy {
    /// Creates a policy with [`DEFAULT_TIMEOUT`] as the default timeout.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Spawning the interactive shell: 20 attempts, 2 s apart.
    pub fn shell_init() -> Self {
        Self::new(20, Duration::from_secs(2))
    }

    /// Sending one shell command: 3 attempts, reinitialising in between.
    pub fn shell_send() -> Self {
        Self::new(3, Duration::ZERO)
    }

    /// Polling device services: 20 checks, 1 s apart.
    pub fn readiness() -> Self {
        Self::new(20, Duration::from_secs(1))
    }

    /// Returns a copy with a different default timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Picks the caller's timeout, falling back to the policy default.
    pub fn resolve_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.default_timeout)
    }

    /// Returns true if another attempt is allowed after `attempt` (1-based).
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// The pair of policies a shell session runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Applied while spawning the shell and waiting for its first prompt.
    pub init: RetryPolicy,
    /// Applied to each command sent over a ready shell.
    pub send: RetryPolicy,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            init: RetryPolicy::shell_init(),
            send: RetryPolicy::shell_send(),
        }
    }
}
