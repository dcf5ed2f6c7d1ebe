//! Error types shared by every droidlink component.
//!
//! Callers see one closed enum, [`DeviceError`], so they can decide whether to
//! retry, abort, or degrade without string matching. Transport instability
//! (end-of-stream, prompt timeouts) is recovered inside the shell session up to
//! its retry budget; only what survives that budget reaches this type.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::transport::ExpectError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors surfaced by the device channel.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The interactive shell could not be brought to a ready prompt.
    #[error("failed to start adb shell after {attempts} attempts")]
    SessionInit {
        /// Number of spawn attempts made before giving up.
        attempts: u32,
    },

    /// Reinitialising the shell did not get a shell command through.
    #[error("shell command `{command}` failed after {attempts} attempts")]
    SessionRecoveryExhausted {
        /// The joined shell command line.
        command: String,
        /// Number of send attempts made.
        attempts: u32,
    },

    /// The readiness probe never saw every required service.
    #[error("device was not ready after {attempts} checks")]
    DeviceReadinessTimeout {
        /// Number of readiness checks performed.
        attempts: u32,
    },

    /// A one-shot command exited non-zero or ran past its timeout.
    #[error("command `{command}` {reason}")]
    ProcessExecution {
        /// The full command line, prefix included.
        command: String,
        /// Why the command is considered failed.
        reason: ExecutionFailure,
        /// Combined stdout and stderr captured before the failure.
        output: Vec<u8>,
    },

    /// A probe's expected output layout was not found.
    #[error("could not parse {probe} output: {output:?}")]
    ParseMismatch {
        /// Which probe failed (e.g. `"screen size"`).
        probe: &'static str,
        /// The output that did not match.
        output: String,
    },

    /// The session or monitor was closed while the operation was in flight.
    #[error("channel closed while the operation was in flight")]
    Closed,

    /// A subprocess could not be started at all.
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn {
        /// The command that failed to start.
        command: String,
        /// Underlying cause.
        reason: String,
    },

    /// Waiting for a pattern on the interactive transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] ExpectError),

    /// A caller-supplied regular expression did not compile.
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Returns true for failures caused by transport instability, where a
    /// later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::SessionRecoveryExhausted { .. }
                | DeviceError::ProcessExecution { .. }
                | DeviceError::Transport(_)
                | DeviceError::Io(_)
        )
    }

    /// Returns the captured output attached to the error, if any.
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            DeviceError::ProcessExecution { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Reason a one-shot command is reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// The process exited with a non-zero status (`None` if killed by a signal).
    ExitStatus(Option<i32>),
    /// The process did not finish before the timeout.
    TimedOut(Duration),
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFailure::ExitStatus(Some(code)) => write!(f, "exited with status {code}"),
            ExecutionFailure::ExitStatus(None) => write!(f, "was terminated by a signal"),
            ExecutionFailure::TimedOut(timeout) => write!(f, "timed out after {timeout:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_session_init() {
        let err = DeviceError::SessionInit { attempts: 20 };
        assert_eq!(err.to_string(), "failed to start adb shell after 20 attempts");
    }

    #[test]
    fn error_display_process_execution() {
        let err = DeviceError::ProcessExecution {
            command: "adb -P 5037 install app.apk".to_string(),
            reason: ExecutionFailure::ExitStatus(Some(1)),
            output: b"Failure [INSTALL_FAILED]".to_vec(),
        };
        assert_eq!(
            err.to_string(),
            "command `adb -P 5037 install app.apk` exited with status 1"
        );
        assert_eq!(err.output(), Some(&b"Failure [INSTALL_FAILED]"[..]));
    }

    #[test]
    fn error_display_timeout_reason() {
        let reason = ExecutionFailure::TimedOut(Duration::from_secs(3));
        assert_eq!(reason.to_string(), "timed out after 3s");
    }

    #[test]
    fn retryable_classification() {
        assert!(!DeviceError::SessionInit { attempts: 1 }.is_retryable());
        assert!(!DeviceError::Closed.is_retryable());
        assert!(!DeviceError::ParseMismatch {
            probe: "screen size",
            output: String::new()
        }
        .is_retryable());
        assert!(DeviceError::SessionRecoveryExhausted {
            command: "ls".to_string(),
            attempts: 3
        }
        .is_retryable());
    }
}
