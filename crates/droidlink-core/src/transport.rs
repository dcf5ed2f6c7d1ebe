//! Process transports: the interactive "send a line, wait for a pattern"
//! capability and the one-shot "run and collect output" runner.
//!
//! The shell session is written once against [`InteractiveProcess`]. Two
//! backends implement it:
//!
//! - [`PtyProcess`] runs the shell on a pseudo-terminal. The device echoes
//!   every line written to it, so output starts with the echoed command.
//! - [`PipeProcess`] runs the shell over plain pipes, where nothing is echoed
//!   and the device may never print a prompt.
//!
//! [`ShellFlavor`] records which behavior a spawner produces, and is chosen
//! once at construction time (see [`ShellFlavor::native`]).
//!
//! Both backends feed raw output chunks into an [`ExpectBuffer`], which does
//! the incremental pattern matching.

use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use regex::bytes::Regex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::device::SpawnConfig;
use crate::error::{DeviceError, ExecutionFailure, Result};

// ---------------------------------------------------------------------------
// Expect primitives
// ---------------------------------------------------------------------------

/// Text surrounding a successful pattern match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectMatch {
    /// Everything received before the match.
    pub before: Vec<u8>,
    /// The matched bytes themselves.
    pub matched: Vec<u8>,
}

/// Why waiting for a pattern did not produce a match.
#[derive(Error, Debug)]
pub enum ExpectError {
    /// The process closed its output before the pattern appeared.
    #[error("end of stream before pattern appeared")]
    Eof {
        /// Output received since the previous match.
        before: Vec<u8>,
    },

    /// The pattern did not appear before the deadline.
    #[error("timed out waiting for pattern")]
    Timeout {
        /// Output received since the previous match (left in the buffer).
        before: Vec<u8>,
    },

    /// Writing to the process failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental matcher over a stream of output chunks.
///
/// Chunks arrive on a channel; the stream is at end when every sender has
/// been dropped. Matched text (and everything before it) is consumed, so the
/// next `expect` starts right after the previous match.
pub struct ExpectBuffer {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    buffer: Vec<u8>,
    eof: bool,
}

impl ExpectBuffer {
    /// Creates a buffer and the sender that feeds it.
    pub fn channel() -> (mpsc::UnboundedSender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx,
                buffer: Vec::new(),
                eof: false,
            },
        )
    }

    /// Waits until `pattern` matches the buffered output or `timeout` elapses.
    pub async fn expect(
        &mut self,
        pattern: &Regex,
        timeout: Duration,
    ) -> std::result::Result<ExpectMatch, ExpectError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(range) = pattern.find(&self.buffer).map(|m| m.range()) {
                let matched = self.buffer[range.clone()].to_vec();
                let before = self.buffer[..range.start].to_vec();
                self.buffer.drain(..range.end);
                return Ok(ExpectMatch { before, matched });
            }
            if self.eof {
                return Err(ExpectError::Eof {
                    before: std::mem::take(&mut self.buffer),
                });
            }
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(chunk)) => {
                    trace!(len = chunk.len(), "received output chunk");
                    self.buffer.extend_from_slice(&chunk);
                }
                Ok(None) => self.eof = true,
                Err(_) => {
                    return Err(ExpectError::Timeout {
                        before: self.buffer.clone(),
                    })
                }
            }
        }
    }

    /// Returns and clears everything buffered, including chunks that have
    /// arrived but were not yet inspected.
    pub fn take(&mut self) -> Vec<u8> {
        while let Ok(chunk) = self.rx.try_recv() {
            self.buffer.extend_from_slice(&chunk);
        }
        std::mem::take(&mut self.buffer)
    }

    /// Returns true once the stream has been observed to end.
    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// An interactive process with blocking pattern waits and buffer inspection.
#[async_trait]
pub trait InteractiveProcess: Send {
    /// Writes `line` followed by a newline, with no artificial delay.
    async fn send_line(&mut self, line: &str) -> std::io::Result<()>;

    /// Waits for `pattern` in the output, see [`ExpectBuffer::expect`].
    async fn expect(
        &mut self,
        pattern: &Regex,
        timeout: Duration,
    ) -> std::result::Result<ExpectMatch, ExpectError>;

    /// Discards and returns any unread output.
    fn take_buffer(&mut self) -> Vec<u8>;

    /// Forcibly terminates the process. Safe to call more than once.
    async fn terminate(&mut self);
}

/// How a spawned interactive shell presents its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFlavor {
    /// Pseudo-terminal: input is echoed and the prompt is always printed.
    Pty,
    /// Plain pipes: no echo; completion is best detected by a check pattern.
    Pipe,
}

impl ShellFlavor {
    /// The flavor that works on the current platform.
    pub fn native() -> Self {
        if cfg!(windows) {
            ShellFlavor::Pipe
        } else {
            ShellFlavor::Pty
        }
    }

    /// Returns true if this flavor waits for the check pattern instead of the
    /// prompt when one is supplied.
    pub fn waits_for_check_pattern(self) -> bool {
        matches!(self, ShellFlavor::Pipe)
    }

    /// Extracts a command's output from the text around the completion match.
    ///
    /// Pty output starts with the echoed command line, which is dropped. When
    /// completion was detected through a check pattern, the matched text is
    /// the result.
    pub fn extract_output(self, found: ExpectMatch, via_check_pattern: bool) -> Vec<u8> {
        match self {
            ShellFlavor::Pipe if via_check_pattern => found.matched,
            ShellFlavor::Pipe => found.before,
            ShellFlavor::Pty => strip_echo(found.before),
        }
    }

    /// Extracts the usable part of output left over after a timeout.
    pub fn extract_partial(self, before: Vec<u8>) -> Vec<u8> {
        match self {
            ShellFlavor::Pipe => before,
            ShellFlavor::Pty => strip_echo(before),
        }
    }
}

/// Drops everything up to and including the first newline.
fn strip_echo(mut output: Vec<u8>) -> Vec<u8> {
    match output.iter().position(|b| *b == b'\n') {
        Some(pos) => output.split_off(pos + 1),
        None => Vec::new(),
    }
}

/// Spawns interactive shells.
#[async_trait]
pub trait ShellSpawner: Send + Sync {
    /// The output behavior of processes produced by this spawner.
    fn flavor(&self) -> ShellFlavor;

    /// Starts `command` as an interactive process.
    async fn spawn(
        &self,
        command: &[String],
        config: &SpawnConfig,
    ) -> Result<Box<dyn InteractiveProcess>>;
}

/// Runs one-shot commands to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command`, returning combined stdout and stderr on success.
    ///
    /// A non-zero exit status or an expired `timeout` is reported as
    /// [`DeviceError::ProcessExecution`].
    async fn run(&self, command: &[String], config: &SpawnConfig, timeout: Duration)
        -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Native implementations
// ---------------------------------------------------------------------------

/// Spawns real subprocesses with the selected flavor.
#[derive(Debug, Clone, Copy)]
pub struct NativeSpawner {
    flavor: ShellFlavor,
}

impl NativeSpawner {
    /// Creates a spawner for the given flavor.
    pub fn new(flavor: ShellFlavor) -> Self {
        Self { flavor }
    }
}

impl Default for NativeSpawner {
    fn default() -> Self {
        Self::new(ShellFlavor::native())
    }
}

#[async_trait]
impl ShellSpawner for NativeSpawner {
    fn flavor(&self) -> ShellFlavor {
        self.flavor
    }

    async fn spawn(
        &self,
        command: &[String],
        config: &SpawnConfig,
    ) -> Result<Box<dyn InteractiveProcess>> {
        match self.flavor {
            ShellFlavor::Pty => Ok(Box::new(PtyProcess::spawn(command, config)?)),
            ShellFlavor::Pipe => Ok(Box::new(PipeProcess::spawn(command, config)?)),
        }
    }
}

fn split_command(command: &[String]) -> Result<(&String, &[String])> {
    command.split_first().ok_or_else(|| DeviceError::Spawn {
        command: String::new(),
        reason: "empty command".to_string(),
    })
}

fn spawn_error(command: &[String], reason: impl ToString) -> DeviceError {
    DeviceError::Spawn {
        command: command.join(" "),
        reason: reason.to_string(),
    }
}

/// Interactive process running on a pseudo-terminal.
pub struct PtyProcess {
    buffer: ExpectBuffer,
    // Blocking writes run off the async runtime.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    // Keeps the pty open for the lifetime of the process.
    _master: Box<dyn portable_pty::MasterPty + Send>,
}

impl PtyProcess {
    /// Spawns `command` on a fresh pty and starts a reader thread for it.
    pub fn spawn(command: &[String], config: &SpawnConfig) -> Result<Self> {
        let (program, args) = split_command(command)?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                // Wide enough that long commands are echoed without wrapping.
                cols: 1024,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_error(command, e))?;

        let mut builder = CommandBuilder::new(program);
        builder.args(args);
        config.apply_pty(&mut builder);

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| spawn_error(command, e))?;
        // The slave end must close with the child so the reader sees EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_error(command, e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_error(command, e))?;

        let (tx, buffer) = ExpectBuffer::channel();
        std::thread::Builder::new()
            .name("adb-shell-reader".to_string())
            .spawn(move || forward_blocking(reader, tx))?;

        debug!(pid = ?child.process_id(), "spawned pty shell");
        Ok(Self {
            buffer,
            writer: Arc::new(Mutex::new(writer)),
            child,
            _master: pair.master,
        })
    }
}

fn forward_blocking(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO on the master once the child is gone.
                debug!(error = %e, "pty reader stopped");
                break;
            }
        }
    }
}

#[async_trait]
impl InteractiveProcess for PtyProcess {
    async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');

        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(std::io::Error::other)?
    }

    async fn expect(
        &mut self,
        pattern: &Regex,
        timeout: Duration,
    ) -> std::result::Result<ExpectMatch, ExpectError> {
        self.buffer.expect(pattern, timeout).await
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        self.buffer.take()
    }

    async fn terminate(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            if let Err(e) = self.child.kill() {
                warn!(error = %e, "failed to kill pty shell");
            }
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
        }
    }
}

/// Interactive process running over plain stdin/stdout pipes.
pub struct PipeProcess {
    buffer: ExpectBuffer,
    stdin: tokio::process::ChildStdin,
    child: tokio::process::Child,
}

impl PipeProcess {
    /// Spawns `command` with piped stdio; stdout and stderr are merged.
    pub fn spawn(command: &[String], config: &SpawnConfig) -> Result<Self> {
        let (program, args) = split_command(command)?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        config.apply(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| spawn_error(command, e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(command, "stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(command, "stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error(command, "stderr unavailable"))?;

        let (tx, buffer) = ExpectBuffer::channel();
        tokio::spawn(forward_async(stdout, tx.clone()));
        tokio::spawn(forward_async(stderr, tx));

        debug!(pid = ?child.id(), "spawned piped shell");
        Ok(Self {
            buffer,
            stdin,
            child,
        })
    }
}

async fn forward_async<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl InteractiveProcess for PipeProcess {
    async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await
    }

    async fn expect(
        &mut self,
        pattern: &Regex,
        timeout: Duration,
    ) -> std::result::Result<ExpectMatch, ExpectError> {
        self.buffer.expect(pattern, timeout).await
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        self.buffer.take()
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "piped shell already exited");
            return;
        }
        let _ = self.child.wait().await;
    }
}

/// Runs one-shot commands as real subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        command: &[String],
        config: &SpawnConfig,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (program, args) = split_command(command)?;
        let command_line = command.join(" ");

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        config.apply(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| spawn_error(command, e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(command, "stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error(command, "stderr unavailable"))?;

        // Both streams share one channel so chunks keep their arrival order.
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_async(stdout, tx.clone()));
        tokio::spawn(forward_async(stderr, tx));

        let collect = async {
            let mut combined = Vec::new();
            while let Some(chunk) = rx.recv().await {
                combined.extend_from_slice(&chunk);
            }
            (combined, child.wait().await)
        };

        // On timeout the child is dropped, which kills it.
        let (combined, status) = match tokio::time::timeout(timeout, collect).await {
            Err(_) => {
                return Err(DeviceError::ProcessExecution {
                    command: command_line,
                    reason: ExecutionFailure::TimedOut(timeout),
                    output: Vec::new(),
                })
            }
            Ok(collected) => collected,
        };
        let status = status.map_err(|e| spawn_error(command, e))?;

        if !status.success() {
            return Err(DeviceError::ProcessExecution {
                command: command_line,
                reason: ExecutionFailure::ExitStatus(status.code()),
                output: combined,
            });
        }
        Ok(combined)
    }
}
