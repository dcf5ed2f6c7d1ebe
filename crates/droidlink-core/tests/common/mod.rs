//! Shared test helpers for droidlink-core integration tests.
//!
//! Provides scripted stand-ins for the adb processes: a fake interactive
//! shell, a fake one-shot runner and an in-memory log stream.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::bytes::Regex;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use droidlink_core::device::{DeviceHandle, SpawnConfig};
use droidlink_core::error::{DeviceError, Result};
use droidlink_core::executor::CommandExecutor;
use droidlink_core::logcat::{LogMonitor, LogcatConfig};
use droidlink_core::retry::{RetryPolicy, SessionPolicy};
use droidlink_core::transport::{
    CommandRunner, ExpectBuffer, ExpectError, ExpectMatch, InteractiveProcess, ShellFlavor,
    ShellSpawner,
};

/// What the emulator prints when the shell is idle.
pub const PROMPT: &str = "generic_x86:/ $ ";

// ---------------------------------------------------------------------------
// Fake interactive shell
// ---------------------------------------------------------------------------

/// How a freshly spawned fake shell behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnBehavior {
    /// Print the prompt right away.
    Ready,
    /// Close the output stream without printing anything.
    Eof,
    /// Stay silent forever.
    Hang,
    /// Fail to start at all.
    Fail,
}

/// How the fake shell answers one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Print the text in small chunks, then the prompt.
    Output(String),
    /// Print the text and never print the prompt.
    Partial(String),
    /// Close the output stream.
    Eof,
    /// Print nothing.
    Hang,
}

type Responder = Box<dyn Fn(&str) -> Reply + Send + Sync>;

struct ShellState {
    flavor: ShellFlavor,
    spawn_script: Mutex<VecDeque<SpawnBehavior>>,
    default_spawn: SpawnBehavior,
    replies: Mutex<VecDeque<Reply>>,
    responder: Responder,
    spawns: AtomicUsize,
    sent: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ShellState {
    fn next_reply(&self, line: &str) -> Reply {
        match self.replies.lock().unwrap().pop_front() {
            Some(reply) => reply,
            None => (self.responder)(line),
        }
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A scripted `adb shell` that answers through a responder closure.
pub struct FakeShell {
    state: Arc<ShellState>,
}

impl FakeShell {
    /// Creates a pty-flavored shell that spawns ready and answers every
    /// command through `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(ShellState {
                flavor: ShellFlavor::Pty,
                spawn_script: Mutex::new(VecDeque::new()),
                default_spawn: SpawnBehavior::Ready,
                replies: Mutex::new(VecDeque::new()),
                responder: Box::new(responder),
                spawns: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// A shell that answers each command with `<command>\r\n`.
    pub fn echoing() -> Self {
        Self::new(|line| Reply::Output(format!("{line}\r\n")))
    }

    fn state_mut(&mut self) -> &mut ShellState {
        Arc::get_mut(&mut self.state).expect("configure the fake shell before sharing it")
    }

    pub fn with_flavor(mut self, flavor: ShellFlavor) -> Self {
        self.state_mut().flavor = flavor;
        self
    }

    /// Behaviors for the first spawns, in order.
    pub fn with_spawns(mut self, spawns: Vec<SpawnBehavior>) -> Self {
        self.state_mut().spawn_script = Mutex::new(spawns.into());
        self
    }

    /// Behavior once the spawn script is used up.
    pub fn always_spawn(mut self, behavior: SpawnBehavior) -> Self {
        self.state_mut().default_spawn = behavior;
        self
    }

    /// Replies for the first commands, in order, before the responder.
    pub fn with_replies(mut self, replies: Vec<Reply>) -> Self {
        self.state_mut().replies = Mutex::new(replies.into());
        self
    }

    pub fn spawns(&self) -> usize {
        self.state.spawns.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellSpawner for FakeShell {
    fn flavor(&self) -> ShellFlavor {
        self.state.flavor
    }

    async fn spawn(
        &self,
        command: &[String],
        _config: &SpawnConfig,
    ) -> Result<Box<dyn InteractiveProcess>> {
        self.state.spawns.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .state
            .spawn_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.state.default_spawn);

        let (tx, buffer) = ExpectBuffer::channel();
        let tx = match behavior {
            SpawnBehavior::Fail => {
                return Err(DeviceError::Spawn {
                    command: command.join(" "),
                    reason: "device offline".to_string(),
                })
            }
            SpawnBehavior::Ready => {
                tx.send(PROMPT.as_bytes().to_vec()).unwrap();
                Some(tx)
            }
            SpawnBehavior::Eof => None,
            SpawnBehavior::Hang => Some(tx),
        };

        Ok(Box::new(FakeProcess {
            tx,
            buffer,
            state: self.state.clone(),
        }))
    }
}

struct FakeProcess {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    buffer: ExpectBuffer,
    state: Arc<ShellState>,
}

#[async_trait]
impl InteractiveProcess for FakeProcess {
    async fn send_line(&mut self, line: &str) -> io::Result<()> {
        let Some(tx) = self.tx.clone() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "shell is gone"));
        };
        self.state.sent.lock().unwrap().push(line.to_string());

        if self.state.flavor == ShellFlavor::Pty {
            let _ = tx.send(format!("{line}\r\n").into_bytes());
        }

        match self.state.next_reply(line) {
            Reply::Output(text) => {
                let state = self.state.clone();
                state.enter();
                tokio::spawn(async move {
                    for chunk in text.as_bytes().chunks(7) {
                        let _ = tx.send(chunk.to_vec());
                        tokio::task::yield_now().await;
                    }
                    state.leave();
                    let _ = tx.send(PROMPT.as_bytes().to_vec());
                });
            }
            Reply::Partial(text) => {
                let _ = tx.send(text.into_bytes());
            }
            Reply::Eof => self.tx = None,
            Reply::Hang => {}
        }
        Ok(())
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
        self.tx = None;
    }
}

// ---------------------------------------------------------------------------
// Fake one-shot runner
// ---------------------------------------------------------------------------

type RunResponder = Box<dyn Fn(&[String]) -> Result<Vec<u8>> + Send + Sync>;

/// Records one-shot commands and answers them through a closure.
pub struct FakeRunner {
    calls: Mutex<Vec<Vec<String>>>,
    responder: RunResponder,
}

impl FakeRunner {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[String]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// A runner where every command succeeds with empty output.
    pub fn ok() -> Self {
        Self::new(|_| Ok(Vec::new()))
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        command: &[String],
        _config: &SpawnConfig,
        _timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(command.to_vec());
        (self.responder)(command)
    }
}

// ---------------------------------------------------------------------------
// Executor wiring
// ---------------------------------------------------------------------------

pub fn test_device() -> DeviceHandle {
    DeviceHandle::new("adb").with_device("emulator-5554")
}

/// Short delays and timeouts so failing paths finish quickly.
pub fn fast_policy() -> SessionPolicy {
    let timeout = Duration::from_secs(5);
    SessionPolicy {
        init: RetryPolicy::new(3, Duration::from_millis(10)).with_default_timeout(timeout),
        send: RetryPolicy::shell_send().with_default_timeout(timeout),
    }
}

pub fn executor_with(
    shell: Arc<FakeShell>,
    runner: Arc<FakeRunner>,
    policy: SessionPolicy,
) -> CommandExecutor {
    CommandExecutor::with_parts(test_device(), SpawnConfig::inherit(), shell, runner, policy)
        .unwrap()
}

pub fn shell_executor(shell: Arc<FakeShell>) -> CommandExecutor {
    executor_with(shell, Arc::new(FakeRunner::ok()), fast_policy())
}

// ---------------------------------------------------------------------------
// Fake log stream
// ---------------------------------------------------------------------------

/// The writing end of an in-memory log stream.
pub struct FakeLogStream {
    writer: DuplexStream,
}

impl FakeLogStream {
    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

/// A monitor reading from an in-memory stream.
pub fn log_stream(config: LogcatConfig) -> (LogMonitor, FakeLogStream) {
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let monitor = LogMonitor::from_reader(BufReader::new(reader), config);
    (monitor, FakeLogStream { writer })
}

/// A valid `logcat -v epoch` line carrying `message`.
pub fn make_stdout(message: &str) -> String {
    format!("         1553110400.424  5583  5658 D Tag: {message}")
}
