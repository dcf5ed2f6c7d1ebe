//! Continuous log-stream monitoring with pattern listeners.
//!
//! A [`LogMonitor`] tails `adb logcat -v epoch` on a background task for its
//! whole lifetime. Each line is parsed into a [`LogEvent`] and handed to every
//! active [`EventListener`] whose pattern matches the event's message.
//!
//! Callers can also block on a line without polling: [`LogMonitor::waiter`]
//! registers with the dispatch loop and [`EventWaiter::wait`] resolves when a
//! matching line has been dispatched, the timeout fires, or the monitor is
//! killed. Listener matches are latched, so a match that lands before the
//! wait starts still counts.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use droidlink_core::device::{DeviceHandle, SpawnConfig};
//! use droidlink_core::logcat::{EventListener, LogcatConfig, LogMonitor};
//! use regex::Regex;
//!
//! #[tokio::main]
//! async fn main() -> droidlink_core::error::Result<()> {
//!     let config = LogcatConfig {
//!         filters: vec!["AndroidRLTask:V".parse()?],
//!         print_all_lines: false,
//!     };
//!     let monitor = LogMonitor::spawn(&DeviceHandle::default(), &SpawnConfig::default(), config)?;
//!
//!     let listener = EventListener::new(Regex::new("episode_end")?, |line, _| {
//!         println!("episode ended: {}", line.text());
//!     });
//!     monitor.add_event_listener(listener.clone());
//!
//!     let seen = monitor.wait(None, Duration::from_secs(30)).await;
//!     println!("saw an event: {seen}");
//!
//!     monitor.kill().await;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use crate::device::{DeviceHandle, SpawnConfig};
use crate::error::{DeviceError, Result};

// ---------------------------------------------------------------------------
// Log lines
// ---------------------------------------------------------------------------

/// Severity of a log line, as printed in its single-letter column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Silent,
}

impl LogLevel {
    /// Parses the single-letter level column.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'V' => Some(LogLevel::Verbose),
            'D' => Some(LogLevel::Debug),
            'I' => Some(LogLevel::Info),
            'W' => Some(LogLevel::Warn),
            'E' => Some(LogLevel::Error),
            'F' => Some(LogLevel::Fatal),
            'S' => Some(LogLevel::Silent),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            LogLevel::Verbose => 'V',
            LogLevel::Debug => 'D',
            LogLevel::Info => 'I',
            LogLevel::Warn => 'W',
            LogLevel::Error => 'E',
            LogLevel::Fatal => 'F',
            LogLevel::Silent => 'S',
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One parsed `logcat -v epoch` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub tid: u32,
    pub level: LogLevel,
    pub tag: String,
    pub message: String,
}

fn epoch_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\.(\d+)\s+(\d+)\s+(\d+)\s+([VDIWEFS])\s+([^:]*?)\s*:\s?(.*)$")
            .expect("epoch line pattern is valid")
    })
}

impl LogEvent {
    /// Parses `<secs>.<frac>  <pid> <tid> <level> <tag>: <message>`.
    ///
    /// Returns `None` for anything else (banners, continuation lines, blank
    /// lines).
    pub fn parse(line: &str) -> Option<Self> {
        let caps = epoch_line_regex().captures(line)?;

        let secs: i64 = caps[1].parse().ok()?;
        let frac = &caps[2];
        let frac = &frac[..frac.len().min(9)];
        let nanos: u32 = format!("{frac:0<9}").parse().ok()?;

        Some(Self {
            timestamp: DateTime::from_timestamp(secs, nanos)?,
            pid: caps[3].parse().ok()?,
            tid: caps[4].parse().ok()?,
            level: caps[5].chars().next().and_then(LogLevel::from_char)?,
            tag: caps[6].to_string(),
            message: caps[7].to_string(),
        })
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:03} {:>5} {:>5} {} {}: {}",
            self.timestamp.timestamp(),
            self.timestamp.timestamp_subsec_millis(),
            self.pid,
            self.tid,
            self.level,
            self.tag,
            self.message
        )
    }
}

/// A line offered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLine {
    /// A line in the expected layout.
    Event(LogEvent),
    /// Any other line, only produced when `print_all_lines` is enabled.
    Raw(String),
}

impl LogLine {
    /// The text listener patterns are matched against: the message of a
    /// parsed event, or the whole raw line.
    pub fn text(&self) -> &str {
        match self {
            LogLine::Event(event) => &event.message,
            LogLine::Raw(raw) => raw,
        }
    }

    pub fn event(&self) -> Option<&LogEvent> {
        match self {
            LogLine::Event(event) => Some(event),
            LogLine::Raw(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A `tag:level` filter expression passed to logcat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogFilter {
    pub tag: String,
    pub level: LogLevel,
}

impl LogFilter {
    pub fn new(tag: impl Into<String>, level: LogLevel) -> Self {
        Self {
            tag: tag.into(),
            level,
        }
    }
}

/// A filter string that is not of the form `TAG:LEVEL`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid log filter `{0}`, expected TAG:LEVEL with LEVEL one of VDIWEFS")]
pub struct InvalidFilter(pub String);

impl FromStr for LogFilter {
    type Err = InvalidFilter;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || InvalidFilter(s.to_string());
        let (tag, level) = s.rsplit_once(':').ok_or_else(invalid)?;
        let mut chars = level.chars();
        let level = match (chars.next(), chars.next()) {
            (Some(c), None) => LogLevel::from_char(c).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };
        if tag.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(tag, level))
    }
}

impl TryFrom<String> for LogFilter {
    type Error = InvalidFilter;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LogFilter> for String {
    fn from(filter: LogFilter) -> Self {
        filter.to_string()
    }
}

impl fmt::Display for LogFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.level)
    }
}

impl From<InvalidFilter> for DeviceError {
    fn from(err: InvalidFilter) -> Self {
        DeviceError::ParseMismatch {
            probe: "log filter",
            output: err.0,
        }
    }
}

/// What the log monitor streams and how it treats unparsed lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogcatConfig {
    /// Tags to show; every other tag is silenced.
    pub filters: Vec<LogFilter>,
    /// Echo every line to the log and offer unparsed lines to listeners.
    pub print_all_lines: bool,
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Process-unique identity of an [`EventListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ListenerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Callback invoked on the monitor's background task for each match.
///
/// Handlers should return quickly; long work belongs on a task of its own.
pub type EventHandler = Box<dyn Fn(&LogLine, &Captures<'_>) + Send + Sync>;

/// A pattern and the handler to run when it matches.
pub struct EventListener {
    id: ListenerId,
    pattern: Regex,
    handler: EventHandler,
    active: AtomicBool,
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .field("active", &self.is_active())
            .finish()
    }
}

impl EventListener {
    /// Creates an active listener.
    pub fn new<F>(pattern: Regex, handler: F) -> Arc<Self>
    where
        F: Fn(&LogLine, &Captures<'_>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: ListenerId::next(),
            pattern,
            handler: Box::new(handler),
            active: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    /// Enables or disables the listener without unregistering it.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Runs the handler if the listener is active and its pattern matches.
    /// Returns true if it matched.
    fn dispatch(&self, line: &LogLine) -> bool {
        if !self.is_active() {
            return false;
        }
        let Some(caps) = self.pattern.captures(line.text()) else {
            return false;
        };
        if catch_unwind(AssertUnwindSafe(|| (self.handler)(line, &caps))).is_err() {
            warn!(listener = %self.id, "event handler panicked");
        }
        true
    }
}

/// Thread-safe set of registered listeners.
///
/// Dispatch iterates a snapshot, so listeners added or removed meanwhile only
/// affect later lines.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: RwLock<BTreeMap<ListenerId, Arc<EventListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<EventListener>) -> ListenerId {
        let id = listener.id();
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, listener);
        id
    }

    /// Returns true if the listener was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id)
            .is_some()
    }

    pub fn snapshot(&self) -> Vec<Arc<EventListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers `line` to every listener in a snapshot of the registry.
    /// Returns true if at least one listener matched.
    pub fn dispatch(&self, line: &LogLine) -> bool {
        let mut matched = false;
        for listener in self.snapshot() {
            if listener.dispatch(line) {
                trace!(listener = %listener.id(), "listener matched");
                matched = true;
            }
        }
        matched
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Wait bookkeeping shared by the dispatch loop and every [`EventWaiter`].
#[derive(Debug)]
struct WaitSignals {
    /// Number of dispatched lines that some registered listener matched.
    listener_matches: watch::Sender<u64>,
    /// Highest listener match already reported by a successful wait.
    acknowledged: AtomicU64,
    /// Pattern waits in progress, checked on the dispatch side.
    pattern_waits: ListenerRegistry,
}

impl WaitSignals {
    fn new() -> Self {
        let (listener_matches, _) = watch::channel(0);
        Self {
            listener_matches,
            acknowledged: AtomicU64::new(0),
            pattern_waits: ListenerRegistry::new(),
        }
    }

    /// Must run after the listener registry has seen `line`.
    fn dispatch(&self, line: &LogLine, matched_listener: bool) {
        if matched_listener {
            self.listener_matches.send_modify(|n| *n += 1);
        }
        self.pattern_waits.dispatch(line);
    }

    fn acknowledge(&self, listener_matches: u64) {
        self.acknowledged.fetch_max(listener_matches, Ordering::AcqRel);
    }
}

/// Background log-stream reader with a listener registry.
///
/// The stream keeps running until [`kill`](Self::kill) is called, the
/// monitor is dropped, or the stream ends.
pub struct LogMonitor {
    registry: Arc<ListenerRegistry>,
    signals: Arc<WaitSignals>,
    cancel_token: CancellationToken,
    child: std::sync::Mutex<Option<tokio::process::Child>>,
    join_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LogMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogMonitor")
            .field("listeners", &self.registry.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl LogMonitor {
    /// Starts `adb logcat` for `device` and begins dispatching its lines.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::Spawn`] if the log process cannot be started
    pub fn spawn(
        device: &DeviceHandle,
        spawn_config: &SpawnConfig,
        config: LogcatConfig,
    ) -> Result<Self> {
        let command = device.logcat_command(&config.filters);
        info!(command = %command.join(" "), "starting logcat");

        let spawn_error = |reason: String| DeviceError::Spawn {
            command: command.join(" "),
            reason,
        };
        let (program, args) = command
            .split_first()
            .ok_or_else(|| spawn_error("empty command".to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        spawn_config.apply(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(line = %line, "logcat stderr");
                }
            });
        }

        Ok(Self::start(BufReader::new(stdout), config, Some(child)))
    }

    /// Dispatches lines read from any async source.
    pub fn from_reader<R>(reader: R, config: LogcatConfig) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        Self::start(reader, config, None)
    }

    fn start<R>(reader: R, config: LogcatConfig, child: Option<tokio::process::Child>) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let registry = Arc::new(ListenerRegistry::new());
        let signals = Arc::new(WaitSignals::new());
        let cancel_token = CancellationToken::new();

        let join_handle = tokio::spawn(
            Self::run_loop(
                reader,
                config,
                registry.clone(),
                signals.clone(),
                cancel_token.clone(),
            )
            .instrument(debug_span!("logcat_loop")),
        );

        Self {
            registry,
            signals,
            cancel_token,
            child: std::sync::Mutex::new(child),
            join_handle: std::sync::Mutex::new(Some(join_handle)),
        }
    }

    async fn run_loop<R>(
        mut reader: R,
        config: LogcatConfig,
        registry: Arc<ListenerRegistry>,
        signals: Arc<WaitSignals>,
        cancel_token: CancellationToken,
    ) where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = tokio::select! {
                _ = cancel_token.cancelled() => break,
                r = reader.read_until(b'\n', &mut buf) => r,
            };
            match read {
                Ok(0) => {
                    info!("log stream ended");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "log stream read failed");
                    break;
                }
            }

            let raw = String::from_utf8_lossy(&buf);
            let raw = raw.trim_end_matches(['\r', '\n']);
            if config.print_all_lines {
                info!(line = %raw, "logcat");
            }

            let line = match LogEvent::parse(raw) {
                Some(event) => LogLine::Event(event),
                None if config.print_all_lines => LogLine::Raw(raw.to_string()),
                None => {
                    trace!(line = %raw, "skipping unparsed line");
                    continue;
                }
            };

            let matched_listener = registry.dispatch(&line);
            signals.dispatch(&line, matched_listener);
        }
        cancel_token.cancel();
        debug!("logcat loop exited");
    }

    /// Registers a listener. Takes effect from the next dispatched line.
    pub fn add_event_listener(&self, listener: Arc<EventListener>) -> ListenerId {
        debug!(listener = %listener.id(), pattern = listener.pattern().as_str(), "adding event listener");
        self.registry.add(listener)
    }

    /// Unregisters a listener. Returns false if it was not registered.
    ///
    /// A dispatch already running may still call it once.
    pub fn remove_event_listener(&self, listener: &EventListener) -> bool {
        debug!(listener = %listener.id(), "removing event listener");
        self.registry.remove(listener.id())
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Prepares a wait right away.
    ///
    /// With a pattern, the waiter resolves on the first line dispatched after
    /// this call that matches it. Without one, it resolves once some
    /// registered listener has matched a line that no earlier successful wait
    /// has reported, including matches made before this call.
    pub fn waiter(&self, pattern: Option<Regex>) -> EventWaiter {
        let target = match pattern {
            None => WaitTarget::AnyListener {
                baseline: self.signals.acknowledged.load(Ordering::Acquire),
                rx: self.signals.listener_matches.subscribe(),
            },
            Some(pattern) => {
                let (tx, rx) = watch::channel(None);
                let listener_matches = self.signals.listener_matches.subscribe();
                let listener = EventListener::new(pattern, move |_, _| {
                    tx.send_replace(Some(*listener_matches.borrow()));
                });
                let id = self.signals.pattern_waits.add(listener);
                WaitTarget::Pattern { id, rx }
            }
        };
        EventWaiter {
            signals: self.signals.clone(),
            target,
            shutdown: self.cancel_token.clone(),
        }
    }

    /// Waits up to `timeout` for a line, see [`waiter`](Self::waiter).
    pub async fn wait(&self, pattern: Option<&Regex>, timeout: Duration) -> bool {
        self.waiter(pattern.cloned()).wait(timeout).await
    }

    /// Stops the log process and the background loop, unblocking every
    /// waiter with `false`. Idempotent.
    pub async fn kill(&self) {
        self.cancel_token.cancel();

        let child = self
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut child) = child {
            info!("killing logcat");
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "logcat already exited");
            }
            let _ = child.wait().await;
        }

        let handle = self
            .join_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Returns true until the monitor is killed or its stream ends.
    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled()
    }
}

impl Drop for LogMonitor {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

enum WaitTarget {
    AnyListener {
        baseline: u64,
        rx: watch::Receiver<u64>,
    },
    Pattern {
        id: ListenerId,
        rx: watch::Receiver<Option<u64>>,
    },
}

/// A pending wait on a [`LogMonitor`].
pub struct EventWaiter {
    signals: Arc<WaitSignals>,
    target: WaitTarget,
    shutdown: CancellationToken,
}

impl EventWaiter {
    /// Resolves to true when a matching line has been dispatched, or false on
    /// timeout or when the monitor stops.
    pub async fn wait(mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let shutdown = self.shutdown.clone();
        let target = &mut self.target;

        // Yields the listener match count as of the satisfying line.
        let matched = async move {
            match target {
                WaitTarget::AnyListener { baseline, rx } => {
                    let baseline = *baseline;
                    match rx.wait_for(|n| *n > baseline).await {
                        Ok(n) => Some(*n),
                        Err(_) => None,
                    }
                }
                WaitTarget::Pattern { rx, .. } => match rx.wait_for(Option::is_some).await {
                    Ok(seen) => *seen,
                    Err(_) => None,
                },
            }
        };

        let outcome = tokio::select! {
            biased;
            seen = matched => seen,
            _ = shutdown.cancelled() => None,
            _ = tokio::time::sleep_until(deadline) => None,
        };
        match outcome {
            Some(listener_matches) => {
                self.signals.acknowledge(listener_matches);
                true
            }
            None => false,
        }
    }
}

impl Drop for EventWaiter {
    fn drop(&mut self) {
        if let WaitTarget::Pattern { id, .. } = &self.target {
            self.signals.pattern_waits.remove(*id);
        }
    }
}
