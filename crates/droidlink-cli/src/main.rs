//! CLI client for driving an Android device through adb.
//!
//! Every invocation opens one [`CommandExecutor`], runs a single command and
//! closes the channel again.
//!
//! # Usage
//!
//! ```bash
//! # Run a one-shot adb command (prefix and serial are added)
//! droidlink exec install -r app.apk
//!
//! # Run a command over the interactive shell
//! droidlink shell getprop ro.build.version.sdk
//!
//! # Wait for a pattern instead of the prompt
//! droidlink shell --check Success pm install /data/local/tmp/app.apk
//!
//! # Start the adb server before launching an emulator
//! droidlink start-server
//!
//! # Block until the device services are up
//! droidlink --device emulator-5554 wait-ready
//!
//! # Device probes
//! droidlink screen-size
//! droidlink orientation
//! droidlink activity
//!
//! # Wait up to 30 s for a log line
//! droidlink logcat --filter AndroidRLTask:V --pattern "episode_end" --timeout 30
//! ```
//!
//! Add `--format json` for machine-readable output.
//!
//! Settings come from `~/.droidlink/config.json`; flags and `DROIDLINK_*`
//! variables override them.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use droidlink_core::config::DroidlinkConfig;
use droidlink_core::device::SpawnConfig;
use droidlink_core::error::DeviceError;
use droidlink_core::executor::{CommandExecutor, PendingCommand};
use droidlink_core::logcat::{EventListener, LogFilter, LogLine, LogMonitor};
use droidlink_core::readiness::DeviceReadinessProbe;
use droidlink_core::retry::RetryPolicy;
use droidlink_core::transport::{NativeSpawner, ProcessRunner};
use regex::Regex;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// CLI client for Android device automation over adb.
#[derive(Parser)]
#[command(name = "droidlink")]
#[command(about = "Run commands, probes and log waits against an Android device")]
#[command(version)]
struct Cli {
    /// Path to the adb binary
    #[arg(long, env = "DROIDLINK_ADB")]
    adb: Option<PathBuf>,

    /// Port of the adb server
    #[arg(short, long, env = "DROIDLINK_PORT")]
    port: Option<u16>,

    /// Serial of the device to target
    #[arg(short, long, env = "DROIDLINK_DEVICE")]
    device: Option<String>,

    /// Default command timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Output format: text or json
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a one-shot adb command
    Exec {
        /// Arguments after the adb prefix
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run a command over the interactive shell
    Shell {
        /// Regular expression to wait for instead of the prompt
        #[arg(short, long)]
        check: Option<String>,
        /// The shell command line
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Start the adb server without addressing a device
    StartServer,

    /// Wait until the device's system services are registered
    WaitReady,

    /// Print the physical screen size as WIDTHxHEIGHT
    ScreenSize,

    /// Print the current surface orientation
    Orientation,

    /// Print the visible activity component
    Activity,

    /// Wait for a log line matching a pattern
    Logcat {
        /// Tag filters as TAG:LEVEL (e.g. ActivityManager:I)
        #[arg(short, long = "filter")]
        filters: Vec<String>,
        /// Regular expression matched against each log message
        #[arg(long)]
        pattern: String,
        /// Seconds to wait before giving up
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Also match lines that are not in logcat's epoch layout
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_file.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

/// Logs to stderr, or to `log_file` through a background writer whose guard
/// must outlive `run`.
fn init_logging(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_writer(std::io::stderr)
            .init();
        return None;
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("droidlink.log"));
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum CliError {
    CommandFailed(String),
    Session(String),
    Timeout(String),
    Parse(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::CommandFailed(_) => ExitCode::from(1),
            CliError::Session(_) => ExitCode::from(2),
            CliError::Timeout(_) => ExitCode::from(3),
            CliError::Parse(_) => ExitCode::from(4),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::CommandFailed(msg) => write!(f, "Command failed: {}", msg),
            CliError::Session(msg) => write!(f, "Session error: {}", msg),
            CliError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            CliError::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl From<DeviceError> for CliError {
    fn from(err: DeviceError) -> Self {
        let msg = err.to_string();
        match err {
            DeviceError::ProcessExecution { .. } => CliError::CommandFailed(msg),
            DeviceError::DeviceReadinessTimeout { .. } => CliError::Timeout(msg),
            DeviceError::ParseMismatch { .. } | DeviceError::InvalidPattern(_) => {
                CliError::Parse(msg)
            }
            DeviceError::SessionInit { .. }
            | DeviceError::SessionRecoveryExhausted { .. }
            | DeviceError::Spawn { .. }
            | DeviceError::Transport(_)
            | DeviceError::Io(_)
            | DeviceError::Closed => CliError::Session(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn load_config(cli: &Cli) -> DroidlinkConfig {
    let mut config = DroidlinkConfig::load();
    if let Some(adb) = &cli.adb {
        config.adb_path = adb.clone();
    }
    if let Some(port) = cli.port {
        config.server_port = port;
    }
    if let Some(device) = &cli.device {
        config.device_id = Some(device.clone());
    }
    if let Some(secs) = cli.timeout {
        config.default_timeout_secs = secs;
    }
    config
}

fn open_executor(config: &DroidlinkConfig) -> Result<CommandExecutor, CliError> {
    let executor = CommandExecutor::with_parts(
        config.device_handle(),
        SpawnConfig::default(),
        Arc::new(NativeSpawner::default()),
        Arc::new(ProcessRunner),
        config.retry_policy(),
    )?;
    Ok(executor)
}

/// Writes raw command output to stdout, or wraps it in a JSON object.
fn emit(format: OutputFormat, output: &[u8]) -> Result<(), CliError> {
    if format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::json!({ "output": String::from_utf8_lossy(output) })
        );
        return Ok(());
    }
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(output)
        .and_then(|()| stdout.flush())
        .map_err(|e| CliError::Session(e.to_string()))
}

fn print_result(format: OutputFormat, text: impl std::fmt::Display, json: serde_json::Value) {
    match format {
        OutputFormat::Text => println!("{}", text),
        OutputFormat::Json => println!("{}", json),
    }
}

fn log_line_json(line: &LogLine) -> serde_json::Value {
    match line {
        LogLine::Event(event) => serde_json::json!({
            "timestamp": event.timestamp.to_rfc3339(),
            "pid": event.pid,
            "tid": event.tid,
            "level": event.level.to_string(),
            "tag": event.tag,
            "message": event.message,
        }),
        LogLine::Raw(raw) => serde_json::json!({ "raw": raw }),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(&cli);
    debug!(?config, "effective configuration");

    // Building the executor spawns nothing; the shell starts on first use.
    let executor = open_executor(&config)?;
    let result = run_command(&executor, &config, cli.format, cli.command).await;
    executor.close().await;
    result
}

async fn run_command(
    executor: &CommandExecutor,
    config: &DroidlinkConfig,
    format: OutputFormat,
    command: Command,
) -> Result<(), CliError> {
    match command {
        Command::Exec { args } => match executor.run(args).await {
            Ok(output) => emit(format, &output),
            Err(e) => {
                if let Some(output) = e.output() {
                    emit(format, output)?;
                }
                Err(e.into())
            }
        },
        Command::Shell { check, args } => {
            let mut pending = PendingCommand::new(std::iter::once("shell".to_string()).chain(args));
            if let Some(check) = check {
                pending = pending.check(check);
            }
            let output = executor.execute(pending).await?;
            emit(format, &output)
        }
        Command::StartServer => {
            executor.init_server(None).await?;
            info!("adb server started");
            Ok(())
        }
        Command::WaitReady => {
            DeviceReadinessProbe::new(executor, RetryPolicy::readiness())
                .wait_until_ready(None)
                .await?;
            print_result(format, "ready", serde_json::json!({ "ready": true }));
            Ok(())
        }
        Command::ScreenSize => {
            let size = executor.screen_dimensions(None).await?;
            print_result(
                format,
                size,
                serde_json::json!({ "width": size.width, "height": size.height }),
            );
            Ok(())
        }
        Command::Orientation => {
            let orientation = executor.orientation().await?;
            print_result(
                format,
                orientation,
                serde_json::json!({
                    "orientation": orientation.to_string(),
                    "rotation": orientation.as_digit(),
                }),
            );
            Ok(())
        }
        Command::Activity => {
            let activity = executor.current_activity().await?;
            let json = serde_json::json!({ "activity": activity });
            print_result(format, activity, json);
            Ok(())
        }
        Command::Logcat {
            filters,
            pattern,
            timeout,
            all,
        } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.default_timeout());
            wait_for_log(config, format, &filters, &pattern, timeout, all).await
        }
    }
}

async fn wait_for_log(
    config: &DroidlinkConfig,
    format: OutputFormat,
    filters: &[String],
    pattern: &str,
    timeout: Duration,
    all: bool,
) -> Result<(), CliError> {
    let mut logcat = config.logcat_config();
    if !filters.is_empty() {
        logcat.filters = filters
            .iter()
            .map(|f| f.parse::<LogFilter>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(DeviceError::from)?;
    }
    logcat.print_all_lines |= all;
    let pattern = Regex::new(pattern).map_err(DeviceError::from)?;

    let monitor = LogMonitor::spawn(&config.device_handle(), &SpawnConfig::default(), logcat)?;
    monitor.add_event_listener(EventListener::new(pattern.clone(), move |line, _| {
        match (format, line) {
            (OutputFormat::Json, line) => println!("{}", log_line_json(line)),
            (OutputFormat::Text, LogLine::Event(event)) => println!("{}", event),
            (OutputFormat::Text, LogLine::Raw(raw)) => println!("{}", raw),
        }
    }));

    let seen = monitor.wait(None, timeout).await;
    monitor.kill().await;

    if seen {
        info!(pattern = %pattern, "log pattern seen");
        Ok(())
    } else {
        Err(CliError::Timeout(format!(
            "no log line matched `{}` within {:?}",
            pattern, timeout
        )))
    }
}
