//! Readiness probe and device-state probe tests over the scripted shell.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{executor_with, fast_policy, shell_executor, FakeRunner, FakeShell, Reply, SpawnBehavior};

use droidlink_core::error::DeviceError;
use droidlink_core::probes::{Orientation, ScreenSize};
use droidlink_core::readiness::{DeviceReadinessProbe, REQUIRED_SERVICES};
use droidlink_core::retry::RetryPolicy;

/// Answers `service check` like a booted device.
fn booted(line: &str) -> Option<Reply> {
    let service = line.strip_prefix("service check ")?;
    Some(Reply::Output(format!("Service {service}: found\r\n")))
}

fn device_shell() -> FakeShell {
    FakeShell::new(|line| {
        if let Some(reply) = booted(line) {
            return reply;
        }
        match line {
            "wm size" => Reply::Output("Physical size: 1080x1920\r\n".to_string()),
            "dumpsys input" => Reply::Output(
                "  Viewport:\r\n      PhysicalWidth: 1080px\r\n      SurfaceOrientation: 0\r\n"
                    .to_string(),
            ),
            "am stack list" => Reply::Output(
                "  taskId=42: com.example.vokram/com.example.vokram.MainActivity bounds=[0,0][1080,1920] userId=0 visible=true topActivity=ComponentInfo{com.example.vokram/com.example.vokram.MainActivity}\r\n"
                    .to_string(),
            ),
            _ => Reply::Output(String::new()),
        }
    })
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ready_device_passes_first_round() {
    let shell = Arc::new(FakeShell::new(|line| booted(line).unwrap()));
    let executor = shell_executor(shell.clone());

    let probe = DeviceReadinessProbe::new(&executor, RetryPolicy::readiness());
    probe.wait_until_ready(None).await.unwrap();

    let expected: Vec<String> = REQUIRED_SERVICES
        .iter()
        .map(|s| format!("service check {s}"))
        .collect();
    assert_eq!(shell.sent(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_missing_service_is_retried() {
    let rounds = Arc::new(AtomicUsize::new(0));
    let counter = rounds.clone();
    let shell = Arc::new(FakeShell::new(move |line| {
        if line == "service check window" && counter.fetch_add(1, Ordering::SeqCst) < 2 {
            return Reply::Output("Service window: not found\r\n".to_string());
        }
        booted(line).unwrap()
    }));
    let executor = shell_executor(shell.clone());

    let probe = DeviceReadinessProbe::new(&executor, RetryPolicy::readiness());
    let start = tokio::time::Instant::now();
    probe.wait_until_ready(None).await.unwrap();

    assert_eq!(rounds.load(Ordering::SeqCst), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_never_ready_times_out() {
    let shell = Arc::new(FakeShell::new(|_| {
        Reply::Output("Service package: not found\r\n".to_string())
    }));
    let executor = shell_executor(shell.clone());

    let probe = DeviceReadinessProbe::new(&executor, RetryPolicy::new(3, Duration::from_secs(1)));
    assert!(matches!(
        probe.wait_until_ready(None).await,
        Err(DeviceError::DeviceReadinessTimeout { attempts: 3 })
    ));
    // The round stops at the first missing service.
    assert_eq!(shell.sent().len(), 3);
}

#[tokio::test]
async fn test_transport_failure_counts_as_not_ready() {
    let shell = Arc::new(FakeShell::new(|_| Reply::Eof));
    let executor = shell_executor(shell.clone());

    let probe = DeviceReadinessProbe::new(&executor, RetryPolicy::readiness());
    assert!(!probe.check_once(None).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_session_init_failure_propagates() {
    let shell = Arc::new(FakeShell::echoing().always_spawn(SpawnBehavior::Fail));
    let executor = executor_with(shell.clone(), Arc::new(FakeRunner::ok()), fast_policy());

    let probe = DeviceReadinessProbe::new(&executor, RetryPolicy::readiness());
    assert!(matches!(
        probe.wait_until_ready(None).await,
        Err(DeviceError::SessionInit { attempts: 3 })
    ));
    assert_eq!(shell.spawns(), 3);
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_screen_dimensions_waits_for_readiness() {
    let shell = Arc::new(device_shell());
    let executor = shell_executor(shell.clone());

    let size = executor.screen_dimensions(None).await.unwrap();
    assert_eq!(size, ScreenSize { width: 1080, height: 1920 });
    assert_eq!(size.height_width(), (1920, 1080));

    let sent = shell.sent();
    assert_eq!(sent.len(), REQUIRED_SERVICES.len() + 1);
    assert_eq!(sent.last().unwrap(), "wm size");
}

#[tokio::test]
async fn test_orientation_probe() {
    let executor = shell_executor(Arc::new(device_shell()));
    assert_eq!(executor.orientation().await.unwrap(), Orientation::Portrait);
}

#[tokio::test]
async fn test_current_activity_probe() {
    let executor = shell_executor(Arc::new(device_shell()));
    assert_eq!(
        executor.current_activity().await.unwrap(),
        "com.example.vokram/com.example.vokram.MainActivity"
    );
}

#[tokio::test]
async fn test_screen_pinning_locks_visible_task() {
    let shell = Arc::new(device_shell());
    let executor = shell_executor(shell.clone());

    executor
        .start_screen_pinning("com.example.vokram/com.example.vokram.MainActivity")
        .await
        .unwrap();
    assert_eq!(shell.sent(), vec!["am stack list", "am task lock 42"]);
}

#[tokio::test]
async fn test_screen_pinning_without_task_is_a_noop() {
    let shell = Arc::new(device_shell());
    let executor = shell_executor(shell.clone());

    executor.start_screen_pinning("com.other/.Main").await.unwrap();
    assert_eq!(shell.sent(), vec!["am stack list"]);
}

#[tokio::test]
async fn test_unparseable_screen_size_is_an_error() {
    let shell = Arc::new(FakeShell::new(|line| {
        booted(line).unwrap_or_else(|| Reply::Output("Override size: none\r\n".to_string()))
    }));
    let executor = shell_executor(shell);

    assert!(matches!(
        executor.screen_dimensions(Some(Duration::from_secs(1))).await,
        Err(DeviceError::ParseMismatch { probe: "screen size", .. })
    ));
}
