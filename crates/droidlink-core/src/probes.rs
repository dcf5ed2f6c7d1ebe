//! Device-state probes built on [`CommandExecutor`].
//!
//! Each probe is a shell command plus a pure parser. The parsers are public so
//! captured output can be checked offline.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{error, info};

use crate::error::{DeviceError, Result};
use crate::executor::{CommandExecutor, PendingCommand};
use crate::readiness::DeviceReadinessProbe;
use crate::retry::RetryPolicy;

/// Timeout for the `dumpsys` and `am` based probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const SCREEN_SIZE_PATTERN: &str = r"Physical\ssize:\s([0-9]+)x([0-9]+)";

/// Physical screen size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    /// The `(height, width)` pair, rows first.
    pub fn height_width(self) -> (u32, u32) {
        (self.height, self.width)
    }
}

impl fmt::Display for ScreenSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Surface rotation reported by the input service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Portrait,
    Landscape,
    ReversePortrait,
    ReverseLandscape,
}

impl Orientation {
    pub fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            0 => Some(Orientation::Portrait),
            1 => Some(Orientation::Landscape),
            2 => Some(Orientation::ReversePortrait),
            3 => Some(Orientation::ReverseLandscape),
            _ => None,
        }
    }

    pub fn as_digit(self) -> u8 {
        match self {
            Orientation::Portrait => 0,
            Orientation::Landscape => 1,
            Orientation::ReversePortrait => 2,
            Orientation::ReverseLandscape => 3,
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
            Orientation::ReversePortrait => "reverse-portrait",
            Orientation::ReverseLandscape => "reverse-landscape",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

fn screen_size_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SCREEN_SIZE_PATTERN).expect("screen size pattern is valid"))
}

/// Parses `wm size` output such as `Physical size: 1080x1920`.
pub fn parse_screen_size(output: &str) -> Result<ScreenSize> {
    let mismatch = || DeviceError::ParseMismatch {
        probe: "screen size",
        output: output.to_string(),
    };
    let joined = output.replace("\r\n", "");
    let caps = screen_size_regex().captures(&joined).ok_or_else(mismatch)?;
    Ok(ScreenSize {
        width: caps[1].parse().map_err(|_| mismatch())?,
        height: caps[2].parse().map_err(|_| mismatch())?,
    })
}

/// Parses `dumpsys input` output for the first valid display's
/// `SurfaceOrientation`.
///
/// A `PhysicalWidth` line with a negative width marks the following
/// orientation as belonging to a placeholder display, which is skipped.
pub fn parse_orientation(output: &str) -> Result<Orientation> {
    static WIDTH: OnceLock<Regex> = OnceLock::new();
    static SURFACE: OnceLock<Regex> = OnceLock::new();
    let width = WIDTH.get_or_init(|| {
        Regex::new(r"^\s+PhysicalWidth:\s+(-?\d+)px").expect("width pattern is valid")
    });
    let surface = SURFACE.get_or_init(|| {
        Regex::new(r"^\s+SurfaceOrientation:\s+(\d)").expect("orientation pattern is valid")
    });

    let mut skip_next = false;
    for line in output.lines() {
        if let Some(caps) = width.captures(line) {
            skip_next = caps[1].parse::<i64>().map(|w| w < 0).unwrap_or(false);
        }
        if let Some(caps) = surface.captures(line) {
            if skip_next {
                continue;
            }
            let orientation = caps[1]
                .parse::<u8>()
                .ok()
                .and_then(Orientation::from_digit);
            if let Some(orientation) = orientation {
                return Ok(orientation);
            }
        }
    }
    Err(DeviceError::ParseMismatch {
        probe: "orientation",
        output: output.to_string(),
    })
}

/// Finds the id of the visible task running `activity` in `am stack list`
/// output.
pub fn parse_task_id(output: &str, activity: &str) -> Result<Option<u32>> {
    let activity = regex::escape(activity);
    let by_name = Regex::new(&format!(r"^\s*taskId=([0-9]+): {activity}.*visible=true"))?;
    let by_component =
        Regex::new(&format!(r"^\s*taskId=([0-9]+): .* visible=true .*\{{{activity}\}}"))?;

    for line in output.lines() {
        let caps = by_name
            .captures(line)
            .or_else(|| by_component.captures(line));
        if let Some(id) = caps.and_then(|c| c[1].parse().ok()) {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Extracts the component name of the first visible task in `am stack list`
/// output, e.g. `com.example.app/com.example.app.MainActivity`.
pub fn parse_current_activity(output: &str) -> Result<String> {
    static COMPONENT: OnceLock<Regex> = OnceLock::new();
    let component = COMPONENT.get_or_init(|| Regex::new(r".*\{(.*)\}").expect("component pattern is valid"));

    output
        .lines()
        .filter(|line| line.contains("visible=true"))
        .find_map(|line| component.captures(line).map(|c| c[1].to_string()))
        .ok_or_else(|| DeviceError::ParseMismatch {
            probe: "current activity",
            output: output.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Executor-backed probes
// ---------------------------------------------------------------------------

impl CommandExecutor {
    async fn shell_text(&self, command: PendingCommand) -> Result<String> {
        let output = self.execute(command).await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Waits for the device to be ready, then reads its physical screen size.
    pub async fn screen_dimensions(&self, timeout: Option<Duration>) -> Result<ScreenSize> {
        info!("fetching screen dimensions");
        DeviceReadinessProbe::new(self, RetryPolicy::readiness())
            .wait_until_ready(timeout)
            .await?;

        let mut command = PendingCommand::new(["shell", "wm", "size"]).check(SCREEN_SIZE_PATTERN);
        if let Some(timeout) = timeout {
            command = command.timeout(timeout);
        }
        let size = parse_screen_size(&self.shell_text(command).await?)?;
        info!(width = size.width, height = size.height, "screen dimensions");
        Ok(size)
    }

    /// Reads the current surface orientation from `dumpsys input`.
    pub async fn orientation(&self) -> Result<Orientation> {
        let output = self
            .shell_text(PendingCommand::new(["shell", "dumpsys", "input"]).timeout(PROBE_TIMEOUT))
            .await?;
        let orientation = parse_orientation(&output)?;
        info!(%orientation, "orientation");
        Ok(orientation)
    }

    async fn stack_list(&self) -> Result<String> {
        self.shell_text(PendingCommand::new(["shell", "am", "stack", "list"]).timeout(PROBE_TIMEOUT))
            .await
    }

    /// Returns the id of the visible task running `activity`, if any.
    pub async fn current_task_id(&self, activity: &str) -> Result<Option<u32>> {
        let stack = self.stack_list().await?;
        let id = parse_task_id(&stack, activity)?;
        if id.is_none() {
            error!(activity, stack = %stack, "could not find current activity in stack list");
        }
        Ok(id)
    }

    /// Returns the component name of the foreground activity.
    pub async fn current_activity(&self) -> Result<String> {
        let stack = self.stack_list().await?;
        let activity = parse_current_activity(&stack);
        if activity.is_err() {
            error!(stack = %stack, "could not extract current activity");
        }
        activity
    }

    /// Pins the screen to the task running `activity`.
    ///
    /// Does nothing when no visible task runs it.
    pub async fn start_screen_pinning(&self, activity: &str) -> Result<()> {
        let Some(task_id) = self.current_task_id(activity).await? else {
            info!(activity, "could not find task id for activity; not pinning");
            return Ok(());
        };
        let task_id = task_id.to_string();
        self.execute(
            PendingCommand::new(["shell", "am", "task", "lock", task_id.as_str()])
                .timeout(PROBE_TIMEOUT),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMPSYS_INPUT: &str = "\
Input Manager State:
  Display: 0
    Viewport INTERNAL:
      PhysicalWidth: -1px
      SurfaceOrientation: 3
  Display: 1
      PhysicalWidth: 1080px
      SurfaceOrientation: 1
";

    const STACK_LIST: &str = "\
Stack id=0 bounds=[0,0][1080,1920] displayId=0 userId=0
  taskId=12: com.android.launcher3/.Launcher bounds=[0,0][1080,1920] userId=0 visible=false
Stack id=3 bounds=[0,0][1080,1920] displayId=0 userId=0
  taskId=42: com.example.vokram/com.example.vokram.MainActivity bounds=[0,0][1080,1920] userId=0 visible=true topActivity=ComponentInfo{com.example.vokram/com.example.vokram.MainActivity}
";

    #[test]
    fn screen_size_from_wm_output() {
        let size = parse_screen_size("Physical size: 320x480\r\n").unwrap();
        assert_eq!(size, ScreenSize { width: 320, height: 480 });
        assert_eq!(size.height_width(), (480, 320));
        assert_eq!(size.to_string(), "320x480");
    }

    #[test]
    fn screen_size_mismatch_is_an_error() {
        match parse_screen_size("Override size: n/a") {
            Err(DeviceError::ParseMismatch { probe, .. }) => assert_eq!(probe, "screen size"),
            other => panic!("expected ParseMismatch, got {:?}", other),
        }
    }

    #[test]
    fn orientation_skips_negative_width_display() {
        assert_eq!(parse_orientation(DUMPSYS_INPUT).unwrap(), Orientation::Landscape);
    }

    #[test]
    fn orientation_without_surface_line_fails() {
        assert!(matches!(
            parse_orientation("Input Manager State:\n"),
            Err(DeviceError::ParseMismatch { .. })
        ));
    }

    #[test]
    fn task_id_for_visible_activity() {
        let id = parse_task_id(STACK_LIST, "com.example.vokram/com.example.vokram.MainActivity").unwrap();
        assert_eq!(id, Some(42));
    }

    #[test]
    fn task_id_ignores_invisible_tasks() {
        assert_eq!(parse_task_id(STACK_LIST, "com.android.launcher3/.Launcher").unwrap(), None);
    }

    #[test]
    fn task_id_matches_component_form() {
        let line = "  taskId=7: unnamed bounds=[0,0][1,1] visible=true topActivity=ComponentInfo{com.a/com.a.B}";
        assert_eq!(parse_task_id(line, "com.a/com.a.B").unwrap(), Some(7));
    }

    #[test]
    fn current_activity_from_visible_task() {
        assert_eq!(
            parse_current_activity(STACK_LIST).unwrap(),
            "com.example.vokram/com.example.vokram.MainActivity"
        );
        assert!(parse_current_activity("taskId=1: a visible=false").is_err());
    }

    #[test]
    fn orientation_digits() {
        for digit in 0..4 {
            assert_eq!(Orientation::from_digit(digit).unwrap().as_digit(), digit);
        }
        assert_eq!(Orientation::from_digit(4), None);
    }
}
