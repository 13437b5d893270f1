use std::io::Cursor;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use regex::Regex;
use tokio::sync::OnceCell;

use crate::config::DeviceConfig;
use crate::device::{keycode, DeviceSurface, ScreenInsets, Screenshot};
use crate::errors::{AgentError, AgentResult};

const REMOTE_SCREENSHOT_PATH: &str = "/sdcard/screenshot_tmp.png";

/// Real device backend speaking the adb command surface.
pub struct AdbDevice {
    adb_path: String,
    device: String,
    command_timeout: Duration,
    screenshot_timeout: Duration,
    screen_size: OnceCell<(u32, u32)>,
    insets: OnceCell<ScreenInsets>,
}

impl AdbDevice {
    pub fn new(device: impl Into<String>, config: &DeviceConfig) -> Self {
        Self {
            adb_path: config.adb_path.clone(),
            device: device.into(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            screenshot_timeout: Duration::from_secs(config.screenshot_timeout_secs),
            screen_size: OnceCell::new(),
            insets: OnceCell::new(),
        }
    }

    /// List serials of devices currently reported by `adb devices`.
    pub async fn list_devices(adb_path: &str) -> AgentResult<Vec<String>> {
        let output = run_with_timeout(
            adb_path,
            &["devices"],
            Duration::from_secs(10),
        )
        .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .skip(1)
            .filter_map(|line| {
                let mut cols = line.split_whitespace();
                match (cols.next(), cols.next()) {
                    (Some(serial), Some("device")) => Some(serial.to_string()),
                    _ => None,
                }
            })
            .collect())
    }

    async fn run(&self, args: &[&str]) -> AgentResult<Output> {
        self.run_timeout(args, self.command_timeout).await
    }

    async fn run_timeout(&self, args: &[&str], timeout: Duration) -> AgentResult<Output> {
        let mut full: Vec<&str> = vec!["-s", self.device.as_str()];
        full.extend_from_slice(args);
        run_with_timeout(&self.adb_path, &full, timeout).await
    }

    /// Run and require a zero exit status.
    async fn run_ok(&self, args: &[&str]) -> AgentResult<Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(AgentError::DeviceCommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn shell_ok(&self, args: &[&str]) -> AgentResult<Output> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.run_ok(&full).await
    }

    async fn cached_screen_size(&self) -> AgentResult<(u32, u32)> {
        self.screen_size
            .get_or_try_init(|| async {
                let output = self.shell_ok(&["wm", "size"]).await?;
                parse_screen_size(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
                    AgentError::DeviceUnavailable("cannot parse screen size from wm size".into())
                })
            })
            .await
            .copied()
    }

    async fn cached_insets(&self) -> AgentResult<ScreenInsets> {
        let insets = self
            .insets
            .get_or_try_init(|| async {
                let (_, height) = self.cached_screen_size().await?;
                let output = self
                    .run_timeout(&["shell", "dumpsys", "window", "windows"], Duration::from_secs(10))
                    .await?;
                Ok::<_, AgentError>(parse_insets(
                    &String::from_utf8_lossy(&output.stdout),
                    height,
                ))
            })
            .await?;
        Ok(*insets)
    }
}

async fn run_with_timeout(adb_path: &str, args: &[&str], timeout: Duration) -> AgentResult<Output> {
    let future = tokio::process::Command::new(adb_path)
        .args(args)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(AgentError::DeviceUnavailable(format!(
            "failed to spawn adb: {e}"
        ))),
        Err(_) => Err(AgentError::DeviceUnavailable(format!(
            "adb {} timed out after {:?}",
            args.join(" "),
            timeout
        ))),
    }
}

/// `wm size` prefers an Override size when the resolution was changed.
fn parse_screen_size(output: &str) -> Option<(u32, u32)> {
    let re_override = Regex::new(r"Override size:\s*(\d+)x(\d+)").ok()?;
    let re_physical = Regex::new(r"Physical size:\s*(\d+)x(\d+)").ok()?;
    let re_any = Regex::new(r"(\d+)x(\d+)").ok()?;
    for re in [&re_override, &re_physical, &re_any] {
        if let Some(caps) = re.captures(output) {
            let w = caps[1].parse().ok()?;
            let h = caps[2].parse().ok()?;
            return Some((w, h));
        }
    }
    None
}

/// `mAppBounds=Rect(0, 92 - 1080, 2276)` is the most reliable source; the
/// StatusBar / NavigationBar `Requested h=` lines are the fallback.
fn parse_insets(output: &str, screen_height: u32) -> ScreenInsets {
    if let Ok(re) = Regex::new(r"mAppBounds=Rect\((\d+),\s*(\d+)\s*-\s*(\d+),\s*(\d+)\)") {
        if let Some(caps) = re.captures(output) {
            let top: u32 = caps[2].parse().unwrap_or(0);
            let bottom_y: u32 = caps[4].parse().unwrap_or(screen_height);
            return ScreenInsets {
                top,
                bottom: screen_height.saturating_sub(bottom_y),
            };
        }
    }

    let mut insets = ScreenInsets::default();
    if let Ok(re) = Regex::new(r"(?s)StatusBar\}:.*?Requested w=\d+ h=(\d+)") {
        if let Some(caps) = re.captures(output) {
            insets.top = caps[1].parse().unwrap_or(0);
        }
    }
    if let Ok(re) = Regex::new(r"(?s)NavigationBar\d*\}:.*?Requested w=\d+ h=(\d+)") {
        if let Some(caps) = re.captures(output) {
            insets.bottom = caps[1].parse().unwrap_or(0);
        }
    }
    insets
}

fn parse_foreground(output: &str) -> Option<String> {
    for pattern in [
        r"mResumedActivity.*?(\S+)/",
        r"topResumedActivity.*?(\S+)/",
        r"ResumedActivity.*?(\S+)/",
        r"mFocusedApp.*?(\S+)/",
        r"mCurrentFocus.*?(\S+)/",
    ] {
        if let Ok(re) = Regex::new(pattern) {
            if let Some(caps) = re.captures(output) {
                let pkg = caps[1].rsplit(' ').next().unwrap_or(&caps[1]).to_string();
                if pkg.contains('.') {
                    return Some(pkg);
                }
            }
        }
    }
    None
}

/// Escape text for `input text`: spaces become %s, shell metacharacters are
/// backslash-escaped.
fn escape_ascii_text(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace(' ', "%s")
        .replace('&', "\\&")
        .replace('<', "\\<")
        .replace('>', "\\>")
        .replace('(', "\\(")
        .replace(')', "\\)")
}

fn crop_png(png: &[u8], insets: ScreenInsets) -> AgentResult<Screenshot> {
    let img = image::load_from_memory(png)?;
    let (width, height) = (img.width(), img.height());
    let cropped_height = height
        .saturating_sub(insets.top)
        .saturating_sub(insets.bottom);
    if cropped_height == 0 || (insets.top == 0 && insets.bottom == 0) {
        return Ok(Screenshot {
            png: png.to_vec(),
            width,
            height,
            crop_top: 0,
        });
    }

    let cropped = img.crop_imm(0, insets.top, width, cropped_height);
    let mut out = Vec::new();
    cropped.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)?;
    Ok(Screenshot {
        png: out,
        width,
        height: cropped_height,
        crop_top: insets.top,
    })
}

#[async_trait]
impl DeviceSurface for AdbDevice {
    fn name(&self) -> &str {
        &self.device
    }

    async fn connect(&self) -> AgentResult<bool> {
        // Only address-style targets (ip:port) need an explicit connect.
        if !self.device.contains(':') {
            return Ok(true);
        }
        let output = run_with_timeout(
            &self.adb_path,
            &["connect", self.device.as_str()],
            Duration::from_secs(30),
        )
        .await?;
        let ok = String::from_utf8_lossy(&output.stdout)
            .to_lowercase()
            .contains("connected");
        if ok {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(ok)
    }

    async fn is_connected(&self) -> AgentResult<bool> {
        let serials = Self::list_devices(&self.adb_path).await?;
        Ok(serials.iter().any(|s| s == &self.device))
    }

    async fn screen_size(&self) -> AgentResult<(u32, u32)> {
        self.cached_screen_size().await
    }

    async fn screen_insets(&self) -> AgentResult<ScreenInsets> {
        self.cached_insets().await
    }

    async fn tap(&self, x: u32, y: u32) -> AgentResult<()> {
        tracing::debug!(x, y, "tap");
        self.shell_ok(&["input", "tap", &x.to_string(), &y.to_string()])
            .await?;
        Ok(())
    }

    async fn long_press(&self, x: u32, y: u32, duration_ms: u64) -> AgentResult<()> {
        tracing::debug!(x, y, duration_ms, "long press");
        let (xs, ys, ds) = (x.to_string(), y.to_string(), duration_ms.to_string());
        self.shell_ok(&["input", "swipe", &xs, &ys, &xs, &ys, &ds])
            .await?;
        Ok(())
    }

    async fn swipe(
        &self,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration_ms: u64,
    ) -> AgentResult<()> {
        tracing::debug!(x1, y1, x2, y2, duration_ms, "swipe");
        let args = [
            x1.to_string(),
            y1.to_string(),
            x2.to_string(),
            y2.to_string(),
            duration_ms.to_string(),
        ];
        self.shell_ok(&[
            "input", "swipe", &args[0], &args[1], &args[2], &args[3], &args[4],
        ])
        .await?;
        Ok(())
    }

    async fn input_text(&self, text: &str) -> AgentResult<()> {
        let escaped = escape_ascii_text(text);
        self.shell_ok(&["input", "text", &escaped]).await?;
        Ok(())
    }

    async fn input_text_wide(&self, text: &str) -> AgentResult<()> {
        // Base64 broadcast avoids shell encoding issues entirely.
        let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
        let output = self
            .shell_ok(&[
                "am", "broadcast", "-a", "ADB_INPUT_B64", "--es", "msg", &encoded,
            ])
            .await?;
        if String::from_utf8_lossy(&output.stdout).contains("Broadcast completed") {
            return Ok(());
        }

        tracing::debug!("base64 broadcast not acknowledged, trying raw broadcast");
        let output = self
            .shell_ok(&["am", "broadcast", "-a", "ADB_INPUT_TEXT", "--es", "msg", text])
            .await?;
        if String::from_utf8_lossy(&output.stdout).contains("Broadcast completed") {
            return Ok(());
        }

        // Last resort: unicode escape sequences, supported on some builds.
        let escaped: String = text
            .chars()
            .map(|c| {
                if (c as u32) > 127 {
                    format!("\\u{:04x}", c as u32)
                } else {
                    c.to_string()
                }
            })
            .collect();
        self.shell_ok(&["input", "text", &escaped]).await?;
        Ok(())
    }

    async fn clear_text_field(&self) -> AgentResult<()> {
        self.key_event(keycode::MOVE_END).await?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        // One shell round-trip for the delete burst.
        let dels = vec!["67"; 30];
        let mut args = vec!["input", "keyevent"];
        args.extend_from_slice(&dels);
        self.shell_ok(&args).await?;
        Ok(())
    }

    async fn key_event(&self, key: u32) -> AgentResult<()> {
        self.shell_ok(&["input", "keyevent", &key.to_string()])
            .await?;
        Ok(())
    }

    async fn launch_app(&self, package: &str, activity: Option<&str>) -> AgentResult<()> {
        match activity {
            Some(activity) => {
                let component = format!("{package}/{activity}");
                self.shell_ok(&["am", "start", "-n", &component]).await?;
            }
            None => {
                self.shell_ok(&[
                    "monkey",
                    "-p",
                    package,
                    "-c",
                    "android.intent.category.LAUNCHER",
                    "1",
                ])
                .await?;
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn stop_app(&self, package: &str) -> AgentResult<()> {
        self.shell_ok(&["am", "force-stop", package]).await?;
        Ok(())
    }

    async fn foreground_app(&self) -> AgentResult<Option<String>> {
        let output = self
            .run_timeout(
                &["shell", "dumpsys", "activity", "activities"],
                Duration::from_secs(10),
            )
            .await?;
        if let Some(pkg) = parse_foreground(&String::from_utf8_lossy(&output.stdout)) {
            return Ok(Some(pkg));
        }
        let output = self
            .run_timeout(
                &["shell", "dumpsys", "window", "windows"],
                Duration::from_secs(10),
            )
            .await?;
        Ok(parse_foreground(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn open_url(&self, url: &str) -> AgentResult<()> {
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("https://{url}")
        };
        self.shell_ok(&["am", "start", "-a", "android.intent.action.VIEW", "-d", &url])
            .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn call(&self, number: &str) -> AgentResult<()> {
        let cleaned: String = number
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect();
        let uri = format!("tel:{cleaned}");
        self.shell_ok(&["am", "start", "-a", "android.intent.action.CALL", "-d", &uri])
            .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn screenshot(&self) -> AgentResult<Screenshot> {
        let png = self.screenshot_full().await?;
        let insets = self.cached_insets().await?;
        crop_png(&png, insets)
    }

    async fn screenshot_full(&self) -> AgentResult<Vec<u8>> {
        let cap = self
            .run_timeout(
                &["shell", "screencap", "-p", REMOTE_SCREENSHOT_PATH],
                self.screenshot_timeout,
            )
            .await?;
        if !cap.status.success() {
            return Err(AgentError::DeviceCommandFailed {
                command: "screencap".into(),
                stderr: String::from_utf8_lossy(&cap.stderr).trim().to_string(),
            });
        }
        // exec-out keeps the transfer off the sdcard on newer devices, but
        // pull has the widest compatibility; mirror the capture+pull flow.
        let local = std::env::temp_dir().join(format!("droidpilot_shot_{}.png", std::process::id()));
        let local_str = local.to_string_lossy().to_string();
        let output = self
            .run_timeout(
                &["pull", REMOTE_SCREENSHOT_PATH, &local_str],
                self.screenshot_timeout,
            )
            .await?;
        if !output.status.success() {
            return Err(AgentError::DeviceCommandFailed {
                command: "pull screenshot".into(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let bytes = tokio::fs::read(&local).await?;
        let _ = tokio::fs::remove_file(&local).await;
        let _ = self.run(&["shell", "rm", REMOTE_SCREENSHOT_PATH]).await;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_size_prefers_override() {
        let out = "Physical size: 1080x2400\nOverride size: 720x1600\n";
        assert_eq!(parse_screen_size(out), Some((720, 1600)));
        assert_eq!(parse_screen_size("Physical size: 1080x2400"), Some((1080, 2400)));
        assert_eq!(parse_screen_size("garbage"), None);
    }

    #[test]
    fn insets_from_app_bounds() {
        let out = "mAppBounds=Rect(0, 92 - 1080, 2276)";
        let insets = parse_insets(out, 2400);
        assert_eq!(insets, ScreenInsets { top: 92, bottom: 124 });
    }

    #[test]
    fn insets_from_bar_heights() {
        let out = "Window{abc StatusBar}:\n  Requested w=1080 h=92\nWindow{def NavigationBar0}:\n  Requested w=1080 h=124\n";
        let insets = parse_insets(out, 2400);
        assert_eq!(insets, ScreenInsets { top: 92, bottom: 124 });
    }

    #[test]
    fn foreground_parses_resumed_activity() {
        let out = "  mResumedActivity: ActivityRecord{123 u0 com.tencent.mm/.ui.LauncherUI t42}";
        assert_eq!(parse_foreground(out), Some("com.tencent.mm".into()));
        assert_eq!(parse_foreground("nothing here"), None);
    }

    #[test]
    fn ascii_escaping_replaces_spaces() {
        assert_eq!(escape_ascii_text("hello world"), "hello%sworld");
        assert_eq!(escape_ascii_text("a&b"), "a\\&b");
    }
}
