pub mod adb;
pub mod mock;

use async_trait::async_trait;

use crate::errors::AgentResult;

/// Android key codes used by the orchestrator.
pub mod keycode {
    pub const HOME: u32 = 3;
    pub const BACK: u32 = 4;
    pub const POWER: u32 = 26;
    pub const ENTER: u32 = 66;
    pub const DEL: u32 = 67;
    pub const MOVE_END: u32 = 123;
}

/// Status-bar / navigation-bar heights in device pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScreenInsets {
    pub top: u32,
    pub bottom: u32,
}

/// A captured screenshot with the vertical crop applied during capture.
/// `crop_top` lets callers translate cropped-image coordinates back to the
/// full display before issuing input events.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub crop_top: u32,
}

impl Screenshot {
    /// Translate a point located on the cropped image into absolute device
    /// pixels.
    pub fn to_device_coords(&self, x: u32, y: u32) -> (u32, u32) {
        (x, y + self.crop_top)
    }
}

/// True when the text needs the wide-character (broadcast) input path.
pub fn needs_wide_input(text: &str) -> bool {
    text.chars().any(|c| c as u32 >= 0x80)
}

/// The narrow command surface to one device. Real and mock backends share
/// this contract and the core must not distinguish them.
#[async_trait]
pub trait DeviceSurface: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> AgentResult<bool>;
    async fn is_connected(&self) -> AgentResult<bool>;

    async fn screen_size(&self) -> AgentResult<(u32, u32)>;
    async fn screen_insets(&self) -> AgentResult<ScreenInsets>;

    async fn tap(&self, x: u32, y: u32) -> AgentResult<()>;
    async fn long_press(&self, x: u32, y: u32, duration_ms: u64) -> AgentResult<()>;
    async fn swipe(&self, x1: u32, y1: u32, x2: u32, y2: u32, duration_ms: u64)
        -> AgentResult<()>;

    /// ASCII-only text input via `input text`.
    async fn input_text(&self, text: &str) -> AgentResult<()>;
    /// Wide-character input via the keyboard broadcast channel; tries the
    /// base64 form first and falls back to the raw broadcast.
    async fn input_text_wide(&self, text: &str) -> AgentResult<()>;
    /// Clear the focused input field (move to end, batched deletes).
    async fn clear_text_field(&self) -> AgentResult<()>;

    async fn key_event(&self, keycode: u32) -> AgentResult<()>;

    async fn launch_app(&self, package: &str, activity: Option<&str>) -> AgentResult<()>;
    async fn stop_app(&self, package: &str) -> AgentResult<()>;
    /// Foreground package name, when the device exposes it.
    async fn foreground_app(&self) -> AgentResult<Option<String>>;

    async fn open_url(&self, url: &str) -> AgentResult<()>;
    async fn call(&self, number: &str) -> AgentResult<()>;

    /// Capture a screenshot cropped to the app content area (status bar and
    /// navigation bar removed) together with the applied top offset.
    async fn screenshot(&self) -> AgentResult<Screenshot>;
    /// Capture the full, uncropped display as PNG bytes.
    async fn screenshot_full(&self) -> AgentResult<Vec<u8>>;

    async fn press_home(&self) -> AgentResult<()> {
        self.key_event(keycode::HOME).await
    }

    async fn press_back(&self) -> AgentResult<()> {
        self.key_event(keycode::BACK).await
    }

    async fn press_enter(&self) -> AgentResult<()> {
        self.key_event(keycode::ENTER).await
    }

    /// Return to the system launcher. A single HOME press may only back out
    /// to an app's own root, so two presses with a brief interval.
    async fn go_home(&self) -> AgentResult<()> {
        self.key_event(keycode::HOME).await?;
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        self.key_event(keycode::HOME).await?;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_input_selection_is_by_code_point() {
        assert!(!needs_wide_input("hello 123"));
        assert!(needs_wide_input("你好"));
        assert!(needs_wide_input("hi 你"));
        assert!(needs_wide_input("café"));
    }

    #[test]
    fn crop_translation_adds_top_offset() {
        let shot = Screenshot {
            png: Vec::new(),
            width: 1080,
            height: 2184,
            crop_top: 92,
        };
        assert_eq!(shot.to_device_coords(540, 1000), (540, 1092));
    }
}
