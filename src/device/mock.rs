use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::DeviceConfig;
use crate::device::{DeviceSurface, ScreenInsets, Screenshot};
use crate::errors::AgentResult;

/// Mock backend selected by `DEBUG_MODE=true`. Logs every operation, sleeps
/// proportionally to parameter sizes and produces a synthetic placeholder
/// screenshot of the configured resolution.
pub struct MockDevice {
    name: String,
    width: u32,
    height: u32,
    foreground: Mutex<Option<String>>,
    ops: AtomicUsize,
    /// Sleep scale; tests set 0 to run instantly.
    delay_unit_ms: u64,
}

impl MockDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        tracing::info!(
            device = %config.debug_device_name,
            width = config.debug_screen_width,
            height = config.debug_screen_height,
            "mock device initialized"
        );
        Self {
            name: config.debug_device_name.clone(),
            width: config.debug_screen_width,
            height: config.debug_screen_height,
            foreground: Mutex::new(None),
            ops: AtomicUsize::new(0),
            delay_unit_ms: 10,
        }
    }

    pub fn with_resolution(name: &str, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            foreground: Mutex::new(None),
            ops: AtomicUsize::new(0),
            delay_unit_ms: 0,
        }
    }

    /// Number of operations issued so far, observable by tests.
    pub fn op_count(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    async fn op(&self, kind: &str, weight: u64) {
        self.ops.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(device = %self.name, op = kind, "mock op");
        if self.delay_unit_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_unit_ms * weight.max(1))).await;
        }
    }

    fn placeholder_png(&self) -> Vec<u8> {
        let mut img =
            image::RgbImage::from_pixel(self.width, self.height, image::Rgb([240, 240, 240]));
        for x in 0..self.width {
            for y in [0, 1, self.height - 2, self.height - 1] {
                img.put_pixel(x, y, image::Rgb([100, 100, 100]));
            }
        }
        for y in 0..self.height {
            for x in [0, 1, self.width - 2, self.width - 1] {
                img.put_pixel(x, y, image::Rgb([100, 100, 100]));
            }
        }
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .expect("in-memory PNG encode");
        out
    }
}

#[async_trait]
impl DeviceSurface for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> AgentResult<bool> {
        self.op("connect", 2).await;
        Ok(true)
    }

    async fn is_connected(&self) -> AgentResult<bool> {
        Ok(true)
    }

    async fn screen_size(&self) -> AgentResult<(u32, u32)> {
        Ok((self.width, self.height))
    }

    async fn screen_insets(&self) -> AgentResult<ScreenInsets> {
        Ok(ScreenInsets::default())
    }

    async fn tap(&self, x: u32, y: u32) -> AgentResult<()> {
        tracing::info!(device = %self.name, x, y, "mock tap");
        self.op("tap", 1).await;
        Ok(())
    }

    async fn long_press(&self, x: u32, y: u32, duration_ms: u64) -> AgentResult<()> {
        tracing::info!(device = %self.name, x, y, duration_ms, "mock long press");
        self.op("long_press", duration_ms / 100).await;
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
        tracing::info!(device = %self.name, x1, y1, x2, y2, duration_ms, "mock swipe");
        self.op("swipe", duration_ms / 100).await;
        Ok(())
    }

    async fn input_text(&self, text: &str) -> AgentResult<()> {
        tracing::info!(device = %self.name, text, "mock input text");
        self.op("input_text", text.len() as u64 / 4).await;
        Ok(())
    }

    async fn input_text_wide(&self, text: &str) -> AgentResult<()> {
        tracing::info!(device = %self.name, text, "mock wide input");
        self.op("input_text_wide", text.chars().count() as u64 / 2)
            .await;
        Ok(())
    }

    async fn clear_text_field(&self) -> AgentResult<()> {
        self.op("clear_text_field", 2).await;
        Ok(())
    }

    async fn key_event(&self, key: u32) -> AgentResult<()> {
        tracing::info!(device = %self.name, key, "mock key event");
        self.op("key_event", 1).await;
        Ok(())
    }

    async fn launch_app(&self, package: &str, activity: Option<&str>) -> AgentResult<()> {
        tracing::info!(device = %self.name, package, ?activity, "mock launch app");
        *self.foreground.lock().expect("mock foreground lock") = Some(package.to_string());
        self.op("launch_app", 5).await;
        Ok(())
    }

    async fn stop_app(&self, package: &str) -> AgentResult<()> {
        tracing::info!(device = %self.name, package, "mock stop app");
        {
            let mut fg = self.foreground.lock().expect("mock foreground lock");
            if fg.as_deref() == Some(package) {
                *fg = None;
            }
        }
        self.op("stop_app", 2).await;
        Ok(())
    }

    async fn foreground_app(&self) -> AgentResult<Option<String>> {
        Ok(self.foreground.lock().expect("mock foreground lock").clone())
    }

    async fn open_url(&self, url: &str) -> AgentResult<()> {
        tracing::info!(device = %self.name, url, "mock open url");
        self.op("open_url", 5).await;
        Ok(())
    }

    async fn call(&self, number: &str) -> AgentResult<()> {
        tracing::info!(device = %self.name, number, "mock call");
        self.op("call", 5).await;
        Ok(())
    }

    async fn screenshot(&self) -> AgentResult<Screenshot> {
        self.op("screenshot", 3).await;
        Ok(Screenshot {
            png: self.placeholder_png(),
            width: self.width,
            height: self.height,
            crop_top: 0,
        })
    }

    async fn screenshot_full(&self) -> AgentResult<Vec<u8>> {
        self.op("screenshot_full", 3).await;
        Ok(self.placeholder_png())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_screenshot_matches_configured_resolution() {
        let device = MockDevice::with_resolution("test", 320, 640);
        let shot = device.screenshot().await.unwrap();
        let img = image::load_from_memory(&shot.png).unwrap();
        assert_eq!((img.width(), img.height()), (320, 640));
        assert_eq!(shot.crop_top, 0);
    }

    #[tokio::test]
    async fn foreground_tracks_launched_app() {
        let device = MockDevice::with_resolution("test", 100, 100);
        assert_eq!(device.foreground_app().await.unwrap(), None);
        device.launch_app("com.tencent.mm", None).await.unwrap();
        assert_eq!(
            device.foreground_app().await.unwrap().as_deref(),
            Some("com.tencent.mm")
        );
        device.stop_app("com.tencent.mm").await.unwrap();
        assert_eq!(device.foreground_app().await.unwrap(), None);
    }

    #[tokio::test]
    async fn go_home_presses_home_twice() {
        let device = MockDevice::with_resolution("test", 100, 100);
        device.go_home().await.unwrap();
        assert_eq!(device.op_count(), 2);
    }
}
