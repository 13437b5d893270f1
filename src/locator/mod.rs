pub mod detector;
pub mod feature;
pub mod remote;
pub mod template;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use image::GrayImage;
use serde::Serialize;

use crate::config::AppConfig;
use crate::device::Screenshot;
use crate::llm::LlmRouter;
use crate::locator::detector::UiElementDetector;
use crate::locator::remote::RemoteLocator;
use crate::locator::template::PixelMatch;

/// Which stage of the pipeline produced (or last attempted) the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocateStage {
    Template,
    MultiScale,
    Feature,
    OnDeviceModel,
    RemoteModel,
}

/// Stage forcing for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocateStrategy {
    /// Pixel stages only; no model calls. Used by the ensure-home loop and
    /// screen detection where speed matters.
    OpencvOnly,
    /// Model stages only.
    AiOnly,
    /// Pixel stages first, models as fallback.
    #[default]
    OpencvFirst,
}

/// How a step target is addressed. The on-disk authoring syntax keeps the
/// `dynamic:` prefix; in the implementation the two modes are distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    ByReference(String),
    ByDescription(String),
}

impl TargetRef {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix("dynamic:") {
            Some(desc) => TargetRef::ByDescription(desc.trim().to_string()),
            None => TargetRef::ByReference(raw.trim().to_string()),
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            TargetRef::ByReference(name) => name,
            TargetRef::ByDescription(desc) => desc,
        }
    }
}

/// Point + confidence result in cropped-screenshot pixels.
#[derive(Debug, Clone, Copy)]
pub struct LocateResult {
    pub found: bool,
    pub x: u32,
    pub y: u32,
    pub confidence: f32,
    pub stage: LocateStage,
}

impl LocateResult {
    fn hit(stage: LocateStage, m: PixelMatch) -> Self {
        Self {
            found: true,
            x: m.x,
            y: m.y,
            confidence: m.confidence,
            stage,
        }
    }

    fn miss(stage: LocateStage) -> Self {
        Self {
            found: false,
            x: 0,
            y: 0,
            confidence: 0.0,
            stage,
        }
    }
}

/// Multi-stage visual locator. Pixel stages are CPU-bound and run on the
/// blocking pool; model stages go through the shared clients. The detector
/// session requires exclusive access and is shared behind a mutex.
pub struct HybridLocator {
    detector: Option<Arc<Mutex<UiElementDetector>>>,
    remote: Option<Arc<RemoteLocator>>,
    pub default_strategy: LocateStrategy,
}

impl HybridLocator {
    pub fn new(config: &AppConfig, router: Option<LlmRouter>) -> Self {
        let detector = config
            .detector_model_path
            .as_deref()
            .and_then(UiElementDetector::try_new)
            .map(|d| Arc::new(Mutex::new(d)));
        let remote = router.map(|r| Arc::new(RemoteLocator::new(r)));
        Self {
            detector,
            remote,
            default_strategy: LocateStrategy::OpencvFirst,
        }
    }

    /// Pixel-stage-only locator with no model clients (tests, preset loop).
    pub fn offline() -> Self {
        Self {
            detector: None,
            remote: None,
            default_strategy: LocateStrategy::OpencvFirst,
        }
    }

    /// Locate a target on the screenshot. Reference targets walk the full
    /// stage pipeline; description targets go straight to the model stages.
    pub async fn locate_target(
        &self,
        shot: &Screenshot,
        target: &TargetRef,
        variants: Vec<PathBuf>,
        strategy: LocateStrategy,
    ) -> LocateResult {
        match target {
            TargetRef::ByReference(name) => {
                self.locate_reference(shot, name, variants, strategy).await
            }
            TargetRef::ByDescription(desc) => self.locate_description(shot, desc).await,
        }
    }

    pub async fn locate_reference(
        &self,
        shot: &Screenshot,
        name: &str,
        variants: Vec<PathBuf>,
        strategy: LocateStrategy,
    ) -> LocateResult {
        if variants.is_empty() {
            tracing::debug!(target = name, "no reference images for target");
            return LocateResult::miss(LocateStage::Template);
        }

        let mut last_stage = LocateStage::Template;

        if strategy != LocateStrategy::AiOnly {
            let screen = match decode_gray(&shot.png).await {
                Some(img) => img,
                None => {
                    tracing::warn!("failed to decode screenshot for locator");
                    return LocateResult::miss(LocateStage::Template);
                }
            };
            let paths = variants.clone();
            let pixel_result = tokio::task::spawn_blocking(move || {
                run_pixel_stages(&screen, &paths, true)
            })
            .await
            .unwrap_or(None);

            if let Some(result) = pixel_result {
                tracing::debug!(
                    target = name,
                    stage = ?result.stage,
                    confidence = result.confidence,
                    "pixel stage located target"
                );
                return result;
            }
            last_stage = LocateStage::Feature;
        }

        if strategy == LocateStrategy::OpencvOnly {
            return LocateResult::miss(last_stage);
        }

        // Stage 4: on-device model with a hint derived from the name.
        if let Some(detector) = &self.detector {
            last_stage = LocateStage::OnDeviceModel;
            let detector = detector.clone();
            let png = shot.png.clone();
            let hint = name.to_string();
            let hit = tokio::task::spawn_blocking(move || {
                let mut det = detector.lock().expect("detector lock");
                det.locate_by_hint(&png, &hint)
            })
            .await
            .unwrap_or(Ok(None));
            match hit {
                Ok(Some(m)) => return LocateResult::hit(LocateStage::OnDeviceModel, m),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "detector stage failed, falling through"),
            }
        }

        // Stage 5: remote vision model against the primary variant.
        if let Some(remote) = &self.remote {
            last_stage = LocateStage::RemoteModel;
            match remote
                .locate_by_reference(&shot.png, shot.width, shot.height, &variants[0])
                .await
            {
                Ok(Some(m)) => return LocateResult::hit(LocateStage::RemoteModel, m),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "remote locator stage failed"),
            }
        }

        tracing::debug!(target = name, stage = ?last_stage, "all locator stages exhausted");
        LocateResult::miss(last_stage)
    }

    pub async fn locate_description(&self, shot: &Screenshot, description: &str) -> LocateResult {
        // Pixel stages need a reference image; descriptions go to the models.
        if let Some(detector) = &self.detector {
            let detector = detector.clone();
            let png = shot.png.clone();
            let hint = description.to_string();
            let hit = tokio::task::spawn_blocking(move || {
                let mut det = detector.lock().expect("detector lock");
                det.locate_by_hint(&png, &hint)
            })
            .await
            .unwrap_or(Ok(None));
            if let Ok(Some(m)) = hit {
                return LocateResult::hit(LocateStage::OnDeviceModel, m);
            }
        }

        if let Some(remote) = &self.remote {
            match remote
                .locate_by_description(&shot.png, shot.width, shot.height, description)
                .await
            {
                Ok(Some(m)) => return LocateResult::hit(LocateStage::RemoteModel, m),
                Ok(None) => return LocateResult::miss(LocateStage::RemoteModel),
                Err(e) => tracing::warn!(error = %e, "remote description locate failed"),
            }
        }

        LocateResult::miss(LocateStage::RemoteModel)
    }

    /// Locate several named targets on one screenshot concurrently.
    /// Pixel stages only (template + multi-scale): this path serves the
    /// preset/reset loops where every round trip counts. The result map
    /// preserves target names; the best confidence per target wins.
    pub async fn locate_many(
        &self,
        shot: &Screenshot,
        targets: HashMap<String, Vec<PathBuf>>,
    ) -> HashMap<String, LocateResult> {
        let mut results: HashMap<String, LocateResult> = targets
            .keys()
            .map(|name| (name.clone(), LocateResult::miss(LocateStage::MultiScale)))
            .collect();

        let screen = match decode_gray(&shot.png).await {
            Some(img) => img,
            None => return results,
        };

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|(name, paths)| {
                let screen = screen.clone();
                tokio::task::spawn_blocking(move || {
                    let result = run_pixel_stages(&screen, &paths, false);
                    (name, result)
                })
            })
            .collect();

        for joined in join_all(tasks).await {
            match joined {
                Ok((name, Some(result))) => {
                    let better = results
                        .get(&name)
                        .map(|prev| !prev.found || result.confidence > prev.confidence)
                        .unwrap_or(true);
                    if better {
                        results.insert(name, result);
                    }
                }
                Ok((_, None)) => {}
                Err(e) => tracing::warn!(error = %e, "parallel locate task panicked"),
            }
        }
        results
    }
}

async fn decode_gray(png: &[u8]) -> Option<Arc<GrayImage>> {
    let bytes = png.to_vec();
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes)
            .ok()
            .map(|img| Arc::new(img.to_luma8()))
    })
    .await
    .ok()
    .flatten()
}

/// Stage-major pixel pipeline over all variants: exact template for every
/// variant, then the scale sweep, then (optionally) feature matching.
fn run_pixel_stages(
    screen: &GrayImage,
    variant_paths: &[PathBuf],
    with_feature: bool,
) -> Option<LocateResult> {
    let variants: Vec<GrayImage> = variant_paths
        .iter()
        .filter_map(|path| match image::open(path) {
            Ok(img) => Some(img.to_luma8()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot load reference image");
                None
            }
        })
        .collect();
    if variants.is_empty() {
        return None;
    }

    for tmpl in &variants {
        if let Some(m) = template::template_match(screen, tmpl) {
            return Some(LocateResult::hit(LocateStage::Template, m));
        }
    }
    for tmpl in &variants {
        if let Some(m) = template::multi_scale_match(screen, tmpl) {
            return Some(LocateResult::hit(LocateStage::MultiScale, m));
        }
    }
    if with_feature {
        for tmpl in &variants {
            if let Some(m) = feature::feature_match(screen, tmpl) {
                return Some(LocateResult::hit(LocateStage::Feature, m));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::io::Cursor;

    fn png_bytes(img: &GrayImage) -> Vec<u8> {
        let mut out = Vec::new();
        image::DynamicImage::ImageLuma8(img.clone())
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn button(side: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(side, side, Luma([30u8]));
        let border = (side / 5).max(2);
        for y in 0..side {
            for x in 0..side {
                let on_border =
                    x < border || y < border || x >= side - border || y >= side - border;
                img.put_pixel(x, y, Luma([if on_border { 220 } else { 80 }]));
            }
        }
        img
    }

    fn shot_with_button_sized(side: u32, at: (i64, i64)) -> Screenshot {
        let mut screen = GrayImage::from_pixel(240, 320, Luma([50u8]));
        image::imageops::overlay(&mut screen, &button(side), at.0, at.1);
        Screenshot {
            png: png_bytes(&screen),
            width: 240,
            height: 320,
            crop_top: 0,
        }
    }

    fn shot_with_button(at: (i64, i64)) -> Screenshot {
        shot_with_button_sized(24, at)
    }

    fn write_button_png(dir: &std::path::Path, name: &str, side: u32) -> PathBuf {
        let path = dir.join(name);
        image::DynamicImage::ImageLuma8(button(side))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn target_ref_parses_dynamic_prefix() {
        assert_eq!(
            TargetRef::parse("dynamic:取消按钮"),
            TargetRef::ByDescription("取消按钮".into())
        );
        assert_eq!(
            TargetRef::parse("wechat_chat_send"),
            TargetRef::ByReference("wechat_chat_send".into())
        );
    }

    #[tokio::test]
    async fn reference_found_at_template_stage() {
        let dir = tempfile::tempdir().unwrap();
        let tmpl = write_button_png(dir.path(), "send.png", 24);
        let locator = HybridLocator::offline();
        let shot = shot_with_button((100, 200));

        let result = locator
            .locate_reference(&shot, "send", vec![tmpl], LocateStrategy::OpencvFirst)
            .await;
        assert!(result.found);
        assert_eq!(result.stage, LocateStage::Template);
        assert!((result.x as i32 - 112).abs() <= 2);
        assert!((result.y as i32 - 212).abs() <= 2);
    }

    #[tokio::test]
    async fn scaled_reference_falls_to_multiscale() {
        let dir = tempfile::tempdir().unwrap();
        // Reference captured at a much denser UI scale (1.5x gap).
        let tmpl = write_button_png(dir.path(), "send.png", 20);
        let locator = HybridLocator::offline();
        let shot = shot_with_button_sized(30, (60, 90));

        let result = locator
            .locate_reference(&shot, "send", vec![tmpl], LocateStrategy::OpencvFirst)
            .await;
        assert!(result.found);
        assert_eq!(result.stage, LocateStage::MultiScale);
    }

    #[tokio::test]
    async fn missing_reference_is_not_found_without_error() {
        let locator = HybridLocator::offline();
        let shot = shot_with_button((10, 10));
        let result = locator
            .locate_reference(&shot, "ghost", Vec::new(), LocateStrategy::OpencvFirst)
            .await;
        assert!(!result.found);
    }

    #[tokio::test]
    async fn many_targets_preserve_names() {
        let dir = tempfile::tempdir().unwrap();
        let present = write_button_png(dir.path(), "present.png", 24);
        let absent = dir.path().join("absent.png");
        image::DynamicImage::ImageLuma8(GrayImage::from_pixel(24, 24, Luma([255u8])))
            .save(&absent)
            .unwrap();

        let locator = HybridLocator::offline();
        let shot = shot_with_button((50, 50));
        let results = locator
            .locate_many(
                &shot,
                HashMap::from([
                    ("home_button".to_string(), vec![present]),
                    ("cancel_button".to_string(), vec![absent]),
                ]),
            )
            .await;

        assert!(results["home_button"].found);
        assert!(!results["cancel_button"].found);
        assert_eq!(results.len(), 2);
    }
}
