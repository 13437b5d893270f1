use std::collections::HashMap;
use std::path::Path;

use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

use crate::errors::{AgentError, AgentResult};
use crate::locator::template::PixelMatch;

/// One detection in normalized [0,1] coordinates.
#[derive(Debug, Clone)]
pub struct DetectedElement {
    pub class_name: String,
    pub bbox: [f32; 4],
    pub confidence: f32,
}

#[derive(Debug, Clone)]
struct RawDetection {
    bbox: [f32; 4],
    confidence: f32,
    class_id: usize,
}

/// UI element classes emitted by the bundled detector model.
pub fn default_class_names() -> Vec<String> {
    ["button", "input", "icon", "text", "image", "checkbox", "tab", "menu"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Optional on-device detector stage: a small ONNX model that proposes UI
/// element boxes, filtered by a text hint derived from the reference name.
pub struct UiElementDetector {
    session: Session,
    input_size: u32,
    conf_threshold: f32,
    iou_threshold: f32,
    class_names: Vec<String>,
}

impl UiElementDetector {
    /// Returns `None` when the model file is absent; the stage is optional.
    pub fn try_new(model_path: &str) -> Option<Self> {
        if !Path::new(model_path).exists() {
            tracing::warn!(path = %model_path, "detector model not found, stage disabled");
            return None;
        }
        match Self::build(model_path) {
            Ok(det) => {
                tracing::info!(path = %model_path, "on-device element detector loaded");
                Some(det)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load detector model");
                None
            }
        }
    }

    fn build(model_path: &str) -> AgentResult<Self> {
        let session = Session::builder()
            .map_err(|e| AgentError::Locator(format!("ort session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| AgentError::Locator(format!("ort opt-level: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| AgentError::Locator(format!("ort load model: {e}")))?;

        Ok(Self {
            session,
            input_size: 640,
            conf_threshold: 0.35,
            iou_threshold: 0.45,
            class_names: default_class_names(),
        })
    }

    /// Locate the element best matching `hint` on a PNG/JPEG screenshot.
    /// The hint is the token set derived from a reference name.
    pub fn locate_by_hint(&mut self, image_bytes: &[u8], hint: &str) -> AgentResult<Option<PixelMatch>> {
        let wanted = hint_classes(hint);
        if wanted.is_empty() {
            tracing::debug!(hint, "no detector class maps to hint");
            return Ok(None);
        }

        let img = image::load_from_memory(image_bytes)?;
        let (w, h) = (img.width() as f32, img.height() as f32);
        let elements = self.detect_image(&img)?;

        let best = elements
            .into_iter()
            .filter(|e| wanted.iter().any(|c| c == &e.class_name))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));

        Ok(best.map(|e| {
            let cx = (e.bbox[0] + e.bbox[2]) / 2.0 * w;
            let cy = (e.bbox[1] + e.bbox[3]) / 2.0 * h;
            PixelMatch {
                x: cx.round() as u32,
                y: cy.round() as u32,
                confidence: e.confidence,
            }
        }))
    }

    /// Run detection over a decoded screenshot.
    fn detect_image(&mut self, img: &image::DynamicImage) -> AgentResult<Vec<DetectedElement>> {
        let (orig_w, orig_h) = (img.width(), img.height());
        let (input_tensor, pad_x, pad_y, scale) = self.preprocess(img);

        let input_value = Tensor::from_array(input_tensor)
            .map_err(|e| AgentError::Locator(format!("ort tensor: {e}")))?;

        let output_owned = {
            let outputs = self
                .session
                .run(ort::inputs![input_value])
                .map_err(|e| AgentError::Locator(format!("ort run: {e}")))?;
            outputs[0]
                .try_extract_array::<f32>()
                .map_err(|e| AgentError::Locator(format!("extract tensor: {e}")))?
                .to_owned()
        };

        let raw = self.postprocess(&output_owned.view(), orig_w, orig_h, pad_x, pad_y, scale)?;
        let kept = self.nms(&raw);
        Ok(kept
            .into_iter()
            .map(|i| {
                let det = &raw[i];
                DetectedElement {
                    class_name: self
                        .class_names
                        .get(det.class_id)
                        .cloned()
                        .unwrap_or_else(|| "unknown".into()),
                    bbox: det.bbox,
                    confidence: det.confidence,
                }
            })
            .collect())
    }

    /// Resize + letterbox + normalize into an NCHW f32 tensor.
    fn preprocess(&self, img: &image::DynamicImage) -> (Array4<f32>, f32, f32, f32) {
        let sz = self.input_size;
        let (ow, oh) = (img.width() as f32, img.height() as f32);
        let scale = (sz as f32 / ow).min(sz as f32 / oh);
        let nw = (ow * scale).round() as u32;
        let nh = (oh * scale).round() as u32;
        let pad_x = (sz - nw) as f32 / 2.0;
        let pad_y = (sz - nh) as f32 / 2.0;

        let resized = img.resize_exact(nw, nh, image::imageops::FilterType::CatmullRom);
        let rgb = resized.to_rgb8();

        let mut canvas = image::RgbImage::from_pixel(sz, sz, image::Rgb([114, 114, 114]));
        image::imageops::overlay(&mut canvas, &rgb, pad_x.round() as i64, pad_y.round() as i64);

        let mut tensor = Array4::<f32>::zeros((1, 3, sz as usize, sz as usize));
        for y in 0..sz {
            for x in 0..sz {
                let p = canvas.get_pixel(x, y);
                tensor[[0, 0, y as usize, x as usize]] = p[0] as f32 / 255.0;
                tensor[[0, 1, y as usize, x as usize]] = p[1] as f32 / 255.0;
                tensor[[0, 2, y as usize, x as usize]] = p[2] as f32 / 255.0;
            }
        }
        (tensor, pad_x, pad_y, scale)
    }

    /// Decode `[1, 4+classes, proposals]` output back into normalized boxes.
    fn postprocess(
        &self,
        output: &ndarray::ArrayViewD<f32>,
        orig_w: u32,
        orig_h: u32,
        pad_x: f32,
        pad_y: f32,
        scale: f32,
    ) -> AgentResult<Vec<RawDetection>> {
        let shape = output.shape();
        if shape.len() < 3 || shape[1] < 5 {
            return Err(AgentError::Locator(format!(
                "unexpected detector output shape: {shape:?}"
            )));
        }
        let num_classes = shape[1] - 4;
        let num_preds = shape[2];

        let mut detections = Vec::new();
        for i in 0..num_preds {
            let cx = output[[0, 0, i]];
            let cy = output[[0, 1, i]];
            let w = output[[0, 2, i]];
            let h = output[[0, 3, i]];

            let mut max_score = 0f32;
            let mut max_class = 0usize;
            for c in 0..num_classes {
                let s = output[[0, 4 + c, i]];
                if s > max_score {
                    max_score = s;
                    max_class = c;
                }
            }
            if max_score < self.conf_threshold {
                continue;
            }

            let x1 = ((cx - w / 2.0) - pad_x) / scale;
            let y1 = ((cy - h / 2.0) - pad_y) / scale;
            let x2 = ((cx + w / 2.0) - pad_x) / scale;
            let y2 = ((cy + h / 2.0) - pad_y) / scale;

            detections.push(RawDetection {
                bbox: [
                    (x1 / orig_w as f32).clamp(0.0, 1.0),
                    (y1 / orig_h as f32).clamp(0.0, 1.0),
                    (x2 / orig_w as f32).clamp(0.0, 1.0),
                    (y2 / orig_h as f32).clamp(0.0, 1.0),
                ],
                confidence: max_score,
                class_id: max_class,
            });
        }
        Ok(detections)
    }

    /// Greedy per-class non-maximum suppression.
    fn nms(&self, dets: &[RawDetection]) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..dets.len()).collect();
        indices.sort_by(|&a, &b| dets[b].confidence.total_cmp(&dets[a].confidence));

        let mut keep = Vec::new();
        let mut suppressed = vec![false; dets.len()];
        for &i in &indices {
            if suppressed[i] {
                continue;
            }
            keep.push(i);
            for &j in &indices {
                if suppressed[j] || i == j {
                    continue;
                }
                if dets[i].class_id == dets[j].class_id
                    && iou(&dets[i].bbox, &dets[j].bbox) > self.iou_threshold
                {
                    suppressed[j] = true;
                }
            }
        }
        keep
    }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);

    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Map reference-name tokens onto detector classes. Unknown vocabularies
/// yield an empty set and the stage is skipped.
pub fn hint_classes(hint: &str) -> Vec<String> {
    let hint = hint.to_lowercase();
    let table: HashMap<&str, &str> = HashMap::from([
        ("button", "button"),
        ("btn", "button"),
        ("tab", "tab"),
        ("send", "button"),
        ("publish", "button"),
        ("entry", "button"),
        ("add", "button"),
        ("back", "button"),
        ("cancel", "button"),
        ("input", "input"),
        ("box", "input"),
        ("field", "input"),
        ("search", "input"),
        ("icon", "icon"),
        ("camera", "icon"),
        ("scan", "icon"),
        ("menu", "menu"),
        ("page", "image"),
    ]);

    let mut classes: Vec<String> = hint
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter_map(|token| table.get(token).map(|c| c.to_string()))
        .collect();
    classes.sort();
    classes.dedup();
    classes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_tokens_map_to_classes() {
        assert_eq!(hint_classes("wechat_chat_send"), vec!["button"]);
        assert_eq!(hint_classes("wechat_moments_input_box"), vec!["input"]);
        assert_eq!(hint_classes("wechat_moments_camera"), vec!["icon"]);
        assert!(hint_classes("zhangsan").is_empty());
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(iou(&[0.0, 0.0, 0.1, 0.1], &[0.5, 0.5, 0.6, 0.6]), 0.0);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = [0.2, 0.2, 0.4, 0.4];
        assert!((iou(&b, &b) - 1.0).abs() < 1e-6);
    }
}
