use std::path::Path;

use base64::Engine as _;
use serde::Deserialize;

use crate::errors::{AgentError, AgentResult};
use crate::llm::types::ChatMessage;
use crate::llm::{LlmRouter, Role};
use crate::locator::template::PixelMatch;

const LOCATOR_SYSTEM_PROMPT: &str = "You are an Android UI element locator. \
You receive a reference image of a UI element followed by a full screenshot. \
Find the element on the screenshot. Output only JSON. \
On success: {\"found\": true, \"xmin\": int, \"ymin\": int, \"xmax\": int, \"ymax\": int, \"confidence\": float} \
with coordinates on a 0-1000 grid over the screenshot. \
On failure: {\"found\": false, \"reason\": string, \"suggestion\": string}.";

const DESCRIPTION_SYSTEM_PROMPT: &str = "You are an Android UI element locator. \
You receive a screenshot and a description of one element. \
Find the described element. Output only JSON. \
On success: {\"found\": true, \"xmin\": int, \"ymin\": int, \"xmax\": int, \"ymax\": int, \"confidence\": float} \
with coordinates on a 0-1000 grid over the screenshot. \
On failure: {\"found\": false, \"reason\": string, \"suggestion\": string}.";

#[derive(Debug, Deserialize)]
struct RemoteBox {
    found: bool,
    #[serde(default)]
    xmin: f64,
    #[serde(default)]
    ymin: f64,
    #[serde(default)]
    xmax: f64,
    #[serde(default)]
    ymax: f64,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
}

/// Final locator stage: a remote vision model returning a bounding box on a
/// 0-1000 grid, converted to pixel coordinates with the screenshot size.
pub struct RemoteLocator {
    router: LlmRouter,
}

impl RemoteLocator {
    pub fn new(router: LlmRouter) -> Self {
        Self { router }
    }

    pub async fn locate_by_reference(
        &self,
        screenshot_png: &[u8],
        screen_w: u32,
        screen_h: u32,
        reference_path: &Path,
    ) -> AgentResult<Option<PixelMatch>> {
        let reference = tokio::fs::read(reference_path).await?;
        let b64 = base64::engine::general_purpose::STANDARD;
        let messages = vec![
            ChatMessage::system(LOCATOR_SYSTEM_PROMPT),
            ChatMessage::user_with_images(
                "The first image is the reference element, the second is the current screenshot. \
                 Locate the element.",
                vec![b64.encode(&reference), b64.encode(screenshot_png)],
            ),
        ];
        self.call(messages, screen_w, screen_h).await
    }

    pub async fn locate_by_description(
        &self,
        screenshot_png: &[u8],
        screen_w: u32,
        screen_h: u32,
        description: &str,
    ) -> AgentResult<Option<PixelMatch>> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let messages = vec![
            ChatMessage::system(DESCRIPTION_SYSTEM_PROMPT),
            ChatMessage::user_with_images(
                format!("Locate this element: {description}"),
                vec![b64.encode(screenshot_png)],
            ),
        ];
        self.call(messages, screen_w, screen_h).await
    }

    async fn call(
        &self,
        messages: Vec<ChatMessage>,
        screen_w: u32,
        screen_h: u32,
    ) -> AgentResult<Option<PixelMatch>> {
        let (provider, mut cfg) = self.router.for_role(Role::Main);
        cfg.json_mode = true;
        let response = provider.chat(messages, &cfg).await?;
        parse_remote_box(&response, screen_w, screen_h)
    }
}

/// Extract the JSON object from the response and convert the grid box to a
/// pixel center. Unparseable content is a provider error, not a not-found.
pub fn parse_remote_box(
    response: &str,
    screen_w: u32,
    screen_h: u32,
) -> AgentResult<Option<PixelMatch>> {
    let json_text = extract_json_object(response).ok_or_else(|| {
        AgentError::LlmProvider(format!(
            "remote locator returned no JSON object: {}",
            truncate(response, 120)
        ))
    })?;
    let parsed: RemoteBox = serde_json::from_str(json_text)?;

    if !parsed.found {
        tracing::debug!(reason = ?parsed.reason, "remote locator did not find target");
        return Ok(None);
    }

    let cx = (parsed.xmin + parsed.xmax) / 2.0 / 1000.0;
    let cy = (parsed.ymin + parsed.ymax) / 2.0 / 1000.0;
    if !(0.0..=1.0).contains(&cx) || !(0.0..=1.0).contains(&cy) {
        return Err(AgentError::LlmProvider(format!(
            "remote locator box out of grid: ({}, {})-({}, {})",
            parsed.xmin, parsed.ymin, parsed.xmax, parsed.ymax
        )));
    }

    Ok(Some(PixelMatch {
        x: (cx * screen_w as f64).round() as u32,
        y: (cy * screen_h as f64).round() as u32,
        confidence: parsed.confidence.unwrap_or(1.0) as f32,
    }))
}

/// First top-level `{…}` block in the text; models occasionally wrap JSON in
/// prose or fences despite the contract.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_box_converts_to_pixel_center() {
        let response = r#"{"found": true, "xmin": 400, "ymin": 550, "xmax": 600, "ymax": 650, "confidence": 0.9}"#;
        let m = parse_remote_box(response, 1080, 2400).unwrap().unwrap();
        assert_eq!(m.x, 540);
        assert_eq!(m.y, 1440);
        assert!((m.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn not_found_is_none_not_error() {
        let response = r#"{"found": false, "reason": "element not visible", "suggestion": "scroll down"}"#;
        assert!(parse_remote_box(response, 1080, 2400).unwrap().is_none());
    }

    #[test]
    fn fenced_json_is_extracted() {
        let response = "Here you go:\n```json\n{\"found\": true, \"xmin\": 0, \"ymin\": 0, \"xmax\": 100, \"ymax\": 100}\n```";
        let m = parse_remote_box(response, 1000, 1000).unwrap().unwrap();
        assert_eq!((m.x, m.y), (50, 50));
    }

    #[test]
    fn prose_without_json_is_a_provider_error() {
        assert!(parse_remote_box("cannot help with that", 100, 100).is_err());
    }
}
