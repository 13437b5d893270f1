use image::imageops::FilterType;
use image::GrayImage;
use imageproc::template_matching::{match_template, MatchTemplateMethod};

/// Acceptance threshold for the exact template stage.
pub const TEMPLATE_THRESHOLD: f32 = 0.75;
/// The multi-scale stage accepts slightly lower responses.
pub const MULTI_SCALE_THRESHOLD: f32 = 0.70;

/// Scale sweep for the multi-scale stage.
const SCALE_MIN: f32 = 0.5;
const SCALE_MAX: f32 = 1.5;
const SCALE_STEP: f32 = 0.1;

/// A point match in cropped-screenshot pixels.
#[derive(Debug, Clone, Copy)]
pub struct PixelMatch {
    pub x: u32,
    pub y: u32,
    pub confidence: f32,
}

/// Zero-mean normalized cross-correlation template match at native scale.
pub fn template_match(screen: &GrayImage, template: &GrayImage) -> Option<PixelMatch> {
    let m = best_response(screen, template)?;
    if m.confidence >= TEMPLATE_THRESHOLD {
        Some(m)
    } else {
        tracing::trace!(best = m.confidence, "template best response below threshold");
        None
    }
}

/// Template match across a scale sweep, for screenshots whose UI density
/// differs from the device the reference was captured on.
pub fn multi_scale_match(screen: &GrayImage, template: &GrayImage) -> Option<PixelMatch> {
    let (tw, th) = template.dimensions();
    let mut best: Option<(PixelMatch, f32)> = None;

    let mut scale = SCALE_MIN;
    while scale <= SCALE_MAX + 1e-6 {
        let current = scale;
        scale += SCALE_STEP;

        let nw = (tw as f32 * current).round() as u32;
        let nh = (th as f32 * current).round() as u32;
        if nw < 10 || nh < 10 {
            continue;
        }
        if nw > screen.width() || nh > screen.height() {
            continue;
        }

        let resized = image::imageops::resize(template, nw, nh, FilterType::CatmullRom);
        if let Some(m) = best_response(screen, &resized) {
            let better = best.map(|(b, _)| m.confidence > b.confidence).unwrap_or(true);
            if better {
                best = Some((m, current));
            }
        }
    }

    match best {
        Some((m, used_scale)) if m.confidence >= MULTI_SCALE_THRESHOLD => {
            tracing::debug!(
                confidence = m.confidence,
                scale = used_scale,
                "multi-scale match accepted"
            );
            Some(m)
        }
        Some((m, used_scale)) => {
            tracing::trace!(
                best = m.confidence,
                scale = used_scale,
                "multi-scale best response below threshold"
            );
            None
        }
        None => None,
    }
}

/// Best zero-mean NCC response over all placements.
///
/// imageproc's normalized method is not mean-centered, which makes flat
/// regions score high against any bright template. Instead take the raw
/// cross-correlation (the expensive term) from imageproc and normalize each
/// window with integral-image statistics, which is the classic
/// mean-centered formulation the 0.75 threshold is calibrated against.
fn best_response(screen: &GrayImage, template: &GrayImage) -> Option<PixelMatch> {
    let (tw, th) = template.dimensions();
    let (sw, sh) = screen.dimensions();
    if tw == 0 || th == 0 || tw > sw || th > sh {
        return None;
    }

    let n = (tw as f64) * (th as f64);
    let mut sum_t = 0f64;
    let mut sum_t2 = 0f64;
    for p in template.pixels() {
        let v = p.0[0] as f64;
        sum_t += v;
        sum_t2 += v * v;
    }
    let denom_t = (sum_t2 - sum_t * sum_t / n).max(0.0).sqrt();
    if denom_t < 1e-6 {
        // Uniform template carries no signal.
        return None;
    }
    let mean_t = sum_t / n;

    let cc = match_template(screen, template, MatchTemplateMethod::CrossCorrelation);
    let (integral, integral_sq) = integrals(screen);

    let mut best = PixelMatch {
        x: 0,
        y: 0,
        confidence: f32::MIN,
    };
    for y in 0..=(sh - th) {
        for x in 0..=(sw - tw) {
            let sum_w = rect_sum(&integral, sw, x, y, tw, th);
            let sum_w2 = rect_sum(&integral_sq, sw, x, y, tw, th);
            let denom_w = (sum_w2 - sum_w * sum_w / n).max(0.0).sqrt();
            let score = if denom_w < 1e-6 {
                0.0
            } else {
                let num = cc.get_pixel(x, y).0[0] as f64 - mean_t * sum_w;
                (num / (denom_t * denom_w)) as f32
            };
            if score > best.confidence {
                best = PixelMatch {
                    x: x + tw / 2,
                    y: y + th / 2,
                    confidence: score,
                };
            }
        }
    }
    Some(best)
}

/// Summed-area tables for value and squared value, row-major, with an extra
/// leading row/column of zeros.
fn integrals(img: &GrayImage) -> (Vec<f64>, Vec<f64>) {
    let (w, h) = img.dimensions();
    let stride = (w + 1) as usize;
    let mut integral = vec![0f64; stride * (h + 1) as usize];
    let mut integral_sq = vec![0f64; stride * (h + 1) as usize];
    for y in 0..h as usize {
        let mut row = 0f64;
        let mut row_sq = 0f64;
        for x in 0..w as usize {
            let v = img.get_pixel(x as u32, y as u32).0[0] as f64;
            row += v;
            row_sq += v * v;
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row;
            integral_sq[(y + 1) * stride + x + 1] = integral_sq[y * stride + x + 1] + row_sq;
        }
    }
    (integral, integral_sq)
}

fn rect_sum(integral: &[f64], img_w: u32, x: u32, y: u32, w: u32, h: u32) -> f64 {
    let stride = (img_w + 1) as usize;
    let (x0, y0) = (x as usize, y as usize);
    let (x1, y1) = ((x + w) as usize, (y + h) as usize);
    integral[y1 * stride + x1] + integral[y0 * stride + x0]
        - integral[y0 * stride + x1]
        - integral[y1 * stride + x0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Paint a ring-style button at (sx, sy): bright border, darker fill.
    /// Low-frequency structure so it survives resampling.
    fn paint_button(img: &mut GrayImage, sx: u32, sy: u32, side: u32) {
        let border = (side / 5).max(2);
        for y in 0..side {
            for x in 0..side {
                let on_border =
                    x < border || y < border || x >= side - border || y >= side - border;
                let v = if on_border { 220 } else { 80 };
                img.put_pixel(sx + x, sy + y, Luma([v]));
            }
        }
    }

    fn canvas_with_square(w: u32, h: u32, sx: u32, sy: u32, side: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(w, h, Luma([30u8]));
        paint_button(&mut img, sx, sy, side);
        img
    }

    fn square_template(side: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(side, side, Luma([30u8]));
        paint_button(&mut img, 0, 0, side);
        img
    }

    #[test]
    fn exact_template_finds_center() {
        let screen = canvas_with_square(200, 200, 60, 80, 20);
        let template = square_template(20);
        let m = template_match(&screen, &template).expect("match");
        assert!((m.x as i32 - 70).abs() <= 2, "x={}", m.x);
        assert!((m.y as i32 - 90).abs() <= 2, "y={}", m.y);
        assert!(m.confidence > 0.9);
    }

    #[test]
    fn flat_background_does_not_match() {
        let screen = GrayImage::from_pixel(100, 100, Luma([200u8]));
        let template = square_template(20);
        assert!(template_match(&screen, &template).is_none());
    }

    #[test]
    fn oversized_template_is_rejected() {
        let screen = canvas_with_square(50, 50, 10, 10, 20);
        let template = square_template(60);
        assert!(template_match(&screen, &template).is_none());
    }

    #[test]
    fn multi_scale_finds_scaled_target() {
        // Target drawn at 24px, reference captured at 20px (scale 1.2).
        let screen = canvas_with_square(200, 200, 100, 50, 24);
        let template = square_template(20);
        let m = multi_scale_match(&screen, &template).expect("scaled match");
        assert!((m.x as i32 - 112).abs() <= 4, "x={}", m.x);
        assert!((m.y as i32 - 62).abs() <= 4, "y={}", m.y);
    }

    #[test]
    fn integral_rect_sum_matches_naive() {
        let mut img = GrayImage::new(8, 6);
        for (i, p) in img.pixels_mut().enumerate() {
            *p = Luma([(i % 251) as u8]);
        }
        let (integral, _) = integrals(&img);
        let naive: f64 = (1..5)
            .flat_map(|y| (2..7).map(move |x| (x, y)))
            .map(|(x, y): (u32, u32)| img.get_pixel(x, y).0[0] as f64)
            .sum();
        assert_eq!(rect_sum(&integral, 8, 2, 1, 5, 4), naive);
    }
}
