use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};

use crate::locator::template::PixelMatch;

/// FAST corner detection threshold.
const FAST_THRESHOLD: u8 = 32;
/// Descriptor patch radius; corners closer to a border are skipped.
const PATCH_RADIUS: u32 = 8;
/// Number of sampled intensity pairs (bits) per descriptor.
const DESCRIPTOR_BITS: usize = 256;
/// Lowe-style ratio test bound for accepting a nearest-neighbour match.
const RATIO_TEST: f32 = 0.8;
/// Displacement agreement radius in pixels.
const CONSENSUS_RADIUS: i32 = 6;
/// Minimum number of displacement-consistent matches.
const MIN_INLIERS: usize = 8;
/// Final acceptance: inliers / matches.
const INLIER_RATIO: f32 = 0.5;

type Descriptor = [u64; DESCRIPTOR_BITS / 64];

/// Binary-descriptor feature match: FAST corners, census-style intensity
/// pair descriptors, hamming nearest neighbours, translation consensus.
/// Serves as the tolerant fallback between the scale sweep and the model
/// stages; returns the target center under the consensus displacement.
pub fn feature_match(screen: &GrayImage, template: &GrayImage) -> Option<PixelMatch> {
    let pairs = sample_pairs();

    let t_corners = keypoints(template);
    let s_corners = keypoints(screen);
    if t_corners.len() < 4 || s_corners.len() < 4 {
        tracing::trace!(
            template_corners = t_corners.len(),
            screen_corners = s_corners.len(),
            "too few corners for feature match"
        );
        return None;
    }

    let t_desc = describe(template, &t_corners, &pairs);
    let s_desc = describe(screen, &s_corners, &pairs);
    if t_desc.is_empty() || s_desc.is_empty() {
        return None;
    }

    // Nearest neighbour with ratio test, template -> screen.
    let mut displacements: Vec<(i32, i32)> = Vec::new();
    for (ti, td) in t_desc.iter() {
        let mut best = u32::MAX;
        let mut second = u32::MAX;
        let mut best_si = 0usize;
        for (si, sd) in s_desc.iter().enumerate() {
            let d = hamming(td, &sd.1);
            if d < best {
                second = best;
                best = d;
                best_si = si;
            } else if d < second {
                second = d;
            }
        }
        if second == u32::MAX || (best as f32) < RATIO_TEST * (second as f32) {
            let (tx, ty) = *ti;
            let (sx, sy) = s_desc[best_si].0;
            displacements.push((sx as i32 - tx as i32, sy as i32 - ty as i32));
        }
    }

    if displacements.len() < MIN_INLIERS {
        tracing::trace!(matches = displacements.len(), "too few descriptor matches");
        return None;
    }

    // Translation consensus around the median displacement.
    let (mdx, mdy) = median_displacement(&displacements);
    let inliers = displacements
        .iter()
        .filter(|(dx, dy)| (dx - mdx).abs() <= CONSENSUS_RADIUS && (dy - mdy).abs() <= CONSENSUS_RADIUS)
        .count();
    let confidence = inliers as f32 / displacements.len() as f32;

    if inliers < MIN_INLIERS || confidence < INLIER_RATIO {
        tracing::trace!(
            inliers,
            matches = displacements.len(),
            "displacement consensus too weak"
        );
        return None;
    }

    let center_x = template.width() as i32 / 2 + mdx;
    let center_y = template.height() as i32 / 2 + mdy;
    if center_x < 0
        || center_y < 0
        || center_x >= screen.width() as i32
        || center_y >= screen.height() as i32
    {
        return None;
    }

    tracing::debug!(inliers, matches = displacements.len(), confidence, "feature match accepted");
    Some(PixelMatch {
        x: center_x as u32,
        y: center_y as u32,
        confidence,
    })
}

fn keypoints(img: &GrayImage) -> Vec<Corner> {
    if img.width() <= 2 * PATCH_RADIUS || img.height() <= 2 * PATCH_RADIUS {
        return Vec::new();
    }
    corners_fast9(img, FAST_THRESHOLD)
        .into_iter()
        .filter(|c| {
            c.x >= PATCH_RADIUS
                && c.y >= PATCH_RADIUS
                && c.x < img.width() - PATCH_RADIUS
                && c.y < img.height() - PATCH_RADIUS
        })
        .collect()
}

#[allow(clippy::type_complexity)]
fn describe(
    img: &GrayImage,
    corners: &[Corner],
    pairs: &[(i32, i32, i32, i32)],
) -> Vec<((u32, u32), Descriptor)> {
    corners
        .iter()
        .map(|c| {
            let mut desc: Descriptor = [0; DESCRIPTOR_BITS / 64];
            for (bit, (ax, ay, bx, by)) in pairs.iter().enumerate() {
                let a = sample(img, c.x as i32 + ax, c.y as i32 + ay);
                let b = sample(img, c.x as i32 + bx, c.y as i32 + by);
                if a > b {
                    desc[bit / 64] |= 1u64 << (bit % 64);
                }
            }
            ((c.x, c.y), desc)
        })
        .collect()
}

fn sample(img: &GrayImage, x: i32, y: i32) -> u8 {
    let x = x.clamp(0, img.width() as i32 - 1) as u32;
    let y = y.clamp(0, img.height() as i32 - 1) as u32;
    img.get_pixel(x, y).0[0]
}

fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Deterministic pseudo-random offset pairs within the patch, identical for
/// every call so descriptors are comparable across images.
fn sample_pairs() -> Vec<(i32, i32, i32, i32)> {
    let r = PATCH_RADIUS as i64;
    let span = 2 * r + 1;
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut next = move || {
        // xorshift64*
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        state.wrapping_mul(0x2545_F491_4F6C_DD1D)
    };
    (0..DESCRIPTOR_BITS)
        .map(|_| {
            let v = next();
            let ax = ((v & 0xFFFF) as i64 % span - r) as i32;
            let ay = (((v >> 16) & 0xFFFF) as i64 % span - r) as i32;
            let bx = (((v >> 32) & 0xFFFF) as i64 % span - r) as i32;
            let by = (((v >> 48) & 0xFFFF) as i64 % span - r) as i32;
            (ax, ay, bx, by)
        })
        .collect()
}

fn median_displacement(displacements: &[(i32, i32)]) -> (i32, i32) {
    let mut xs: Vec<i32> = displacements.iter().map(|d| d.0).collect();
    let mut ys: Vec<i32> = displacements.iter().map(|d| d.1).collect();
    xs.sort_unstable();
    ys.sort_unstable();
    (xs[xs.len() / 2], ys[ys.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Textured patch with corner-rich structure.
    fn textured_patch(side: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(side, side, Luma([40u8]));
        for y in 0..side {
            for x in 0..side {
                let cell = ((x / 8) + (y / 8)) % 3;
                let v = match cell {
                    0 => 40,
                    1 => 140,
                    _ => 230,
                };
                img.put_pixel(x, y, Luma([v]));
            }
        }
        img
    }

    #[test]
    fn translated_patch_is_found() {
        let template = textured_patch(64);
        let mut screen = GrayImage::from_pixel(300, 300, Luma([90u8]));
        image::imageops::overlay(&mut screen, &template, 120, 150);

        let m = feature_match(&screen, &template).expect("feature match");
        // Template center is (32, 32); placed at (120, 150).
        assert!((m.x as i32 - 152).abs() <= 8, "x={}", m.x);
        assert!((m.y as i32 - 182).abs() <= 8, "y={}", m.y);
        assert!(m.confidence >= 0.5);
    }

    #[test]
    fn featureless_images_do_not_match() {
        let template = GrayImage::from_pixel(64, 64, Luma([100u8]));
        let screen = GrayImage::from_pixel(300, 300, Luma([100u8]));
        assert!(feature_match(&screen, &template).is_none());
    }

    #[test]
    fn descriptor_pairs_are_deterministic() {
        assert_eq!(sample_pairs(), sample_pairs());
    }
}
