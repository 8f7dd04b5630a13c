//! Face sample quality metrics: landmark Procrustes distance, pixel area, sharpness.
//!
//! All functions are pure and deterministic for a given input.

use crate::types::{BoundingBox, Landmarks};

/// ArcFace reference landmarks for a 112×112 aligned crop.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Something whose sharpness can be measured on demand.
///
/// The admission policy evaluates sharpness last, so implementors may defer
/// the grayscale conversion until it is actually asked for.
pub trait Sharpness {
    /// Variance of the Laplacian. Higher = sharper.
    fn sharpness(&self) -> f64;
}

/// A precomputed sharpness value.
#[derive(Debug, Clone, Copy)]
pub struct FixedSharpness(pub f64);

impl Sharpness for FixedSharpness {
    fn sharpness(&self) -> f64 {
        self.0
    }
}

/// Center a point set and scale it to unit Frobenius norm.
///
/// Returns `None` for a degenerate set (all points coincide).
fn normalize_shape(points: &[(f64, f64); 5]) -> Option<[(f64, f64); 5]> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;

    let mut centered = [(0.0, 0.0); 5];
    for (dst, p) in centered.iter_mut().zip(points.iter()) {
        *dst = (p.0 - cx, p.1 - cy);
    }

    let norm = centered.iter().map(|p| p.0 * p.0 + p.1 * p.1).sum::<f64>().sqrt();
    if norm <= f64::EPSILON {
        return None;
    }
    for p in centered.iter_mut() {
        p.0 /= norm;
        p.1 /= norm;
    }
    Some(centered)
}

/// Procrustes distance between detected landmarks and the canonical pentagon.
///
/// Landmarks are normalized to `bbox`; they are first mapped to integer
/// frame pixels, then both shapes are centered and scaled to unit norm.
/// The result is dimensionless and scale-invariant. Degenerate landmark
/// sets return `f64::INFINITY`.
pub fn procrustes_distance(landmarks: &Landmarks, bbox: &BoundingBox, width: u32, height: u32) -> f64 {
    let mut detected = [(0.0f64, 0.0f64); 5];
    for (dst, &(x, y)) in detected.iter_mut().zip(landmarks.iter()) {
        let px = ((x * bbox.width + bbox.xmin) * width as f32) as i64;
        let py = ((y * bbox.height + bbox.ymin) * height as f32) as i64;
        *dst = (px as f64, py as f64);
    }

    let mut reference = [(0.0f64, 0.0f64); 5];
    for (dst, &(x, y)) in reference.iter_mut().zip(REFERENCE_LANDMARKS_112.iter()) {
        *dst = (x as f64, y as f64);
    }

    let (Some(a), Some(b)) = (normalize_shape(&detected), normalize_shape(&reference)) else {
        return f64::INFINITY;
    };

    a.iter()
        .zip(b.iter())
        .map(|(p, q)| (p.0 - q.0).powi(2) + (p.1 - q.1).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Bounding box area in frame pixels: `int(w·W) · int(h·H)`.
pub fn pixel_area(bbox: &BoundingBox, width: u32, height: u32) -> u64 {
    let w = (bbox.width * width as f32).max(0.0) as u64;
    let h = (bbox.height * height as f32).max(0.0) as u64;
    w * h
}

/// Variance of the 4-neighbour Laplacian over the interior of a grayscale image.
///
/// Images smaller than 3×3 (or with a short buffer) report 0.
pub fn laplacian_variance(gray: &[u8], width: u32, height: u32) -> f64 {
    let w = width as usize;
    let h = height as usize;
    if w < 3 || h < 3 || gray.len() < w * h {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = gray[y * w + x] as f64;
            let lap = gray[(y - 1) * w + x] as f64
                + gray[(y + 1) * w + x] as f64
                + gray[y * w + x - 1] as f64
                + gray[y * w + x + 1] as f64
                - 4.0 * c;
            sum += lap;
            sum_sq += lap * lap;
            count += 1;
        }
    }

    let n = count as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_frame() -> BoundingBox {
        BoundingBox { xmin: 0.0, ymin: 0.0, width: 1.0, height: 1.0 }
    }

    /// Reference landmarks expressed relative to a 112×112 full-frame box.
    fn reference_normalized() -> Landmarks {
        let mut lm = [(0.0, 0.0); 5];
        for (dst, &(x, y)) in lm.iter_mut().zip(REFERENCE_LANDMARKS_112.iter()) {
            *dst = (x / 112.0, y / 112.0);
        }
        lm
    }

    #[test]
    fn test_procrustes_canonical_is_near_zero() {
        // Integer truncation at 1120px is negligible.
        let d = procrustes_distance(&reference_normalized(), &full_frame(), 1120, 1120);
        assert!(d < 0.01, "d = {d}");
    }

    #[test]
    fn test_procrustes_scale_and_translation_invariant() {
        let lm = reference_normalized();
        let small = BoundingBox { xmin: 0.1, ymin: 0.2, width: 0.3, height: 0.3 };
        let large = BoundingBox { xmin: 0.4, ymin: 0.1, width: 0.6, height: 0.6 };
        let a = procrustes_distance(&lm, &small, 2000, 2000);
        let b = procrustes_distance(&lm, &large, 2000, 2000);
        assert!((a - b).abs() < 0.01, "a = {a}, b = {b}");
    }

    #[test]
    fn test_procrustes_profile_face_is_far() {
        // Everything squeezed to one side: a strong profile view.
        let lm: Landmarks = [(0.1, 0.4), (0.2, 0.4), (0.05, 0.6), (0.1, 0.8), (0.15, 0.8)];
        let d = procrustes_distance(&lm, &full_frame(), 640, 640);
        assert!(d > 0.3, "d = {d}");
    }

    #[test]
    fn test_procrustes_degenerate_is_infinite() {
        let lm: Landmarks = [(0.5, 0.5); 5];
        assert!(procrustes_distance(&lm, &full_frame(), 640, 480).is_infinite());
    }

    #[test]
    fn test_pixel_area() {
        let bbox = BoundingBox { xmin: 0.0, ymin: 0.0, width: 0.5, height: 0.25 };
        assert_eq!(pixel_area(&bbox, 640, 480), 320 * 120);
        // Truncation happens per side.
        let bbox = BoundingBox { xmin: 0.0, ymin: 0.0, width: 0.101, height: 0.101 };
        assert_eq!(pixel_area(&bbox, 100, 100), 10 * 10);
    }

    #[test]
    fn test_laplacian_flat_image_is_zero() {
        let gray = vec![128u8; 32 * 32];
        assert_eq!(laplacian_variance(&gray, 32, 32), 0.0);
    }

    #[test]
    fn test_laplacian_checkerboard_is_sharp() {
        let (w, h) = (32usize, 32usize);
        let gray: Vec<u8> = (0..w * h)
            .map(|i| if ((i % w) + (i / w)) % 2 == 0 { 0 } else { 255 })
            .collect();
        let sharp = laplacian_variance(&gray, w as u32, h as u32);

        // Smooth horizontal gradient: Laplacian is zero everywhere.
        let smooth: Vec<u8> = (0..w * h).map(|i| (i % w * 8) as u8).collect();
        let soft = laplacian_variance(&smooth, w as u32, h as u32);

        assert!(sharp > 300.0, "sharp = {sharp}");
        assert!(soft < sharp);
    }

    #[test]
    fn test_laplacian_tiny_image() {
        assert_eq!(laplacian_variance(&[1, 2, 3, 4], 2, 2), 0.0);
        assert_eq!(laplacian_variance(&[], 10, 10), 0.0);
    }

    #[test]
    fn test_fixed_sharpness() {
        assert_eq!(FixedSharpness(42.0).sharpness(), 42.0);
    }
}
