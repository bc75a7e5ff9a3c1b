use crate::imgproc::{FloatImage, edge::sobel, to_float};
use image::{GrayImage, Luma};
use nalgebra::Point2;

/// Side of the window the structure tensor is summed over.
const BLOCK_SIZE: i64 = 3;

#[derive(Clone, Copy, Debug)]
pub struct CornerParams {
    pub max_corners: usize,
    /// Corners weaker than this fraction of the strongest are dropped.
    pub quality_level: f64,
    pub min_distance: f64,
}

/// Smaller eigenvalue of the structure tensor at every pixel.
fn min_eigenvalues(gray: &GrayImage) -> FloatImage {
    let (width, height) = gray.dimensions();
    // Aperture 3 is always supported.
    let Ok(gradient) = sobel(&to_float(gray), 3) else {
        return FloatImage::new(width, height);
    };

    let radius = BLOCK_SIZE / 2;
    FloatImage::from_fn(width, height, |x, y| {
        let (mut a, mut b, mut c) = (0.0f32, 0.0f32, 0.0f32);
        for v in (y as i64 - radius)..=(y as i64 + radius) {
            for u in (x as i64 - radius)..=(x as i64 + radius) {
                if u < 0 || v < 0 || u >= width as i64 || v >= height as i64 {
                    continue;
                }
                let gx = gradient.dx.get_pixel(u as u32, v as u32).0[0];
                let gy = gradient.dy.get_pixel(u as u32, v as u32).0[0];
                a += gx * gx;
                b += gx * gy;
                c += gy * gy;
            }
        }
        let half_trace = (a + c) / 2.0;
        let root = (((a - c) / 2.0).powi(2) + b * b).sqrt();
        Luma([half_trace - root])
    })
}

/// Shi-Tomasi corners, strongest first.
///
/// Candidates must exceed `quality_level` times the strongest response and
/// be a local maximum in their 3x3 neighborhood. Corners closer than
/// `min_distance` to a stronger accepted corner are skipped.
pub fn good_features_to_track(gray: &GrayImage, params: &CornerParams) -> Vec<Point2<f32>> {
    let response = min_eigenvalues(gray);
    let (width, height) = response.dimensions();
    let strongest = response.pixels().map(|px| px.0[0]).fold(0.0f32, f32::max);
    if strongest <= 0.0 || width < 3 || height < 3 {
        return Vec::new();
    }

    let threshold = strongest * params.quality_level as f32;
    let mut candidates: Vec<(f32, u32, u32)> = Vec::new();
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let value = response.get_pixel(x, y).0[0];
            if value <= threshold {
                continue;
            }
            let is_peak = (y - 1..=y + 1)
                .flat_map(|v| (x - 1..=x + 1).map(move |u| (u, v)))
                .all(|(u, v)| response.get_pixel(u, v).0[0] <= value);
            if is_peak {
                candidates.push((value, x, y));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

    let min_sq = (params.min_distance * params.min_distance) as f32;
    let mut corners: Vec<Point2<f32>> = Vec::new();
    for (_, x, y) in candidates {
        if corners.len() >= params.max_corners {
            break;
        }
        let p = Point2::new(x as f32, y as f32);
        if corners.iter().all(|c| (c - p).norm_squared() >= min_sq) {
            corners.push(p);
        }
    }
    corners
}
