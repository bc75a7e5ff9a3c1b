//! Classical image processing primitives used by the estimators.

pub mod backend;
pub mod color;
pub mod contour;
pub mod corner;
pub mod edge;
pub mod flow;
pub mod hough;
pub mod morphology;

use image::{GrayImage, ImageBuffer, Luma};

/// Single channel image with floating point intensities.
pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Mask value for set pixels.
pub const FOREGROUND: u8 = 255;

pub fn to_float(gray: &GrayImage) -> FloatImage {
    let (width, height) = gray.dimensions();
    let data = gray.as_raw().iter().map(|&v| v as f32).collect();
    // Same dimensions and one channel, so the length always matches.
    FloatImage::from_raw(width, height, data).unwrap_or_else(|| FloatImage::new(width, height))
}

/// Read `(x, y)` with coordinates clamped to the image.
pub(crate) fn clamped(image: &FloatImage, x: i64, y: i64) -> f32 {
    let (width, height) = image.dimensions();
    let x = x.clamp(0, width as i64 - 1) as u32;
    let y = y.clamp(0, height as i64 - 1) as u32;
    image.get_pixel(x, y).0[0]
}

/// Sample `image` at a subpixel location with bilinear interpolation.
///
/// Locations outside the image are clamped to the border.
pub fn interpolate_bilinear(image: &FloatImage, x: f32, y: f32) -> f32 {
    let (width, height) = image.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let p00 = image.get_pixel(x0, y0).0[0];
    let p10 = image.get_pixel(x1, y0).0[0];
    let p01 = image.get_pixel(x0, y1).0[0];
    let p11 = image.get_pixel(x1, y1).0[0];

    (1.0 - fx) * (1.0 - fy) * p00 + fx * (1.0 - fy) * p10 + (1.0 - fx) * fy * p01 + fx * fy * p11
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn bilinear_midpoint() {
        let image = FloatImage::from_raw(2, 2, vec![0.0, 10.0, 20.0, 30.0]).unwrap();
        assert_relative_eq!(interpolate_bilinear(&image, 0.5, 0.5), 15.0);
        assert_relative_eq!(interpolate_bilinear(&image, 1.0, 0.0), 10.0);
    }

    #[test]
    fn bilinear_clamps_outside() {
        let image = FloatImage::from_raw(2, 1, vec![4.0, 8.0]).unwrap();
        assert_relative_eq!(interpolate_bilinear(&image, -3.0, 0.0), 4.0);
        assert_relative_eq!(interpolate_bilinear(&image, 9.0, 2.0), 8.0);
    }
}
