use crate::imgproc::FOREGROUND;
use image::{GrayImage, Luma, Rgb, RgbImage};
use nalgebra::{Point2, Vector2};

/// An 8-bit HSV triple. Hue is in [0, 180), half of degrees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hsv {
    pub h: u8,
    pub s: u8,
    pub v: u8,
}

impl From<Rgb<u8>> for Hsv {
    fn from(Rgb([r, g, b]): Rgb<u8>) -> Self {
        let (r, g, b) = (r as f64, g as f64, b as f64);
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        let s = match max > 0.0 {
            true => 255.0 * delta / max,
            false => 0.0,
        };

        let degrees = if delta == 0.0 {
            0.0
        } else if max == r {
            60.0 * (g - b) / delta
        } else if max == g {
            120.0 + 60.0 * (b - r) / delta
        } else {
            240.0 + 60.0 * (r - g) / delta
        };
        let degrees = if degrees < 0.0 { degrees + 360.0 } else { degrees };

        Self {
            h: ((degrees / 2.0).round() as u32 % 180) as u8,
            s: s.round() as u8,
            v: max as u8,
        }
    }
}

/// Mean color of the pixels inside a rotated window, clipped to the image.
///
/// The window is centered on `center` and reaches `half[k]` along the unit
/// vector `axes[k]` on both sides. Returns `None` when no pixel falls inside.
pub fn mean_color(
    image: &RgbImage,
    center: Point2<f64>,
    axes: [Vector2<f64>; 2],
    half: [f64; 2],
) -> Option<Rgb<u8>> {
    let (width, height) = image.dimensions();
    let reach = |i: usize| axes[0][i].abs() * half[0] + axes[1][i].abs() * half[1];
    let (rx, ry) = (reach(0), reach(1));
    let xs = ((center.x - rx).floor() as i64).max(0)..((center.x + rx).ceil() as i64 + 1).min(width as i64);
    let ys = ((center.y - ry).floor() as i64).max(0)..((center.y + ry).ceil() as i64 + 1).min(height as i64);

    let mut sum = [0u64; 3];
    let mut count = 0u64;
    for y in ys {
        for x in xs.clone() {
            let offset = Vector2::new(x as f64, y as f64) - center.coords;
            if offset.dot(&axes[0]).abs() > half[0] || offset.dot(&axes[1]).abs() > half[1] {
                continue;
            }
            let Rgb(px) = image.get_pixel(x as u32, y as u32);
            sum.iter_mut().zip(px).for_each(|(s, v)| *s += *v as u64);
            count += 1;
        }
    }

    match count {
        0 => None,
        n => Some(Rgb(sum.map(|s| ((s as f64 / n as f64).round()) as u8))),
    }
}

/// Binary mask of the pixels whose HSV value satisfies `accept`.
pub fn hsv_mask<F>(image: &RgbImage, accept: F) -> GrayImage
where
    F: Fn(Hsv) -> bool,
{
    let (width, height) = image.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        match accept(Hsv::from(*image.get_pixel(x, y))) {
            true => Luma([FOREGROUND]),
            false => Luma([0]),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case([255, 0, 0], Hsv { h: 0, s: 255, v: 255 })]
    #[case([0, 255, 0], Hsv { h: 60, s: 255, v: 255 })]
    #[case([0, 0, 255], Hsv { h: 120, s: 255, v: 255 })]
    #[case([255, 0, 10], Hsv { h: 179, s: 255, v: 255 })]
    #[case([128, 128, 128], Hsv { h: 0, s: 0, v: 128 })]
    #[case([0, 0, 0], Hsv { h: 0, s: 0, v: 0 })]
    fn converts_like_8bit_hsv(#[case] rgb: [u8; 3], #[case] expected: Hsv) {
        assert_eq!(Hsv::from(Rgb(rgb)), expected);
    }

    fn image_axes() -> [Vector2<f64>; 2] {
        [Vector2::x(), Vector2::y()]
    }

    #[test]
    fn mean_color_clips_window() {
        let mut image = RgbImage::new(4, 4);
        image.put_pixel(0, 0, Rgb([100, 0, 0]));
        image.put_pixel(1, 0, Rgb([200, 0, 0]));
        assert_eq!(
            mean_color(&image, Point2::new(-1.0, 0.0), image_axes(), [2.0, 0.0]),
            Some(Rgb([150, 0, 0]))
        );
        assert_eq!(mean_color(&image, Point2::new(10.0, 10.0), image_axes(), [1.0, 1.0]), None);
    }

    #[test]
    fn mean_color_follows_window_rotation() {
        let mut image = RgbImage::new(5, 5);
        for i in 1..4 {
            image.put_pixel(i, i, Rgb([200, 0, 0]));
        }
        let c = std::f64::consts::FRAC_1_SQRT_2;
        let diagonal = [Vector2::new(c, c), Vector2::new(-c, c)];
        assert_eq!(
            mean_color(&image, Point2::new(2.0, 2.0), diagonal, [1.5, 0.2]),
            Some(Rgb([200, 0, 0]))
        );
        assert_eq!(
            mean_color(&image, Point2::new(2.0, 2.0), image_axes(), [1.0, 1.0]),
            Some(Rgb([67, 0, 0]))
        );
    }

    #[test]
    fn mask_marks_accepted_pixels() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(1, 0, Rgb([0, 255, 0]));
        let mask = hsv_mask(&image, |hsv| hsv.h == 60);
        assert_eq!(mask.as_raw(), &vec![0, FOREGROUND]);
    }
}
