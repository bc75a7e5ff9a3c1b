use crate::{
    error::ConfigError,
    imgproc::{FOREGROUND, FloatImage, clamped, to_float},
};
use image::{GrayImage, Luma};

const APERTURES: &[u32] = &[3, 5, 7];

/// tan(22.5 deg) and tan(67.5 deg) split the gradient direction into sectors.
const TAN_22_5: f32 = 0.414_213_57;
const TAN_67_5: f32 = 2.414_213_6;

/// Horizontal and vertical derivatives of an image.
pub struct Gradient {
    pub dx: FloatImage,
    pub dy: FloatImage,
}

impl Gradient {
    /// L1 magnitude at every pixel.
    pub fn magnitude(&self) -> FloatImage {
        let (width, height) = self.dx.dimensions();
        FloatImage::from_fn(width, height, |x, y| {
            Luma([self.dx.get_pixel(x, y).0[0].abs() + self.dy.get_pixel(x, y).0[0].abs()])
        })
    }
}

/// Smoothing and derivative kernels of the separable Sobel operator.
fn sobel_kernels(aperture: u32) -> Result<(&'static [f32], &'static [f32]), ConfigError> {
    match aperture {
        3 => Ok((&[1.0, 2.0, 1.0], &[-1.0, 0.0, 1.0])),
        5 => Ok((&[1.0, 4.0, 6.0, 4.0, 1.0], &[-1.0, -2.0, 0.0, 2.0, 1.0])),
        7 => Ok((
            &[1.0, 6.0, 15.0, 20.0, 15.0, 6.0, 1.0],
            &[-1.0, -4.0, -5.0, 0.0, 5.0, 4.0, 1.0],
        )),
        _ => Err(ConfigError::Unsupported {
            name: "sobel aperture",
            value: aperture,
            allowed: APERTURES,
        }),
    }
}

/// One dimensional correlation with replicated borders.
fn convolve(image: &FloatImage, kernel: &[f32], horizontal: bool) -> FloatImage {
    let (width, height) = image.dimensions();
    let radius = (kernel.len() / 2) as i64;
    FloatImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as i64, y as i64);
        let sum: f32 = kernel
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let offset = i as i64 - radius;
                match horizontal {
                    true => k * clamped(image, x + offset, y),
                    false => k * clamped(image, x, y + offset),
                }
            })
            .sum();
        Luma([sum])
    })
}

/// Sobel derivatives with an aperture of 3, 5 or 7.
pub fn sobel(image: &FloatImage, aperture: u32) -> Result<Gradient, ConfigError> {
    let (smooth, derive) = sobel_kernels(aperture)?;
    let dx = convolve(&convolve(image, derive, true), smooth, false);
    let dy = convolve(&convolve(image, smooth, true), derive, false);
    Ok(Gradient { dx, dy })
}

/// Canny edge detector.
///
/// Gradient magnitude is the L1 norm. A pixel survives non-maximum
/// suppression when it beats its neighbor behind it along the gradient and
/// is at least as large as the one ahead. Surviving pixels above `high` seed
/// edges which then grow through 8-connected survivors above `low`.
pub fn canny(gray: &GrayImage, low: f32, high: f32, aperture: u32) -> Result<GrayImage, ConfigError> {
    let gradient = sobel(&to_float(gray), aperture)?;
    let magnitude = gradient.magnitude();
    let (width, height) = gray.dimensions();

    let at = |x: i64, y: i64| -> f32 {
        match x >= 0 && y >= 0 && x < width as i64 && y < height as i64 {
            true => magnitude.get_pixel(x as u32, y as u32).0[0],
            false => 0.0,
        }
    };

    // 0: not an edge, 1: candidate, 2: edge
    let mut state = vec![0u8; (width * height) as usize];
    let mut stack = Vec::new();
    for y in 0..height {
        for x in 0..width {
            let mag = magnitude.get_pixel(x, y).0[0];
            if mag <= low {
                continue;
            }

            let gx = gradient.dx.get_pixel(x, y).0[0];
            let gy = gradient.dy.get_pixel(x, y).0[0];
            let (ax, ay) = (gx.abs(), gy.abs());
            let (xi, yi) = (x as i64, y as i64);
            let (behind, ahead) = if ay <= ax * TAN_22_5 {
                (at(xi - 1, yi), at(xi + 1, yi))
            } else if ay >= ax * TAN_67_5 {
                (at(xi, yi - 1), at(xi, yi + 1))
            } else if (gx > 0.0) == (gy > 0.0) {
                (at(xi - 1, yi - 1), at(xi + 1, yi + 1))
            } else {
                (at(xi + 1, yi - 1), at(xi - 1, yi + 1))
            };

            if mag > behind && mag >= ahead {
                let index = (y * width + x) as usize;
                state[index] = 1;
                if mag > high {
                    state[index] = 2;
                    stack.push((xi, yi));
                }
            }
        }
    }

    while let Some((x, y)) = stack.pop() {
        for (dx, dy) in NEIGHBORS_8 {
            let (nx, ny) = (x + dx, y + dy);
            if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                continue;
            }
            let index = (ny * width as i64 + nx) as usize;
            if state[index] == 1 {
                state[index] = 2;
                stack.push((nx, ny));
            }
        }
    }

    let edges = state
        .into_iter()
        .map(|s| if s == 2 { FOREGROUND } else { 0 })
        .collect();
    Ok(GrayImage::from_raw(width, height, edges).unwrap_or_else(|| GrayImage::new(width, height)))
}

const NEIGHBORS_8: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn step(width: u32, height: u32, at: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| Luma([if x < at { 0 } else { 200 }]))
    }

    #[rstest]
    #[case(3, 800.0)]
    #[case(5, 200.0 * 3.0 * 16.0)]
    fn sobel_responds_to_step(#[case] aperture: u32, #[case] expected: f32) {
        let gradient = sobel(&to_float(&step(20, 10, 10)), aperture).unwrap();
        let peak = (0..20)
            .map(|x| gradient.dx.get_pixel(x, 5).0[0])
            .fold(f32::MIN, f32::max);
        assert_relative_eq!(peak, expected);
        assert_relative_eq!(gradient.dy.get_pixel(10, 5).0[0], 0.0);
    }

    #[test]
    fn rejects_unknown_aperture() {
        assert!(sobel(&FloatImage::new(4, 4), 4).is_err());
    }

    #[test]
    fn canny_thins_step_to_one_column() {
        let edges = canny(&step(20, 10, 10), 100.0, 300.0, 3).unwrap();
        for (x, _, px) in edges.enumerate_pixels() {
            assert_eq!(px.0[0] == FOREGROUND, x == 9, "column {x}");
        }
    }

    #[test]
    fn canny_ignores_flat_image() {
        let edges = canny(&GrayImage::from_pixel(8, 8, Luma([90])), 1.0, 2.0, 3).unwrap();
        assert!(edges.pixels().all(|px| px.0[0] == 0));
    }

    #[test]
    fn weak_edges_need_a_strong_seed() {
        let edges = canny(&step(20, 10, 10), 100.0, 10_000.0, 3).unwrap();
        assert!(edges.pixels().all(|px| px.0[0] == 0));
    }
}
