use crate::imgproc::{FloatImage, interpolate_bilinear, to_float};
use image::{GrayImage, imageops};
use nalgebra::{Point2, Vector2};
use rayon::prelude::*;

/// Updates smaller than this many pixels end the iteration at a level.
const EPSILON: f32 = 0.01;

/// Determinant below which a window has too little texture to track.
const MIN_DETERMINANT: f32 = 1e-6;

/// Images at successively halved resolutions, finest first.
pub struct Pyramid {
    pub levels: Vec<FloatImage>,
}

impl Pyramid {
    /// Build up to `num_levels` levels. Stops early once a level would be
    /// smaller than `min_size` on either side.
    pub fn build(gray: &GrayImage, num_levels: usize, min_size: u32) -> Self {
        let mut images = vec![gray.clone()];
        while images.len() < num_levels.max(1) {
            let Some(prev) = images.last() else {
                break;
            };
            let (width, height) = (prev.width() / 2, prev.height() / 2);
            if width < min_size || height < min_size {
                break;
            }
            let next = imageops::resize(prev, width, height, imageops::FilterType::Triangle);
            images.push(next);
        }

        Self {
            levels: images.iter().map(to_float).collect(),
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrackStatus {
    Tracked,
    Lost,
    OutOfBounds,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Track {
    pub from: Point2<f32>,
    pub to: Point2<f32>,
    pub status: TrackStatus,
}

impl Track {
    pub fn displacement(&self) -> Vector2<f32> {
        self.to - self.from
    }
}

/// Pyramidal Lucas-Kanade tracker with forward additive updates.
#[derive(Clone, Copy, Debug)]
pub struct LucasKanade {
    /// Half width of the square window.
    pub half_window: usize,
    pub max_iterations: usize,
    pub max_levels: usize,
}

enum LevelResult {
    Converged(Vector2<f32>),
    Singular,
}

impl LucasKanade {
    pub fn new(win_size: u32, max_iterations: u32, max_level: u32) -> Self {
        Self {
            half_window: (win_size / 2).max(1) as usize,
            max_iterations: max_iterations.max(1) as usize,
            max_levels: max_level as usize + 1,
        }
    }

    /// Track every point from `prev` into `curr`. Points are tracked in
    /// parallel and the output keeps the input order.
    pub fn track(&self, prev: &Pyramid, curr: &Pyramid, points: &[Point2<f32>]) -> Vec<Track> {
        let levels = self
            .max_levels
            .min(prev.num_levels())
            .min(curr.num_levels());

        points
            .par_iter()
            .map(|&point| self.track_point(prev, curr, point, levels))
            .collect()
    }

    fn track_point(&self, prev: &Pyramid, curr: &Pyramid, point: Point2<f32>, levels: usize) -> Track {
        let mut d = Vector2::zeros();
        for level in (0..levels).rev() {
            let scale = 1.0 / (1u32 << level) as f32;
            let at = point * scale;
            match self.iterate(&prev.levels[level], &curr.levels[level], at, d) {
                LevelResult::Converged(update) => d = update,
                LevelResult::Singular => {
                    return Track {
                        from: point,
                        to: point + d / scale,
                        status: TrackStatus::Lost,
                    };
                }
            }
            if level > 0 {
                d *= 2.0;
            }
        }

        let to = point + d;
        let (width, height) = prev.levels[0].dimensions();
        let inside = to.x >= 0.0 && to.y >= 0.0 && to.x < width as f32 && to.y < height as f32;
        Track {
            from: point,
            to,
            status: if inside {
                TrackStatus::Tracked
            } else {
                TrackStatus::OutOfBounds
            },
        }
    }

    fn iterate(
        &self,
        prev: &FloatImage,
        curr: &FloatImage,
        at: Point2<f32>,
        mut d: Vector2<f32>,
    ) -> LevelResult {
        let half = self.half_window as isize;
        for _ in 0..self.max_iterations {
            let (mut h00, mut h01, mut h11) = (0.0f32, 0.0f32, 0.0f32);
            let (mut b0, mut b1) = (0.0f32, 0.0f32);
            for py in -half..=half {
                for px in -half..=half {
                    let (tx, ty) = (at.x + px as f32, at.y + py as f32);
                    let template = interpolate_bilinear(prev, tx, ty);

                    let (wx, wy) = (tx + d.x, ty + d.y);
                    let error = template - interpolate_bilinear(curr, wx, wy);
                    let gx = 0.5
                        * (interpolate_bilinear(curr, wx + 1.0, wy)
                            - interpolate_bilinear(curr, wx - 1.0, wy));
                    let gy = 0.5
                        * (interpolate_bilinear(curr, wx, wy + 1.0)
                            - interpolate_bilinear(curr, wx, wy - 1.0));

                    h00 += gx * gx;
                    h01 += gx * gy;
                    h11 += gy * gy;
                    b0 += gx * error;
                    b1 += gy * error;
                }
            }

            let det = h00 * h11 - h01 * h01;
            if det.abs() < MIN_DETERMINANT {
                return LevelResult::Singular;
            }

            let step = Vector2::new(h11 * b0 - h01 * b1, h00 * b1 - h01 * b0) / det;
            d += step;
            if step.norm_squared() < EPSILON * EPSILON {
                break;
            }
        }
        LevelResult::Converged(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imgproc::corner::{CornerParams, good_features_to_track};
    use image::Luma;

    /// Bright squares on a dark background, shifted by `(sx, sy)`.
    fn scene(sx: u32, sy: u32) -> GrayImage {
        let squares = [(35, 35, 15), (70, 35, 12), (35, 70, 18), (70, 65, 14)];
        GrayImage::from_fn(120, 120, |x, y| {
            let lit = squares.iter().any(|&(x0, y0, size)| {
                (x0 + sx..x0 + sx + size).contains(&x) && (y0 + sy..y0 + sy + size).contains(&y)
            });
            Luma([if lit { 200 } else { 30 }])
        })
    }

    fn corners(image: &GrayImage) -> Vec<Point2<f32>> {
        let params = CornerParams {
            max_corners: 50,
            quality_level: 0.05,
            min_distance: 4.0,
        };
        good_features_to_track(image, &params)
    }

    #[test]
    fn pyramid_halves_each_level() {
        let pyramid = Pyramid::build(&scene(0, 0), 4, 8);
        let sizes: Vec<_> = pyramid.levels.iter().map(|l| l.dimensions()).collect();
        assert_eq!(sizes, vec![(120, 120), (60, 60), (30, 30), (15, 15)]);
    }

    #[test]
    fn pyramid_stops_at_min_size() {
        let pyramid = Pyramid::build(&scene(0, 0), 10, 20);
        assert_eq!(pyramid.num_levels(), 3);
    }

    #[test]
    fn tracks_shifted_scene() {
        let (a, b) = (scene(0, 0), scene(3, 2));
        let points = corners(&a);
        assert!(!points.is_empty());

        let tracker = LucasKanade::new(15, 30, 1);
        let tracks = tracker.track(&Pyramid::build(&a, 2, 8), &Pyramid::build(&b, 2, 8), &points);

        let good: Vec<_> = tracks
            .iter()
            .filter(|t| t.status == TrackStatus::Tracked)
            .filter(|t| (t.displacement() - Vector2::new(3.0, 2.0)).norm() < 0.5)
            .collect();
        assert!(good.len() * 2 >= tracks.len(), "{} of {} tracked", good.len(), tracks.len());
    }

    #[test]
    fn identical_frames_do_not_move() {
        let image = scene(0, 0);
        let pyramid = Pyramid::build(&image, 3, 8);
        let tracks = LucasKanade::new(15, 30, 2).track(&pyramid, &pyramid, &corners(&image));
        for track in tracks.iter().filter(|t| t.status == TrackStatus::Tracked) {
            assert!(track.displacement().norm() < 1e-3);
        }
    }

    #[test]
    fn flat_window_is_lost() {
        let flat = GrayImage::from_pixel(40, 40, Luma([50]));
        let pyramid = Pyramid::build(&flat, 1, 8);
        let tracks = LucasKanade::new(7, 10, 0).track(&pyramid, &pyramid, &[Point2::new(20.0, 20.0)]);
        assert_eq!(tracks[0].status, TrackStatus::Lost);
    }
}
