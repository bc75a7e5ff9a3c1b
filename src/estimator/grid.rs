use crate::{
    config::{GridSettings, SharedSettings},
    debug::{DebugChannel, DebugImage, DebugSink, draw_line},
    error::NoEstimate,
    estimator::{Estimator, duration, time_delta},
    frame::Frame,
    imgproc::{
        edge::canny,
        hough::{HoughLine, HoughParams, hough_lines},
    },
    state::PoseSource,
};
use chrono::{DateTime, Utc};
use image::{Rgb, imageops};
use nalgebra::Vector2;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::Serialize;
use std::{
    f64::consts::{FRAC_PI_2, FRAC_PI_4, PI, TAU},
    sync::Arc,
};
use tracing::{debug, trace};
use uom::si::{
    angle::radian,
    f64::{Angle, Length},
    length::meter,
};

/// Smallest side, in pixels, a frame may have after scaling.
const MIN_SCALED_SIZE: u32 = 8;

/// Weight of the newest inlier ratio in the rolling confidence.
const CONFIDENCE_GAIN: f64 = 0.5;

/// Current belief about where the grid sits relative to the looked-up pose.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridHypothesis {
    /// Yaw error of the looked-up heading, in [-pi/4, pi/4).
    pub theta: f64,
    /// Distance from the camera to the nearest line of each family, modulo
    /// the grid spacing.
    pub offset: Vector2<f64>,
    pub confidence: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PoseEstimate {
    pub position: Vector2<f64>,
    pub yaw: Angle,
    pub confidence: f64,
    pub stamp: DateTime<Utc>,
}

/// A line on the floor relative to the camera, in a world aligned frame.
///
/// Points `p` on the line satisfy `p . (cos normal, sin normal) = distance`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GroundLine {
    pub normal: f64,
    pub distance: f64,
}

impl GroundLine {
    /// Convert a line found in an image whose ground resolution is
    /// `pixels_per_meter` and whose up direction points along `yaw`.
    pub fn from_hough(line: &HoughLine, dims: (u32, u32), pixels_per_meter: f64, yaw: f64) -> Self {
        let (cx, cy) = (dims.0 as f64 / 2.0, dims.1 as f64 / 2.0);
        let (sin, cos) = line.theta.sin_cos();
        let centered = line.rho - cx * cos - cy * sin;
        // Flipping the image Y axis mirrors the normal angle.
        Self {
            normal: -line.theta + yaw,
            distance: centered / pixels_per_meter,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Axis {
    /// Lines of constant world X.
    X,
    /// Lines of constant world Y.
    Y,
}

impl Axis {
    fn index(&self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
        }
    }
}

/// `value` modulo `period`, in [0, period).
fn modulo(value: f64, period: f64) -> f64 {
    let r = value.rem_euclid(period);
    // rem_euclid rounds tiny negative values up to `period`.
    if r >= period { 0.0 } else { r }
}

/// Wrap an angle into [-pi/4, pi/4).
pub(crate) fn wrap_quarter(angle: f64) -> f64 {
    modulo(angle + FRAC_PI_4, FRAC_PI_2) - FRAC_PI_4
}

/// Distance between `a` and `b` on a circle of circumference `period`.
fn circular_distance(a: f64, b: f64, period: f64) -> f64 {
    let d = (a - b).rem_euclid(period);
    d.min(period - d)
}

/// Mean of values defined modulo `period`, in [0, period).
///
/// Returns `None` for an empty slice or when the values cancel out.
pub fn circular_mean(values: &[f64], period: f64) -> Option<f64> {
    let (sin, cos) = values.iter().fold((0.0, 0.0), |(s, c), v| {
        let (vs, vc) = (TAU * v / period).sin_cos();
        (s + vs, c + vc)
    });
    if sin.hypot(cos) < 1e-9 {
        return None;
    }
    Some(modulo(period * sin.atan2(cos) / TAU, period))
}

/// Assign a line to an axis family given a candidate yaw error `theta`.
///
/// Returns the family, the orientation residual and the signed distance
/// along the family's positive axis.
fn classify(line: &GroundLine, theta: f64) -> (Axis, f64, f64) {
    let mut phi = (line.normal - theta + PI).rem_euclid(TAU) - PI;
    let mut d = line.distance;
    if phi > FRAC_PI_2 {
        phi -= PI;
        d = -d;
    } else if phi <= -FRAC_PI_2 {
        phi += PI;
        d = -d;
    }

    if phi.abs() < FRAC_PI_4 {
        (Axis::X, phi, d)
    } else if phi < 0.0 {
        (Axis::Y, phi + FRAC_PI_2, -d)
    } else {
        (Axis::Y, phi - FRAC_PI_2, d)
    }
}

/// Search parameters derived from one settings snapshot.
#[derive(Clone, Copy, Debug)]
pub(crate) struct GridSearch {
    pub spacing: f64,
    /// Half width of the band around a grid line that edges may fall in.
    pub band: f64,
    pub grid_step: f64,
    pub theta_step: f64,
    /// Largest orientation residual of a scoring line.
    pub tolerance: f64,
    pub mean_iterations: u32,
}

impl GridSearch {
    pub fn new(settings: &GridSettings) -> Self {
        let spacing = settings.grid_spacing.get::<meter>();
        let grid_step = settings.grid_step.get::<meter>();
        let theta_step = settings.theta_step.get::<radian>();
        // One pixel for edge localization on either side of the painted line.
        let pixel = 1.0 / settings.camera.pixels_per_meter;
        Self {
            spacing,
            band: settings.grid_line_thickness.get::<meter>() / 2.0 + grid_step / 2.0 + pixel,
            grid_step,
            theta_step,
            tolerance: theta_step.max(settings.hough_theta_resolution.get::<radian>()),
            mean_iterations: settings.grid_translation_mean_iterations,
        }
    }

    fn count_near(&self, distances: &[f64], offset: f64) -> usize {
        distances
            .iter()
            .filter(|d| circular_distance(**d, offset, self.spacing) <= self.band)
            .count()
    }

    /// Offset with the most distances inside its band. Ties go to the
    /// smallest offset.
    fn best_offset(&self, distances: &[f64]) -> (f64, usize) {
        let steps = (self.spacing / self.grid_step).ceil() as usize;
        (0..steps)
            .map(|i| i as f64 * self.grid_step)
            .map(|offset| (offset, self.count_near(distances, offset)))
            .fold((0.0, 0), |best, next| if next.1 > best.1 { next } else { best })
    }

    /// Score one candidate orientation.
    fn score(&self, lines: &[GroundLine], theta: f64) -> Candidate {
        let mut distances = [Vec::new(), Vec::new()];
        for line in lines {
            let (axis, residual, d) = classify(line, theta);
            if residual.abs() <= self.tolerance {
                distances[axis.index()].push(d);
            }
        }

        let (ox, nx) = self.best_offset(&distances[0]);
        let (oy, ny) = self.best_offset(&distances[1]);
        Candidate {
            theta,
            score: nx + ny,
            offset: Vector2::new(ox, oy),
        }
    }

    /// Find the orientation and offsets that explain the most lines.
    ///
    /// Orientations are tried in `center +- half_width` and scored in
    /// parallel. The winner is refined by averaging the residuals of its
    /// inliers and then by iterated circular means of their offsets.
    pub fn fit(&self, lines: &[GroundLine], center: f64, half_width: f64) -> Option<GridFit> {
        let steps = (half_width / self.theta_step).floor() as i64;
        let best = (-steps..=steps)
            .into_par_iter()
            .map(|i| center + i as f64 * self.theta_step)
            .map(|theta| self.score(lines, theta))
            .reduce_with(|a, b| match b.better_than(&a, center) {
                true => b,
                false => a,
            })?;

        if best.score == 0 {
            return None;
        }

        let inliers = |theta: f64, offset: &Vector2<f64>| {
            let mut found: [Vec<(f64, f64)>; 2] = [Vec::new(), Vec::new()];
            for line in lines {
                let (axis, residual, d) = classify(line, theta);
                let i = axis.index();
                if residual.abs() <= self.tolerance
                    && circular_distance(d, offset[i], self.spacing) <= self.band
                {
                    found[i].push((residual, d));
                }
            }
            found
        };

        let coarse = inliers(best.theta, &best.offset);
        let residuals: Vec<f64> = coarse.iter().flatten().map(|(r, _)| *r).collect();
        let theta = best.theta + residuals.iter().sum::<f64>() / residuals.len().max(1) as f64;

        let mut offset = best.offset;
        let mut found = inliers(theta, &offset);
        for _ in 0..self.mean_iterations {
            for i in 0..2 {
                let distances: Vec<f64> = found[i].iter().map(|(_, d)| *d).collect();
                if let Some(mean) = circular_mean(&distances, self.spacing) {
                    offset[i] = mean;
                }
            }
            found = inliers(theta, &offset);
        }

        Some(GridFit {
            theta,
            offset,
            inliers: [found[0].len(), found[1].len()],
        })
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    theta: f64,
    score: usize,
    offset: Vector2<f64>,
}

impl Candidate {
    /// Higher score wins. Ties go to the orientation nearer `center`, then to
    /// the smaller orientation.
    fn better_than(&self, other: &Candidate, center: f64) -> bool {
        let spread = |c: &Candidate| (c.theta - center).abs();
        match self.score.cmp(&other.score) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match spread(self).total_cmp(&spread(other)) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => self.theta < other.theta,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct GridFit {
    pub theta: f64,
    pub offset: Vector2<f64>,
    pub inliers: [usize; 2],
}

/// Orientation window `(center, half_width)` to search.
///
/// With a hypothesis, lines whose orientation strays from it by more than
/// `limit` are dropped and the window narrows to `limit`.
fn warm_start(lines: &mut Vec<GroundLine>, hypothesis: Option<&GridHypothesis>, limit: f64) -> (f64, f64) {
    match hypothesis {
        Some(hypothesis) => {
            lines.retain(|line| {
                let (_, residual, _) = classify(line, hypothesis.theta);
                residual.abs() <= limit
            });
            (hypothesis.theta, limit)
        }
        None => (0.0, FRAC_PI_4),
    }
}

/// Place `value`, known modulo `period`, in the period nearest `reference`.
fn unwrap_near(value: f64, reference: f64, period: f64) -> f64 {
    value + period * ((reference - value) / period).round()
}

/// Localizes the vehicle against the painted floor grid.
///
/// Carries a [`GridHypothesis`] between frames to narrow the orientation
/// search. Frames that are gated or fail to fit leave it untouched.
pub struct GridLineEstimator<P: PoseSource> {
    settings: SharedSettings<GridSettings>,
    poses: P,
    hypothesis: Option<GridHypothesis>,
    debug: Option<Arc<dyn DebugSink>>,
}

impl<P: PoseSource> GridLineEstimator<P> {
    pub fn new(settings: SharedSettings<GridSettings>, poses: P) -> Self {
        Self {
            settings,
            poses,
            hypothesis: None,
            debug: None,
        }
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug = Some(sink);
        self
    }

    pub fn hypothesis(&self) -> Option<&GridHypothesis> {
        self.hypothesis.as_ref()
    }

    pub fn settings(&self) -> &SharedSettings<GridSettings> {
        &self.settings
    }

    fn process(&mut self, frame: &Frame) -> Result<PoseEstimate, NoEstimate> {
        let settings = self.settings.load();
        let state = self
            .poses
            .lookup(frame.stamp(), duration(settings.lookup_timeout))?;

        let error = state.stamp_error(frame.stamp());
        if error > time_delta(settings.allowed_position_stamp_error) {
            return Err(NoEstimate::StampMismatch { error });
        }

        let altitude = state.altitude.get::<meter>();
        let min_altitude = settings.min_extraction_altitude.get::<meter>();
        if altitude < min_altitude {
            return Err(NoEstimate::BelowMinAltitude {
                altitude_m: altitude,
                min_m: min_altitude,
            });
        }

        let gray = frame.to_gray();
        let (width, height) = gray.dimensions();
        let ppm = settings.camera.pixels_per_meter;
        let factor = ppm / settings.camera.ground_resolution(width, Length::new::<meter>(altitude));
        let scaled_dims = (
            (width as f64 * factor).round() as u32,
            (height as f64 * factor).round() as u32,
        );
        if scaled_dims.0 < MIN_SCALED_SIZE || scaled_dims.1 < MIN_SCALED_SIZE {
            return Err(NoEstimate::DegenerateFrame {
                width: scaled_dims.0,
                height: scaled_dims.1,
            });
        }
        let scaled = match scaled_dims == (width, height) {
            true => gray,
            false => imageops::resize(&gray, scaled_dims.0, scaled_dims.1, imageops::FilterType::Triangle),
        };

        let high = settings.canny_high_threshold as f32;
        let low = high / settings.canny_threshold_ratio as f32;
        let edges = canny(&scaled, low, high, settings.canny_sobel_size)?;

        let hough = HoughParams {
            rho_resolution: settings.hough_rho_resolution,
            theta_resolution: settings.hough_theta_resolution.get::<radian>(),
            threshold: (settings.hough_thresh_fraction * scaled_dims.0.min(scaled_dims.1) as f64) as u32,
        };
        let detected = hough_lines(&edges, &hough);
        trace!(lines = detected.len(), "hough lines");

        if let Some(sink) = &self.debug {
            if settings.debug_edges {
                sink.publish(DebugChannel::Edges, frame.stamp(), DebugImage::Gray(edges.clone()));
            }
            if settings.debug_lines {
                let mut canvas = image::DynamicImage::ImageLuma8(edges.clone()).into_rgb8();
                for line in &detected {
                    draw_line(&mut canvas, line.rho, line.theta, Rgb([255, 0, 0]));
                }
                sink.publish(DebugChannel::Lines, frame.stamp(), DebugImage::Rgb(canvas));
            }
        }

        let yaw = state.yaw().get::<radian>();
        let mut lines: Vec<GroundLine> = detected
            .iter()
            .map(|line| GroundLine::from_hough(line, scaled_dims, ppm, yaw))
            .collect();

        let search = GridSearch::new(&settings);
        let window = warm_start(
            &mut lines,
            self.hypothesis.as_ref(),
            settings.line_rejection_angle_threshold.get::<radian>(),
        );

        let total = lines.len();
        let fit = search
            .fit(&lines, window.0, window.1)
            .ok_or(NoEstimate::InsufficientLines { found: 0 })?;
        let found = fit.inliers[0] + fit.inliers[1];
        if fit.inliers.iter().any(|n| *n == 0) {
            return Err(NoEstimate::InsufficientLines { found });
        }

        let spacing = search.spacing;
        let zero = Vector2::new(
            settings.grid_zero_offset.0.get::<meter>(),
            settings.grid_zero_offset.1.get::<meter>(),
        );
        let position = Vector2::new(
            unwrap_near(zero.x - fit.offset.x, state.position.x, spacing),
            unwrap_near(zero.y - fit.offset.y, state.position.y, spacing),
        );

        let ratio = found as f64 / total.max(1) as f64;
        let confidence = match &self.hypothesis {
            Some(h) => (1.0 - CONFIDENCE_GAIN) * h.confidence + CONFIDENCE_GAIN * ratio,
            None => ratio,
        };
        self.hypothesis = Some(GridHypothesis {
            theta: wrap_quarter(fit.theta),
            offset: fit.offset,
            confidence,
        });

        let yaw = (yaw - fit.theta + PI).rem_euclid(TAU) - PI;
        debug!(
            lines = total,
            inliers = found,
            x = position.x,
            y = position.y,
            yaw,
            "grid fit"
        );

        Ok(PoseEstimate {
            position,
            yaw: Angle::new::<radian>(yaw),
            confidence,
            stamp: frame.stamp(),
        })
    }
}

impl<P: PoseSource> Estimator for GridLineEstimator<P> {
    type Output = PoseEstimate;
    type Error = NoEstimate;

    /// Estimate the vehicle's planar pose from one frame.
    fn update(&mut self, frame: &Frame) -> Result<PoseEstimate, NoEstimate> {
        let result = self.process(frame);
        if let Err(reason) = &result {
            debug!(stamp = %frame.stamp(), %reason, "grid estimate withheld");
        }
        result
    }
}
