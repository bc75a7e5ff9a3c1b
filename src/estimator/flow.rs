use crate::{
    config::{FlowFilter, FlowSettings, SharedSettings},
    debug::{DebugChannel, DebugImage, DebugSink, draw_segment},
    error::NoEstimate,
    estimator::{Estimator, duration, time_delta},
    frame::Frame,
    imgproc::{
        corner::{CornerParams, good_features_to_track},
        flow::{LucasKanade, Pyramid, Track, TrackStatus},
    },
    state::{PoseSource, VehicleState},
};
use chrono::{DateTime, Utc};
use image::{GrayImage, Rgb, imageops};
use nalgebra::{Point2, Vector2};
#[cfg(feature = "serde")]
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};
use uom::si::{angle::degree, angular_velocity::radian_per_second, length::meter};

/// Smallest side, in pixels, a frame may have after downscaling.
const MIN_SCALED_SIZE: u32 = 8;

/// Pyramid levels are never built smaller than this.
const MIN_PYRAMID_SIZE: u32 = 8;

/// A horizontal ground velocity in the world frame.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct VelocityEstimate {
    /// Meters per second along world X and Y.
    pub velocity: Vector2<f64>,
    pub variance: f64,
    pub stamp: DateTime<Utc>,
    /// Number of flow vectors that survived filtering.
    pub samples: usize,
}

/// The result of aggregating per point velocities.
#[derive(Clone, Debug, PartialEq)]
pub struct FilteredFlow {
    pub velocity: Vector2<f64>,
    /// Samples that contributed to `velocity`.
    pub inliers: Vec<Vector2<f64>>,
}

impl FilteredFlow {
    /// Mean squared distance of the inliers from `velocity`.
    pub fn variance(&self) -> f64 {
        mean_square_distance(&self.inliers, &self.velocity)
    }
}

fn mean(samples: &[Vector2<f64>]) -> Vector2<f64> {
    samples.iter().sum::<Vector2<f64>>() / samples.len().max(1) as f64
}

fn mean_square_distance(samples: &[Vector2<f64>], center: &Vector2<f64>) -> f64 {
    samples
        .iter()
        .map(|s| (s - center).norm_squared())
        .sum::<f64>()
        / samples.len().max(1) as f64
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    match values.len() % 2 {
        0 if mid > 0 => (values[mid - 1] + values[mid]) / 2.0,
        _ => values.get(mid).copied().unwrap_or(0.0),
    }
}

/// Reduce per point velocities to a single estimate.
///
/// [`FlowFilter::Statistical`] repeatedly drops samples further from the
/// running mean than `threshold` RMS distances until no more are dropped. It
/// gives up as soon as fewer than `min_vectors` samples remain.
pub fn filter_samples(
    samples: &[Vector2<f64>],
    filter: FlowFilter,
    threshold: f64,
    min_vectors: usize,
) -> Result<FilteredFlow, NoEstimate> {
    if samples.is_empty() {
        return Err(NoEstimate::InsufficientSamples {
            found: 0,
            min: min_vectors,
        });
    }

    match filter {
        FlowFilter::Average => Ok(FilteredFlow {
            velocity: mean(samples),
            inliers: samples.to_vec(),
        }),
        FlowFilter::Median => {
            let mut xs: Vec<f64> = samples.iter().map(|s| s.x).collect();
            let mut ys: Vec<f64> = samples.iter().map(|s| s.y).collect();
            Ok(FilteredFlow {
                velocity: Vector2::new(median(&mut xs), median(&mut ys)),
                inliers: samples.to_vec(),
            })
        }
        FlowFilter::Statistical => {
            let mut kept = samples.to_vec();
            loop {
                if kept.len() < min_vectors {
                    return Err(NoEstimate::InsufficientSamples {
                        found: kept.len(),
                        min: min_vectors,
                    });
                }

                let center = mean(&kept);
                let rms = mean_square_distance(&kept, &center).sqrt();
                if rms <= f64::EPSILON {
                    break;
                }

                let before = kept.len();
                kept.retain(|s| (s - center).norm() / rms <= threshold);
                trace!(before, after = kept.len(), rms, "statistical flow filter pass");
                if kept.len() == before {
                    break;
                }
            }

            Ok(FilteredFlow {
                velocity: mean(&kept),
                inliers: kept,
            })
        }
    }
}

/// Everything carried from the last tracked frame to the next.
struct PreviousFrame {
    pyramid: Pyramid,
    gray: GrayImage,
    points: Vec<Point2<f32>>,
    stamp: DateTime<Utc>,
    state: VehicleState,
}

/// Estimates ground velocity from sparse optical flow between consecutive
/// frames.
///
/// Only frames that pass every gate become the reference for the next frame.
pub struct OpticalFlowEstimator<P: PoseSource> {
    settings: SharedSettings<FlowSettings>,
    poses: P,
    previous: Option<PreviousFrame>,
    debug: Option<Arc<dyn DebugSink>>,
}

impl<P: PoseSource> OpticalFlowEstimator<P> {
    pub fn new(settings: SharedSettings<FlowSettings>, poses: P) -> Self {
        Self {
            settings,
            poses,
            previous: None,
            debug: None,
        }
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug = Some(sink);
        self
    }

    pub fn settings(&self) -> &SharedSettings<FlowSettings> {
        &self.settings
    }

    /// Number of features carried into the next frame.
    pub fn tracked_points(&self) -> usize {
        self.previous.as_ref().map_or(0, |p| p.points.len())
    }

    fn gate(&self, settings: &FlowSettings, frame: &Frame) -> Result<VehicleState, NoEstimate> {
        let state = self
            .poses
            .lookup(frame.stamp(), duration(settings.imu_update_timeout))?;

        let error = state.stamp_error(frame.stamp());
        if error > time_delta(settings.allowed_stamp_error) {
            return Err(NoEstimate::StampMismatch { error });
        }

        let altitude = state.altitude.get::<meter>();
        let min_altitude = settings.min_estimation_altitude.get::<meter>();
        if altitude < min_altitude {
            return Err(NoEstimate::BelowMinAltitude {
                altitude_m: altitude,
                min_m: min_altitude,
            });
        }

        let tilt = state.tilt().get::<degree>();
        let max_tilt = settings.max_vertical_angle.get::<degree>();
        if tilt > max_tilt {
            return Err(NoEstimate::ExcessiveTilt {
                tilt_deg: tilt,
                max_deg: max_tilt,
            });
        }

        let rate = state.rotation_rate().get::<radian_per_second>();
        let max_rate = settings.max_rotation_rate.get::<radian_per_second>();
        if rate > max_rate {
            return Err(NoEstimate::ExcessiveRotation { rate, max: max_rate });
        }

        Ok(state)
    }

    fn process(&mut self, frame: &Frame) -> Result<VelocityEstimate, NoEstimate> {
        let settings = self.settings.load();
        let state = self.gate(&settings, frame)?;

        if let Some(previous) = &self.previous {
            if frame.stamp() <= previous.stamp {
                return Err(NoEstimate::NonIncreasingStamp);
            }
        }

        let gray = frame.to_gray();
        let (width, height) = gray.dimensions();
        let dims = (
            (width as f64 * settings.scale_factor).round() as u32,
            (height as f64 * settings.scale_factor).round() as u32,
        );
        if dims.0 < MIN_SCALED_SIZE || dims.1 < MIN_SCALED_SIZE {
            return Err(NoEstimate::DegenerateFrame {
                width: dims.0,
                height: dims.1,
            });
        }
        let gray = match dims == (width, height) {
            true => gray,
            false => imageops::resize(&gray, dims.0, dims.1, imageops::FilterType::Triangle),
        };
        let pyramid = Pyramid::build(&gray, settings.max_level as usize + 1, MIN_PYRAMID_SIZE);

        let Some(previous) = self.previous.take() else {
            let points = detect(&gray, &settings);
            trace!(points = points.len(), "detected initial features");
            self.previous = Some(PreviousFrame {
                pyramid,
                gray,
                points,
                stamp: frame.stamp(),
                state,
            });
            return Err(NoEstimate::FirstFrame);
        };

        let points = match previous.points.len() * 2 < settings.points {
            true => {
                let fresh = detect(&previous.gray, &settings);
                trace!(carried = previous.points.len(), fresh = fresh.len(), "redetected features");
                fresh
            }
            false => previous.points,
        };

        let tracker = LucasKanade::new(settings.win_size, settings.iters, settings.max_level);
        let tracks: Vec<Track> = tracker
            .track(&previous.pyramid, &pyramid, &points)
            .into_iter()
            .filter(|t| t.status == TrackStatus::Tracked)
            .filter(|t| inside_margins(t.from, dims, &settings) && inside_margins(t.to, dims, &settings))
            .collect();

        let dt = (frame.stamp() - previous.stamp)
            .to_std()
            .map_or(0.0, |d| d.as_secs_f64());
        let camera = &settings.camera;
        let (prev_height, height) = (
            previous.state.altitude.get::<meter>(),
            state.altitude.get::<meter>(),
        );
        let velocities: Vec<Vector2<f64>> = tracks
            .iter()
            .filter_map(|t| {
                let from = Point2::new(t.from.x as f64, t.from.y as f64);
                let to = Point2::new(t.to.x as f64, t.to.y as f64);
                let before = camera.ground_offset(from, dims, &previous.state, prev_height)?;
                let after = camera.ground_offset(to, dims, &state, height)?;
                Some((before - after) / dt)
            })
            .collect();

        if let Some(sink) = self.debug.as_ref().filter(|_| settings.debug_vectors) {
            let mut canvas = image::DynamicImage::ImageLuma8(gray.clone()).into_rgb8();
            for t in &tracks {
                let from = Point2::new(t.from.x as f64, t.from.y as f64);
                let to = Point2::new(t.to.x as f64, t.to.y as f64);
                draw_segment(&mut canvas, from, to, Rgb([0, 255, 0]));
            }
            sink.publish(DebugChannel::Vectors, frame.stamp(), DebugImage::Rgb(canvas));
        }

        self.previous = Some(PreviousFrame {
            pyramid,
            gray,
            points: tracks.iter().map(|t| t.to).collect(),
            stamp: frame.stamp(),
            state,
        });

        let filtered = filter_samples(
            &velocities,
            settings.filter,
            settings.filter_threshold,
            settings.min_vectors,
        )?;
        if filtered.inliers.len() < settings.min_vectors {
            return Err(NoEstimate::InsufficientSamples {
                found: filtered.inliers.len(),
                min: settings.min_vectors,
            });
        }

        let variance = filtered.variance();
        if variance > settings.max_filtered_variance {
            return Err(NoEstimate::ExcessiveVariance {
                variance,
                max: settings.max_filtered_variance,
            });
        }

        Ok(VelocityEstimate {
            velocity: filtered.velocity,
            variance: settings.variance + settings.variance_scale * state.angular_velocity.norm(),
            stamp: frame.stamp(),
            samples: filtered.inliers.len(),
        })
    }
}

impl<P: PoseSource> Estimator for OpticalFlowEstimator<P> {
    type Output = VelocityEstimate;
    type Error = NoEstimate;

    fn update(&mut self, frame: &Frame) -> Result<VelocityEstimate, NoEstimate> {
        let result = self.process(frame);
        if let Err(reason) = &result {
            debug!(stamp = %frame.stamp(), %reason, "velocity estimate withheld");
        }
        result
    }
}

fn detect(gray: &GrayImage, settings: &FlowSettings) -> Vec<Point2<f32>> {
    let params = CornerParams {
        max_corners: settings.points,
        quality_level: settings.quality_level,
        min_distance: settings.min_dist,
    };
    good_features_to_track(gray, &params)
}

fn inside_margins(point: Point2<f32>, dims: (u32, u32), settings: &FlowSettings) -> bool {
    let (width, height) = (dims.0 as f64, dims.1 as f64);
    let (mx, my) = (width * settings.x_cutoff, height * settings.y_cutoff);
    let (x, y) = (point.x as f64, point.y as f64);
    x >= mx && x <= width - mx && y >= my && y <= height - my
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LookupError;
    use approx::assert_abs_diff_eq;
    use chrono::TimeDelta;
    use image::{Luma, RgbImage};
    use nalgebra::{UnitQuaternion, Vector3};
    use rstest::rstest;
    use std::time::Duration;
    use uom::si::{angle::radian, f64::Angle};

    /// 90 samples on a small lattice around (1, 0) and eight far outliers.
    fn contaminated() -> Vec<Vector2<f64>> {
        let mut samples = Vec::new();
        for _ in 0..10 {
            for dx in [-0.01, 0.0, 0.01] {
                for dy in [-0.01, 0.0, 0.01] {
                    samples.push(Vector2::new(1.0 + dx, dy));
                }
            }
        }
        for _ in 0..2 {
            for (x, y) in [(50.0, 50.0), (-50.0, 50.0), (50.0, -50.0), (-50.0, -50.0)] {
                samples.push(Vector2::new(x, y));
            }
        }
        samples
    }

    #[test]
    fn statistical_filter_drops_outliers() {
        let filtered = filter_samples(&contaminated(), FlowFilter::Statistical, 2.0, 10).unwrap();
        assert_eq!(filtered.inliers.len(), 90);
        assert_abs_diff_eq!(filtered.velocity.x, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(filtered.velocity.y, 0.0, epsilon = 1e-9);
        assert!(filtered.variance() < 1e-3);
    }

    #[test]
    fn statistical_filter_rejects_when_too_few_survive() {
        let result = filter_samples(&contaminated(), FlowFilter::Statistical, 2.0, 95);
        assert_eq!(result, Err(NoEstimate::InsufficientSamples { found: 90, min: 95 }));
    }

    #[test]
    fn statistical_filter_keeps_identical_samples() {
        let samples = vec![Vector2::new(0.2, -0.1); 12];
        let filtered = filter_samples(&samples, FlowFilter::Statistical, 2.0, 10).unwrap();
        assert_eq!(filtered.inliers.len(), 12);
        assert_eq!(filtered.velocity, Vector2::new(0.2, -0.1));
    }

    #[rstest]
    #[case(FlowFilter::Average, Vector2::new(11.0, 1.0))]
    #[case(FlowFilter::Median, Vector2::new(2.0, 1.0))]
    fn simple_filters(#[case] filter: FlowFilter, #[case] expected: Vector2<f64>) {
        let samples = [
            Vector2::new(1.0, 1.0),
            Vector2::new(2.0, 0.0),
            Vector2::new(30.0, 2.0),
        ];
        let filtered = filter_samples(&samples, filter, 2.0, 1).unwrap();
        assert_abs_diff_eq!(filtered.velocity, expected, epsilon = 1e-12);
        assert_eq!(filtered.inliers.len(), 3);
    }

    #[test]
    fn no_samples_is_insufficient() {
        assert_eq!(
            filter_samples(&[], FlowFilter::Average, 2.0, 3),
            Err(NoEstimate::InsufficientSamples { found: 0, min: 3 })
        );
    }

    #[test]
    fn median_of_even_count_averages_middle() {
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
    }

    /// Answers every lookup with a copy of one state stamped as requested.
    struct Steady(VehicleState);

    impl PoseSource for Steady {
        fn lookup(&self, stamp: DateTime<Utc>, _: Duration) -> Result<VehicleState, LookupError> {
            Ok(VehicleState { stamp, ..self.0 })
        }
    }

    fn stamp(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::milliseconds(ms)
    }

    fn level(altitude: f64) -> VehicleState {
        VehicleState::level(
            stamp(0),
            Vector3::new(0.0, 0.0, altitude),
            Angle::new::<radian>(0.0),
        )
    }

    /// Blocks of pseudo random brightness.
    fn textured(ms: i64) -> Frame {
        let gray = GrayImage::from_fn(240, 180, |x, y| {
            let (cx, cy) = ((x / 12) as u64, (y / 12) as u64);
            let hash = (cx * 73_856_093) ^ (cy * 19_349_663);
            Luma([[30, 90, 160, 230][(hash % 4) as usize]])
        });
        let rgb = image::DynamicImage::ImageLuma8(gray).into_rgb8();
        Frame::new(rgb, stamp(ms))
    }

    fn estimator(state: VehicleState) -> OpticalFlowEstimator<Steady> {
        let settings = SharedSettings::new(FlowSettings::default()).unwrap();
        OpticalFlowEstimator::new(settings, Steady(state))
    }

    #[test]
    fn first_frame_has_no_estimate() {
        let mut flow = estimator(level(1.0));
        assert_eq!(flow.update(&textured(0)), Err(NoEstimate::FirstFrame));
        assert!(flow.tracked_points() > 0);
    }

    #[test]
    fn identical_frames_are_stationary() {
        let mut flow = estimator(level(1.0));
        assert_eq!(flow.update(&textured(0)), Err(NoEstimate::FirstFrame));

        let estimate = flow.update(&textured(100)).unwrap();
        assert_abs_diff_eq!(estimate.velocity.x, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(estimate.velocity.y, 0.0, epsilon = 1e-6);
        assert!(estimate.samples >= 10);
        assert_abs_diff_eq!(estimate.variance, 0.01, epsilon = 1e-12);
    }

    #[test]
    fn repeated_stamp_is_rejected() {
        let mut flow = estimator(level(1.0));
        let _ = flow.update(&textured(50));
        assert_eq!(flow.update(&textured(50)), Err(NoEstimate::NonIncreasingStamp));
        assert_eq!(flow.update(&textured(40)), Err(NoEstimate::NonIncreasingStamp));
    }

    #[test]
    fn low_altitude_leaves_state_untouched() {
        let mut flow = estimator(level(0.1));
        assert!(matches!(
            flow.update(&textured(0)),
            Err(NoEstimate::BelowMinAltitude { .. })
        ));
        assert_eq!(flow.tracked_points(), 0);
    }

    #[test]
    fn tilted_camera_is_gated() {
        let mut state = level(1.0);
        state.attitude = UnitQuaternion::from_euler_angles(0.0, 40f64.to_radians(), 0.0);
        let result = estimator(state).update(&textured(0));
        assert!(matches!(result, Err(NoEstimate::ExcessiveTilt { .. })), "{result:?}");
    }

    #[test]
    fn fast_rotation_is_gated() {
        let mut state = level(1.0);
        state.angular_velocity = Vector3::new(0.0, 0.0, 2.0);
        let result = estimator(state).update(&textured(0));
        assert_eq!(result, Err(NoEstimate::ExcessiveRotation { rate: 2.0, max: 1.0 }));
    }

    #[test]
    fn tiny_frame_is_degenerate() {
        let mut flow = estimator(level(1.0));
        let frame = Frame::new(RgbImage::new(10, 10), stamp(0));
        assert_eq!(
            flow.update(&frame),
            Err(NoEstimate::DegenerateFrame { width: 5, height: 5 })
        );
    }

    #[test]
    fn margins_exclude_border() {
        let settings = FlowSettings::default();
        assert!(inside_margins(Point2::new(50.0, 50.0), (100, 100), &settings));
        assert!(!inside_margins(Point2::new(2.0, 50.0), (100, 100), &settings));
        assert!(!inside_margins(Point2::new(50.0, 97.0), (100, 100), &settings));
    }
}
