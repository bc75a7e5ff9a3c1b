use crate::{camera::CameraGeometry, error::ConfigError, imgproc::color::Hsv};
use parking_lot::RwLock;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uom::si::{
    angle::degree,
    angular_velocity::radian_per_second,
    f64::{Angle, AngularVelocity, Length, Time},
    length::meter,
    time::{millisecond, second},
};

const SOBEL_APERTURES: &[u32] = &[3, 5, 7];

/// Settings that can reject themselves before an estimator ever sees them.
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// An immutable settings snapshot that can be replaced between frames.
///
/// Readers clone the inner `Arc` once per call and keep using it even if a
/// writer stores a new value in the meantime.
#[derive(Debug)]
pub struct SharedSettings<T> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T: Validate> SharedSettings<T> {
    pub fn new(settings: T) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        })
    }

    /// The current snapshot.
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&*self.inner.read())
    }

    /// Replace the snapshot. Invalid settings leave the current one in place.
    pub fn store(&self, settings: T) -> Result<(), ConfigError> {
        settings.validate()?;
        *self.inner.write() = Arc::new(settings);
        Ok(())
    }
}

impl<T> Clone for SharedSettings<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GridSettings {
    pub camera: CameraGeometry,

    pub canny_high_threshold: f64,
    /// Low threshold is `canny_high_threshold / canny_threshold_ratio`.
    pub canny_threshold_ratio: f64,
    pub canny_sobel_size: u32,

    /// Distance resolution of the accumulator in pixels.
    pub hough_rho_resolution: f64,
    pub hough_theta_resolution: Angle,
    /// Votes needed as a fraction of the smaller image dimension.
    pub hough_thresh_fraction: f64,

    pub grid_spacing: Length,
    pub grid_line_thickness: Length,
    /// World coordinates of a grid line intersection.
    pub grid_zero_offset: (Length, Length),

    pub theta_step: Angle,
    pub grid_step: Length,
    pub grid_translation_mean_iterations: u32,
    pub line_rejection_angle_threshold: Angle,

    pub min_extraction_altitude: Length,
    pub allowed_position_stamp_error: Time,
    pub lookup_timeout: Time,

    pub debug_edges: bool,
    pub debug_lines: bool,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            camera: CameraGeometry::default(),
            canny_high_threshold: 35_000.0,
            canny_threshold_ratio: 3.5,
            canny_sobel_size: 7,
            hough_rho_resolution: 1.0,
            hough_theta_resolution: Angle::new::<degree>(1.0),
            hough_thresh_fraction: 0.25,
            grid_spacing: Length::new::<meter>(1.0),
            grid_line_thickness: Length::new::<meter>(0.05),
            grid_zero_offset: (Length::new::<meter>(0.0), Length::new::<meter>(0.0)),
            theta_step: Angle::new::<degree>(0.5),
            grid_step: Length::new::<meter>(0.01),
            grid_translation_mean_iterations: 3,
            line_rejection_angle_threshold: Angle::new::<degree>(10.0),
            min_extraction_altitude: Length::new::<meter>(1.0),
            allowed_position_stamp_error: Time::new::<second>(0.1),
            lookup_timeout: Time::new::<millisecond>(50.0),
            debug_edges: false,
            debug_lines: false,
        }
    }
}

impl Validate for GridSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        self.camera.validate()?;
        ConfigError::positive("canny_high_threshold", self.canny_high_threshold)?;
        ConfigError::positive("canny_threshold_ratio", self.canny_threshold_ratio)?;
        if !SOBEL_APERTURES.contains(&self.canny_sobel_size) {
            return Err(ConfigError::Unsupported {
                name: "canny_sobel_size",
                value: self.canny_sobel_size,
                allowed: SOBEL_APERTURES,
            });
        }
        ConfigError::positive("hough_rho_resolution", self.hough_rho_resolution)?;
        ConfigError::within(
            "hough_theta_resolution",
            self.hough_theta_resolution.get::<degree>(),
            1e-3,
            45.0,
        )?;
        ConfigError::within("hough_thresh_fraction", self.hough_thresh_fraction, 0.0, 1.0)?;
        ConfigError::positive("grid_spacing", self.grid_spacing.get::<meter>())?;
        ConfigError::within(
            "grid_line_thickness",
            self.grid_line_thickness.get::<meter>(),
            0.0,
            self.grid_spacing.get::<meter>(),
        )?;
        ConfigError::within("theta_step", self.theta_step.get::<degree>(), 1e-3, 45.0)?;
        ConfigError::within(
            "grid_step",
            self.grid_step.get::<meter>(),
            1e-6,
            self.grid_spacing.get::<meter>(),
        )?;
        ConfigError::within(
            "line_rejection_angle_threshold",
            self.line_rejection_angle_threshold.get::<degree>(),
            0.0,
            45.0,
        )?;
        ConfigError::within(
            "min_extraction_altitude",
            self.min_extraction_altitude.get::<meter>(),
            0.0,
            f64::MAX,
        )?;
        ConfigError::within(
            "allowed_position_stamp_error",
            self.allowed_position_stamp_error.get::<second>(),
            0.0,
            f64::MAX,
        )?;
        ConfigError::within("lookup_timeout", self.lookup_timeout.get::<second>(), 0.0, 60.0)
    }
}

/// How per point velocities are reduced to one estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FlowFilter {
    Average,
    /// Component-wise median.
    Median,
    /// Mean after iteratively discarding samples far from the running mean.
    Statistical,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlowSettings {
    pub camera: CameraGeometry,

    /// Maximum number of corners to track.
    pub points: usize,
    pub quality_level: f64,
    /// Minimum distance between corners in downscaled pixels.
    pub min_dist: f64,
    pub win_size: u32,
    pub max_level: u32,
    pub iters: u32,
    /// Frames are resized by this factor before tracking.
    pub scale_factor: f64,

    pub imu_update_timeout: Time,
    pub allowed_stamp_error: Time,

    /// Base variance reported with every estimate.
    pub variance: f64,
    /// Additional variance per rad/s of body rotation.
    pub variance_scale: f64,

    /// Margin on either side of the image, as a fraction of width, in which
    /// tracked points are ignored.
    pub x_cutoff: f64,
    pub y_cutoff: f64,

    pub max_rotation_rate: AngularVelocity,
    pub max_vertical_angle: Angle,
    pub min_estimation_altitude: Length,

    pub filter: FlowFilter,
    /// Samples further than this many RMS distances from the mean are dropped.
    pub filter_threshold: f64,
    pub min_vectors: usize,
    pub max_filtered_variance: f64,

    pub debug_vectors: bool,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            camera: CameraGeometry::default(),
            points: 100,
            quality_level: 0.01,
            min_dist: 8.0,
            win_size: 21,
            max_level: 3,
            iters: 30,
            scale_factor: 0.5,
            imu_update_timeout: Time::new::<millisecond>(50.0),
            allowed_stamp_error: Time::new::<second>(0.1),
            variance: 0.01,
            variance_scale: 0.1,
            x_cutoff: 0.05,
            y_cutoff: 0.05,
            max_rotation_rate: AngularVelocity::new::<radian_per_second>(1.0),
            max_vertical_angle: Angle::new::<degree>(30.0),
            min_estimation_altitude: Length::new::<meter>(0.3),
            filter: FlowFilter::Statistical,
            filter_threshold: 2.0,
            min_vectors: 10,
            max_filtered_variance: 0.5,
            debug_vectors: false,
        }
    }
}

impl Validate for FlowSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        self.camera.validate()?;
        ConfigError::positive("points", self.points as f64)?;
        ConfigError::within("quality_level", self.quality_level, 1e-6, 1.0)?;
        ConfigError::within("min_dist", self.min_dist, 0.0, f64::MAX)?;
        ConfigError::positive("win_size", self.win_size as f64)?;
        ConfigError::within("max_level", self.max_level as f64, 0.0, 8.0)?;
        ConfigError::positive("iters", self.iters as f64)?;
        ConfigError::within("scale_factor", self.scale_factor, 1e-3, 1.0)?;
        ConfigError::within("imu_update_timeout", self.imu_update_timeout.get::<second>(), 0.0, 60.0)?;
        ConfigError::within(
            "allowed_stamp_error",
            self.allowed_stamp_error.get::<second>(),
            0.0,
            f64::MAX,
        )?;
        ConfigError::within("variance", self.variance, 0.0, f64::MAX)?;
        ConfigError::within("variance_scale", self.variance_scale, 0.0, f64::MAX)?;
        ConfigError::within("x_cutoff", self.x_cutoff, 0.0, 0.49)?;
        ConfigError::within("y_cutoff", self.y_cutoff, 0.0, 0.49)?;
        ConfigError::positive(
            "max_rotation_rate",
            self.max_rotation_rate.get::<radian_per_second>(),
        )?;
        ConfigError::within("max_vertical_angle", self.max_vertical_angle.get::<degree>(), 0.0, 90.0)?;
        ConfigError::within(
            "min_estimation_altitude",
            self.min_estimation_altitude.get::<meter>(),
            0.0,
            f64::MAX,
        )?;
        ConfigError::positive("filter_threshold", self.filter_threshold)?;
        ConfigError::positive("min_vectors", self.min_vectors as f64)?;
        ConfigError::within("max_filtered_variance", self.max_filtered_variance, 0.0, f64::MAX)
    }
}

/// An inclusive box in 8-bit HSV space. Hue spans [0, 180).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HsvRange {
    pub h_min: u8,
    pub h_max: u8,
    pub s_min: u8,
    pub s_max: u8,
    pub v_min: u8,
    pub v_max: u8,
}

impl HsvRange {
    pub fn new(h: (u8, u8), s: (u8, u8), v: (u8, u8)) -> Self {
        Self {
            h_min: h.0,
            h_max: h.1,
            s_min: s.0,
            s_max: s.1,
            v_min: v.0,
            v_max: v.1,
        }
    }

    pub fn contains(&self, hsv: Hsv) -> bool {
        (self.h_min..=self.h_max).contains(&hsv.h)
            && (self.s_min..=self.s_max).contains(&hsv.s)
            && (self.v_min..=self.v_max).contains(&hsv.v)
    }

    fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        let ordered = self.h_min <= self.h_max && self.s_min <= self.s_max && self.v_min <= self.v_max;
        match ordered && self.h_max < 180 {
            true => Ok(()),
            false => Err(ConfigError::OutOfRange {
                name,
                value: self.h_max as f64,
                min: self.h_min as f64,
                max: 179.0,
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BlobSettings {
    pub green: HsvRange,
    /// Red wraps around hue zero so it takes two ranges.
    pub red1: HsvRange,
    pub red2: HsvRange,

    /// Side length of the square opening kernel.
    pub morphology_size: u32,
    pub morphology_iterations: u32,

    /// Bounds on the contour area in square pixels.
    pub min_area: f64,
    pub max_area: f64,
    pub max_aspect_ratio: f64,

    /// Height of the targets' top surface above the floor.
    pub target_height: Length,

    pub debug_hsv_slice: bool,
    pub debug_contours: bool,
}

impl Default for BlobSettings {
    fn default() -> Self {
        Self {
            green: HsvRange::new((30, 90), (100, 255), (20, 255)),
            red1: HsvRange::new((0, 8), (100, 255), (20, 255)),
            red2: HsvRange::new((165, 179), (100, 255), (20, 255)),
            morphology_size: 3,
            morphology_iterations: 2,
            min_area: 2000.0,
            max_area: 15000.0,
            max_aspect_ratio: 4.0,
            target_height: Length::new::<meter>(0.065),
            debug_hsv_slice: false,
            debug_contours: false,
        }
    }
}

impl BlobSettings {
    /// Whether `hsv` falls in any of the target color ranges.
    pub fn is_target(&self, hsv: Hsv) -> bool {
        self.green.contains(hsv) || self.red1.contains(hsv) || self.red2.contains(hsv)
    }
}

impl Validate for BlobSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        self.green.validate("green")?;
        self.red1.validate("red1")?;
        self.red2.validate("red2")?;
        ConfigError::positive("morphology_size", self.morphology_size as f64)?;
        ConfigError::positive("min_area", self.min_area)?;
        ConfigError::within("max_area", self.max_area, self.min_area, f64::MAX)?;
        ConfigError::within("max_aspect_ratio", self.max_aspect_ratio, 1.0, f64::MAX)?;
        ConfigError::within("target_height", self.target_height.get::<meter>(), 0.0, f64::MAX)
    }
}

/// Settings for every estimator in the pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VisionSettings {
    pub grid: GridSettings,
    pub flow: FlowSettings,
    pub blob: BlobSettings,
}

impl Validate for VisionSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        self.grid.validate()?;
        self.flow.validate()?;
        self.blob.validate()
    }
}
