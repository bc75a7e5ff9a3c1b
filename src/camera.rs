use crate::{error::ConfigError, state::VehicleState};
use nalgebra::{Point2, Vector2, Vector3};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uom::si::{
    angle::{degree, radian},
    f64::{Angle, Length},
    length::meter,
};

/// Rays flatter than this (world Z component) never reach the floor.
const MIN_DOWNWARD_COMPONENT: f64 = 1e-6;

/// Intrinsics of the downward camera.
///
/// Uses the pinhole model. The image is centered on the optical axis and
/// pixels are square.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CameraGeometry {
    /// Horizontal angle of view across the full image width.
    pub fov: Angle,

    /// The ground resolution that images are normalized to before processing.
    pub pixels_per_meter: f64,
}

impl CameraGeometry {
    pub fn new(fov: Angle, pixels_per_meter: f64) -> Self {
        Self {
            fov,
            pixels_per_meter,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::within("fov", self.fov.get::<degree>(), 1.0, 179.0)?;
        ConfigError::positive("pixels_per_meter", self.pixels_per_meter)
    }

    /// Focal length in pixels for an image `width` pixels wide.
    pub fn focal_length_px(&self, width: u32) -> f64 {
        width as f64 / 2.0 / (self.fov.get::<radian>() / 2.0).tan()
    }

    /// Ground resolution of an image `width` pixels wide seen from `altitude`
    /// looking straight down.
    pub fn ground_resolution(&self, width: u32, altitude: Length) -> f64 {
        let ground_width = 2.0 * altitude.get::<meter>() * (self.fov.get::<radian>() / 2.0).tan();
        width as f64 / ground_width
    }

    /// Trace `pixel` through the lens into a body frame direction.
    ///
    /// The returned vector is not normalized. Its Z component is -1.
    pub fn pixel_ray(&self, pixel: Point2<f64>, dims: (u32, u32)) -> Vector3<f64> {
        let focal = self.focal_length_px(dims.0);
        let (cx, cy) = (dims.0 as f64 / 2.0, dims.1 as f64 / 2.0);
        Vector3::new((pixel.x - cx) / focal, (cy - pixel.y) / focal, -1.0)
    }

    /// Intersect the ray through `pixel` with a horizontal plane `height`
    /// meters below the camera.
    ///
    /// Returns the world frame offset from the camera to the intersection or
    /// `None` if the ray does not point down.
    pub fn ground_offset(
        &self,
        pixel: Point2<f64>,
        dims: (u32, u32),
        state: &VehicleState,
        height: f64,
    ) -> Option<Vector2<f64>> {
        let ray = state.attitude * self.pixel_ray(pixel, dims);
        if ray.z > -MIN_DOWNWARD_COMPONENT {
            return None;
        }

        let scale = height / -ray.z;
        Some(Vector2::new(ray.x * scale, ray.y * scale))
    }
}

impl Default for CameraGeometry {
    fn default() -> Self {
        Self {
            fov: Angle::new::<degree>(100.0),
            pixels_per_meter: 100.0,
        }
    }
}
