use crate::{
    camera::CameraGeometry,
    config::{BlobSettings, SharedSettings},
    debug::{DebugChannel, DebugImage, DebugSink},
    error::BlobError,
    estimator::Estimator,
    frame::Frame,
    imgproc::{
        backend::{CpuBackend, ImageBackend},
        color::{Hsv, mean_color},
        contour::{Contour, external_contours},
    },
    state::VehicleState,
};
use image::{Rgb, RgbImage};
use nalgebra::{Point2, Vector2};
#[cfg(feature = "serde")]
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};
use uom::si::{
    angle::{degree, radian},
    f64::Angle,
    length::meter,
};

/// Size of the corner patches relative to the box.
const PATCH_SCALE: f64 = 0.2;

/// A target seen from above, as a rotated rectangle in pixel coordinates.
///
/// `angle` turns the image axes onto the box axes. At zero the width runs
/// along image X and the height along image Y.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Blob {
    pub center: Point2<f64>,
    pub width: f64,
    pub height: f64,
    pub angle: Angle,
}

impl Blob {
    /// Unit vectors along the width and height of the box.
    fn axes(&self) -> (Vector2<f64>, Vector2<f64>) {
        let (sin, cos) = self.angle.get::<radian>().sin_cos();
        (Vector2::new(cos, sin), Vector2::new(-sin, cos))
    }

    pub fn aspect_ratio(&self) -> f64 {
        let (long, short) = (self.width.max(self.height), self.width.min(self.height));
        match short > 0.0 {
            true => long / short,
            false => f64::INFINITY,
        }
    }

    /// World position of the blob's center, assuming its top is `target_height`
    /// above the floor.
    pub fn ground_position(
        &self,
        camera: &CameraGeometry,
        dims: (u32, u32),
        state: &VehicleState,
        target_height: f64,
    ) -> Option<Vector2<f64>> {
        let depth = state.altitude.get::<meter>() - target_height;
        let offset = camera.ground_offset(self.center, dims, state, depth)?;
        Some(state.position.xy() + offset)
    }
}

/// A contour known to contain at least one point.
#[derive(Clone, Debug, PartialEq)]
pub struct NonEmptyContour(Contour);

impl TryFrom<Contour> for NonEmptyContour {
    type Error = BlobError;

    fn try_from(contour: Contour) -> Result<Self, BlobError> {
        match contour.is_empty() {
            true => Err(BlobError::EmptyContour),
            false => Ok(Self(contour)),
        }
    }
}

impl NonEmptyContour {
    pub fn points(&self) -> &[Point2<i32>] {
        &self.0.points
    }

    /// Smallest box aligned with the principal axes of the contour that
    /// contains every contour point.
    pub fn rotated_rect(&self) -> Blob {
        let points: Vec<Vector2<f64>> = self
            .points()
            .iter()
            .map(|p| Vector2::new(p.x as f64, p.y as f64))
            .collect();

        // Degenerate covariance falls back to image axes.
        let major = self
            .0
            .moments()
            .normalized_covariance()
            .map(|covariance| {
                let eigen = covariance.symmetric_eigen();
                let index = match eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
                    true => 0,
                    false => 1,
                };
                eigen.eigenvectors.column(index).into_owned()
            })
            .unwrap_or_else(Vector2::y);
        let major = match major.y < 0.0 || (major.y == 0.0 && major.x > 0.0) {
            true => -major,
            false => major,
        };
        let minor = Vector2::new(major.y, -major.x);

        let extent = |axis: &Vector2<f64>| {
            points.iter().map(|p| p.dot(axis)).fold((f64::MAX, f64::MIN), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            })
        };
        let (x0, x1) = extent(&minor);
        let (y0, y1) = extent(&major);
        let center = minor * (x0 + x1) / 2.0 + major * (y0 + y1) / 2.0;

        Blob {
            center: Point2::from(center),
            width: x1 - x0,
            height: y1 - y0,
            angle: Angle::new::<degree>(-major.x.atan2(major.y).to_degrees()),
        }
    }
}

/// Finds colored targets by thresholding in HSV space.
///
/// Stateless between frames. The mask stages run on `B`.
pub struct BlobDetector<B: ImageBackend = CpuBackend> {
    settings: SharedSettings<BlobSettings>,
    backend: B,
    debug: Option<Arc<dyn DebugSink>>,
}

impl BlobDetector<CpuBackend> {
    pub fn new(settings: SharedSettings<BlobSettings>) -> Self {
        Self::with_backend(settings, CpuBackend)
    }
}

impl<B: ImageBackend> BlobDetector<B> {
    pub fn with_backend(settings: SharedSettings<BlobSettings>, backend: B) -> Self {
        Self {
            settings,
            backend,
            debug: None,
        }
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug = Some(sink);
        self
    }

    pub fn settings(&self) -> &SharedSettings<BlobSettings> {
        &self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn detect(&self, frame: &Frame) -> Result<Vec<Blob>, BlobError> {
        let settings = self.settings.load();
        let ranges = [settings.green, settings.red1, settings.red2];

        let image = self.backend.upload(frame.image());
        let mask = self.backend.hsv_mask(&image, &ranges);
        let mask = self
            .backend
            .open(&mask, settings.morphology_size, settings.morphology_iterations);
        let mask = self.backend.materialize(&mask);

        if let Some(sink) = self.debug.as_ref().filter(|_| settings.debug_hsv_slice) {
            sink.publish(DebugChannel::HsvSlice, frame.stamp(), DebugImage::Gray(mask.clone()));
        }

        let contours = external_contours(&mask);
        trace!(contours = contours.len(), "external contours");

        let mut blobs = Vec::new();
        for contour in &contours {
            let area = contour.area();
            if area < settings.min_area || area > settings.max_area {
                trace!(area, "contour area out of bounds");
                continue;
            }

            let contour = NonEmptyContour::try_from(contour.clone())?;
            let mut blob = contour.rotated_rect();
            if blob.aspect_ratio() > settings.max_aspect_ratio {
                trace!(aspect = blob.aspect_ratio(), "contour too elongated");
                continue;
            }

            resolve_orientation(&mut blob, frame.image(), &settings);
            blobs.push(blob);
        }

        if let Some(sink) = self.debug.as_ref().filter(|_| settings.debug_contours) {
            let mut canvas = frame.image().clone();
            for contour in &contours {
                for p in &contour.points {
                    canvas.put_pixel(p.x as u32, p.y as u32, Rgb([255, 0, 255]));
                }
            }
            sink.publish(DebugChannel::Contours, frame.stamp(), DebugImage::Rgb(canvas));
        }

        debug!(stamp = %frame.stamp(), blobs = blobs.len(), "blob detection finished");
        Ok(blobs)
    }
}

impl<B: ImageBackend> Estimator for BlobDetector<B> {
    type Output = Vec<Blob>;
    type Error = BlobError;

    fn update(&mut self, frame: &Frame) -> Result<Vec<Blob>, BlobError> {
        self.detect(frame)
    }
}

/// Point the blob's angle at its colored end.
///
/// Samples a patch near each corner of the box, turned with it. When only the patches on the
/// positive width side show target color the box is turned half a turn.
pub fn resolve_orientation(blob: &mut Blob, image: &RgbImage, settings: &BlobSettings) {
    let (along_width, along_height) = blob.axes();
    let reach = (1.0 - PATCH_SCALE) / 2.0;
    let half_patch = [PATCH_SCALE * blob.width / 2.0, PATCH_SCALE * blob.height / 2.0];

    let mut corners = [[false; 2]; 2];
    for (i, side) in [-1.0, 1.0].into_iter().enumerate() {
        for (j, end) in [-1.0, 1.0].into_iter().enumerate() {
            let at = blob.center
                + along_width * side * reach * blob.width
                + along_height * end * reach * blob.height;
            corners[i][j] = mean_color(image, at, [along_width, along_height], half_patch)
                .is_some_and(|color| settings.is_target(Hsv::from(color)));
        }
    }

    if !corners[0][0] && !corners[0][1] && corners[1][0] && corners[1][1] {
        let flipped = (blob.angle.get::<degree>() + 180.0).rem_euclid(360.0);
        blob.angle = Angle::new::<degree>(flipped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::{DateTime, Utc};
    use nalgebra::{UnitQuaternion, Vector3};
    use rstest::rstest;
    use uom::si::f64::Length;

    const GREEN: Rgb<u8> = Rgb([0, 200, 0]);

    fn paint(image: &mut RgbImage, xs: std::ops::Range<u32>, ys: std::ops::Range<u32>) {
        for y in ys {
            for x in xs.clone() {
                image.put_pixel(x, y, GREEN);
            }
        }
    }

    fn frame_with(xs: std::ops::Range<u32>, ys: std::ops::Range<u32>) -> Frame {
        let mut image = RgbImage::new(320, 240);
        paint(&mut image, xs, ys);
        Frame::new(image, DateTime::<Utc>::UNIX_EPOCH)
    }

    fn detector() -> BlobDetector {
        BlobDetector::new(SharedSettings::new(BlobSettings::default()).unwrap())
    }

    #[test]
    fn finds_upright_rectangle() {
        let blobs = detector().detect(&frame_with(100..160, 50..150)).unwrap();
        assert_eq!(blobs.len(), 1);

        let blob = blobs[0];
        assert_abs_diff_eq!(blob.center.x, 129.5, epsilon = 1e-6);
        assert_abs_diff_eq!(blob.center.y, 99.5, epsilon = 1e-6);
        assert_abs_diff_eq!(blob.width, 59.0, epsilon = 1e-6);
        assert_abs_diff_eq!(blob.height, 99.0, epsilon = 1e-6);
        assert_abs_diff_eq!(blob.angle.get::<degree>(), 0.0, epsilon = 1e-6);
    }

    #[rstest]
    #[case::too_small(100..120, 50..75)]
    #[case::too_long(100..120, 20..220)]
    fn rejects_out_of_bounds_shapes(
        #[case] xs: std::ops::Range<u32>,
        #[case] ys: std::ops::Range<u32>,
    ) {
        assert!(detector().detect(&frame_with(xs, ys)).unwrap().is_empty());
    }

    #[test]
    fn blank_frame_has_no_blobs() {
        let frame = Frame::new(RgbImage::new(64, 48), DateTime::<Utc>::UNIX_EPOCH);
        assert!(detector().detect(&frame).unwrap().is_empty());
    }

    #[test]
    fn empty_contour_is_fatal() {
        let result = NonEmptyContour::try_from(Contour { points: Vec::new() });
        assert_eq!(result, Err(BlobError::EmptyContour));
    }

    #[test]
    fn diagonal_contour_is_rotated() {
        let points = (0..40)
            .map(|i| Point2::new(i, i))
            .chain((0..40).rev().map(|i| Point2::new(i + 10, i)))
            .collect();
        let blob = NonEmptyContour::try_from(Contour { points }).unwrap().rotated_rect();
        // The long axis runs down and to the right in the image.
        assert_abs_diff_eq!(blob.angle.get::<degree>(), -45.0, epsilon = 2.0);
        assert!(blob.height > blob.width);
    }

    /// A box colored across its full height on the +X side and only in a
    /// central stub on the -X side.
    fn arrow() -> RgbImage {
        let mut image = RgbImage::new(320, 240);
        paint(&mut image, 120..160, 50..150);
        paint(&mut image, 100..120, 80..120);
        image
    }

    fn boxed(angle: f64) -> Blob {
        Blob {
            center: Point2::new(130.0, 100.0),
            width: 60.0,
            height: 100.0,
            angle: Angle::new::<degree>(angle),
        }
    }

    #[test]
    fn flips_towards_colored_side() {
        let mut blob = boxed(0.0);
        resolve_orientation(&mut blob, &arrow(), &BlobSettings::default());
        assert_abs_diff_eq!(blob.angle.get::<degree>(), 180.0, epsilon = 1e-9);
    }

    #[test]
    fn flipped_box_stays_flipped() {
        let mut blob = boxed(180.0);
        resolve_orientation(&mut blob, &arrow(), &BlobSettings::default());
        assert_abs_diff_eq!(blob.angle.get::<degree>(), 180.0, epsilon = 1e-9);
    }

    #[test]
    fn uniform_box_is_left_alone() {
        let mut image = RgbImage::new(320, 240);
        paint(&mut image, 100..160, 50..150);
        let mut blob = boxed(0.0);
        resolve_orientation(&mut blob, &image, &BlobSettings::default());
        assert_abs_diff_eq!(blob.angle.get::<degree>(), 0.0, epsilon = 1e-9);
    }

    /// A long thin box lying along image Y, colored only over `ys`.
    #[rstest]
    #[case::colored_below(115..175, 270.0)]
    #[case::colored_above(65..125, 90.0)]
    fn patches_turn_with_box(#[case] ys: std::ops::Range<u32>, #[case] expected: f64) {
        let mut image = RgbImage::new(320, 240);
        paint(&mut image, 146..174, ys);
        let mut blob = Blob {
            center: Point2::new(160.0, 120.0),
            width: 100.0,
            height: 24.0,
            angle: Angle::new::<degree>(90.0),
        };
        resolve_orientation(&mut blob, &image, &BlobSettings::default());
        assert_abs_diff_eq!(blob.angle.get::<degree>(), expected, epsilon = 1e-9);
    }

    #[test]
    fn ground_position_accounts_for_target_height() {
        let state = VehicleState {
            stamp: DateTime::<Utc>::UNIX_EPOCH,
            position: Vector3::new(1.0, 2.0, 2.0),
            attitude: UnitQuaternion::identity(),
            altitude: Length::new::<meter>(2.0),
            angular_velocity: Vector3::zeros(),
        };
        let camera = CameraGeometry::new(Angle::new::<degree>(90.0), 100.0);
        let blob = Blob {
            center: Point2::new(200.0, 50.0),
            ..boxed(0.0)
        };

        // Focal length is 100 px so the ray is (1, 0, -1).
        let position = blob.ground_position(&camera, (200, 100), &state, 1.0).unwrap();
        assert_abs_diff_eq!(position.x, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(position.y, 2.0, epsilon = 1e-9);
    }
}
