use chrono::{DateTime, Utc};
use image::{GrayImage, Rgb, RgbImage};
use nalgebra::Point2;
use parking_lot::Mutex;

/// Intermediate imagery an estimator can emit for inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DebugChannel {
    Edges,
    Lines,
    Vectors,
    HsvSlice,
    Contours,
}

impl DebugChannel {
    pub fn name(&self) -> &'static str {
        match self {
            DebugChannel::Edges => "edges",
            DebugChannel::Lines => "lines",
            DebugChannel::Vectors => "flow_vectors",
            DebugChannel::HsvSlice => "hsv_slice",
            DebugChannel::Contours => "contours",
        }
    }
}

#[derive(Clone, Debug)]
pub enum DebugImage {
    Gray(GrayImage),
    Rgb(RgbImage),
}

/// Receives debug imagery. Never read back by the estimators.
pub trait DebugSink: Send + Sync {
    fn publish(&self, channel: DebugChannel, stamp: DateTime<Utc>, image: DebugImage);
}

/// Keeps everything it is given. Useful in tests and offline tools.
#[derive(Debug, Default)]
pub struct MemorySink {
    images: Mutex<Vec<(DebugChannel, DateTime<Utc>, DebugImage)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything published so far.
    pub fn take(&self) -> Vec<(DebugChannel, DateTime<Utc>, DebugImage)> {
        std::mem::take(&mut *self.images.lock())
    }

    pub fn channels(&self) -> Vec<DebugChannel> {
        self.images.lock().iter().map(|(c, _, _)| *c).collect()
    }
}

impl DebugSink for MemorySink {
    fn publish(&self, channel: DebugChannel, stamp: DateTime<Utc>, image: DebugImage) {
        self.images.lock().push((channel, stamp, image));
    }
}

/// Draw a straight segment, clipped to the image.
pub(crate) fn draw_segment(image: &mut RgbImage, a: Point2<f64>, b: Point2<f64>, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    let steps = (b - a).abs().max().ceil().max(1.0) as usize;
    for i in 0..=steps {
        let p = a + (b - a) * (i as f64 / steps as f64);
        let (x, y) = (p.x.round(), p.y.round());
        if x >= 0.0 && y >= 0.0 && x < width as f64 && y < height as f64 {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

/// Draw the infinite line `x cos(theta) + y sin(theta) = rho` across the image.
pub(crate) fn draw_line(image: &mut RgbImage, rho: f64, theta: f64, color: Rgb<u8>) {
    let (sin, cos) = theta.sin_cos();
    let origin = Point2::new(rho * cos, rho * sin);
    let reach = (image.width() as f64).hypot(image.height() as f64);
    let direction = nalgebra::Vector2::new(-sin, cos) * reach;
    draw_segment(image, origin - direction, origin + direction, color);
}
