pub mod blob;
pub mod flow;
pub mod grid;

use chrono::TimeDelta;
use std::time::Duration;
use uom::si::{f64::Time, time::second};

pub use blob::{Blob, BlobDetector};
pub use flow::{OpticalFlowEstimator, VelocityEstimate};
pub use grid::{GridHypothesis, GridLineEstimator, PoseEstimate};

/// Consumes one frame at a time and produces one result per frame.
pub trait Estimator {
    type Output;
    type Error;

    fn update(&mut self, frame: &crate::frame::Frame) -> Result<Self::Output, Self::Error>;
}

pub(crate) fn time_delta(time: Time) -> TimeDelta {
    TimeDelta::microseconds((time.get::<second>() * 1e6).round() as i64)
}

pub(crate) fn duration(time: Time) -> Duration {
    Duration::from_secs_f64(time.get::<second>().max(0.0))
}
