//! Downward Camera Estimators
//!
//! Three independent estimators consume frames from a camera looking straight
//! down at an arena floor:
//!
//! - [`GridLineEstimator`](estimator::GridLineEstimator) localizes the vehicle
//!   against the painted floor grid.
//! - [`OpticalFlowEstimator`](estimator::OpticalFlowEstimator) measures ground
//!   velocity from sparse feature tracks.
//! - [`BlobDetector`](estimator::BlobDetector) finds colored ground robots.
//!
//! [`VisionPipeline`](pipeline::VisionPipeline) runs all three on each frame.

pub mod camera;
pub mod config;
pub mod debug;
#[allow(missing_docs)]
pub mod error;
pub mod estimator;
pub mod frame;
pub mod imgproc;
pub mod pipeline;
pub mod state;
