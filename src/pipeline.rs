use crate::{
    config::{SharedSettings, Validate, VisionSettings},
    debug::DebugSink,
    error::{BlobError, ConfigError, NoEstimate},
    estimator::{
        Blob, BlobDetector, Estimator, GridLineEstimator, OpticalFlowEstimator, PoseEstimate,
        VelocityEstimate,
    },
    frame::{Frame, FrameQueue},
    imgproc::backend::{CpuBackend, ImageBackend},
    state::PoseSource,
};
use std::sync::Arc;
use tracing::{info_span, warn};

/// Results of every estimator for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineOutput {
    pub pose: Result<PoseEstimate, NoEstimate>,
    pub velocity: Result<VelocityEstimate, NoEstimate>,
    pub blobs: Result<Vec<Blob>, BlobError>,
}

/// Runs the three estimators side by side on each frame.
///
/// The estimators share nothing mutable, so each frame fans out to all three
/// on the rayon pool and the call returns once every one has finished.
pub struct VisionPipeline<P: PoseSource, B: ImageBackend = CpuBackend> {
    grid: GridLineEstimator<P>,
    flow: OpticalFlowEstimator<P>,
    blobs: BlobDetector<B>,
}

impl<P: PoseSource + Clone> VisionPipeline<P, CpuBackend> {
    pub fn new(settings: &VisionSettings, poses: P) -> Result<Self, ConfigError> {
        Ok(Self::from_parts(
            GridLineEstimator::new(SharedSettings::new(settings.grid.clone())?, poses.clone()),
            OpticalFlowEstimator::new(SharedSettings::new(settings.flow.clone())?, poses),
            BlobDetector::new(SharedSettings::new(settings.blob.clone())?),
        ))
    }
}

impl<P: PoseSource, B: ImageBackend> VisionPipeline<P, B> {
    pub fn from_parts(
        grid: GridLineEstimator<P>,
        flow: OpticalFlowEstimator<P>,
        blobs: BlobDetector<B>,
    ) -> Self {
        Self { grid, flow, blobs }
    }

    /// Route debug imagery from every estimator to `sink`.
    pub fn with_debug_sink(self, sink: Arc<dyn DebugSink>) -> Self {
        Self {
            grid: self.grid.with_debug_sink(Arc::clone(&sink)),
            flow: self.flow.with_debug_sink(Arc::clone(&sink)),
            blobs: self.blobs.with_debug_sink(sink),
        }
    }

    pub fn grid(&self) -> &GridLineEstimator<P> {
        &self.grid
    }

    pub fn flow(&self) -> &OpticalFlowEstimator<P> {
        &self.flow
    }

    pub fn blobs(&self) -> &BlobDetector<B> {
        &self.blobs
    }

    /// Replace the settings of every estimator. Nothing is replaced unless
    /// all three are valid.
    pub fn store_settings(&self, settings: VisionSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        self.grid.settings().store(settings.grid)?;
        self.flow.settings().store(settings.flow)?;
        self.blobs.settings().store(settings.blob)
    }

    pub fn process(&mut self, frame: &Frame) -> PipelineOutput {
        let _span = info_span!("frame", stamp = %frame.stamp()).entered();
        let Self {
            grid,
            flow,
            blobs: detector,
        } = self;
        let (pose, (velocity, blobs)) = rayon::join(
            || grid.update(frame),
            || rayon::join(|| flow.update(frame), || detector.update(frame)),
        );

        if let Err(e) = &blobs {
            warn!(err = e.to_string(), "blob detection failed");
        }
        PipelineOutput {
            pose,
            velocity,
            blobs,
        }
    }

    /// Process queued frames in order until the queue is empty.
    ///
    /// Returns the number of frames processed.
    pub fn drain<F>(&mut self, queue: &FrameQueue, mut on_output: F) -> usize
    where
        F: FnMut(&Frame, PipelineOutput),
    {
        let mut processed = 0;
        while let Some(frame) = queue.pop() {
            let output = self.process(&frame);
            on_output(&frame, output);
            processed += 1;
        }
        processed
    }
}
