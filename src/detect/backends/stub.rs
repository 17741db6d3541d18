use anyhow::Result;

use crate::detect::backend::{
    AttributeEstimator, PersonDetector, Pipeline, PipelineFactory,
};
use crate::detect::backends::CentroidTracker;
use crate::detect::result::{AttributeEstimate, Detection, Track};
use crate::frame::Frame;

/// Stub detector for running without a model. Sees nobody.
#[derive(Default)]
pub struct StubDetector {
    frames: u64,
}

impl PersonDetector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        if self.frames == 0 {
            log::debug!(
                "stub detector active ({}x{} frames); no people will be reported",
                frame.width(),
                frame.height()
            );
        }
        self.frames += 1;
        Ok(Vec::new())
    }
}

/// Estimator that never produces attributes.
#[derive(Default)]
pub struct NullEstimator;

impl AttributeEstimator for NullEstimator {
    fn estimate(&mut self, _frame: &Frame, _hints: &[Track]) -> Result<Vec<AttributeEstimate>> {
        Ok(Vec::new())
    }
}

/// Stub detector + centroid tracker + null estimator.
#[derive(Clone, Copy, Debug, Default)]
pub struct StubFactory;

impl PipelineFactory for StubFactory {
    fn name(&self) -> &str {
        "stub"
    }

    fn build(&self) -> Result<Pipeline> {
        Ok(Pipeline::new(
            Box::new(StubDetector::default()),
            Box::new(CentroidTracker::default()),
            Box::new(NullEstimator),
        ))
    }
}
