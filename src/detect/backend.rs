use anyhow::Result;

use crate::detect::result::{AttributeEstimate, Detection, Track};
use crate::frame::Frame;

/// Person detector.
///
/// Implementations wrap a model; the analytics core treats them as black boxes
/// that turn a decoded frame into person boxes.
pub trait PersonDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once when a session starts.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Assigns and maintains identity ids across frames.
pub trait PersonTracker: Send {
    fn update(&mut self, detections: &[Detection], frame: &Frame) -> Result<Vec<Track>>;
}

/// Face-attribute estimator. `hints` are the current frame's tracks.
pub trait AttributeEstimator: Send {
    fn estimate(&mut self, frame: &Frame, hints: &[Track]) -> Result<Vec<AttributeEstimate>>;
}

/// The per-session collaborator handles, allocated at session start.
pub struct Pipeline {
    pub detector: Box<dyn PersonDetector>,
    pub tracker: Box<dyn PersonTracker>,
    pub estimator: Box<dyn AttributeEstimator>,
}

impl Pipeline {
    pub fn new(
        detector: Box<dyn PersonDetector>,
        tracker: Box<dyn PersonTracker>,
        estimator: Box<dyn AttributeEstimator>,
    ) -> Self {
        Self {
            detector,
            tracker,
            estimator,
        }
    }

    pub fn name(&self) -> &'static str {
        self.detector.name()
    }
}

/// Builds a fresh `Pipeline` for each session. Sessions never share handles.
pub trait PipelineFactory: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self) -> Result<Pipeline>;
}
