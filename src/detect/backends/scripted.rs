//! Scripted backend: replays queued scene frames instead of running a model.
//!
//! Used by the demo binary and by tests that need exact control over which
//! tracks and attribute estimates a frame produces.

use anyhow::{anyhow, bail, Result};
use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use crate::detect::backend::{
    AttributeEstimator, PersonDetector, PersonTracker, Pipeline, PipelineFactory,
};
use crate::detect::result::{AttributeEstimate, Detection, Track};
use crate::frame::Frame;

/// What the next processed frame should "see".
#[derive(Default)]
pub struct SceneFrame {
    pub tracks: Vec<Track>,
    pub attributes: Vec<AttributeEstimate>,
    /// Detection blocks until this receives a message (or its sender is dropped).
    pub gate: Option<Receiver<()>>,
    /// Detection fails with this message.
    pub fail: Option<String>,
}

impl SceneFrame {
    pub fn tracks(tracks: Vec<Track>) -> Self {
        Self {
            tracks,
            ..Self::default()
        }
    }

    pub fn with_attributes(mut self, attributes: Vec<AttributeEstimate>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn gated(mut self, gate: Receiver<()>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct ScriptState {
    queue: VecDeque<SceneFrame>,
    tracks: Vec<Track>,
    attributes: Vec<AttributeEstimate>,
    detect_calls: u64,
    estimate_calls: u64,
}

/// Shared scene queue. Cloning shares the queue; every pipeline built from it
/// consumes from the same script.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: SceneFrame) -> Result<()> {
        self.lock()?.queue.push_back(frame);
        Ok(())
    }

    /// Drop scene frames no frame consumed (e.g. skipped during cooldown).
    pub fn clear(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let dropped = state.queue.len();
        state.queue.clear();
        Ok(dropped)
    }

    pub fn pending(&self) -> Result<usize> {
        Ok(self.lock()?.queue.len())
    }

    pub fn detect_calls(&self) -> Result<u64> {
        Ok(self.lock()?.detect_calls)
    }

    pub fn estimate_calls(&self) -> Result<u64> {
        Ok(self.lock()?.estimate_calls)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ScriptState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("scripted scene lock poisoned"))
    }
}

impl PipelineFactory for ScriptedFactory {
    fn name(&self) -> &str {
        "scripted"
    }

    fn build(&self) -> Result<Pipeline> {
        Ok(Pipeline::new(
            Box::new(ScriptedDetector(self.clone())),
            Box::new(ScriptedTracker(self.clone())),
            Box::new(ScriptedEstimator(self.clone())),
        ))
    }
}

struct ScriptedDetector(ScriptedFactory);

impl PersonDetector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        let next = {
            let mut state = self.0.lock()?;
            state.detect_calls += 1;
            state.queue.pop_front().unwrap_or_default()
        };
        // Wait outside the lock so the test driving the gate can still inspect the script.
        if let Some(gate) = next.gate {
            let _ = gate.recv();
        }
        let mut state = self.0.lock()?;
        if let Some(message) = next.fail {
            state.tracks.clear();
            state.attributes.clear();
            bail!("scripted detector failure: {}", message);
        }
        let detections = next
            .tracks
            .iter()
            .map(|t| Detection {
                bbox: t.bbox,
                confidence: t.confidence,
            })
            .collect();
        state.tracks = next.tracks;
        state.attributes = next.attributes;
        Ok(detections)
    }
}

struct ScriptedTracker(ScriptedFactory);

impl PersonTracker for ScriptedTracker {
    fn update(&mut self, _detections: &[Detection], _frame: &Frame) -> Result<Vec<Track>> {
        Ok(self.0.lock()?.tracks.clone())
    }
}

struct ScriptedEstimator(ScriptedFactory);

impl AttributeEstimator for ScriptedEstimator {
    fn estimate(&mut self, _frame: &Frame, _hints: &[Track]) -> Result<Vec<AttributeEstimate>> {
        let mut state = self.0.lock()?;
        state.estimate_calls += 1;
        Ok(state.attributes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;

    #[test]
    fn replays_queue_then_sees_nobody() {
        let factory = ScriptedFactory::new();
        let t = Track::new(4, BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.7);
        factory.push(SceneFrame::tracks(vec![t])).unwrap();
        factory.push(SceneFrame::failing("boom")).unwrap();

        let mut p = factory.build().unwrap();
        let frame = Frame::blank(16, 16);
        let dets = p.detector.detect(&frame).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(p.tracker.update(&dets, &frame).unwrap(), vec![t]);

        assert!(p.detector.detect(&frame).is_err());
        assert!(p.tracker.update(&[], &frame).unwrap().is_empty());

        assert!(p.detector.detect(&frame).unwrap().is_empty());
        assert_eq!(factory.detect_calls().unwrap(), 3);
        assert_eq!(factory.pending().unwrap(), 0);
    }
}
