//! Detection collaborators: detector, tracker and attribute estimator seams,
//! the per-session `Pipeline` that bundles them, and the built-in backends.

mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::{AttributeEstimator, PersonDetector, PersonTracker, Pipeline, PipelineFactory};
pub use backends::{CentroidTracker, SceneFrame, ScriptedFactory, StubFactory};
pub use registry::BackendRegistry;
pub use result::{AttributeEstimate, Detection, Track};
