pub mod centroid;
pub mod scripted;
pub mod stub;

pub use centroid::CentroidTracker;
pub use scripted::{SceneFrame, ScriptedFactory};
pub use stub::{NullEstimator, StubDetector, StubFactory};
