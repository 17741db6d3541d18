use serde::{Deserialize, Serialize};

use crate::fusion::Gender;
use crate::geometry::{BoundingBox, Point};

/// A person detection in frame pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// One frame's sighting of a tracked identity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: u64,
    pub bbox: BoundingBox,
    pub center: Point,
    pub confidence: f32,
}

impl Track {
    pub fn new(id: u64, bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            id,
            bbox,
            center: bbox.center(),
            confidence,
        }
    }
}

/// Face-attribute estimate for one crop. Fields the estimator could not
/// produce stay `None`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeEstimate {
    pub bbox: BoundingBox,
    pub age: Option<f64>,
    pub age_confidence: f64,
    pub gender: Option<Gender>,
    /// Crop quality in `[0, 1]` (sharpness, pose, size).
    pub quality: f64,
}
