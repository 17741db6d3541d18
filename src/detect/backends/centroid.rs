//! Nearest-neighbour centroid tracker.
//!
//! Each live track predicts its next center from its last displacement; new
//! detections are greedily matched to the closest prediction within
//! `max_distance`. Unmatched tracks survive `max_missed` frames before they are
//! dropped, unmatched detections start new tracks.

use anyhow::Result;
use std::collections::{HashSet, VecDeque};

use crate::detect::backend::PersonTracker;
use crate::detect::result::{Detection, Track};
use crate::frame::Frame;
use crate::geometry::{BoundingBox, Point};

const POSITION_HISTORY_SIZE: usize = 10;
pub const DEFAULT_MAX_MISSED: u32 = 5;
pub const DEFAULT_MAX_DISTANCE: f64 = 80.0;

#[derive(Clone, Debug)]
struct Tracked {
    id: u64,
    bbox: BoundingBox,
    confidence: f32,
    history: VecDeque<Point>,
    velocity: (f64, f64),
    missed: u32,
}

impl Tracked {
    fn new(id: u64, det: &Detection) -> Self {
        let mut history = VecDeque::with_capacity(POSITION_HISTORY_SIZE);
        history.push_back(det.bbox.center());
        Self {
            id,
            bbox: det.bbox,
            confidence: det.confidence,
            history,
            velocity: (0.0, 0.0),
            missed: 0,
        }
    }

    fn center(&self) -> Point {
        self.bbox.center()
    }

    fn predicted(&self) -> Point {
        let c = self.center();
        Point::new(c.x + self.velocity.0, c.y + self.velocity.1)
    }

    fn observe(&mut self, det: &Detection) {
        let previous = self.center();
        self.bbox = det.bbox;
        self.confidence = det.confidence;
        let now = self.center();
        self.history.push_back(now);
        if self.history.len() > POSITION_HISTORY_SIZE {
            self.history.pop_front();
        }
        // Displacement since the last sighting, spread over the frames it was missing.
        let frames = f64::from(self.missed + 1);
        self.velocity = ((now.x - previous.x) / frames, (now.y - previous.y) / frames);
        self.missed = 0;
    }
}

pub struct CentroidTracker {
    tracked: Vec<Tracked>,
    next_id: u64,
    max_distance: f64,
    max_missed: u32,
}

impl CentroidTracker {
    pub fn new(max_distance: f64, max_missed: u32) -> Self {
        Self {
            tracked: Vec::new(),
            next_id: 1,
            max_distance,
            max_missed,
        }
    }

    /// Number of tracks alive, including ones currently unmatched.
    pub fn live(&self) -> usize {
        self.tracked.len()
    }

    fn step(&mut self, detections: &[Detection]) -> Vec<Track> {
        let mut used: HashSet<usize> = HashSet::new();
        let mut matched: HashSet<usize> = HashSet::new();

        // Closest pairs first so one greedy pass is order independent.
        let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
        for (i, t) in self.tracked.iter().enumerate() {
            let predicted = t.predicted();
            for (j, d) in detections.iter().enumerate() {
                let dist = predicted.distance(&d.bbox.center());
                if dist < self.max_distance {
                    pairs.push((dist, i, j));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut out = Vec::new();
        for (_, i, j) in pairs {
            if matched.contains(&i) || used.contains(&j) {
                continue;
            }
            matched.insert(i);
            used.insert(j);
            let t = &mut self.tracked[i];
            t.observe(&detections[j]);
            out.push(Track::new(t.id, t.bbox, t.confidence));
        }

        for (i, t) in self.tracked.iter_mut().enumerate() {
            if !matched.contains(&i) {
                t.missed += 1;
            }
        }
        let max_missed = self.max_missed;
        self.tracked.retain(|t| t.missed <= max_missed);

        for (j, d) in detections.iter().enumerate() {
            if used.contains(&j) {
                continue;
            }
            let t = Tracked::new(self.next_id, d);
            self.next_id += 1;
            out.push(Track::new(t.id, t.bbox, t.confidence));
            self.tracked.push(t);
        }
        out.sort_by_key(|t| t.id);
        out
    }
}

impl Default for CentroidTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DISTANCE, DEFAULT_MAX_MISSED)
    }
}

impl PersonTracker for CentroidTracker {
    fn update(&mut self, detections: &[Detection], _frame: &Frame) -> Result<Vec<Track>> {
        Ok(self.step(detections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f64, y: f64) -> Detection {
        Detection {
            bbox: BoundingBox::new(x - 10.0, y - 20.0, x + 10.0, y + 20.0),
            confidence: 0.8,
        }
    }

    #[test]
    fn keeps_identity_while_moving() {
        let mut tracker = CentroidTracker::default();
        let first = tracker.step(&[det(100.0, 100.0), det(300.0, 100.0)]);
        assert_eq!(first.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);
        let second = tracker.step(&[det(310.0, 105.0), det(110.0, 100.0)]);
        assert_eq!(second.len(), 2);
        let left = second.iter().find(|t| t.center.x < 200.0).unwrap();
        assert_eq!(left.id, 1);
        let right = second.iter().find(|t| t.center.x > 200.0).unwrap();
        assert_eq!(right.id, 2);
    }

    #[test]
    fn only_current_sightings_are_reported() {
        let mut tracker = CentroidTracker::new(50.0, 2);
        tracker.step(&[det(100.0, 100.0)]);
        assert!(tracker.step(&[]).is_empty());
        assert_eq!(tracker.live(), 1);
        // Reappears close by within the miss budget: same id.
        let back = tracker.step(&[det(105.0, 100.0)]);
        assert_eq!(back[0].id, 1);
        for _ in 0..3 {
            tracker.step(&[]);
        }
        assert_eq!(tracker.live(), 0);
        let fresh = tracker.step(&[det(105.0, 100.0)]);
        assert_eq!(fresh[0].id, 2);
    }

    #[test]
    fn far_detection_starts_new_track() {
        let mut tracker = CentroidTracker::new(30.0, 1);
        tracker.step(&[det(0.0, 0.0)]);
        let out = tracker.step(&[det(200.0, 200.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 2);
    }
}
