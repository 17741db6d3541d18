//! Track-profile store.
//!
//! One `PersonProfile` per tracked identity, created on first sighting and kept
//! for the lifetime of the session. Attribute estimates are attached to the
//! track whose box they overlap most and fused through `fusion`.
//!
//! "Currently present" means present in the latest track list. It is never
//! derived from how recently a profile was last seen.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::detect::{AttributeEstimate, Track};
use crate::fusion::{AttributeHistory, CategoricalTally, Gender, WeightedSample};
use crate::geometry::Point;

pub const DEFAULT_HISTORY_CAPACITY: usize = 15;
pub const DEFAULT_TRAIL_CAPACITY: usize = 100;
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusionSettings {
    pub history_capacity: usize,
    pub trail_capacity: usize,
    /// Minimum share of the estimate's box that must lie inside a track box.
    pub overlap_threshold: f64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            trail_capacity: DEFAULT_TRAIL_CAPACITY,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrailPoint {
    pub position: Point,
    pub timestamp: f64,
}

#[derive(Clone, Debug)]
pub struct PersonProfile {
    pub track_id: u64,
    pub first_seen: f64,
    pub last_seen: f64,
    pub total_frames: u64,
    pub faces_detected: u64,
    age: AttributeHistory,
    gender: CategoricalTally<Gender>,
    trail: VecDeque<TrailPoint>,
    trail_capacity: usize,
}

impl PersonProfile {
    fn new(track_id: u64, now: f64, settings: &FusionSettings) -> Self {
        Self {
            track_id,
            first_seen: now,
            last_seen: now,
            total_frames: 0,
            faces_detected: 0,
            age: AttributeHistory::new(settings.history_capacity),
            gender: CategoricalTally::new(),
            trail: VecDeque::with_capacity(settings.trail_capacity.min(256)),
            trail_capacity: settings.trail_capacity.max(1),
        }
    }

    fn observe(&mut self, position: Point, now: f64) {
        if self.trail.len() == self.trail_capacity {
            self.trail.pop_front();
        }
        self.trail.push_back(TrailPoint {
            position,
            timestamp: now,
        });
        self.last_seen = now;
        self.total_frames += 1;
    }

    fn absorb(&mut self, estimate: &AttributeEstimate) {
        self.faces_detected += 1;
        if let Some(age) = estimate.age {
            self.age.offer(WeightedSample::new(
                age,
                estimate.age_confidence,
                estimate.quality,
            ));
        }
        if let Some(gender) = estimate.gender {
            self.gender.record(gender);
        }
    }

    pub fn avg_age(&self) -> Option<f64> {
        self.age.smoothed()
    }

    pub fn age_confidence(&self) -> Option<f64> {
        self.age.mean_confidence()
    }

    pub fn avg_face_quality(&self) -> Option<f64> {
        self.age.mean_quality()
    }

    pub fn age_history(&self) -> &AttributeHistory {
        &self.age
    }

    pub fn dominant_gender(&self) -> Option<Gender> {
        self.gender.dominant().map(|(g, _)| g)
    }

    pub fn gender_confidence(&self) -> Option<f64> {
        self.gender.dominant().map(|(_, c)| c)
    }

    pub fn trail(&self) -> impl Iterator<Item = &TrailPoint> {
        self.trail.iter()
    }

    pub fn last_position(&self) -> Option<Point> {
        self.trail.back().map(|p| p.position)
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot {
            track_id: self.track_id,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            total_frames: self.total_frames,
            faces_detected: self.faces_detected,
            avg_age: self.avg_age(),
            age_confidence: self.age_confidence(),
            avg_face_quality: self.avg_face_quality(),
            dominant_gender: self.dominant_gender(),
            gender_confidence: self.gender_confidence(),
            rejected_samples: self.age.rejected(),
            last_position: self.last_position(),
        }
    }
}

/// Serializable view of a profile, used for persistence and the API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub track_id: u64,
    pub first_seen: f64,
    pub last_seen: f64,
    pub total_frames: u64,
    pub faces_detected: u64,
    pub avg_age: Option<f64>,
    pub age_confidence: Option<f64>,
    pub avg_face_quality: Option<f64>,
    pub dominant_gender: Option<Gender>,
    pub gender_confidence: Option<f64>,
    pub rejected_samples: u64,
    pub last_position: Option<Point>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RealtimeStats {
    pub total_people: usize,
    pub active_tracks: usize,
    pub avg_age: Option<f64>,
    pub male_count: usize,
    pub female_count: usize,
    pub frame_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeDistribution {
    #[serde(rename = "0-17")]
    pub under_18: usize,
    #[serde(rename = "18-25")]
    pub age_18_25: usize,
    #[serde(rename = "26-35")]
    pub age_26_35: usize,
    #[serde(rename = "36-45")]
    pub age_36_45: usize,
    #[serde(rename = "46-55")]
    pub age_46_55: usize,
    #[serde(rename = "56-65")]
    pub age_56_65: usize,
    #[serde(rename = "65+")]
    pub over_65: usize,
}

impl AgeDistribution {
    pub fn add(&mut self, age: f64) {
        let bucket = if age < 18.0 {
            &mut self.under_18
        } else if age < 26.0 {
            &mut self.age_18_25
        } else if age < 36.0 {
            &mut self.age_26_35
        } else if age < 46.0 {
            &mut self.age_36_45
        } else if age < 56.0 {
            &mut self.age_46_55
        } else if age < 66.0 {
            &mut self.age_56_65
        } else {
            &mut self.over_65
        };
        *bucket += 1;
    }

    pub fn total(&self) -> usize {
        self.under_18
            + self.age_18_25
            + self.age_26_35
            + self.age_36_45
            + self.age_46_55
            + self.age_56_65
            + self.over_65
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProfileStore {
    settings: FusionSettings,
    profiles: BTreeMap<u64, PersonProfile>,
    active: Vec<u64>,
}

impl ProfileStore {
    pub fn new(settings: FusionSettings) -> Self {
        Self {
            settings,
            profiles: BTreeMap::new(),
            active: Vec::new(),
        }
    }

    /// Fold one frame of tracks and attribute estimates into the store.
    /// Returns how many estimates were attached to a track.
    pub fn update(&mut self, tracks: &[Track], estimates: &[AttributeEstimate], now: f64) -> usize {
        self.active.clear();
        for track in tracks {
            let settings = &self.settings;
            let profile = self
                .profiles
                .entry(track.id)
                .or_insert_with(|| PersonProfile::new(track.id, now, settings));
            profile.observe(track.center, now);
            self.active.push(track.id);
        }

        let mut matched = 0;
        for estimate in estimates {
            let Some(track_id) = self.best_track(tracks, estimate) else {
                continue;
            };
            if let Some(profile) = self.profiles.get_mut(&track_id) {
                profile.absorb(estimate);
                matched += 1;
            }
        }
        matched
    }

    fn best_track(&self, tracks: &[Track], estimate: &AttributeEstimate) -> Option<u64> {
        let mut best: Option<(u64, f64)> = None;
        for track in tracks {
            let ratio = estimate.bbox.overlap_ratio(&track.bbox);
            if ratio < self.settings.overlap_threshold || ratio <= 0.0 {
                continue;
            }
            if best.map_or(true, |(_, r)| ratio > r) {
                best = Some((track.id, ratio));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Number of tracks in the most recent update.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_ids(&self) -> &[u64] {
        &self.active
    }

    pub fn is_active(&self, track_id: u64) -> bool {
        self.active.contains(&track_id)
    }

    pub fn get(&self, track_id: u64) -> Option<&PersonProfile> {
        self.profiles.get(&track_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PersonProfile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn realtime_stats(&self, frame_count: u64) -> RealtimeStats {
        let ages: Vec<f64> = self.iter().filter_map(|p| p.avg_age()).collect();
        let avg_age = if ages.is_empty() {
            None
        } else {
            Some(ages.iter().sum::<f64>() / ages.len() as f64)
        };
        let genders: Vec<Gender> = self.iter().filter_map(|p| p.dominant_gender()).collect();
        RealtimeStats {
            total_people: self.len(),
            active_tracks: self.active_count(),
            avg_age,
            male_count: genders.iter().filter(|g| **g == Gender::Male).count(),
            female_count: genders.iter().filter(|g| **g == Gender::Female).count(),
            frame_count,
        }
    }

    pub fn age_distribution(&self) -> AgeDistribution {
        let mut dist = AgeDistribution::default();
        for age in self.iter().filter_map(|p| p.avg_age()) {
            dist.add(age);
        }
        dist
    }
}
