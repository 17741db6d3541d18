//! Behavior/zone engine.
//!
//! Per identity it tracks zone occupancy edges (enter/exit), dwell per zone,
//! path length and stops, and derives an engagement score plus shopper/browser
//! flags. A shared heatmap accumulates where people stand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::detect::Track;
use crate::geometry::{Point, Zone, ZoneKind};
use crate::heatmap::{Heatmap, DEFAULT_DECAY, DEFAULT_RADIUS};
use crate::profile::ProfileStore;

pub const DEFAULT_SPEED_THRESHOLD: f64 = 5.0;
pub const DEFAULT_MIN_STOP_SECS: f64 = 2.0;

const SHOPPER_MIN_DWELL_SECS: f64 = 60.0;
const SHOPPER_MIN_ZONES: usize = 2;
const BROWSER_MIN_DWELL_SECS: f64 = 30.0;
const BROWSER_MIN_STOPS: u32 = 2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSettings {
    /// Below this speed (px/s) a long enough gap counts as a stop.
    pub speed_threshold: f64,
    pub min_stop_secs: f64,
    pub heatmap_decay: f32,
    pub heatmap_radius: u32,
}

impl Default for BehaviorSettings {
    fn default() -> Self {
        Self {
            speed_threshold: DEFAULT_SPEED_THRESHOLD,
            min_stop_secs: DEFAULT_MIN_STOP_SECS,
            heatmap_decay: DEFAULT_DECAY,
            heatmap_radius: DEFAULT_RADIUS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EnterZone,
    ExitZone,
    Stop,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub person_id: u64,
    pub kind: EventKind,
    pub zone: Option<String>,
    pub timestamp: f64,
    pub position: Point,
    pub duration: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct PersonBehavior {
    pub person_id: u64,
    pub total_dwell_time: f64,
    pub zone_visits: BTreeMap<String, u32>,
    pub zone_dwell_times: BTreeMap<String, f64>,
    pub path_length: f64,
    pub avg_speed: f64,
    pub stop_count: u32,
    pub engagement_score: f64,
    pub is_shopper: bool,
    pub is_browser: bool,
    events: Vec<BehaviorEvent>,
    inside: Vec<bool>,
    last_seen: Option<(Point, f64)>,
}

impl PersonBehavior {
    fn new(person_id: u64, zone_count: usize) -> Self {
        Self {
            person_id,
            total_dwell_time: 0.0,
            zone_visits: BTreeMap::new(),
            zone_dwell_times: BTreeMap::new(),
            path_length: 0.0,
            avg_speed: 0.0,
            stop_count: 0,
            engagement_score: 0.0,
            is_shopper: false,
            is_browser: false,
            events: Vec::new(),
            inside: vec![false; zone_count],
            last_seen: None,
        }
    }

    pub fn events(&self) -> &[BehaviorEvent] {
        &self.events
    }

    pub fn distinct_zones(&self) -> usize {
        self.zone_visits.len()
    }

    pub fn digest(&self) -> BehaviorDigest {
        BehaviorDigest {
            total_dwell_time: self.total_dwell_time,
            path_length: self.path_length,
            avg_speed: self.avg_speed,
            stop_count: self.stop_count,
            engagement_score: self.engagement_score,
            is_shopper: self.is_shopper,
            is_browser: self.is_browser,
            zone_visits: self.zone_visits.clone(),
            zone_dwell_times: self.zone_dwell_times.clone(),
        }
    }

    fn recompute(&mut self) {
        self.engagement_score = engagement_score(
            self.total_dwell_time,
            self.distinct_zones(),
            self.stop_count,
            self.path_length,
        );
        self.is_shopper = self.total_dwell_time > SHOPPER_MIN_DWELL_SECS
            && self.distinct_zones() >= SHOPPER_MIN_ZONES;
        self.is_browser = self.total_dwell_time > BROWSER_MIN_DWELL_SECS
            && self.stop_count >= BROWSER_MIN_STOPS;
    }
}

/// Per-person behavior metrics without the event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BehaviorDigest {
    pub total_dwell_time: f64,
    pub path_length: f64,
    pub avg_speed: f64,
    pub stop_count: u32,
    pub engagement_score: f64,
    pub is_shopper: bool,
    pub is_browser: bool,
    pub zone_visits: BTreeMap<String, u32>,
    pub zone_dwell_times: BTreeMap<String, f64>,
}

/// Additive 0..=100 score: dwell (30), zone diversity (30), stops (20), path (20).
pub fn engagement_score(dwell_secs: f64, distinct_zones: usize, stops: u32, path_px: f64) -> f64 {
    let mut score = 0.0;
    if dwell_secs > 30.0 {
        score += (dwell_secs / 300.0).min(1.0) * 30.0;
    }
    score += (distinct_zones as f64 * 10.0).min(30.0);
    score += (f64::from(stops) * 5.0).min(20.0);
    if path_px > 100.0 {
        score += (path_px / 1000.0 * 20.0).min(20.0);
    }
    score
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSummary {
    pub total_people: usize,
    pub avg_dwell_time: f64,
    pub avg_path_length: f64,
    pub avg_engagement_score: f64,
    pub shoppers: usize,
    pub browsers: usize,
    pub shopper_rate: f64,
    pub browser_rate: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneStatistics {
    pub name: String,
    pub kind: ZoneKind,
    pub total_visits: u64,
    pub unique_visitors: usize,
    pub total_dwell_time: f64,
    /// Dwell per unique visitor.
    pub avg_dwell_time: f64,
}

pub struct BehaviorEngine {
    settings: BehaviorSettings,
    zones: Vec<Zone>,
    heatmap: Heatmap,
    people: BTreeMap<u64, PersonBehavior>,
    /// Timestamp of the previous update cycle.
    previous_update: Option<f64>,
}

impl BehaviorEngine {
    pub fn new(settings: BehaviorSettings, zones: Vec<Zone>, width: u32, height: u32) -> Self {
        let heatmap = Heatmap::new(
            width,
            height,
            settings.heatmap_decay,
            settings.heatmap_radius,
        );
        Self {
            settings,
            zones,
            heatmap,
            people: BTreeMap::new(),
            previous_update: None,
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn heatmap(&self) -> &Heatmap {
        &self.heatmap
    }

    /// Follow the incoming frame size. Returns true when the heatmap was reset.
    pub fn fit_frame(&mut self, width: u32, height: u32) -> bool {
        self.heatmap.resize(width, height)
    }

    pub fn person(&self, id: u64) -> Option<&PersonBehavior> {
        self.people.get(&id)
    }

    pub fn people(&self) -> impl Iterator<Item = &PersonBehavior> {
        self.people.values()
    }

    /// Advance one update cycle and return the events it produced.
    pub fn update(&mut self, tracks: &[Track], profiles: &ProfileStore, now: f64) -> Vec<BehaviorEvent> {
        self.heatmap.update(tracks.iter().map(|t| &t.center));
        let previous_update = self.previous_update.replace(now);

        let mut emitted = Vec::new();
        for track in tracks {
            let zone_count = self.zones.len();
            let person = self
                .people
                .entry(track.id)
                .or_insert_with(|| PersonBehavior::new(track.id, zone_count));
            let first_seen = profiles.get(track.id).map_or(now, |p| p.first_seen);
            person.total_dwell_time = (now - first_seen).max(0.0);

            let position = track.center;
            let dt = person.last_seen.map(|(_, t)| now - t);
            // Zone dwell only accrues across consecutive updates; an identity
            // missing from an update gets no credit for the gap.
            let dwell_delta = match (person.last_seen, previous_update) {
                (Some((_, seen)), Some(prev)) if seen == prev => (now - prev).max(0.0),
                _ => 0.0,
            };
            let start = person.events.len();

            if let (Some((last_pos, _)), Some(dt)) = (person.last_seen, dt) {
                if dt > 0.0 {
                    let distance = position.distance(&last_pos);
                    let speed = distance / dt;
                    person.path_length += distance;
                    if speed < self.settings.speed_threshold && dt >= self.settings.min_stop_secs {
                        person.stop_count += 1;
                        person.events.push(BehaviorEvent {
                            person_id: track.id,
                            kind: EventKind::Stop,
                            zone: None,
                            timestamp: now,
                            position,
                            duration: Some(dt),
                        });
                    }
                }
            }
            person.avg_speed = if person.total_dwell_time > 0.0 {
                person.path_length / person.total_dwell_time
            } else {
                0.0
            };

            for (idx, zone) in self.zones.iter().enumerate() {
                let inside = zone.contains(position);
                let was_inside = person.inside[idx];
                match (was_inside, inside) {
                    (false, true) => {
                        *person.zone_visits.entry(zone.name.clone()).or_insert(0) += 1;
                        person.events.push(BehaviorEvent {
                            person_id: track.id,
                            kind: EventKind::EnterZone,
                            zone: Some(zone.name.clone()),
                            timestamp: now,
                            position,
                            duration: None,
                        });
                    }
                    (true, false) => {
                        person.events.push(BehaviorEvent {
                            person_id: track.id,
                            kind: EventKind::ExitZone,
                            zone: Some(zone.name.clone()),
                            timestamp: now,
                            position,
                            duration: None,
                        });
                    }
                    (true, true) => {
                        *person
                            .zone_dwell_times
                            .entry(zone.name.clone())
                            .or_insert(0.0) += dwell_delta;
                    }
                    (false, false) => {}
                }
                person.inside[idx] = inside;
            }

            person.last_seen = Some((position, now));
            emitted.extend_from_slice(&person.events[start..]);
        }

        for person in self.people.values_mut() {
            person.recompute();
        }
        emitted
    }

    pub fn summary(&self) -> BehaviorSummary {
        let n = self.people.len();
        if n == 0 {
            return BehaviorSummary::default();
        }
        let total = n as f64;
        let shoppers = self.people().filter(|p| p.is_shopper).count();
        let browsers = self.people().filter(|p| p.is_browser).count();
        BehaviorSummary {
            total_people: n,
            avg_dwell_time: self.people().map(|p| p.total_dwell_time).sum::<f64>() / total,
            avg_path_length: self.people().map(|p| p.path_length).sum::<f64>() / total,
            avg_engagement_score: self.people().map(|p| p.engagement_score).sum::<f64>() / total,
            shoppers,
            browsers,
            shopper_rate: shoppers as f64 / total,
            browser_rate: browsers as f64 / total,
        }
    }

    pub fn zone_statistics(&self) -> Vec<ZoneStatistics> {
        self.zones
            .iter()
            .map(|zone| {
                let mut total_visits = 0u64;
                let mut unique_visitors = 0usize;
                let mut total_dwell_time = 0.0;
                for person in self.people.values() {
                    if let Some(v) = person.zone_visits.get(&zone.name) {
                        total_visits += u64::from(*v);
                        unique_visitors += 1;
                    }
                    if let Some(d) = person.zone_dwell_times.get(&zone.name) {
                        total_dwell_time += d;
                    }
                }
                ZoneStatistics {
                    name: zone.name.clone(),
                    kind: zone.kind,
                    total_visits,
                    unique_visitors,
                    total_dwell_time,
                    avg_dwell_time: if unique_visitors > 0 {
                        total_dwell_time / unique_visitors as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }
}
