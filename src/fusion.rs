//! Attribute fusion: turns repeated noisy per-frame estimates into stable values.
//!
//! Scalars (age) keep a bounded ring of `(value, confidence, quality)` samples and
//! report a confidence×quality weighted mean. Categoricals (gender) keep a full
//! tally and report the majority label with its count share.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A sample is rejected when it lies further than this many standard
/// deviations from the recent mean.
pub const OUTLIER_Z_THRESHOLD: f64 = 3.0;
/// Number of most recent samples the outlier test compares against.
pub const OUTLIER_WINDOW: usize = 5;
const OUTLIER_MIN_HISTORY: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightedSample {
    pub value: f64,
    pub confidence: f64,
    pub quality: f64,
}

impl WeightedSample {
    pub fn new(value: f64, confidence: f64, quality: f64) -> Self {
        Self {
            value,
            confidence,
            quality,
        }
    }

    fn weight(&self) -> f64 {
        unit(self.confidence) * unit(self.quality)
    }
}

fn unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Fixed-capacity history of scalar samples. Oldest sample is evicted on overflow.
#[derive(Clone, Debug)]
pub struct AttributeHistory {
    samples: VecDeque<WeightedSample>,
    capacity: usize,
    rejected: u64,
}

impl AttributeHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            rejected: 0,
        }
    }

    /// Append unconditionally, evicting the oldest sample when full.
    pub fn push(&mut self, sample: WeightedSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Append unless the sample is an outlier against recent history.
    /// Returns whether the sample was kept.
    pub fn offer(&mut self, sample: WeightedSample) -> bool {
        if !sample.value.is_finite() || self.is_outlier(sample.value) {
            self.rejected += 1;
            return false;
        }
        self.push(sample);
        true
    }

    /// z-score test against the last `OUTLIER_WINDOW` values. Needs at least
    /// three stored samples and a non-zero spread before it rejects anything.
    pub fn is_outlier(&self, value: f64) -> bool {
        if self.samples.len() < OUTLIER_MIN_HISTORY {
            return false;
        }
        let recent: Vec<f64> = self
            .samples
            .iter()
            .rev()
            .take(OUTLIER_WINDOW)
            .map(|s| s.value)
            .collect();
        let n = recent.len() as f64;
        let mean = recent.iter().sum::<f64>() / n;
        let var = recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std = var.sqrt();
        if std <= 0.0 {
            return false;
        }
        ((value - mean) / std).abs() > OUTLIER_Z_THRESHOLD
    }

    /// Σ(value·conf·quality) / Σ(conf·quality). Falls back to the plain mean
    /// when every weight is zero. `None` when empty.
    pub fn smoothed(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let (num, den) = self.samples.iter().fold((0.0, 0.0), |(num, den), s| {
            let w = s.weight();
            (num + s.value * w, den + w)
        });
        if den > 0.0 {
            Some(num / den)
        } else {
            Some(self.samples.iter().map(|s| s.value).sum::<f64>() / self.samples.len() as f64)
        }
    }

    pub fn mean_confidence(&self) -> Option<f64> {
        self.mean_of(|s| s.confidence)
    }

    pub fn mean_quality(&self) -> Option<f64> {
        self.mean_of(|s| s.quality)
    }

    fn mean_of(&self, f: impl Fn(&WeightedSample) -> f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(f).sum::<f64>() / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn iter(&self) -> impl Iterator<Item = &WeightedSample> {
        self.samples.iter()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

/// Unbounded label counter. Labels keep first-seen order so ties resolve to
/// whichever label was observed first.
#[derive(Clone, Debug)]
pub struct CategoricalTally<T> {
    counts: Vec<(T, u64)>,
    total: u64,
}

impl<T> Default for CategoricalTally<T> {
    fn default() -> Self {
        Self {
            counts: Vec::new(),
            total: 0,
        }
    }
}

impl<T: Clone + PartialEq> CategoricalTally<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, label: T) {
        self.total += 1;
        match self.counts.iter_mut().find(|(l, _)| *l == label) {
            Some((_, count)) => *count += 1,
            None => self.counts.push((label, 1)),
        }
    }

    /// Majority label and its share of all observations.
    pub fn dominant(&self) -> Option<(T, f64)> {
        let mut best: Option<&(T, u64)> = None;
        for entry in &self.counts {
            if best.map_or(true, |b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        best.map(|(label, count)| (label.clone(), *count as f64 / self.total as f64))
    }

    pub fn count(&self, label: &T) -> u64 {
        self.counts
            .iter()
            .find(|(l, _)| l == label)
            .map_or(0, |(_, c)| *c)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_mean_favours_confident_samples() {
        let mut h = AttributeHistory::new(10);
        h.push(WeightedSample::new(30.0, 0.9, 0.8));
        h.push(WeightedSample::new(50.0, 0.1, 0.2));
        let age = h.smoothed().unwrap();
        assert!((age - 30.0).abs() < (age - 50.0).abs());
        // 30*0.72 + 50*0.02 over 0.74
        assert!((age - 22.6 / 0.74).abs() < 1e-9);
    }

    #[test]
    fn zero_weights_fall_back_to_plain_mean() {
        let mut h = AttributeHistory::new(4);
        h.push(WeightedSample::new(20.0, 0.0, 0.5));
        h.push(WeightedSample::new(40.0, 0.7, 0.0));
        assert_eq!(h.smoothed(), Some(30.0));
    }

    #[test]
    fn ring_buffer_keeps_most_recent() {
        let n = 15;
        let mut h = AttributeHistory::new(n);
        for i in 0..(n + 5) {
            h.push(WeightedSample::new(i as f64, 1.0, 1.0));
        }
        assert_eq!(h.len(), n);
        let values: Vec<f64> = h.iter().map(|s| s.value).collect();
        let expected: Vec<f64> = (5..(n + 5)).map(|i| i as f64).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn empty_history_reports_nothing() {
        let h = AttributeHistory::new(3);
        assert_eq!(h.smoothed(), None);
        assert_eq!(h.mean_confidence(), None);
    }

    #[test]
    fn offer_rejects_outliers_once_history_is_established() {
        let mut h = AttributeHistory::new(15);
        // Too little history to judge: anything goes.
        assert!(h.offer(WeightedSample::new(30.0, 0.8, 0.8)));
        assert!(h.offer(WeightedSample::new(31.0, 0.8, 0.8)));
        for v in [29.0, 30.0, 32.0] {
            assert!(h.offer(WeightedSample::new(v, 0.8, 0.8)));
        }
        assert!(!h.offer(WeightedSample::new(120.0, 0.9, 0.9)));
        assert_eq!(h.rejected(), 1);
        assert!(h.offer(WeightedSample::new(33.0, 0.9, 0.9)));
    }

    #[test]
    fn identical_history_never_rejects() {
        let mut h = AttributeHistory::new(5);
        for _ in 0..5 {
            h.push(WeightedSample::new(25.0, 1.0, 1.0));
        }
        assert!(!h.is_outlier(80.0));
    }

    #[test]
    fn tally_majority_and_tie_break() {
        let mut t = CategoricalTally::new();
        t.record(Gender::Female);
        t.record(Gender::Male);
        assert_eq!(t.dominant(), Some((Gender::Female, 0.5)));
        t.record(Gender::Male);
        let (label, conf) = t.dominant().unwrap();
        assert_eq!(label, Gender::Male);
        assert!((conf - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(t.count(&Gender::Female), 1);
        assert_eq!(t.total(), 3);
    }
}
