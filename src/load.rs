//! Adaptive degradation controller.
//!
//! Keeps a rolling window of per-frame processing times. When the window mean
//! rises above the high-water mark the session degrades: the next few frames
//! skip processing and attribute sampling becomes sparser. It recovers once the
//! mean falls below the low-water mark.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

pub const DEFAULT_WINDOW: usize = 10;
pub const DEFAULT_HIGH_WATER_MS: u64 = 250;
pub const DEFAULT_LOW_WATER_MS: u64 = 100;
pub const DEFAULT_COOLDOWN_FRAMES: u32 = 2;
pub const DEFAULT_ATTRIBUTE_INTERVAL: u32 = 6;
pub const DEFAULT_MIN_ATTRIBUTE_INTERVAL: u32 = 5;
pub const DEFAULT_MAX_ATTRIBUTE_INTERVAL: u32 = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    Normal,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadSettings {
    pub window: usize,
    pub high_water_ms: u64,
    pub low_water_ms: u64,
    /// Frames returned unprocessed after each over-budget evaluation.
    pub cooldown_frames: u32,
    /// Attribute estimation runs on every N-th processed frame.
    pub attribute_interval: u32,
    pub min_attribute_interval: u32,
    pub max_attribute_interval: u32,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            high_water_ms: DEFAULT_HIGH_WATER_MS,
            low_water_ms: DEFAULT_LOW_WATER_MS,
            cooldown_frames: DEFAULT_COOLDOWN_FRAMES,
            attribute_interval: DEFAULT_ATTRIBUTE_INTERVAL,
            min_attribute_interval: DEFAULT_MIN_ATTRIBUTE_INTERVAL,
            max_attribute_interval: DEFAULT_MAX_ATTRIBUTE_INTERVAL,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoadController {
    settings: LoadSettings,
    durations: VecDeque<Duration>,
    mode: ProcessingMode,
    cooldown: u32,
    interval: u32,
}

impl LoadController {
    /// Interval bounds are normalised so that `1 <= min <= max`; an inverted
    /// pair collapses to the minimum.
    pub fn new(mut settings: LoadSettings) -> Self {
        settings.min_attribute_interval = settings.min_attribute_interval.max(1);
        settings.max_attribute_interval = settings
            .max_attribute_interval
            .max(settings.min_attribute_interval);
        let interval = settings
            .attribute_interval
            .clamp(settings.min_attribute_interval, settings.max_attribute_interval);
        Self {
            durations: VecDeque::with_capacity(settings.window),
            mode: ProcessingMode::Normal,
            cooldown: 0,
            interval,
            settings,
        }
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    pub fn attribute_interval(&self) -> u32 {
        self.interval
    }

    /// Whether the `index`-th processed frame should run attribute estimation.
    pub fn samples_attributes(&self, index: u64) -> bool {
        index % u64::from(self.interval.max(1)) == 0
    }

    pub fn rolling_mean(&self) -> Option<Duration> {
        if self.durations.is_empty() {
            return None;
        }
        let total: Duration = self.durations.iter().sum();
        Some(total / self.durations.len() as u32)
    }

    /// Record one frame's processing time. Judges only once the window is full.
    /// Returns the new mode when it changed.
    pub fn record(&mut self, elapsed: Duration) -> Option<ProcessingMode> {
        let window = self.settings.window.max(1);
        self.durations.push_back(elapsed);
        while self.durations.len() > window {
            self.durations.pop_front();
        }
        if self.durations.len() < window {
            return None;
        }
        let mean = self.rolling_mean()?;
        let before = self.mode;
        if mean > Duration::from_millis(self.settings.high_water_ms) {
            self.mode = ProcessingMode::Degraded;
            self.cooldown = self.settings.cooldown_frames;
            self.interval = (self.interval + 1).min(self.settings.max_attribute_interval);
        } else if mean < Duration::from_millis(self.settings.low_water_ms)
            && self.mode == ProcessingMode::Degraded
        {
            self.mode = ProcessingMode::Normal;
            self.interval = self
                .interval
                .saturating_sub(1)
                .max(self.settings.min_attribute_interval);
        }
        (self.mode != before).then_some(self.mode)
    }

    /// Consume one cooldown frame. True means: skip processing this frame.
    pub fn take_cooldown(&mut self) -> bool {
        if self.mode == ProcessingMode::Degraded && self.cooldown > 0 {
            self.cooldown -= 1;
            return true;
        }
        false
    }
}

impl Default for LoadController {
    fn default() -> Self {
        Self::new(LoadSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn hysteresis_between_modes() {
        let mut load = LoadController::default();
        for i in 0..10 {
            let change = load.record(ms(300));
            if i < 9 {
                assert_eq!(change, None);
            }
        }
        assert_eq!(load.mode(), ProcessingMode::Degraded);
        assert_eq!(load.attribute_interval(), 7);

        // Between the marks nothing changes.
        let mut mid = LoadController::default();
        for _ in 0..20 {
            mid.record(ms(180));
        }
        assert_eq!(mid.mode(), ProcessingMode::Normal);

        let mut changes = Vec::new();
        for _ in 0..10 {
            if let Some(m) = load.record(ms(50)) {
                changes.push(m);
            }
        }
        assert_eq!(load.mode(), ProcessingMode::Normal);
        assert_eq!(changes, vec![ProcessingMode::Normal]);
        assert!(load.attribute_interval() >= DEFAULT_MIN_ATTRIBUTE_INTERVAL);
    }

    #[test]
    fn cooldown_skips_a_bounded_number_of_frames() {
        let mut load = LoadController::default();
        assert!(!load.take_cooldown());
        for _ in 0..10 {
            load.record(ms(400));
        }
        assert!(load.take_cooldown());
        assert!(load.take_cooldown());
        assert!(!load.take_cooldown());
    }

    #[test]
    fn interval_is_clamped() {
        let mut load = LoadController::default();
        for _ in 0..50 {
            load.record(ms(1000));
        }
        assert_eq!(load.attribute_interval(), DEFAULT_MAX_ATTRIBUTE_INTERVAL);
        assert!(load.samples_attributes(0));
        assert!(load.samples_attributes(20));
        assert!(!load.samples_attributes(21));
    }

    #[test]
    fn inverted_interval_bounds_collapse_to_minimum() {
        let mut load = LoadController::new(LoadSettings {
            attribute_interval: 6,
            min_attribute_interval: 8,
            max_attribute_interval: 3,
            ..LoadSettings::default()
        });
        assert_eq!(load.attribute_interval(), 8);
        for _ in 0..20 {
            load.record(ms(1000));
        }
        assert_eq!(load.mode(), ProcessingMode::Degraded);
        assert_eq!(load.attribute_interval(), 8);
        for _ in 0..20 {
            load.record(ms(10));
        }
        assert_eq!(load.attribute_interval(), 8);

        let zero = LoadController::new(LoadSettings {
            attribute_interval: 0,
            min_attribute_interval: 0,
            max_attribute_interval: 0,
            ..LoadSettings::default()
        });
        assert_eq!(zero.attribute_interval(), 1);
    }
}
