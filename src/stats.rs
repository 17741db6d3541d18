use serde::{Deserialize, Serialize};

use crate::behavior::{BehaviorSummary, ZoneStatistics};
use crate::load::ProcessingMode;
use crate::profile::{AgeDistribution, RealtimeStats};

/// Statistics payload shared by `frame_result`, `stats_update` and analysis records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub realtime: RealtimeStats,
    pub behavior: BehaviorSummary,
    pub age_distribution: AgeDistribution,
    pub zones: Vec<ZoneStatistics>,
    pub mode: ProcessingMode,
    pub frame_count: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl StatsSnapshot {
    /// All-zero snapshot for sessions that are not analysing yet.
    pub fn empty(timestamp: f64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }
}
