//! Footfall: multi-tenant real-time people analytics.
//!
//! Each viewer gets an isolated analysis session. Frames pushed over the
//! stream are run through pluggable detection collaborators, fused into
//! per-track demographic profiles, and analysed for zone behavior, dwell,
//! stops and engagement. Annotated frames and live statistics go back to the
//! viewer; snapshots and periodic records go to a persistence worker.
//!
//! # Architecture
//!
//! Within a session at most one frame is in flight: a frame arriving while
//! another is being processed is dropped, never queued. When the rolling
//! processing time exceeds its budget the session degrades (skips a few
//! frames, samples attributes less often) and recovers once it falls back
//! under the low-water mark.
//!
//! # Module Structure
//!
//! - `geometry`: points, boxes and polygonal zones
//! - `fusion`, `profile`: attribute smoothing and the track-profile store
//! - `behavior`, `heatmap`: zone transitions, stops, engagement, occupancy
//! - `load`: adaptive degradation controller
//! - `detect`: detector/tracker/estimator seams and built-in backends
//! - `session`, `registry`: per-viewer orchestration and the session table
//! - `storage`: analytics store and the persistence worker
//! - `api`, `transport`: lifecycle HTTP API and the duplex frame stream
//! - `config`: file + environment configuration

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod behavior;
pub mod config;
pub mod detect;
pub mod frame;
pub mod fusion;
pub mod geometry;
pub mod heatmap;
pub mod load;
pub mod profile;
pub mod registry;
pub mod render;
pub mod session;
pub mod stats;
pub mod storage;
pub mod transport;

pub use behavior::{BehaviorEngine, BehaviorEvent, BehaviorSettings, EventKind};
pub use config::FootfallConfig;
pub use detect::{BackendRegistry, Pipeline, PipelineFactory, ScriptedFactory, StubFactory, Track};
pub use frame::Frame;
pub use geometry::{BoundingBox, Point, Zone, ZoneKind};
pub use heatmap::{Heatmap, HeatmapGrid};
pub use load::{LoadController, ProcessingMode};
pub use profile::{ProfileStore, RealtimeStats};
pub use registry::{ReaperHandle, RegistrySettings, SessionRegistry};
pub use session::{
    FrameResult, IngestOutcome, Session, SessionError, SessionSettings, SessionState,
    SessionStatus,
};
pub use stats::StatsSnapshot;
pub use storage::{
    AnalyticsStore, InMemoryAnalyticsStore, PersistenceHandle, PersistenceWorker,
    SqliteAnalyticsStore,
};

// -------------------- Time --------------------

/// Wall-clock seconds since the Unix epoch.
pub fn now_s() -> Result<f64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64())
}
