//! Per-viewer analysis session.
//!
//! A session owns its pipeline handles, profile store and behavior engine.
//! `idle → running → stopped`; stopped is terminal. Within a session at most
//! one frame is processed at a time: a second `ingest` while one is in flight
//! is dropped, never queued.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::behavior::{BehaviorEngine, BehaviorEvent, BehaviorSettings};
use crate::detect::{Pipeline, PipelineFactory, Track};
use crate::frame::{encode_jpeg_data_url, Frame, RESULT_JPEG_QUALITY};
use crate::geometry::{default_zones, Zone};
use crate::heatmap::HeatmapGrid;
use crate::load::{LoadController, LoadSettings, ProcessingMode};
use crate::profile::{FusionSettings, ProfileStore};
use crate::render::{self, RenderOptions};
use crate::stats::StatsSnapshot;
use crate::storage::{AnalysisRecord, PersistCommand, PersistenceHandle, PersonSnapshot};

pub const DEFAULT_FRAME_WIDTH: u32 = 640;
pub const DEFAULT_FRAME_HEIGHT: u32 = 480;
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RECORD_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// Nominal frame size used to lay out the default zones.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Custom zones; `None` uses the default thirds-of-frame layout.
    pub zones: Option<Vec<Zone>>,
    pub fusion: FusionSettings,
    pub behavior: BehaviorSettings,
    pub load: LoadSettings,
    /// Stream time between person snapshot flushes.
    pub snapshot_interval: Duration,
    /// Stream time between analysis records.
    pub record_interval: Duration,
    pub render: RenderOptions,
    pub jpeg_quality: u8,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            frame_width: DEFAULT_FRAME_WIDTH,
            frame_height: DEFAULT_FRAME_HEIGHT,
            zones: None,
            fusion: FusionSettings::default(),
            behavior: BehaviorSettings::default(),
            load: LoadSettings::default(),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            record_interval: DEFAULT_RECORD_INTERVAL,
            render: RenderOptions::standard(),
            jpeg_quality: RESULT_JPEG_QUALITY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
}

/// Failure categories callers need to tell apart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionError {
    NotFound(String),
    NotRunning(String),
    AlreadyStopped(String),
    CapacityExhausted(usize),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "session_not_found",
            SessionError::NotRunning(_) => "session_not_running",
            SessionError::AlreadyStopped(_) => "session_stopped",
            SessionError::CapacityExhausted(_) => "capacity_exhausted",
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotFound(id) => write!(f, "session {} not found", id),
            SessionError::NotRunning(id) => write!(f, "session {} is not running", id),
            SessionError::AlreadyStopped(id) => write!(f, "session {} is stopped", id),
            SessionError::CapacityExhausted(max) => {
                write!(f, "session limit reached ({} active)", max)
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Result of one processed (or cooldown-skipped) frame.
#[derive(Clone, Debug)]
pub struct FrameResult {
    /// Annotated frame as a JPEG data URL.
    pub frame: String,
    pub tracks: Vec<Track>,
    pub events: Vec<BehaviorEvent>,
    pub stats: StatsSnapshot,
    pub processing_time: Duration,
}

#[derive(Clone, Debug)]
pub enum IngestOutcome {
    Processed(FrameResult),
    /// Degraded cooldown: the frame was not analysed; tracks are the last known ones.
    Skipped(FrameResult),
    /// Another frame was still in flight.
    Dropped,
}

impl IngestOutcome {
    pub fn result(&self) -> Option<&FrameResult> {
        match self {
            IngestOutcome::Processed(r) | IngestOutcome::Skipped(r) => Some(r),
            IngestOutcome::Dropped => None,
        }
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, IngestOutcome::Dropped)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub username: String,
    pub state: SessionState,
    pub mode: ProcessingMode,
    pub frame_count: u64,
    pub people: usize,
    pub created_at: f64,
    pub idle_secs: f64,
    pub backend: String,
}

struct Analysis {
    pipeline: Pipeline,
    profiles: ProfileStore,
    behavior: BehaviorEngine,
    load: LoadController,
    last_tracks: Vec<Track>,
    processed: u64,
    last_snapshot_at: Option<f64>,
    last_record_at: Option<f64>,
}

impl Analysis {
    fn snapshot(&self, frame_count: u64, now: f64) -> StatsSnapshot {
        StatsSnapshot {
            realtime: self.profiles.realtime_stats(frame_count),
            behavior: self.behavior.summary(),
            age_distribution: self.profiles.age_distribution(),
            zones: self.behavior.zone_statistics(),
            mode: self.load.mode(),
            frame_count,
            timestamp: now,
        }
    }

    fn person_snapshots(&self, session_id: &str, now: f64) -> Vec<PersonSnapshot> {
        self.profiles
            .iter()
            .map(|p| PersonSnapshot {
                session_id: session_id.to_string(),
                captured_at: now,
                profile: p.snapshot(),
                behavior: self.behavior.person(p.track_id).map(|b| b.digest()),
            })
            .collect()
    }
}

struct Inner {
    state: SessionState,
    last_activity: Instant,
    frame_count: u64,
    analysis: Option<Analysis>,
}

/// Status view refreshed under the session lock at the end of every
/// transition, so queries never wait behind an in-flight frame.
struct Published {
    state: SessionState,
    mode: ProcessingMode,
    frame_count: u64,
    people: usize,
    last_activity: Instant,
    stats: Option<StatsSnapshot>,
}

/// Clears the in-flight flag when dropped, on every exit path.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Session {
    id: String,
    username: String,
    created_at: f64,
    settings: SessionSettings,
    factory: Arc<dyn PipelineFactory>,
    persistence: Option<PersistenceHandle>,
    busy: AtomicBool,
    inner: Mutex<Inner>,
    published: Mutex<Published>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: String,
        username: Option<String>,
        settings: SessionSettings,
        factory: Arc<dyn PipelineFactory>,
        persistence: Option<PersistenceHandle>,
    ) -> Result<Self> {
        let username = username
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("viewer_{}", id.chars().take(8).collect::<String>()));
        let created = Instant::now();
        Ok(Self {
            id,
            username,
            created_at: crate::now_s()?,
            settings,
            factory,
            persistence,
            busy: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                last_activity: created,
                frame_count: 0,
                analysis: None,
            }),
            published: Mutex::new(Published {
                state: SessionState::Idle,
                mode: ProcessingMode::Normal,
                frame_count: 0,
                people: 0,
                last_activity: created,
                stats: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    /// True while a frame is being processed.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("session {} lock poisoned", self.id))
    }

    fn view(&self) -> Result<MutexGuard<'_, Published>> {
        self.published
            .lock()
            .map_err(|_| anyhow!("session {} status lock poisoned", self.id))
    }

    /// Copy the analysis state into the published view. Called with the
    /// session lock held.
    fn publish(&self, inner: &Inner) -> Result<()> {
        let stats = inner
            .analysis
            .as_ref()
            .map(|a| a.snapshot(inner.frame_count, 0.0));
        let mut view = self.view()?;
        view.state = inner.state;
        view.mode = inner
            .analysis
            .as_ref()
            .map_or(ProcessingMode::Normal, |a| a.load.mode());
        view.frame_count = inner.frame_count;
        view.people = inner.analysis.as_ref().map_or(0, |a| a.profiles.len());
        view.last_activity = inner.last_activity;
        view.stats = stats;
        Ok(())
    }

    pub fn state(&self) -> Result<SessionState> {
        Ok(self.view()?.state)
    }

    pub fn status(&self) -> Result<SessionStatus> {
        let view = self.view()?;
        Ok(SessionStatus {
            session_id: self.id.clone(),
            username: self.username.clone(),
            state: view.state,
            mode: view.mode,
            frame_count: view.frame_count,
            people: view.people,
            created_at: self.created_at,
            idle_secs: view.last_activity.elapsed().as_secs_f64(),
            backend: self.factory.name().to_string(),
        })
    }

    /// Allocate pipeline handles and fresh analysis state. No-op when already running.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.state {
            SessionState::Running => return Ok(()),
            SessionState::Stopped => return Err(SessionError::AlreadyStopped(self.id.clone()).into()),
            SessionState::Idle => {}
        }
        let mut pipeline = self.factory.build()?;
        pipeline.detector.warm_up()?;
        let zones = match &self.settings.zones {
            Some(zones) => zones.clone(),
            None => default_zones(self.settings.frame_width, self.settings.frame_height)?,
        };
        inner.analysis = Some(Analysis {
            pipeline,
            profiles: ProfileStore::new(self.settings.fusion.clone()),
            behavior: BehaviorEngine::new(
                self.settings.behavior.clone(),
                zones,
                self.settings.frame_width,
                self.settings.frame_height,
            ),
            load: LoadController::new(self.settings.load.clone()),
            last_tracks: Vec::new(),
            processed: 0,
            last_snapshot_at: None,
            last_record_at: None,
        });
        inner.state = SessionState::Running;
        inner.last_activity = Instant::now();
        self.publish(&inner)?;
        log::info!(
            "session {} ({}) started with backend {}",
            self.id,
            self.username,
            self.factory.name()
        );
        Ok(())
    }

    fn try_begin(&self) -> Option<InFlight<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlight(&self.busy))
    }

    /// Decode and process one encoded frame at wall-clock time.
    pub fn ingest(&self, payload: &str) -> Result<IngestOutcome> {
        let Some(_in_flight) = self.try_begin() else {
            log::debug!("session {}: frame dropped, previous frame in flight", self.id);
            return Ok(IngestOutcome::Dropped);
        };
        let frame = Frame::decode(payload)?;
        let now = crate::now_s()?;
        self.process(frame, now)
    }

    /// Process an already decoded frame at stream time `now` (epoch seconds).
    pub fn ingest_frame(&self, frame: Frame, now: f64) -> Result<IngestOutcome> {
        let Some(_in_flight) = self.try_begin() else {
            log::debug!("session {}: frame dropped, previous frame in flight", self.id);
            return Ok(IngestOutcome::Dropped);
        };
        self.process(frame, now)
    }

    fn process(&self, frame: Frame, now: f64) -> Result<IngestOutcome> {
        let mut inner = self.lock()?;
        let outcome = self.process_locked(&mut inner, frame, now);
        self.publish(&inner)?;
        outcome
    }

    fn process_locked(&self, inner: &mut Inner, frame: Frame, now: f64) -> Result<IngestOutcome> {
        let Inner {
            state,
            last_activity,
            frame_count,
            analysis,
        } = inner;
        if *state != SessionState::Running {
            return Err(SessionError::NotRunning(self.id.clone()).into());
        }
        let analysis = analysis
            .as_mut()
            .ok_or_else(|| anyhow!("session {} running without analysis state", self.id))?;
        *last_activity = Instant::now();
        let started = Instant::now();

        if analysis.load.take_cooldown() {
            *frame_count += 1;
            let encoded = encode_jpeg_data_url(frame.image(), self.settings.jpeg_quality)?;
            return Ok(IngestOutcome::Skipped(FrameResult {
                frame: encoded,
                tracks: analysis.last_tracks.clone(),
                events: Vec::new(),
                stats: analysis.snapshot(*frame_count, now),
                processing_time: started.elapsed(),
            }));
        }

        let detections = analysis.pipeline.detector.detect(&frame)?;
        let tracks = analysis.pipeline.tracker.update(&detections, &frame)?;
        let estimates = if analysis.load.samples_attributes(analysis.processed) {
            analysis.pipeline.estimator.estimate(&frame, &tracks)?
        } else {
            Vec::new()
        };
        analysis.processed += 1;

        if analysis.behavior.fit_frame(frame.width(), frame.height()) {
            log::debug!(
                "session {}: heatmap resized to {}x{}",
                self.id,
                frame.width(),
                frame.height()
            );
        }
        analysis.profiles.update(&tracks, &estimates, now);
        let events = analysis.behavior.update(&tracks, &analysis.profiles, now);
        analysis.last_tracks = tracks.clone();
        *frame_count += 1;

        let mut image = frame.into_image();
        render::annotate(
            &mut image,
            analysis.behavior.zones(),
            &tracks,
            Some(analysis.behavior.heatmap()),
            self.settings.render,
        );
        let encoded = encode_jpeg_data_url(&image, self.settings.jpeg_quality)?;

        let elapsed = started.elapsed();
        if let Some(mode) = analysis.load.record(elapsed) {
            log::info!(
                "session {} switched to {:?} mode (attribute interval {})",
                self.id,
                mode,
                analysis.load.attribute_interval()
            );
        }
        log::debug!(
            "session {} frame {} processed in {:?} ({} tracks)",
            self.id,
            frame_count,
            elapsed,
            tracks.len()
        );

        let stats = analysis.snapshot(*frame_count, now);
        self.persist_on_schedule(analysis, &stats, now);
        Ok(IngestOutcome::Processed(FrameResult {
            frame: encoded,
            tracks,
            events,
            stats,
            processing_time: elapsed,
        }))
    }

    fn persist_on_schedule(&self, analysis: &mut Analysis, stats: &StatsSnapshot, now: f64) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        match analysis.last_snapshot_at {
            None => analysis.last_snapshot_at = Some(now),
            Some(last) if now - last >= self.settings.snapshot_interval.as_secs_f64() => {
                for snapshot in analysis.person_snapshots(&self.id, now) {
                    persistence.submit(PersistCommand::Person(snapshot));
                }
                analysis.last_snapshot_at = Some(now);
            }
            Some(_) => {}
        }
        match analysis.last_record_at {
            None => analysis.last_record_at = Some(now),
            Some(last) if now - last >= self.settings.record_interval.as_secs_f64() => {
                persistence.submit(PersistCommand::Record(AnalysisRecord {
                    session_id: self.id.clone(),
                    recorded_at: now,
                    final_record: false,
                    stats: stats.clone(),
                }));
                analysis.last_record_at = Some(now);
            }
            Some(_) => {}
        }
    }

    /// Statistics as of the last completed frame, stamped with the current
    /// time. Does not wait for a frame in flight.
    pub fn stats(&self) -> Result<StatsSnapshot> {
        let now = crate::now_s()?;
        Ok(match self.view()?.stats.clone() {
            Some(mut stats) => {
                stats.timestamp = now;
                stats
            }
            None => StatsSnapshot::empty(now),
        })
    }

    pub fn heatmap_grid(&self, cols: u32, rows: u32) -> Result<Option<HeatmapGrid>> {
        let inner = self.lock()?;
        Ok(inner
            .analysis
            .as_ref()
            .map(|a| a.behavior.heatmap().downsample(cols, rows)))
    }

    /// Transition to stopped. A running session flushes its final statistics
    /// exactly once; returns whether that happened.
    pub fn stop(&self) -> Result<bool> {
        let mut inner = self.lock()?;
        let flushed = self.stop_locked(&mut inner)?;
        self.publish(&inner)?;
        Ok(flushed)
    }

    /// Stop only if no activity for `timeout` as of `now`. Checked under the
    /// session lock, so it cannot race an in-flight frame.
    pub fn stop_if_idle(&self, now: Instant, timeout: Duration) -> Result<bool> {
        let mut inner = self.lock()?;
        if now.saturating_duration_since(inner.last_activity) < timeout {
            return Ok(false);
        }
        self.stop_locked(&mut inner)?;
        self.publish(&inner)?;
        Ok(true)
    }

    fn stop_locked(&self, inner: &mut Inner) -> Result<bool> {
        match inner.state {
            SessionState::Stopped => Ok(false),
            SessionState::Idle => {
                inner.state = SessionState::Stopped;
                log::info!("session {} stopped before start", self.id);
                Ok(false)
            }
            SessionState::Running => {
                inner.state = SessionState::Stopped;
                if let (Some(analysis), Some(persistence)) = (&inner.analysis, &self.persistence) {
                    let now = crate::now_s()?;
                    for snapshot in analysis.person_snapshots(&self.id, now) {
                        persistence.submit(PersistCommand::Person(snapshot));
                    }
                    persistence.submit(PersistCommand::Record(AnalysisRecord {
                        session_id: self.id.clone(),
                        recorded_at: now,
                        final_record: true,
                        stats: analysis.snapshot(inner.frame_count, now),
                    }));
                }
                log::info!(
                    "session {} stopped after {} frames",
                    self.id,
                    inner.frame_count
                );
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{SceneFrame, ScriptedFactory};
    use crate::geometry::BoundingBox;
    use crate::storage::{AnalyticsStore, InMemoryAnalyticsStore, PersistenceWorker, WorkerSettings};

    fn settings() -> SessionSettings {
        SessionSettings {
            frame_width: 120,
            frame_height: 90,
            ..SessionSettings::default()
        }
    }

    fn session(factory: &ScriptedFactory, persistence: Option<PersistenceHandle>) -> Session {
        Session::new(
            "abcdef0123456789".to_string(),
            None,
            settings(),
            Arc::new(factory.clone()),
            persistence,
        )
        .unwrap()
    }

    fn person(id: u64, x: f64, y: f64) -> Track {
        Track::new(id, BoundingBox::new(x - 5.0, y - 10.0, x + 5.0, y + 10.0), 0.9)
    }

    #[test]
    fn lifecycle_transitions() {
        let factory = ScriptedFactory::new();
        let s = session(&factory, None);
        assert_eq!(s.username(), "viewer_abcdef01");
        assert_eq!(s.state().unwrap(), SessionState::Idle);
        let err = s.ingest_frame(Frame::blank(120, 90), 1.0).unwrap_err();
        assert_eq!(
            err.downcast_ref::<SessionError>(),
            Some(&SessionError::NotRunning(s.id().to_string()))
        );
        s.start().unwrap();
        s.start().unwrap();
        assert_eq!(s.state().unwrap(), SessionState::Running);
        assert!(s.stop().unwrap());
        assert!(!s.stop().unwrap());
        assert!(s.start().is_err());
        assert!(s.ingest_frame(Frame::blank(120, 90), 2.0).is_err());
    }

    #[test]
    fn frame_failure_keeps_session_running() {
        let factory = ScriptedFactory::new();
        factory.push(SceneFrame::failing("model crashed")).unwrap();
        factory.push(SceneFrame::tracks(vec![person(1, 20.0, 20.0)])).unwrap();
        let s = session(&factory, None);
        s.start().unwrap();
        assert!(s.ingest_frame(Frame::blank(120, 90), 1.0).is_err());
        assert!(!s.is_busy());
        assert_eq!(s.state().unwrap(), SessionState::Running);
        let out = s.ingest_frame(Frame::blank(120, 90), 1.1).unwrap();
        let result = out.result().unwrap();
        assert_eq!(result.stats.realtime.active_tracks, 1);
        assert_eq!(result.stats.frame_count, 1);
        assert!(result.frame.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn cooldown_frames_return_last_tracks() {
        let factory = ScriptedFactory::new();
        let mut cfg = settings();
        cfg.load.high_water_ms = 0;
        cfg.load.window = 1;
        let s = Session::new("s1".into(), Some("ana".into()), cfg, Arc::new(factory.clone()), None)
            .unwrap();
        s.start().unwrap();
        factory.push(SceneFrame::tracks(vec![person(9, 30.0, 30.0)])).unwrap();
        let first = s.ingest_frame(Frame::blank(120, 90), 1.0).unwrap();
        assert!(matches!(first, IngestOutcome::Processed(_)));
        assert_eq!(s.status().unwrap().mode, ProcessingMode::Degraded);

        for t in [1.1, 1.2] {
            match s.ingest_frame(Frame::blank(120, 90), t).unwrap() {
                IngestOutcome::Skipped(r) => assert_eq!(r.tracks[0].id, 9),
                other => panic!("expected skipped frame, got {:?}", other),
            }
        }
        assert_eq!(factory.detect_calls().unwrap(), 1);
        assert!(matches!(
            s.ingest_frame(Frame::blank(120, 90), 1.3).unwrap(),
            IngestOutcome::Processed(_)
        ));
        assert_eq!(s.status().unwrap().frame_count, 4);
    }

    #[test]
    fn persists_on_schedule_and_flushes_once_on_stop() {
        let mem = InMemoryAnalyticsStore::new();
        let worker = PersistenceWorker::spawn(Box::new(mem.clone()), WorkerSettings::default())
            .unwrap();
        let factory = ScriptedFactory::new();
        let s = session(&factory, Some(worker.handle()));
        s.start().unwrap();
        // Stream time: 0 s, 11 s (snapshot due), 301 s (snapshot and record due).
        for t in [0.0, 11.0, 301.0] {
            factory.push(SceneFrame::tracks(vec![person(1, 20.0, 20.0)])).unwrap();
            s.ingest_frame(Frame::blank(120, 90), 1000.0 + t).unwrap();
        }
        assert!(s.stop().unwrap());
        assert!(!s.stop().unwrap());
        worker.shutdown().unwrap();

        let mut mem = mem;
        let records = mem.recent_records(Some(s.id()), 10).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].final_record);
        assert!(!records[1].final_record);
        let people = mem.person_snapshots(s.id()).unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].profile.total_frames, 3);
    }
}
