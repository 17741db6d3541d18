//! Persistence of person snapshots and periodic analysis records.
//!
//! Sessions never write to storage on the frame path. They hand commands to a
//! `PersistenceHandle`; a single `PersistenceWorker` thread owns the store,
//! writes in order, and keeps failed writes in a bounded backlog that is retried
//! before the next write or on the retry tick. The submission queue is bounded
//! by the same limit; a full queue drops the new write.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::behavior::BehaviorDigest;
use crate::profile::ProfileSnapshot;
use crate::stats::StatsSnapshot;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_BACKLOG: usize = 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonSnapshot {
    pub session_id: String,
    pub captured_at: f64,
    pub profile: ProfileSnapshot,
    pub behavior: Option<BehaviorDigest>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub session_id: String,
    pub recorded_at: f64,
    /// Written by `stop()` rather than the periodic timer.
    pub final_record: bool,
    pub stats: StatsSnapshot,
}

pub trait AnalyticsStore: Send {
    /// Insert or replace the latest snapshot for `(session_id, track_id)`.
    fn save_person_snapshot(&mut self, snapshot: &PersonSnapshot) -> Result<()>;

    fn save_analysis_record(&mut self, record: &AnalysisRecord) -> Result<()>;

    /// Newest first.
    fn recent_records(&mut self, session_id: Option<&str>, limit: usize) -> Result<Vec<AnalysisRecord>>;

    /// Ordered by track id.
    fn person_snapshots(&mut self, session_id: &str) -> Result<Vec<PersonSnapshot>>;
}

// -------------------- SQLite --------------------

pub struct SqliteAnalyticsStore {
    conn: Connection,
}

impl SqliteAnalyticsStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS person_snapshots (
              session_id TEXT NOT NULL,
              track_id INTEGER NOT NULL,
              captured_at REAL NOT NULL,
              first_seen REAL NOT NULL,
              last_seen REAL NOT NULL,
              total_frames INTEGER NOT NULL,
              faces_detected INTEGER NOT NULL,
              avg_age REAL,
              dominant_gender TEXT,
              gender_confidence REAL,
              engagement_score REAL,
              payload_json TEXT NOT NULL,
              PRIMARY KEY (session_id, track_id)
            );

            CREATE TABLE IF NOT EXISTS analysis_records (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              recorded_at REAL NOT NULL,
              final_record INTEGER NOT NULL,
              total_people INTEGER NOT NULL,
              active_tracks INTEGER NOT NULL,
              avg_age REAL,
              male_count INTEGER NOT NULL,
              female_count INTEGER NOT NULL,
              avg_dwell_time REAL NOT NULL,
              avg_engagement_score REAL NOT NULL,
              shoppers INTEGER NOT NULL,
              browsers INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_session ON analysis_records(session_id, id);
            "#,
        )?;
        Ok(())
    }
}

fn to_i64<T: TryInto<i64>>(value: T, field: &str) -> Result<i64> {
    value
        .try_into()
        .map_err(|_| anyhow!("{} exceeds i64 range", field))
}

impl AnalyticsStore for SqliteAnalyticsStore {
    fn save_person_snapshot(&mut self, snapshot: &PersonSnapshot) -> Result<()> {
        let p = &snapshot.profile;
        let gender = p.dominant_gender.map(|g| g.as_str());
        let payload_json = serde_json::to_string(snapshot)?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO person_snapshots(
              session_id, track_id, captured_at, first_seen, last_seen, total_frames,
              faces_detected, avg_age, dominant_gender, gender_confidence, engagement_score,
              payload_json
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                snapshot.session_id,
                to_i64(p.track_id, "track_id")?,
                snapshot.captured_at,
                p.first_seen,
                p.last_seen,
                to_i64(p.total_frames, "total_frames")?,
                to_i64(p.faces_detected, "faces_detected")?,
                p.avg_age,
                gender,
                p.gender_confidence,
                snapshot.behavior.as_ref().map(|b| b.engagement_score),
                payload_json,
            ],
        )?;
        Ok(())
    }

    fn save_analysis_record(&mut self, record: &AnalysisRecord) -> Result<()> {
        let s = &record.stats;
        let payload_json = serde_json::to_string(record)?;
        self.conn.execute(
            r#"
            INSERT INTO analysis_records(
              session_id, recorded_at, final_record, total_people, active_tracks, avg_age,
              male_count, female_count, avg_dwell_time, avg_engagement_score, shoppers,
              browsers, payload_json
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                record.session_id,
                record.recorded_at,
                record.final_record,
                to_i64(s.realtime.total_people, "total_people")?,
                to_i64(s.realtime.active_tracks, "active_tracks")?,
                s.realtime.avg_age,
                to_i64(s.realtime.male_count, "male_count")?,
                to_i64(s.realtime.female_count, "female_count")?,
                s.behavior.avg_dwell_time,
                s.behavior.avg_engagement_score,
                to_i64(s.behavior.shoppers, "shoppers")?,
                to_i64(s.behavior.browsers, "browsers")?,
                payload_json,
            ],
        )?;
        Ok(())
    }

    fn recent_records(&mut self, session_id: Option<&str>, limit: usize) -> Result<Vec<AnalysisRecord>> {
        let limit = to_i64(limit, "limit")?;
        let mut out = Vec::new();
        match session_id {
            Some(id) => {
                let mut stmt = self.conn.prepare(
                    "SELECT payload_json FROM analysis_records WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![id, limit], |row| row.get::<_, String>(0))?;
                for row in rows {
                    out.push(serde_json::from_str(&row?)?);
                }
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT payload_json FROM analysis_records ORDER BY id DESC LIMIT ?1")?;
                let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
                for row in rows {
                    out.push(serde_json::from_str(&row?)?);
                }
            }
        }
        Ok(out)
    }

    fn person_snapshots(&mut self, session_id: &str) -> Result<Vec<PersonSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json FROM person_snapshots WHERE session_id = ?1 ORDER BY track_id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }
}

// -------------------- In-memory --------------------

#[derive(Default)]
struct MemoryInner {
    persons: BTreeMap<(String, u64), PersonSnapshot>,
    records: Vec<AnalysisRecord>,
}

/// In-memory store. Clones share contents, so a test can keep one clone while
/// the worker owns another.
#[derive(Clone, Default)]
pub struct InMemoryAnalyticsStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl InMemoryAnalyticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    pub fn record_count(&self) -> Result<usize> {
        Ok(self.lock()?.records.len())
    }

    pub fn person_count(&self) -> Result<usize> {
        Ok(self.lock()?.persons.len())
    }
}

impl AnalyticsStore for InMemoryAnalyticsStore {
    fn save_person_snapshot(&mut self, snapshot: &PersonSnapshot) -> Result<()> {
        let key = (snapshot.session_id.clone(), snapshot.profile.track_id);
        self.lock()?.persons.insert(key, snapshot.clone());
        Ok(())
    }

    fn save_analysis_record(&mut self, record: &AnalysisRecord) -> Result<()> {
        self.lock()?.records.push(record.clone());
        Ok(())
    }

    fn recent_records(&mut self, session_id: Option<&str>, limit: usize) -> Result<Vec<AnalysisRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .records
            .iter()
            .rev()
            .filter(|r| session_id.map_or(true, |id| r.session_id == id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn person_snapshots(&mut self, session_id: &str) -> Result<Vec<PersonSnapshot>> {
        let inner = self.lock()?;
        Ok(inner
            .persons
            .iter()
            .filter(|((sid, _), _)| sid == session_id)
            .map(|(_, s)| s.clone())
            .collect())
    }
}

// -------------------- Worker --------------------

#[derive(Clone, Debug, PartialEq)]
pub enum PersistCommand {
    Person(PersonSnapshot),
    Record(AnalysisRecord),
}

enum Message {
    Write(PersistCommand),
    Shutdown,
}

/// Fire-and-forget submission side of the persistence worker.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::SyncSender<Message>,
}

impl PersistenceHandle {
    /// Never blocks. Returns false when the write was dropped because the
    /// queue is full or the worker is gone.
    pub fn submit(&self, command: PersistCommand) -> bool {
        match self.tx.try_send(Message::Write(command)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("persistence queue full; dropping write");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("persistence worker is gone; dropping write");
                false
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WorkerSettings {
    pub retry_interval: Duration,
    pub max_backlog: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_backlog: DEFAULT_MAX_BACKLOG,
        }
    }
}

pub struct PersistenceWorker {
    handle: PersistenceHandle,
    join: Option<JoinHandle<()>>,
}

impl PersistenceWorker {
    pub fn spawn(store: Box<dyn AnalyticsStore>, settings: WorkerSettings) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(settings.max_backlog.max(1));
        let join = std::thread::Builder::new()
            .name("persistence".to_string())
            .spawn(move || run_worker(store, rx, settings))?;
        Ok(Self {
            handle: PersistenceHandle { tx },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> PersistenceHandle {
        self.handle.clone()
    }

    /// Write everything already submitted, then stop the thread.
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.handle.tx.send(Message::Shutdown);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("persistence thread panicked"))?;
        }
        Ok(())
    }
}

fn run_worker(
    mut store: Box<dyn AnalyticsStore>,
    rx: mpsc::Receiver<Message>,
    settings: WorkerSettings,
) {
    let mut backlog: VecDeque<PersistCommand> = VecDeque::new();
    loop {
        match rx.recv_timeout(settings.retry_interval) {
            Ok(Message::Write(command)) => {
                enqueue(&mut backlog, command, settings.max_backlog);
                flush(store.as_mut(), &mut backlog);
            }
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                while let Ok(Message::Write(command)) = rx.try_recv() {
                    enqueue(&mut backlog, command, settings.max_backlog);
                }
                flush(store.as_mut(), &mut backlog);
                if !backlog.is_empty() {
                    log::error!(
                        "persistence worker stopping with {} unwritten items",
                        backlog.len()
                    );
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !backlog.is_empty() {
                    flush(store.as_mut(), &mut backlog);
                }
            }
        }
    }
}

fn enqueue(backlog: &mut VecDeque<PersistCommand>, command: PersistCommand, max: usize) {
    if backlog.len() >= max.max(1) {
        backlog.pop_front();
        log::warn!("persistence backlog full; dropped oldest pending write");
    }
    backlog.push_back(command);
}

/// Write pending commands in order, stopping at the first failure.
fn flush(store: &mut dyn AnalyticsStore, backlog: &mut VecDeque<PersistCommand>) {
    while let Some(command) = backlog.front() {
        let result = match command {
            PersistCommand::Person(s) => store.save_person_snapshot(s),
            PersistCommand::Record(r) => store.save_analysis_record(r),
        };
        match result {
            Ok(()) => {
                backlog.pop_front();
            }
            Err(err) => {
                log::warn!(
                    "persistence write failed ({} pending, will retry): {}",
                    backlog.len(),
                    err
                );
                break;
            }
        }
    }
}
