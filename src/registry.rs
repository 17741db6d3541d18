//! Session registry: creates, looks up and retires sessions, and runs the
//! idle reaper.

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::detect::PipelineFactory;
use crate::session::{Session, SessionError, SessionSettings, SessionStatus};
use crate::storage::PersistenceHandle;

pub const DEFAULT_MAX_SESSIONS: usize = 64;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrySettings {
    pub max_sessions: usize,
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    settings: RegistrySettings,
    session_settings: SessionSettings,
    factory: Arc<dyn PipelineFactory>,
    persistence: Option<PersistenceHandle>,
}

impl SessionRegistry {
    pub fn new(
        settings: RegistrySettings,
        session_settings: SessionSettings,
        factory: Arc<dyn PipelineFactory>,
        persistence: Option<PersistenceHandle>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
            session_settings,
            factory,
            persistence,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &str {
        self.factory.name()
    }

    /// New idle session with a fresh 128-bit id.
    pub fn create(&self, username: Option<String>) -> Result<Arc<Session>> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| anyhow!("session registry lock poisoned"))?;
        if sessions.len() >= self.settings.max_sessions {
            log::warn!(
                "refusing new session: {} sessions active",
                sessions.len()
            );
            return Err(SessionError::CapacityExhausted(self.settings.max_sessions).into());
        }
        let id = loop {
            let id = new_session_id();
            if !sessions.contains_key(&id) {
                break id;
            }
        };
        let session = Arc::new(Session::new(
            id.clone(),
            username,
            self.session_settings.clone(),
            self.factory.clone(),
            self.persistence.clone(),
        )?);
        sessions.insert(id, session.clone());
        log::info!(
            "session {} created for {} ({} active)",
            session.id(),
            session.username(),
            sessions.len()
        );
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .map_err(|_| anyhow!("session registry lock poisoned"))?
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::Error::from(SessionError::NotFound(id.to_string())))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status of every registered session, oldest first.
    pub fn list(&self) -> Result<Vec<SessionStatus>> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .map_err(|_| anyhow!("session registry lock poisoned"))?
            .values()
            .cloned()
            .collect();
        let mut out = sessions
            .iter()
            .map(|s| s.status())
            .collect::<Result<Vec<_>>>()?;
        out.sort_by(|a, b| {
            a.created_at
                .total_cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(out)
    }

    pub fn start(&self, id: &str) -> Result<Arc<Session>> {
        let session = self.get(id)?;
        session.start()?;
        Ok(session)
    }

    /// Stop the session (final flush when it was running) and forget it.
    pub fn stop(&self, id: &str) -> Result<bool> {
        let session = self.get(id)?;
        let flushed = session.stop()?;
        self.remove(id)?;
        Ok(flushed)
    }

    fn remove(&self, id: &str) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| anyhow!("session registry lock poisoned"))?;
        sessions.remove(id);
        Ok(())
    }

    /// Stop and remove sessions idle for at least the configured timeout.
    pub fn reap(&self) -> Result<Vec<String>> {
        self.reap_at(Instant::now())
    }

    /// `reap` as of `now`; the idle check runs under each session's own lock.
    pub fn reap_at(&self, now: Instant) -> Result<Vec<String>> {
        let candidates: Vec<Arc<Session>> = self
            .sessions
            .read()
            .map_err(|_| anyhow!("session registry lock poisoned"))?
            .values()
            .cloned()
            .collect();
        let mut reaped = Vec::new();
        for session in candidates {
            match session.stop_if_idle(now, self.settings.idle_timeout) {
                Ok(true) => reaped.push(session.id().to_string()),
                Ok(false) => {}
                Err(e) => log::warn!("reaper: session {}: {:#}", session.id(), e),
            }
        }
        if !reaped.is_empty() {
            let mut sessions = self
                .sessions
                .write()
                .map_err(|_| anyhow!("session registry lock poisoned"))?;
            for id in &reaped {
                sessions.remove(id);
            }
            log::info!(
                "reaped {} idle session(s), {} remaining",
                reaped.len(),
                sessions.len()
            );
        }
        Ok(reaped)
    }

    /// Stop every session. Used on shutdown.
    pub fn stop_all(&self) -> Result<usize> {
        let drained: Vec<Arc<Session>> = self
            .sessions
            .write()
            .map_err(|_| anyhow!("session registry lock poisoned"))?
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in &drained {
            if let Err(e) = session.stop() {
                log::warn!("shutdown: session {}: {:#}", session.id(), e);
            }
        }
        Ok(drained.len())
    }

    /// Run `reap` every `interval` on a background thread.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> Result<ReaperHandle> {
        let registry = Arc::clone(self);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("session-reaper".to_string())
            .spawn(move || {
                let step = Duration::from_millis(50).min(interval);
                let mut next = Instant::now() + interval;
                while !flag.load(Ordering::SeqCst) {
                    if Instant::now() >= next {
                        if let Err(e) = registry.reap() {
                            log::error!("reaper: {:#}", e);
                        }
                        next = Instant::now() + interval;
                    }
                    std::thread::sleep(step);
                }
            })?;
        log::info!("session reaper running every {:?}", interval);
        Ok(ReaperHandle {
            shutdown,
            join: Some(join),
        })
    }
}

pub struct ReaperHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("reaper thread panicked"))?;
        }
        Ok(())
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
