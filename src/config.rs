use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::behavior::{BehaviorSettings, DEFAULT_MIN_STOP_SECS, DEFAULT_SPEED_THRESHOLD};
use crate::geometry::{Point, Zone, ZoneKind};
use crate::heatmap::{DEFAULT_DECAY, DEFAULT_RADIUS};
use crate::load::{
    LoadSettings, DEFAULT_ATTRIBUTE_INTERVAL, DEFAULT_COOLDOWN_FRAMES, DEFAULT_HIGH_WATER_MS,
    DEFAULT_LOW_WATER_MS, DEFAULT_MAX_ATTRIBUTE_INTERVAL, DEFAULT_MIN_ATTRIBUTE_INTERVAL,
    DEFAULT_WINDOW,
};
use crate::profile::{
    FusionSettings, DEFAULT_HISTORY_CAPACITY, DEFAULT_OVERLAP_THRESHOLD, DEFAULT_TRAIL_CAPACITY,
};
use crate::registry::{
    RegistrySettings, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SESSIONS, DEFAULT_REAP_INTERVAL,
};
use crate::render::RenderOptions;
use crate::session::{
    SessionSettings, DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH, DEFAULT_RECORD_INTERVAL,
    DEFAULT_SNAPSHOT_INTERVAL,
};
use crate::storage::{WorkerSettings, DEFAULT_MAX_BACKLOG, DEFAULT_RETRY_INTERVAL};

const DEFAULT_DB_PATH: &str = "footfall.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8799";
const DEFAULT_STREAM_ADDR: &str = "127.0.0.1:8800";
const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize, Default)]
struct FootfallConfigFile {
    db_path: Option<String>,
    backend: Option<String>,
    api: Option<AddrConfigFile>,
    stream: Option<StreamConfigFile>,
    frame: Option<FrameConfigFile>,
    fusion: Option<FusionConfigFile>,
    behavior: Option<BehaviorConfigFile>,
    load: Option<LoadConfigFile>,
    sessions: Option<SessionsConfigFile>,
    persistence: Option<PersistenceConfigFile>,
    zones: Option<Vec<ZoneConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct AddrConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    addr: Option<String>,
    stats_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FrameConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    heatmap_overlay: Option<bool>,
    zone_labels: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct FusionConfigFile {
    history_capacity: Option<usize>,
    trail_capacity: Option<usize>,
    overlap_threshold: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct BehaviorConfigFile {
    speed_threshold: Option<f64>,
    min_stop_secs: Option<f64>,
    heatmap_decay: Option<f32>,
    heatmap_radius: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct LoadConfigFile {
    window: Option<usize>,
    high_water_ms: Option<u64>,
    low_water_ms: Option<u64>,
    cooldown_frames: Option<u32>,
    attribute_interval: Option<u32>,
    min_attribute_interval: Option<u32>,
    max_attribute_interval: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionsConfigFile {
    max_sessions: Option<usize>,
    idle_timeout_secs: Option<u64>,
    reap_interval_secs: Option<u64>,
    snapshot_interval_secs: Option<u64>,
    record_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PersistenceConfigFile {
    retry_interval_secs: Option<u64>,
    max_backlog: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ZoneConfigFile {
    name: String,
    kind: Option<ZoneKind>,
    vertices: Vec<[f64; 2]>,
    color: Option<[u8; 3]>,
}

#[derive(Debug, Clone)]
pub struct FootfallConfig {
    pub db_path: String,
    /// Detection backend name; `None` uses the registry default.
    pub backend: Option<String>,
    pub api_addr: String,
    pub stream_addr: String,
    /// Idle stream connections receive a `stats_update` this often.
    pub stats_interval: Duration,
    pub reap_interval: Duration,
    pub registry: RegistrySettings,
    pub session: SessionSettings,
    pub worker: WorkerSettings,
}

impl Default for FootfallConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            backend: None,
            api_addr: DEFAULT_API_ADDR.to_string(),
            stream_addr: DEFAULT_STREAM_ADDR.to_string(),
            stats_interval: DEFAULT_STATS_INTERVAL,
            reap_interval: DEFAULT_REAP_INTERVAL,
            registry: RegistrySettings::default(),
            session: SessionSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

impl FootfallConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FOOTFALL_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// File (if any), then environment overrides, then validation.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FootfallConfigFile) -> Result<Self> {
        let fusion = file.fusion.unwrap_or_default();
        let behavior = file.behavior.unwrap_or_default();
        let load = file.load.unwrap_or_default();
        let sessions = file.sessions.unwrap_or_default();
        let frame = file.frame.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let persistence = file.persistence.unwrap_or_default();

        let zones = match file.zones {
            Some(zones) => Some(
                zones
                    .into_iter()
                    .map(|z| {
                        Zone::new(
                            z.name,
                            z.kind.unwrap_or(ZoneKind::General),
                            z.vertices.iter().map(|[x, y]| Point::new(*x, *y)).collect(),
                            z.color.unwrap_or([255, 255, 0]),
                        )
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };

        let session = SessionSettings {
            frame_width: frame.width.unwrap_or(DEFAULT_FRAME_WIDTH),
            frame_height: frame.height.unwrap_or(DEFAULT_FRAME_HEIGHT),
            zones,
            fusion: FusionSettings {
                history_capacity: fusion.history_capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY),
                trail_capacity: fusion.trail_capacity.unwrap_or(DEFAULT_TRAIL_CAPACITY),
                overlap_threshold: fusion
                    .overlap_threshold
                    .unwrap_or(DEFAULT_OVERLAP_THRESHOLD),
            },
            behavior: BehaviorSettings {
                speed_threshold: behavior.speed_threshold.unwrap_or(DEFAULT_SPEED_THRESHOLD),
                min_stop_secs: behavior.min_stop_secs.unwrap_or(DEFAULT_MIN_STOP_SECS),
                heatmap_decay: behavior.heatmap_decay.unwrap_or(DEFAULT_DECAY),
                heatmap_radius: behavior.heatmap_radius.unwrap_or(DEFAULT_RADIUS),
            },
            load: LoadSettings {
                window: load.window.unwrap_or(DEFAULT_WINDOW),
                high_water_ms: load.high_water_ms.unwrap_or(DEFAULT_HIGH_WATER_MS),
                low_water_ms: load.low_water_ms.unwrap_or(DEFAULT_LOW_WATER_MS),
                cooldown_frames: load.cooldown_frames.unwrap_or(DEFAULT_COOLDOWN_FRAMES),
                attribute_interval: load
                    .attribute_interval
                    .unwrap_or(DEFAULT_ATTRIBUTE_INTERVAL),
                min_attribute_interval: load
                    .min_attribute_interval
                    .unwrap_or(DEFAULT_MIN_ATTRIBUTE_INTERVAL),
                max_attribute_interval: load
                    .max_attribute_interval
                    .unwrap_or(DEFAULT_MAX_ATTRIBUTE_INTERVAL),
            },
            snapshot_interval: sessions
                .snapshot_interval_secs
                .map_or(DEFAULT_SNAPSHOT_INTERVAL, Duration::from_secs),
            record_interval: sessions
                .record_interval_secs
                .map_or(DEFAULT_RECORD_INTERVAL, Duration::from_secs),
            render: RenderOptions {
                heatmap: frame.heatmap_overlay.unwrap_or(false),
                labels: frame.zone_labels.unwrap_or(true),
                ..RenderOptions::standard()
            },
            ..SessionSettings::default()
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            backend: file.backend,
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            stream_addr: stream
                .addr
                .unwrap_or_else(|| DEFAULT_STREAM_ADDR.to_string()),
            stats_interval: stream
                .stats_interval_secs
                .map_or(DEFAULT_STATS_INTERVAL, Duration::from_secs),
            reap_interval: sessions
                .reap_interval_secs
                .map_or(DEFAULT_REAP_INTERVAL, Duration::from_secs),
            registry: RegistrySettings {
                max_sessions: sessions.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS),
                idle_timeout: sessions
                    .idle_timeout_secs
                    .map_or(DEFAULT_IDLE_TIMEOUT, Duration::from_secs),
            },
            session,
            worker: WorkerSettings {
                retry_interval: persistence
                    .retry_interval_secs
                    .map_or(DEFAULT_RETRY_INTERVAL, Duration::from_secs),
                max_backlog: persistence.max_backlog.unwrap_or(DEFAULT_MAX_BACKLOG),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("FOOTFALL_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("FOOTFALL_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(addr) = std::env::var("FOOTFALL_STREAM_ADDR") {
            if !addr.trim().is_empty() {
                self.stream_addr = addr;
            }
        }
        if let Ok(backend) = std::env::var("FOOTFALL_BACKEND") {
            if !backend.trim().is_empty() {
                self.backend = Some(backend.trim().to_string());
            }
        }
        if let Ok(max) = std::env::var("FOOTFALL_MAX_SESSIONS") {
            self.registry.max_sessions = max
                .trim()
                .parse()
                .map_err(|_| anyhow!("FOOTFALL_MAX_SESSIONS must be a positive integer"))?;
        }
        if let Ok(idle) = std::env::var("FOOTFALL_IDLE_TIMEOUT_SECS") {
            let seconds: u64 = idle.trim().parse().map_err(|_| {
                anyhow!("FOOTFALL_IDLE_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.registry.idle_timeout = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.registry.max_sessions == 0 {
            return Err(anyhow!("max_sessions must be greater than zero"));
        }
        for (name, value) in [
            ("idle timeout", self.registry.idle_timeout),
            ("reap interval", self.reap_interval),
            ("stats interval", self.stats_interval),
            ("snapshot interval", self.session.snapshot_interval),
            ("record interval", self.session.record_interval),
            ("retry interval", self.worker.retry_interval),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        if self.worker.max_backlog == 0 {
            return Err(anyhow!("max_backlog must be greater than zero"));
        }
        if self.session.frame_width == 0 || self.session.frame_height == 0 {
            return Err(anyhow!("frame size must be non-zero"));
        }

        let fusion = &self.session.fusion;
        if fusion.history_capacity == 0 || fusion.trail_capacity == 0 {
            return Err(anyhow!("history and trail capacities must be greater than zero"));
        }
        if !(fusion.overlap_threshold > 0.0 && fusion.overlap_threshold <= 1.0) {
            return Err(anyhow!("overlap_threshold must be in (0, 1]"));
        }

        let behavior = &self.session.behavior;
        if !(behavior.heatmap_decay > 0.0 && behavior.heatmap_decay <= 1.0) {
            return Err(anyhow!("heatmap_decay must be in (0, 1]"));
        }
        if behavior.heatmap_radius == 0 {
            return Err(anyhow!("heatmap_radius must be greater than zero"));
        }
        if !(behavior.speed_threshold >= 0.0) || !(behavior.min_stop_secs >= 0.0) {
            return Err(anyhow!("stop thresholds must be non-negative"));
        }

        let load = &self.session.load;
        if load.window == 0 {
            return Err(anyhow!("load window must be greater than zero"));
        }
        if load.low_water_ms >= load.high_water_ms {
            return Err(anyhow!(
                "low_water_ms ({}) must be below high_water_ms ({})",
                load.low_water_ms,
                load.high_water_ms
            ));
        }
        if load.min_attribute_interval == 0
            || load.min_attribute_interval > load.max_attribute_interval
        {
            return Err(anyhow!(
                "attribute interval bounds must satisfy 0 < min <= max"
            ));
        }

        if let Some(zones) = &self.session.zones {
            let mut seen = HashSet::new();
            for zone in zones {
                if !seen.insert(zone.name.as_str()) {
                    return Err(anyhow!("duplicate zone name '{}'", zone.name));
                }
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<FootfallConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
