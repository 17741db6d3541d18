//! demo - synthetic end-to-end run of a footfall session
//!
//! Replays a few scripted shoppers walking entrance → product area →
//! checkout (pausing along the way) through one session and prints the final
//! statistics as JSON.

use anyhow::{anyhow, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use footfall::detect::{AttributeEstimate, SceneFrame, ScriptedFactory};
use footfall::fusion::Gender;
use footfall::storage::WorkerSettings;
use footfall::{
    BoundingBox, EventKind, Frame, IngestOutcome, PersistenceWorker, Point, RegistrySettings,
    SessionRegistry, SessionSettings, SqliteAnalyticsStore, Track,
};

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;
const WALK_SPEED_PX_S: f64 = 60.0;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Duration of the synthetic stream in seconds.
    #[arg(long, default_value_t = 60)]
    seconds: u64,
    /// Frames per second for the synthetic stream.
    #[arg(long, default_value_t = 10)]
    fps: u32,
    /// Number of synthetic shoppers.
    #[arg(long, default_value_t = 3)]
    people: u32,
    /// Optional SQLite file for snapshots and records.
    #[arg(long)]
    db: Option<String>,
    /// Seed for attribute noise.
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

/// A scripted visitor: waypoints with a pause (seconds) at each.
struct Walker {
    id: u64,
    enters_at: f64,
    age: f64,
    gender: Gender,
    route: Vec<(Point, f64)>,
}

impl Walker {
    fn new(index: u32) -> Self {
        let lane = f64::from(index % 3) * 20.0;
        Self {
            id: u64::from(index) + 1,
            enters_at: f64::from(index) * 4.0,
            age: 22.0 + f64::from(index) * 9.0,
            gender: if index % 2 == 0 {
                Gender::Female
            } else {
                Gender::Male
            },
            route: vec![
                (Point::new(60.0 + lane, 60.0), 1.0),
                (Point::new(300.0 + lane, 230.0), 8.0 + f64::from(index % 2) * 30.0),
                (Point::new(340.0 - lane, 260.0), 3.0),
                (Point::new(540.0, 400.0 + lane / 2.0), 5.0),
                (Point::new(630.0, 470.0), 0.0),
            ],
        }
    }

    /// Position at stream time `t`, or `None` before entering / after leaving.
    fn position(&self, t: f64) -> Option<Point> {
        let mut clock = self.enters_at;
        if t < clock {
            return None;
        }
        for pair in self.route.windows(2) {
            let (from, pause) = pair[0];
            let (to, _) = pair[1];
            if t < clock + pause {
                return Some(from);
            }
            clock += pause;
            let leg = from.distance(&to) / WALK_SPEED_PX_S;
            if t < clock + leg {
                let f = (t - clock) / leg;
                return Some(Point::new(
                    from.x + (to.x - from.x) * f,
                    from.y + (to.y - from.y) * f,
                ));
            }
            clock += leg;
        }
        None
    }
}

fn person_box(p: Point) -> BoundingBox {
    BoundingBox::new(p.x - 20.0, p.y - 50.0, p.x + 20.0, p.y + 50.0)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }

    let worker = match &args.db {
        Some(path) => Some(PersistenceWorker::spawn(
            Box::new(SqliteAnalyticsStore::open(path)?),
            WorkerSettings::default(),
        )?),
        None => None,
    };

    let script = ScriptedFactory::new();
    let registry = SessionRegistry::new(
        RegistrySettings::default(),
        SessionSettings {
            frame_width: FRAME_WIDTH,
            frame_height: FRAME_HEIGHT,
            ..SessionSettings::default()
        },
        Arc::new(script.clone()),
        worker.as_ref().map(PersistenceWorker::handle),
    );
    let session = registry.create(Some("demo".to_string()))?;
    registry.start(session.id())?;

    let walkers: Vec<Walker> = (0..args.people).map(Walker::new).collect();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let start = footfall::now_s()?;
    let total_frames = args.seconds * u64::from(args.fps);
    let mut events = 0usize;
    let mut stops = 0usize;
    let mut skipped = 0usize;

    for i in 0..total_frames {
        let t = i as f64 / f64::from(args.fps);
        let mut tracks = Vec::new();
        let mut faces = Vec::new();
        for walker in &walkers {
            let Some(p) = walker.position(t) else {
                continue;
            };
            let bbox = person_box(p);
            tracks.push(Track::new(walker.id, bbox, 0.9));
            faces.push(AttributeEstimate {
                bbox: BoundingBox::new(p.x - 10.0, p.y - 48.0, p.x + 10.0, p.y - 28.0),
                age: Some(walker.age + rng.gen_range(-4.0..4.0)),
                age_confidence: rng.gen_range(0.5..0.95),
                gender: Some(if rng.gen_bool(0.9) {
                    walker.gender
                } else if walker.gender == Gender::Male {
                    Gender::Female
                } else {
                    Gender::Male
                }),
                quality: rng.gen_range(0.4..1.0),
            });
        }
        script.clear()?;
        script.push(SceneFrame::tracks(tracks).with_attributes(faces))?;
        match session.ingest_frame(Frame::blank(FRAME_WIDTH, FRAME_HEIGHT), start + t)? {
            IngestOutcome::Processed(result) => {
                events += result.events.len();
                stops += result
                    .events
                    .iter()
                    .filter(|e| e.kind == EventKind::Stop)
                    .count();
            }
            IngestOutcome::Skipped(_) => skipped += 1,
            IngestOutcome::Dropped => {}
        }
    }

    let stats = session.stats()?;
    registry.stop(session.id())?;
    if let Some(worker) = worker {
        worker.shutdown()?;
    }

    log::info!(
        "demo finished: {} frames, {} skipped, {} events ({} stops)",
        total_frames,
        skipped,
        events,
        stops
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
