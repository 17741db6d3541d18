//! Duplex frame stream server.
//!
//! Newline-delimited JSON over TCP, one thread per connection. A connection
//! attaches to exactly one session; frames are processed inline, so a single
//! connection never has more than one frame in flight.

use anyhow::{anyhow, Result};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::messages::{encode_line, parse_client_message, ClientMessage, ServerMessage};
use crate::frame::MAX_PAYLOAD_BYTES;
use crate::session::{Session, SessionError, SessionState};
use crate::SessionRegistry;

const MAX_LINE_BYTES: usize = MAX_PAYLOAD_BYTES + 4096;
const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub addr: String,
    /// Silence on a connection for this long triggers a `stats_update`.
    pub stats_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8800".to_string(),
            stats_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub struct StreamHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StreamHandle {
    /// Stop accepting, then wait for open connections to notice and close.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("stream server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct StreamServer {
    cfg: StreamConfig,
    registry: Arc<SessionRegistry>,
}

impl StreamServer {
    pub fn new(cfg: StreamConfig, registry: Arc<SessionRegistry>) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<StreamHandle> {
        if self.cfg.stats_interval.is_zero() {
            return Err(anyhow!("stats interval must be greater than zero"));
        }
        let listener = TcpListener::bind(self.cfg.addr.as_str())?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("frame-stream".to_string())
            .spawn(move || {
                if let Err(err) = run_stream(listener, self.registry, self.cfg, shutdown_thread) {
                    log::error!("frame stream stopped: {}", err);
                }
            })?;
        log::info!("frame stream listening on {}", addr);
        Ok(StreamHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_stream(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    cfg: StreamConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let registry = registry.clone();
                let shutdown = shutdown.clone();
                let stats_interval = cfg.stats_interval;
                let spawned = std::thread::Builder::new()
                    .name(format!("stream-{}", peer))
                    .spawn(move || {
                        if let Err(err) = serve_connection(stream, &registry, stats_interval, &shutdown)
                        {
                            log::warn!("stream connection {} closed: {:#}", peer, err);
                        }
                    });
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(err) => log::warn!("failed to spawn stream connection thread: {}", err),
                }
                connections.retain(|c| !c.is_finished());
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => break Err(err.into()),
        }
    };
    shutdown.store(true, Ordering::SeqCst);
    for connection in connections {
        let _ = connection.join();
    }
    result
}

enum LineRead {
    Line(String),
    Idle,
    Closed,
}

/// Read one newline-terminated line. A read timeout keeps the partial bytes in
/// `buf` and reports `Idle` so the caller can do periodic work.
fn next_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> Result<LineRead> {
    let budget = (MAX_LINE_BYTES + 1).saturating_sub(buf.len()) as u64;
    let read = reader.by_ref().take(budget).read_until(b'\n', buf);
    if buf.len() > MAX_LINE_BYTES {
        return Err(anyhow!("message exceeds {} bytes", MAX_LINE_BYTES));
    }
    match read {
        Ok(0) => Ok(LineRead::Closed),
        Ok(_) if buf.ends_with(b"\n") => {
            let line = String::from_utf8(std::mem::take(buf))
                .map_err(|_| anyhow!("message is not valid utf-8"))?;
            Ok(LineRead::Line(line))
        }
        Ok(_) => Ok(LineRead::Closed),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            Ok(LineRead::Idle)
        }
        Err(e) => Err(e.into()),
    }
}

fn send(writer: &mut TcpStream, message: &ServerMessage) -> Result<()> {
    writer.write_all(&encode_line(message)?)?;
    writer.flush()?;
    Ok(())
}

fn stats_update(session: &Session) -> Result<ServerMessage> {
    Ok(ServerMessage::StatsUpdate {
        stats: session.stats()?,
        is_running: session.state()? == SessionState::Running,
    })
}

fn serve_connection(
    stream: TcpStream,
    registry: &SessionRegistry,
    stats_interval: Duration,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL.min(stats_interval)))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    let deadline = Instant::now() + ATTACH_TIMEOUT;
    let session_id = loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        match next_line(&mut reader, &mut buf)? {
            LineRead::Line(line) => match parse_client_message(&line) {
                Ok(ClientMessage::Attach { session_id }) => break session_id,
                Ok(_) => {
                    send(
                        &mut writer,
                        &ServerMessage::error("attach_required", "first message must be attach"),
                    )?;
                    return Ok(());
                }
                Err(e) => {
                    send(&mut writer, &ServerMessage::error("invalid_message", e.to_string()))?;
                    return Ok(());
                }
            },
            LineRead::Idle if Instant::now() >= deadline => {
                send(&mut writer, &ServerMessage::error("attach_timeout", "no attach received"))?;
                return Ok(());
            }
            LineRead::Idle => {}
            LineRead::Closed => return Ok(()),
        }
    };

    let session = match registry.get(&session_id) {
        Ok(session) => session,
        Err(err) => {
            let code = err
                .downcast_ref::<SessionError>()
                .map_or("internal_error", SessionError::code);
            send(&mut writer, &ServerMessage::error(code, err.to_string()))?;
            return Ok(());
        }
    };
    log::info!("stream attached to session {}", session.id());
    send(&mut writer, &stats_update(&session)?)?;
    let mut last_traffic = Instant::now();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match next_line(&mut reader, &mut buf)? {
            LineRead::Line(line) => {
                last_traffic = Instant::now();
                let reply = match parse_client_message(&line) {
                    Ok(ClientMessage::VideoFrame { frame }) => match session.ingest(&frame) {
                        Ok(outcome) => outcome.result().map(|r| ServerMessage::FrameResult {
                            frame: r.frame.clone(),
                            stats: r.stats.clone(),
                        }),
                        Err(err) => Some(match err.downcast_ref::<SessionError>() {
                            Some(e) => ServerMessage::error(e.code(), e.to_string()),
                            None => {
                                log::warn!("session {}: frame failed: {:#}", session.id(), err);
                                ServerMessage::error("frame_failed", format!("{:#}", err))
                            }
                        }),
                    },
                    Ok(ClientMessage::GetStats) => Some(stats_update(&session)?),
                    Ok(ClientMessage::Attach { .. }) => Some(ServerMessage::error(
                        "already_attached",
                        "connection is already attached to a session",
                    )),
                    Err(e) => Some(ServerMessage::error("invalid_message", e.to_string())),
                };
                if let Some(reply) = reply {
                    send(&mut writer, &reply)?;
                    last_traffic = Instant::now();
                }
            }
            LineRead::Idle => {
                if last_traffic.elapsed() >= stats_interval {
                    send(&mut writer, &stats_update(&session)?)?;
                    last_traffic = Instant::now();
                }
            }
            LineRead::Closed => break,
        }
    }
    log::info!("stream detached from session {}", session.id());
    Ok(())
}
