//! Lifecycle HTTP API.
//!
//! Minimal HTTP/1.1 over `std::net`: one request per connection, each served
//! on its own thread. Session errors map to status codes by downcasting to
//! `SessionError`.

use crate::session::SessionError;
use crate::storage::AnalyticsStore;
use crate::SessionRegistry;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_RECORD_LIMIT: usize = 20;
const MAX_RECORD_LIMIT: usize = 500;
const DEFAULT_HEATMAP_COLS: u32 = 32;
const DEFAULT_HEATMAP_ROWS: u32 = 24;
const MAX_HEATMAP_CELLS: u32 = 256;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8799".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    registry: Arc<SessionRegistry>,
    store: Option<Box<dyn AnalyticsStore>>,
}

impl ApiServer {
    /// `store` backs `/api/records`; without one that route answers 503.
    pub fn new(
        cfg: ApiConfig,
        registry: Arc<SessionRegistry>,
        store: Option<Box<dyn AnalyticsStore>>,
    ) -> Self {
        Self {
            cfg,
            registry,
            store,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ctx = Arc::new(Context {
            registry: self.registry,
            store: self.store.map(Mutex::new),
        });
        let join = std::thread::Builder::new()
            .name("lifecycle-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx, shutdown_thread) {
                    log::error!("lifecycle api stopped: {}", err);
                }
            })?;
        log::info!("lifecycle api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct Context {
    registry: Arc<SessionRegistry>,
    store: Option<Mutex<Box<dyn AnalyticsStore>>>,
}

fn run_api(listener: TcpListener, ctx: Arc<Context>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("api-{}", peer))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("lifecycle api request rejected: {}", err);
                        }
                    });
                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(err) => log::warn!("failed to spawn api request thread: {}", err),
                }
                workers.retain(|w| !w.is_finished());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => break Err(err.into()),
        }
    };
    for worker in workers {
        let _ = worker.join();
    }
    result
}

struct Reply {
    status: u16,
    body: serde_json::Value,
}

impl Reply {
    fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": code, "message": message.into() }),
        }
    }
}

fn handle_connection(mut stream: TcpStream, ctx: &Context) -> Result<()> {
    // Accepted sockets can inherit the listener's nonblocking flag.
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let reply = Reply::error(400, "bad_request", err.to_string());
            write_json_response(&mut stream, reply.status, &reply.body.to_string())?;
            return Err(err);
        }
    };
    let reply = match route(&request, ctx) {
        Ok(reply) => reply,
        Err(err) => error_reply(&err),
    };
    if reply.status >= 500 {
        log::warn!(
            "{} {} -> {}: {}",
            request.method,
            request.path,
            reply.status,
            reply.body
        );
    } else {
        log::debug!("{} {} -> {}", request.method, request.path, reply.status);
    }
    let payload = serde_json::to_vec(&reply.body)?;
    write_response(&mut stream, reply.status, "application/json", &payload)?;
    Ok(())
}

fn error_reply(err: &anyhow::Error) -> Reply {
    match err.downcast_ref::<SessionError>() {
        Some(e @ SessionError::NotFound(_)) => Reply::error(404, e.code(), e.to_string()),
        Some(e @ SessionError::NotRunning(_)) | Some(e @ SessionError::AlreadyStopped(_)) => {
            Reply::error(409, e.code(), e.to_string())
        }
        Some(e @ SessionError::CapacityExhausted(_)) => Reply::error(503, e.code(), e.to_string()),
        None => Reply::error(500, "internal_error", format!("{:#}", err)),
    }
}

#[derive(Debug, Deserialize, Default)]
struct CreateSessionBody {
    username: Option<String>,
}

fn route(request: &HttpRequest, ctx: &Context) -> Result<Reply> {
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let method = request.method.as_str();
    match (method, segments.as_slice()) {
        ("GET", ["health"]) => Ok(Reply::ok(json!({
            "status": "ok",
            "sessions": ctx.registry.len(),
            "max_sessions": ctx.registry.settings().max_sessions,
            "backend": ctx.registry.backend_name(),
        }))),
        ("POST", ["api", "sessions"]) => {
            let body: CreateSessionBody = if request.body.iter().all(u8::is_ascii_whitespace) {
                CreateSessionBody::default()
            } else {
                match serde_json::from_slice(&request.body) {
                    Ok(body) => body,
                    Err(e) => return Ok(Reply::error(400, "invalid_body", e.to_string())),
                }
            };
            let session = ctx.registry.create(body.username)?;
            Ok(Reply::ok(serde_json::to_value(session.status()?)?))
        }
        ("GET", ["api", "sessions"]) => Ok(Reply::ok(json!({
            "sessions": ctx.registry.list()?,
        }))),
        ("GET", ["api", "sessions", id]) => {
            let session = ctx.registry.get(id)?;
            Ok(Reply::ok(serde_json::to_value(session.status()?)?))
        }
        ("POST", ["api", "sessions", id, "start"]) => {
            let session = ctx.registry.start(id)?;
            Ok(Reply::ok(serde_json::to_value(session.status()?)?))
        }
        ("POST", ["api", "sessions", id, "stop"]) => {
            let flushed = ctx.registry.stop(id)?;
            Ok(Reply::ok(json!({
                "session_id": id,
                "state": "stopped",
                "flushed": flushed,
            })))
        }
        ("GET", ["api", "sessions", id, "stats"]) => {
            let session = ctx.registry.get(id)?;
            Ok(Reply::ok(json!({
                "session_id": id,
                "is_running": session.state()? == crate::SessionState::Running,
                "stats": session.stats()?,
            })))
        }
        ("GET", ["api", "sessions", id, "heatmap"]) => {
            let session = ctx.registry.get(id)?;
            let query = request.query();
            let cols = match parse_dimension(&query, "cols", DEFAULT_HEATMAP_COLS) {
                Ok(v) => v,
                Err(e) => return Ok(Reply::error(400, "invalid_query", e.to_string())),
            };
            let rows = match parse_dimension(&query, "rows", DEFAULT_HEATMAP_ROWS) {
                Ok(v) => v,
                Err(e) => return Ok(Reply::error(400, "invalid_query", e.to_string())),
            };
            match session.heatmap_grid(cols, rows)? {
                Some(grid) => Ok(Reply::ok(serde_json::to_value(grid)?)),
                None => Err(SessionError::NotRunning(id.to_string()).into()),
            }
        }
        ("GET", ["api", "records"]) => {
            let query = request.query();
            let limit = match query.get("limit") {
                Some(v) => match v.parse::<usize>() {
                    Ok(n) => n.clamp(1, MAX_RECORD_LIMIT),
                    Err(_) => {
                        return Ok(Reply::error(400, "invalid_query", "limit must be an integer"))
                    }
                },
                None => DEFAULT_RECORD_LIMIT,
            };
            let Some(store) = ctx.store.as_ref() else {
                return Ok(Reply::error(503, "storage_unavailable", "no analytics store"));
            };
            let records = store
                .lock()
                .map_err(|_| anyhow!("analytics store lock poisoned"))?
                .recent_records(query.get("session_id").map(String::as_str), limit)?;
            Ok(Reply::ok(json!({ "records": records })))
        }
        (_, ["health"])
        | (_, ["api", "sessions"])
        | (_, ["api", "sessions", _])
        | (_, ["api", "sessions", _, "start" | "stop" | "stats" | "heatmap"])
        | (_, ["api", "records"]) => Ok(Reply::error(
            405,
            "method_not_allowed",
            format!("{} not allowed on {}", method, request.path),
        )),
        _ => Ok(Reply::error(404, "not_found", request.path.clone())),
    }
}

fn parse_dimension(query: &HashMap<String, String>, key: &str, default: u32) -> Result<u32> {
    match query.get(key) {
        None => Ok(default),
        Some(v) => {
            let n: u32 = v
                .parse()
                .map_err(|_| anyhow!("{} must be a positive integer", key))?;
            if n == 0 || n > MAX_HEATMAP_CELLS {
                return Err(anyhow!("{} must be in 1..={}", key, MAX_HEATMAP_CELLS));
            }
            Ok(n)
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break None;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break Some(pos + 4);
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    let header_end = header_end.unwrap_or(data.len());
    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("request body truncated"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    /// Percent-decoded query parameters; a repeated key keeps its last value.
    fn query(&self) -> HashMap<String, String> {
        match self.raw_path.split_once('?') {
            Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            None => HashMap::new(),
        }
    }
}
