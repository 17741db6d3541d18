use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use footfall::api::{ApiConfig, ApiHandle, ApiServer};
use footfall::detect::{SceneFrame, ScriptedFactory, Track};
use footfall::storage::{AnalysisRecord, AnalyticsStore, InMemoryAnalyticsStore};
use footfall::{BoundingBox, Frame, RegistrySettings, SessionRegistry, SessionSettings, StatsSnapshot};

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

struct TestApi {
    registry: Arc<SessionRegistry>,
    factory: ScriptedFactory,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(max_sessions: usize, store: Option<InMemoryAnalyticsStore>) -> Result<Self> {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(SessionRegistry::new(
            RegistrySettings {
                max_sessions,
                ..RegistrySettings::default()
            },
            SessionSettings {
                frame_width: 120,
                frame_height: 90,
                ..SessionSettings::default()
            },
            Arc::new(factory.clone()),
            None,
        ));
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        };
        let store: Option<Box<dyn AnalyticsStore>> = match store {
            Some(store) => Some(Box::new(store)),
            None => None,
        };
        let api_handle = ApiServer::new(api_config, registry.clone(), store).spawn()?;
        Ok(Self {
            registry,
            factory,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>) -> Result<(String, Value)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let body = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {len}\r\n\r\n{body}",
            len = body.len()
        );
        stream.write_all(request.as_bytes())?;
        let (headers, body) = read_response(&mut stream)?;
        let json = serde_json::from_str(&body)?;
        Ok((headers, json))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn health_reports_capacity_and_backend() -> Result<()> {
    let api = TestApi::new(5, None)?;
    let (headers, body) = api.request("GET", "/health", None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["status"], "ok");
    assert_eq!(body["max_sessions"], 5);
    assert_eq!(body["backend"], "scripted");
    Ok(())
}

#[test]
fn session_lifecycle_over_http() -> Result<()> {
    let api = TestApi::new(4, None)?;

    let (headers, created) = api.request("POST", "/api/sessions", Some(r#"{"username":"kim"}"#))?;
    assert!(headers.contains("200 OK"));
    let id = created["session_id"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 32);
    assert_eq!(created["username"], "kim");
    assert_eq!(created["state"], "idle");

    let (_, anonymous) = api.request("POST", "/api/sessions", None)?;
    let anon_id = anonymous["session_id"].as_str().unwrap();
    assert_eq!(anonymous["username"], format!("viewer_{}", &anon_id[..8]));

    let (_, listed) = api.request("GET", "/api/sessions", None)?;
    assert_eq!(listed["sessions"].as_array().unwrap().len(), 2);

    let (headers, heatmap) = api.request("GET", &format!("/api/sessions/{id}/heatmap"), None)?;
    assert!(headers.contains("409 Conflict"));
    assert_eq!(heatmap["error"], "session_not_running");

    let (headers, started) = api.request("POST", &format!("/api/sessions/{id}/start"), None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(started["state"], "running");

    let session = api.registry.get(&id)?;
    api.factory.push(SceneFrame::tracks(vec![Track::new(
        1,
        BoundingBox::new(10.0, 10.0, 30.0, 50.0),
        0.8,
    )]))?;
    session.ingest_frame(Frame::blank(120, 90), 5.0)?;

    let (headers, stats) = api.request("GET", &format!("/api/sessions/{id}/stats"), None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(stats["is_running"], true);
    assert_eq!(stats["stats"]["realtime"]["active_tracks"], 1);
    assert_eq!(stats["stats"]["frame_count"], 1);

    let (_, grid) = api.request(
        "GET",
        &format!("/api/sessions/{id}/heatmap?cols=4&rows=3"),
        None,
    )?;
    assert_eq!(grid["cols"], 4);
    assert_eq!(grid["cells"].as_array().unwrap().len(), 3);
    assert!(grid["max"].as_f64().unwrap() > 0.0);

    let (headers, status) = api.request("GET", &format!("/api/sessions/{id}"), None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(status["frame_count"], 1);

    let (headers, stopped) = api.request("POST", &format!("/api/sessions/{id}/stop"), None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(stopped["flushed"], true);

    let (headers, missing) = api.request("GET", &format!("/api/sessions/{id}"), None)?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(missing["error"], "session_not_found");
    Ok(())
}

#[test]
fn capacity_and_bad_requests() -> Result<()> {
    let api = TestApi::new(1, None)?;
    let (headers, _) = api.request("POST", "/api/sessions", None)?;
    assert!(headers.contains("200 OK"));
    let (headers, body) = api.request("POST", "/api/sessions", None)?;
    assert!(headers.contains("503 Service Unavailable"));
    assert_eq!(body["error"], "capacity_exhausted");

    let (headers, _) = api.request("POST", "/api/sessions", Some("{not json"))?;
    assert!(headers.contains("400 Bad Request"));
    let (headers, _) = api.request("DELETE", "/api/sessions", None)?;
    assert!(headers.contains("405 Method Not Allowed"));
    let (headers, _) = api.request("GET", "/nowhere", None)?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.request("POST", "/api/sessions/feedface/start", None)?;
    assert!(headers.contains("404 Not Found"));
    let (headers, body) = api.request("GET", "/api/records", None)?;
    assert!(headers.contains("503 Service Unavailable"));
    assert_eq!(body["error"], "storage_unavailable");
    Ok(())
}

#[test]
fn records_are_listed_newest_first() -> Result<()> {
    let mut store = InMemoryAnalyticsStore::new();
    for (session_id, at) in [("shop 1", 0.5), ("a", 1.0), ("b", 2.0), ("a", 3.0)] {
        store.save_analysis_record(&AnalysisRecord {
            session_id: session_id.to_string(),
            recorded_at: at,
            final_record: false,
            stats: StatsSnapshot::empty(at),
        })?;
    }
    let api = TestApi::new(1, Some(store))?;

    let (headers, body) = api.request("GET", "/api/records?limit=2", None)?;
    assert!(headers.contains("200 OK"));
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["recorded_at"], 3.0);
    assert_eq!(records[1]["recorded_at"], 2.0);

    let (_, body) = api.request("GET", "/api/records?session_id=a", None)?;
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r["session_id"] == "a"));

    let (_, body) = api.request("GET", "/api/records?session_id=shop%201", None)?;
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["session_id"], "shop 1");

    let (headers, _) = api.request("GET", "/api/records?limit=lots", None)?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn queries_answer_while_a_frame_is_in_flight() -> Result<()> {
    let api = TestApi::new(2, None)?;
    let (_, created) = api.request("POST", "/api/sessions", None)?;
    let id = created["session_id"].as_str().unwrap().to_string();
    api.request("POST", &format!("/api/sessions/{id}/start"), None)?;

    let (release, gate) = mpsc::channel();
    api.factory.push(
        SceneFrame::tracks(vec![Track::new(1, BoundingBox::new(10.0, 10.0, 30.0, 50.0), 0.8)])
            .gated(gate),
    )?;
    let session = api.registry.get(&id)?;
    let frame = std::thread::spawn(move || session.ingest_frame(Frame::blank(120, 90), 5.0));
    let deadline = Instant::now() + Duration::from_secs(5);
    while api.factory.detect_calls()? == 0 {
        assert!(Instant::now() < deadline, "frame never started");
        std::thread::sleep(Duration::from_millis(5));
    }

    // A client that connects and never sends must not hold up others.
    let _idle_client = TcpStream::connect(api.handle().addr)?;

    let (headers, status) = api.request("GET", &format!("/api/sessions/{id}"), None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(status["frame_count"], 0);
    let (headers, stats) = api.request("GET", &format!("/api/sessions/{id}/stats"), None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(stats["is_running"], true);
    let (_, listed) = api.request("GET", "/api/sessions", None)?;
    assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);

    release.send(())?;
    frame.join().unwrap()?;
    let (_, stats) = api.request("GET", &format!("/api/sessions/{id}/stats"), None)?;
    assert_eq!(stats["stats"]["frame_count"], 1);
    Ok(())
}
