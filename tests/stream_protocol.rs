use anyhow::{anyhow, Result};
use base64::Engine;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Cursor, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use footfall::detect::{SceneFrame, ScriptedFactory, Track};
use footfall::transport::{StreamConfig, StreamHandle, StreamServer};
use footfall::{BoundingBox, RegistrySettings, SessionRegistry, SessionSettings};

fn png_payload(width: u32, height: u32) -> Result<String> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([90, 120, 150]));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, image::ImageFormat::Png)?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes.into_inner())
    ))
}

struct TestStream {
    registry: Arc<SessionRegistry>,
    factory: ScriptedFactory,
    handle: Option<StreamHandle>,
}

impl TestStream {
    fn new(stats_interval: Duration) -> Result<Self> {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(SessionRegistry::new(
            RegistrySettings::default(),
            SessionSettings {
                frame_width: 64,
                frame_height: 48,
                ..SessionSettings::default()
            },
            Arc::new(factory.clone()),
            None,
        ));
        let handle = StreamServer::new(
            StreamConfig {
                addr: "127.0.0.1:0".to_string(),
                stats_interval,
            },
            registry.clone(),
        )
        .spawn()?;
        Ok(Self {
            registry,
            factory,
            handle: Some(handle),
        })
    }

    fn connect(&self) -> Result<Client> {
        let addr = self
            .handle
            .as_ref()
            .ok_or_else(|| anyhow!("stream server not running"))?
            .addr;
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        Ok(Client {
            writer: stream.try_clone()?,
            reader: BufReader::new(stream),
        })
    }
}

impl Drop for TestStream {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().expect("failed to stop stream server");
        }
    }
}

struct Client {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn send(&mut self, message: Value) -> Result<()> {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        Ok(())
    }

    /// Next message, or `None` once the server closed the connection.
    fn recv(&mut self) -> Result<Option<Value>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&line)?))
    }

    fn expect(&mut self, kind: &str) -> Result<Value> {
        let message = self
            .recv()?
            .ok_or_else(|| anyhow!("connection closed while waiting for {}", kind))?;
        if message["type"] != kind {
            return Err(anyhow!("expected {}, got {}", kind, message));
        }
        Ok(message)
    }
}

#[test]
fn unknown_session_gets_error_and_close() -> Result<()> {
    let server = TestStream::new(Duration::from_secs(2))?;
    let mut client = server.connect()?;
    client.send(json!({"type": "attach", "session_id": "0123456789abcdef"}))?;
    let error = client.expect("error")?;
    assert_eq!(error["code"], "session_not_found");
    assert!(client.recv()?.is_none());
    Ok(())
}

#[test]
fn first_message_must_attach() -> Result<()> {
    let server = TestStream::new(Duration::from_secs(2))?;
    let mut client = server.connect()?;
    client.send(json!({"type": "get_stats"}))?;
    let error = client.expect("error")?;
    assert_eq!(error["code"], "attach_required");
    assert!(client.recv()?.is_none());
    Ok(())
}

#[test]
fn frames_and_stats_round_trip() -> Result<()> {
    let server = TestStream::new(Duration::from_secs(30))?;
    let session = server.registry.create(None)?;
    let mut client = server.connect()?;
    client.send(json!({"type": "attach", "session_id": session.id()}))?;
    let hello = client.expect("stats_update")?;
    assert_eq!(hello["is_running"], false);
    assert_eq!(hello["stats"]["frame_count"], 0);

    // Frames before start are refused without closing the stream.
    client.send(json!({"type": "video_frame", "frame": png_payload(64, 48)?}))?;
    let error = client.expect("error")?;
    assert_eq!(error["code"], "session_not_running");

    server.registry.start(session.id())?;
    server.factory.push(SceneFrame::tracks(vec![Track::new(
        2,
        BoundingBox::new(50.0, 36.0, 60.0, 46.0),
        0.9,
    )]))?;
    client.send(json!({"type": "video_frame", "frame": png_payload(64, 48)?}))?;
    let result = client.expect("frame_result")?;
    assert!(result["frame"]
        .as_str()
        .unwrap()
        .starts_with("data:image/jpeg;base64,"));
    assert_eq!(result["stats"]["realtime"]["active_tracks"], 1);
    assert_eq!(result["stats"]["frame_count"], 1);
    assert!(result["stats"]["age_distribution"].get("65+").is_some());

    client.send(json!({"type": "video_frame", "frame": "bm90IGFuIGltYWdl"}))?;
    let error = client.expect("error")?;
    assert_eq!(error["code"], "frame_failed");

    client.send(json!({"type": "get_stats"}))?;
    let update = client.expect("stats_update")?;
    assert_eq!(update["is_running"], true);
    assert_eq!(update["stats"]["realtime"]["total_people"], 1);

    client.send(json!({"type": "shout"}))?;
    assert_eq!(client.expect("error")?["code"], "invalid_message");
    Ok(())
}

#[test]
fn silence_triggers_periodic_stats() -> Result<()> {
    let server = TestStream::new(Duration::from_millis(300))?;
    let session = server.registry.create(None)?;
    server.registry.start(session.id())?;
    let mut client = server.connect()?;
    client.send(json!({"type": "attach", "session_id": session.id()}))?;
    client.expect("stats_update")?;
    let periodic = client.expect("stats_update")?;
    assert_eq!(periodic["is_running"], true);
    Ok(())
}
