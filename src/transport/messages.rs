//! Duplex stream message types.
//!
//! Every message is one JSON object per line, discriminated by `type`:
//! clients send `attach`, `video_frame` and `get_stats`; the server answers
//! with `frame_result`, `stats_update` or `error`.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::stats::StatsSnapshot;

/// Client → server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first message on a connection.
    Attach { session_id: String },

    /// Base64 frame, optionally as a `data:image/...;base64,` URL.
    VideoFrame { frame: String },

    GetStats,
}

/// Server → client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Annotated frame plus the statistics after processing it.
    FrameResult { frame: String, stats: StatsSnapshot },

    StatsUpdate {
        stats: StatsSnapshot,
        is_running: bool,
    },

    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Parse one line from a client. Blank lines are an error, not a no-op.
pub fn parse_client_message(line: &str) -> Result<ClientMessage> {
    let line = line.trim();
    if line.is_empty() {
        return Err(anyhow!("empty message"));
    }
    serde_json::from_str(line).map_err(|e| anyhow!("invalid client message: {}", e))
}

/// Serialise a server message as a single newline-terminated line.
pub fn encode_line(message: &ServerMessage) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec(message)?;
    out.push(b'\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_messages() {
        assert_eq!(
            parse_client_message(r#"{"type":"attach","session_id":"ab12"}"#).unwrap(),
            ClientMessage::Attach {
                session_id: "ab12".to_string()
            }
        );
        assert_eq!(
            parse_client_message("{\"type\":\"get_stats\"}\r\n").unwrap(),
            ClientMessage::GetStats
        );
        assert!(matches!(
            parse_client_message(r#"{"type":"video_frame","frame":"aGk="}"#).unwrap(),
            ClientMessage::VideoFrame { .. }
        ));
    }

    #[test]
    fn rejects_unknown_or_empty() {
        assert!(parse_client_message("").is_err());
        assert!(parse_client_message(r#"{"type":"dance"}"#).is_err());
        assert!(parse_client_message(r#"{"type":"video_frame"}"#).is_err());
    }

    #[test]
    fn server_messages_are_tagged_lines() {
        let line = encode_line(&ServerMessage::StatsUpdate {
            stats: StatsSnapshot::empty(1.5),
            is_running: false,
        })
        .unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let v: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(v["type"], "stats_update");
        assert_eq!(v["is_running"], false);
        assert_eq!(v["stats"]["timestamp"], 1.5);

        let v: serde_json::Value =
            serde_json::from_slice(&encode_line(&ServerMessage::error("session_not_found", "x")).unwrap())
                .unwrap();
        assert_eq!(v["code"], "session_not_found");
    }
}
