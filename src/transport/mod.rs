//! Viewer-facing transport: the newline-delimited JSON frame stream.
//!
//! Clients attach to a session, push `video_frame` messages and receive
//! `frame_result` replies, with `stats_update` on request or after a quiet
//! interval.

pub mod messages;
mod stream;

pub use messages::{encode_line, parse_client_message, ClientMessage, ServerMessage};
pub use stream::{StreamConfig, StreamHandle, StreamServer};
