//! Streaming wire types.
//!
//! Upstream chat models answer with a line-delimited pseudo event stream,
//! one `data: <json>` line per increment:
//!
//! ```text
//! data: {"reply": "Hel", "stream_status": ""}
//! data: {"reply": "lo", "stream_status": ""}
//! data: {"reply": "", "stream_status": "DONE"}
//! ```
//!
//! The relay turns those lines into [`StreamEvent`]s for its consumer.

use serde::{Deserialize, Serialize};

/// Value of `stream_status` that ends a stream.
pub const STREAM_STATUS_DONE: &str = "DONE";

/// Payload of one upstream stream line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyChunk {
    #[serde(default)]
    pub reply: String,
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub stream_status: String,
}

impl ReplyChunk {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: text.into(),
            ..Default::default()
        }
    }

    pub fn done() -> Self {
        Self {
            stream_status: STREAM_STATUS_DONE.to_string(),
            ..Default::default()
        }
    }

    pub fn is_done(&self) -> bool {
        self.stream_status == STREAM_STATUS_DONE
    }

    /// Render as a `data: ...\n` line, the way upstream endpoints send it.
    pub fn to_line(&self) -> String {
        // Serializing a plain struct of strings and ints cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("data: {}\n", json)
    }
}

/// Event delivered to the consumer of a streaming session.
///
/// A session yields any number of `Token`s followed by exactly one terminal
/// event (`Done`, `Aborted` or `Failed`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A decoded output increment.
    Token { text: String },
    /// Upstream signalled the end of the stream.
    Done,
    /// Moderation rejected the output; nothing follows.
    Aborted { reason: String },
    /// Transport failure or cancellation.
    Failed { reason: String },
}

impl StreamEvent {
    pub fn token(text: impl Into<String>) -> Self {
        StreamEvent::Token { text: text.into() }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        StreamEvent::Aborted {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        StreamEvent::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token { .. })
    }

    /// Short name, used as the SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Token { .. } => "token",
            StreamEvent::Done => "done",
            StreamEvent::Aborted { .. } => "aborted",
            StreamEvent::Failed { .. } => "failed",
        }
    }
}
