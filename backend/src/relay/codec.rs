//! Request encoding and line decoding for streaming models.

use bigmodel_common::ReplyChunk;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A decoded stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An output increment to forward.
    Token(String),
    /// Upstream signalled the end of the stream.
    End,
}

/// A stream line that could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unparseable stream line: {0}")]
pub struct ParseError(pub String);

/// Wire format of one streaming model.
pub trait StreamCodec: Send + Sync + 'static {
    type Request: Send + Sync;

    /// Text to moderate before the request is sent, if any.
    fn input_text<'a>(&self, request: &'a Self::Request) -> Option<&'a str>;

    /// JSON body posted to the endpoint.
    fn encode(&self, request: &Self::Request) -> Result<Value, serde_json::Error>;

    /// Decode one line. `Ok(None)` is a line carrying nothing to forward.
    fn decode_line(&self, line: &str) -> Result<Option<Frame>, ParseError>;
}

/// Request for the chat models.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub inputs: String,
    /// Earlier turns as `[question, answer]` pairs.
    #[serde(default)]
    pub history: Vec<[String; 2]>,
    #[serde(default)]
    pub sampling: bool,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f64,
}

fn default_top_k() -> u32 {
    1
}
fn default_top_p() -> f64 {
    0.7
}
fn default_temperature() -> f64 {
    0.95
}
fn default_repetition_penalty() -> f64 {
    1.0
}

impl ChatRequest {
    pub fn new(inputs: impl Into<String>) -> Self {
        Self {
            inputs: inputs.into(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            temperature: default_temperature(),
            repetition_penalty: default_repetition_penalty(),
            ..Default::default()
        }
    }
}

/// Codec for the `data: {"reply": ..., "stream_status": ...}` line protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyStreamCodec;

impl StreamCodec for ReplyStreamCodec {
    type Request = ChatRequest;

    fn input_text<'a>(&self, request: &'a ChatRequest) -> Option<&'a str> {
        Some(request.inputs.as_str())
    }

    fn encode(&self, request: &ChatRequest) -> Result<Value, serde_json::Error> {
        serde_json::to_value(request)
    }

    fn decode_line(&self, line: &str) -> Result<Option<Frame>, ParseError> {
        let line = line.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
        if line.is_empty() {
            return Ok(None);
        }

        let data = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
        let chunk: ReplyChunk =
            serde_json::from_str(data).map_err(|e| ParseError(format!("{}: {}", e, data)))?;

        if chunk.is_done() {
            return Ok(Some(Frame::End));
        }
        if chunk.reply.is_empty() {
            return Ok(None);
        }
        Ok(Some(Frame::Token(chunk.reply)))
    }
}
