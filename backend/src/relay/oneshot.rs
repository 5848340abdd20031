//! Single request / single response inference.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::moderation::ModerationGate;
use crate::pool::{AcquireMode, EndpointPools};

use super::ParseError;

/// Wire format of one non-streaming model.
pub trait OneShotCodec: Send + Sync + 'static {
    type Request: Send + Sync;
    type Response: Send;

    /// Text to moderate before the request is sent, if any.
    fn input_text<'a>(&self, request: &'a Self::Request) -> Option<&'a str>;

    /// Text to moderate before the response is handed back, if any.
    fn output_text<'a>(&self, _response: &'a Self::Response) -> Option<&'a str> {
        None
    }

    fn encode(&self, request: &Self::Request) -> std::result::Result<Value, serde_json::Error>;

    fn decode(&self, body: Value) -> std::result::Result<Self::Response, ParseError>;
}

/// Posts the payload as-is and returns the response JSON untouched.
///
/// A top-level string field `text`, when present, is moderated.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPassthrough;

impl OneShotCodec for JsonPassthrough {
    type Request = Value;
    type Response = Value;

    fn input_text<'a>(&self, request: &'a Value) -> Option<&'a str> {
        request.get("text").and_then(Value::as_str)
    }

    fn encode(&self, request: &Value) -> std::result::Result<Value, serde_json::Error> {
        Ok(request.clone())
    }

    fn decode(&self, body: Value) -> std::result::Result<Value, ParseError> {
        Ok(body)
    }
}

/// Request for prompt-completion models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
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
    0.85
}
fn default_temperature() -> f64 {
    0.3
}
fn default_repetition_penalty() -> f64 {
    1.1
}

#[derive(Debug, Deserialize)]
struct TextGenerationResponse {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    result: Vec<TextGenerationResult>,
}

#[derive(Debug, Deserialize)]
struct TextGenerationResult {
    #[serde(default)]
    text_generation_text: Vec<String>,
}

/// Codec for `{"code": 200, "result": [{"text_generation_text": [...]}]}`.
///
/// The generated text is moderated before it is returned.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextGenerationCodec;

impl OneShotCodec for TextGenerationCodec {
    type Request = PromptRequest;
    type Response = String;

    fn input_text<'a>(&self, request: &'a PromptRequest) -> Option<&'a str> {
        Some(request.prompt.as_str())
    }

    fn output_text<'a>(&self, response: &'a String) -> Option<&'a str> {
        Some(response.as_str())
    }

    fn encode(&self, request: &PromptRequest) -> std::result::Result<Value, serde_json::Error> {
        serde_json::to_value(request)
    }

    fn decode(&self, body: Value) -> std::result::Result<String, ParseError> {
        let response: TextGenerationResponse =
            serde_json::from_value(body).map_err(|e| ParseError(e.to_string()))?;

        if response.code != 200 {
            return Err(ParseError(format!(
                "generation failed with code {}: {}",
                response.code, response.msg
            )));
        }

        response
            .result
            .into_iter()
            .next()
            .and_then(|r| r.text_generation_text.into_iter().next())
            .ok_or_else(|| ParseError("response carries no generated text".to_string()))
    }
}

/// Invokes non-streaming models on pooled endpoints.
pub struct OneShotClient<C: OneShotCodec> {
    codec: Arc<C>,
    pools: Arc<EndpointPools>,
    gate: Arc<dyn ModerationGate>,
    http_client: Client,
    request_timeout: Duration,
}

impl<C: OneShotCodec> Clone for OneShotClient<C> {
    fn clone(&self) -> Self {
        Self {
            codec: self.codec.clone(),
            pools: self.pools.clone(),
            gate: self.gate.clone(),
            http_client: self.http_client.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

impl<C: OneShotCodec> OneShotClient<C> {
    pub fn new(
        codec: C,
        pools: Arc<EndpointPools>,
        gate: Arc<dyn ModerationGate>,
        http_client: Client,
        request_timeout: Duration,
    ) -> Self {
        Self {
            codec: Arc::new(codec),
            pools,
            gate,
            http_client,
            request_timeout,
        }
    }

    /// How the pool of `kind` waits for an endpoint by default.
    pub fn default_mode(&self, kind: &str) -> Result<AcquireMode> {
        self.pools.get(kind).map(|pool| pool.default_mode())
    }

    /// Send one request to an endpoint of `kind` and decode the answer.
    ///
    /// The endpoint is released when this returns, whatever the outcome.
    pub async fn invoke(&self, kind: &str, request: &C::Request, mode: AcquireMode) -> Result<C::Response> {
        let pool = self.pools.get(kind)?;

        if let Some(text) = self.codec.input_text(request) {
            self.gate.check(text).await?;
        }

        let body = self
            .codec
            .encode(request)
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;

        let lease = pool.acquire_with(mode).await?;
        tracing::debug!("Invoking {} on {}", kind, lease.endpoint());

        let response = self
            .http_client
            .post(lease.endpoint().url())
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to reach {}: {}", lease.endpoint(), e);
                Error::Connection(e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            tracing::warn!("{} returned {}", lease.endpoint(), status);
            return Err(Error::Upstream(format!("{} - {}", status, text)));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("invalid response body: {}", e)))?;
        lease.release();

        let decoded = self
            .codec
            .decode(value)
            .map_err(|e| Error::Upstream(e.to_string()))?;

        if let Some(text) = self.codec.output_text(&decoded) {
            self.gate.check(text).await?;
        }

        Ok(decoded)
    }
}
