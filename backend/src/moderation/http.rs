//! Moderation backed by a remote text detection service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ModerationError, ModerationGate};

#[derive(Debug, Serialize)]
struct DetectionRequest<'a> {
    data: DetectionData<'a>,
    event_type: &'a str,
}

#[derive(Debug, Serialize)]
struct DetectionData<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct DetectionResponse {
    result: DetectionResult,
}

#[derive(Debug, Deserialize)]
struct DetectionResult {
    suggestion: String,
}

/// Gate calling a text detection service over HTTP.
///
/// Any suggestion other than `pass` is a violation.
#[derive(Debug, Clone)]
pub struct HttpModerationGate {
    http_client: Client,
    url: String,
}

impl HttpModerationGate {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http_client, url))
    }

    pub fn with_client(http_client: Client, url: impl Into<String>) -> Self {
        Self {
            http_client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ModerationGate for HttpModerationGate {
    async fn check(&self, text: &str) -> Result<(), ModerationError> {
        let body = DetectionRequest {
            data: DetectionData { text },
            event_type: "comment",
        };

        let response = self
            .http_client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModerationError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ModerationError::Unavailable(format!(
                "moderation service returned {}",
                status
            )));
        }

        let detection: DetectionResponse = response
            .json()
            .await
            .map_err(|e| ModerationError::Unavailable(format!("invalid moderation response: {}", e)))?;

        if detection.result.suggestion != "pass" {
            tracing::debug!("Moderation suggestion: {}", detection.result.suggestion);
            return Err(ModerationError::Violation("invalid text".to_string()));
        }

        Ok(())
    }
}
