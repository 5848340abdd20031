//! Content moderation.
//!
//! A [`ModerationGate`] answers pass or violation for a piece of text.
//! [`PolicyGate`] decides what an unreachable moderation service means.

mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub use self::http::HttpModerationGate;

/// Errors from a moderation check.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModerationError {
    /// The text was judged not to pass.
    #[error("{0}")]
    Violation(String),
    /// The service could not give an answer.
    #[error("{0}")]
    Unavailable(String),
}

/// Checks text against content policy.
#[async_trait]
pub trait ModerationGate: Send + Sync {
    async fn check(&self, text: &str) -> Result<(), ModerationError>;
}

/// Gate that passes every text. Used when no moderation service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl ModerationGate for AllowAll {
    async fn check(&self, _text: &str) -> Result<(), ModerationError> {
        Ok(())
    }
}

/// What an unreachable moderation service means for the text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat the text as not passing.
    #[default]
    FailClosed,
    /// Let the text through and log a warning.
    FailOpen,
}

/// Applies a [`FailurePolicy`] to another gate.
pub struct PolicyGate {
    inner: Arc<dyn ModerationGate>,
    policy: FailurePolicy,
}

impl PolicyGate {
    pub fn new(inner: Arc<dyn ModerationGate>, policy: FailurePolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ModerationGate for PolicyGate {
    async fn check(&self, text: &str) -> Result<(), ModerationError> {
        match self.inner.check(text).await {
            Err(ModerationError::Unavailable(reason)) if self.policy == FailurePolicy::FailOpen => {
                tracing::warn!("Moderation unavailable, letting text through: {}", reason);
                Ok(())
            }
            other => other,
        }
    }
}
