pub mod admission;
pub mod config;
pub mod error;
pub mod logging;
pub mod moderation;
pub mod pool;
pub mod relay;
pub mod routes;
pub mod test_util;

pub use admission::{AdmissionController, AdmissionSettings, InMemoryTaskRepository, TaskRepository};
pub use config::Config;
pub use error::{Error, Result};
pub use moderation::{AllowAll, FailurePolicy, HttpModerationGate, ModerationGate, PolicyGate};
pub use pool::{AcquireMode, Endpoint, EndpointLease, EndpointPool, EndpointPools, WorkerPool};
pub use relay::{
    JsonPassthrough, OneShotClient, ReplyStreamCodec, StreamRelay, StreamSession, TextGenerationCodec,
};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::admission::InferenceTaskExecutor;
use crate::relay::RelayConfig;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Endpoint pools keyed by model kind.
    pub pools: Arc<EndpointPools>,
    /// Executor for batch tasks.
    pub workers: Arc<WorkerPool>,
    pub tasks: Arc<dyn TaskRepository>,
    pub moderation: Arc<dyn ModerationGate>,
    /// Streaming chat relay.
    pub chat_relay: StreamRelay<ReplyStreamCodec>,
    /// One-shot JSON pass-through client.
    pub completions: OneShotClient<JsonPassthrough>,
    /// Prompt completion client; generated text is moderated too.
    pub generation: OneShotClient<TextGenerationCodec>,
    /// Cancelled once on shutdown; every session token derives from it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire every component from configuration.
    pub fn build(config: Config) -> Result<Self> {
        let moderation = moderation_gate(&config)?;
        Self::with_moderation(config, moderation)
    }

    /// Wire every component around the given moderation gate.
    pub fn with_moderation(config: Config, moderation: Arc<dyn ModerationGate>) -> Result<Self> {
        let pools = Arc::new(EndpointPools::from_config(&config.endpoints));
        let workers = Arc::new(WorkerPool::new(config.workers.max_parallel));

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.stream.connect_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let chat_relay = StreamRelay::new(
            ReplyStreamCodec,
            pools.clone(),
            moderation.clone(),
            http_client.clone(),
            RelayConfig {
                check_every_tokens: config.moderation.check_every_tokens,
                channel_capacity: config.stream.channel_capacity,
                max_line_bytes: config.stream.max_line_bytes,
            },
        );
        let request_timeout = Duration::from_secs(config.stream.request_timeout_secs);
        let completions = OneShotClient::new(
            JsonPassthrough,
            pools.clone(),
            moderation.clone(),
            http_client.clone(),
            request_timeout,
        );
        let generation = OneShotClient::new(
            TextGenerationCodec,
            pools.clone(),
            moderation.clone(),
            http_client,
            request_timeout,
        );

        Ok(Self {
            config,
            pools,
            workers,
            tasks: Arc::new(InMemoryTaskRepository::new()),
            moderation,
            chat_relay,
            completions,
            generation,
            shutdown: CancellationToken::new(),
        })
    }

    /// Admission controller dispatching this state's tasks.
    pub fn admission(&self) -> AdmissionController {
        AdmissionController::new(
            self.tasks.clone(),
            self.pools.clone(),
            self.workers.clone(),
            Arc::new(InferenceTaskExecutor::new(self.completions.clone())),
            AdmissionSettings::from(&self.config.admission),
        )
    }
}

fn moderation_gate(config: &Config) -> Result<Arc<dyn ModerationGate>> {
    let Some(url) = &config.moderation.url else {
        tracing::warn!("No moderation service configured, all text passes");
        return Ok(Arc::new(AllowAll));
    };

    let gate = HttpModerationGate::new(url.clone(), Duration::from_secs(config.moderation.timeout_secs))
        .map_err(|e| Error::Internal(format!("Failed to create moderation client: {}", e)))?;
    tracing::info!(
        "Moderation via {} ({:?})",
        url,
        config.moderation.failure_policy
    );

    Ok(Arc::new(PolicyGate::new(
        Arc::new(gate),
        config.moderation.failure_policy,
    )))
}
