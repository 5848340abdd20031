//! Streaming relay.
//!
//! A [`StreamRelay`] moderates the input, leases an endpoint, opens the
//! upstream stream and hands the response body to a background reader. The
//! reader forwards decoded tokens to the session's channel, re-checks the
//! output every few tokens and always finishes with exactly one terminal
//! event, releasing the endpoint first.

mod codec;
mod lines;
mod oneshot;

use std::fmt;
use std::sync::Arc;

use bigmodel_common::StreamEvent;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::moderation::{ModerationError, ModerationGate};
use crate::pool::{AcquireMode, EndpointLease, EndpointPool, EndpointPools};

pub use codec::{ChatRequest, Frame, ParseError, ReplyStreamCodec, StreamCodec};
pub use lines::{LineBuffer, LineTooLong, DEFAULT_MAX_LINE_BYTES};
pub use oneshot::{
    JsonPassthrough, OneShotClient, OneShotCodec, PromptRequest, TextGenerationCodec,
};

/// Tunables of a [`StreamRelay`].
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Forwarded tokens between two output checks; 0 disables them.
    pub check_every_tokens: usize,
    /// Events buffered between the reader and the consumer.
    pub channel_capacity: usize,
    /// Longest upstream line accepted before the session fails.
    pub max_line_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            check_every_tokens: 6,
            channel_capacity: 32,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// Relays streaming inference from pooled endpoints.
pub struct StreamRelay<C: StreamCodec> {
    codec: Arc<C>,
    pools: Arc<EndpointPools>,
    gate: Arc<dyn ModerationGate>,
    http_client: Client,
    config: RelayConfig,
}

impl<C: StreamCodec> Clone for StreamRelay<C> {
    fn clone(&self) -> Self {
        Self {
            codec: self.codec.clone(),
            pools: self.pools.clone(),
            gate: self.gate.clone(),
            http_client: self.http_client.clone(),
            config: self.config,
        }
    }
}

impl<C: StreamCodec> StreamRelay<C> {
    pub fn new(
        codec: C,
        pools: Arc<EndpointPools>,
        gate: Arc<dyn ModerationGate>,
        http_client: Client,
        config: RelayConfig,
    ) -> Self {
        Self {
            codec: Arc::new(codec),
            pools,
            gate,
            http_client,
            config,
        }
    }

    /// Start a streaming session on an endpoint of `kind`.
    ///
    /// Fails without starting a reader when the input is rejected, no endpoint
    /// can be leased, or the upstream request does not succeed. In every such
    /// case the endpoint, if one was leased, is already released.
    pub async fn start(
        &self,
        kind: &str,
        request: &C::Request,
        mode: AcquireMode,
        cancel: CancellationToken,
    ) -> Result<StreamSession> {
        let pool = self.pools.get(kind)?;

        let body = self
            .codec
            .encode(request)
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;

        let (lease, response) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            opened = self.moderate_and_open(pool, request, mode, &body) => opened?,
        };

        let id = Uuid::new_v4();
        tracing::debug!(
            "Stream {} opened on {} ({})",
            id,
            lease.endpoint(),
            lease.kind()
        );

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let reader = StreamReader {
            id,
            codec: self.codec.clone(),
            gate: self.gate.clone(),
            check_every: self.config.check_every_tokens,
            max_line_bytes: self.config.max_line_bytes,
            lease,
            tx,
            cancel,
            progress: Progress::default(),
        };
        tokio::spawn(reader.run(response.bytes_stream()));

        Ok(StreamSession { id, events: rx })
    }

    async fn moderate_and_open(
        &self,
        pool: &EndpointPool,
        request: &C::Request,
        mode: AcquireMode,
        body: &Value,
    ) -> Result<(EndpointLease, reqwest::Response)> {
        if let Some(text) = self.codec.input_text(request) {
            self.gate.check(text).await?;
        }

        let lease = pool.acquire_with(mode).await?;

        let response = self
            .http_client
            .post(lease.endpoint().url())
            .header(reqwest::header::ACCEPT, "*/*")
            .json(body)
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

        Ok((lease, response))
    }
}

/// Consumer side of a streaming session.
pub struct StreamSession {
    id: Uuid,
    events: mpsc::Receiver<StreamEvent>,
}

impl StreamSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event; `None` after the terminal event has been received.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<StreamEvent> {
        ReceiverStream::new(self.events)
    }

    /// Drain the session into a list of events.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession").field("id", &self.id).finish()
    }
}

#[derive(Debug, Default)]
struct Progress {
    forwarded: usize,
    since_check: usize,
    window: String,
}

/// Background half of a session. Owns the lease until the stream ends.
struct StreamReader<C: StreamCodec> {
    id: Uuid,
    codec: Arc<C>,
    gate: Arc<dyn ModerationGate>,
    check_every: usize,
    max_line_bytes: usize,
    lease: EndpointLease,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    progress: Progress,
}

impl<C: StreamCodec> StreamReader<C> {
    async fn run<S, E>(mut self, body: S)
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: fmt::Display,
    {
        let terminal = self.pump(body).await;

        let StreamReader {
            id,
            lease,
            tx,
            cancel,
            progress,
            ..
        } = self;
        let endpoint = lease.endpoint().clone();
        lease.release();

        tracing::info!(
            "Stream {} on {} ended {} after {} token(s)",
            id,
            endpoint,
            terminal.name(),
            progress.forwarded
        );

        match tx.try_send(terminal) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(terminal)) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = tx.send(terminal) => {}
                }
            }
        }
    }

    /// Read until a terminal condition. The body is dropped on return.
    async fn pump<S, E>(&mut self, body: S) -> StreamEvent
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: fmt::Display,
    {
        tokio::pin!(body);
        let mut lines = LineBuffer::new(self.max_line_bytes);

        loop {
            loop {
                let line = match lines.next_line() {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => return StreamEvent::failed(format!("upstream stream error: {}", e)),
                };
                if let Some(terminal) = self.handle_line(&line).await {
                    return terminal;
                }
            }

            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StreamEvent::failed("cancelled"),
                _ = self.tx.closed() => return StreamEvent::failed("consumer disconnected"),
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => lines.push(&bytes),
                Some(Err(e)) => return StreamEvent::failed(format!("upstream stream error: {}", e)),
                None => {
                    if let Some(line) = lines.finish() {
                        if let Some(terminal) = self.handle_line(&line).await {
                            return terminal;
                        }
                    }
                    return StreamEvent::Done;
                }
            }
        }
    }

    /// Process one line; `Some` ends the stream.
    async fn handle_line(&mut self, line: &str) -> Option<StreamEvent> {
        let frame = match self.codec.decode_line(line) {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!("Stream {}: skipping line: {}", self.id, e);
                return None;
            }
        };

        let text = match frame {
            Frame::End => return Some(StreamEvent::Done),
            Frame::Token(text) => text,
        };

        if self.check_every > 0 {
            self.progress.window.push_str(&text);
        }
        if let Some(terminal) = self.forward(StreamEvent::token(text)).await {
            return Some(terminal);
        }
        self.progress.forwarded += 1;
        self.progress.since_check += 1;

        if self.check_every == 0 || self.progress.since_check < self.check_every {
            return None;
        }

        self.progress.since_check = 0;
        let window = std::mem::take(&mut self.progress.window);
        let verdict = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Some(StreamEvent::failed("cancelled")),
            verdict = self.gate.check(&window) => verdict,
        };

        match verdict {
            Ok(()) => None,
            Err(ModerationError::Violation(reason)) => {
                tracing::info!("Stream {}: output rejected by moderation", self.id);
                Some(StreamEvent::aborted(reason))
            }
            Err(ModerationError::Unavailable(reason)) => Some(StreamEvent::failed(format!(
                "moderation unavailable: {}",
                reason
            ))),
        }
    }

    async fn forward(&self, event: StreamEvent) -> Option<StreamEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(StreamEvent::failed("cancelled")),
            sent = self.tx.send(event) => match sent {
                Ok(()) => None,
                Err(_) => Some(StreamEvent::failed("consumer disconnected")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{AllowAll, FailurePolicy, PolicyGate};
    use crate::pool::Endpoint;
    use async_trait::async_trait;
    use bigmodel_common::ReplyChunk;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects the n-th check and every one after it.
    struct RejectFrom {
        n: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModerationGate for RejectFrom {
        async fn check(&self, _text: &str) -> std::result::Result<(), ModerationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.n {
                Err(ModerationError::Violation("invalid text".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Moderation service that never answers.
    struct Down;

    #[async_trait]
    impl ModerationGate for Down {
        async fn check(&self, _text: &str) -> std::result::Result<(), ModerationError> {
            Err(ModerationError::Unavailable("connection refused".to_string()))
        }
    }

    fn reader(
        gate: Arc<dyn ModerationGate>,
        check_every: usize,
        capacity: usize,
    ) -> (EndpointPool, StreamReader<ReplyStreamCodec>, mpsc::Receiver<StreamEvent>, CancellationToken) {
        let pool = EndpointPool::new("glm2", vec![Endpoint::new("http://a")]);
        let lease = pool.try_acquire().unwrap();
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let reader = StreamReader {
            id: Uuid::new_v4(),
            codec: Arc::new(ReplyStreamCodec),
            gate,
            check_every,
            max_line_bytes: 1024,
            lease,
            tx,
            cancel: cancel.clone(),
            progress: Progress::default(),
        };
        (pool, reader, rx, cancel)
    }

    fn body(chunks: Vec<String>) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> {
        futures_util::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_tokens_then_done() {
        let (pool, reader, rx, _cancel) = reader(Arc::new(AllowAll), 6, 16);
        let chunks = vec![
            ReplyChunk::reply("a").to_line(),
            ReplyChunk::reply("b").to_line(),
            ReplyChunk::done().to_line(),
            ReplyChunk::reply("never").to_line(),
        ];

        reader.run(body(chunks)).await;

        assert_eq!(
            drain(rx).await,
            vec![StreamEvent::token("a"), StreamEvent::token("b"), StreamEvent::Done]
        );
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let (_pool, reader, rx, _cancel) = reader(Arc::new(AllowAll), 6, 16);
        let chunks = vec![
            ReplyChunk::reply("first").to_line(),
            "data: {garbage\n".to_string(),
            ReplyChunk::reply("second").to_line(),
        ];

        reader.run(body(chunks)).await;

        assert_eq!(
            drain(rx).await,
            vec![
                StreamEvent::token("first"),
                StreamEvent::token("second"),
                StreamEvent::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_violation_after_sixth_token_aborts() {
        let gate = Arc::new(RejectFrom {
            n: 1,
            calls: AtomicUsize::new(0),
        });
        let (pool, reader, rx, _cancel) = reader(gate.clone(), 6, 16);
        let chunks = (1..=10).map(|i| ReplyChunk::reply(format!("t{}", i)).to_line()).collect();

        reader.run(body(chunks)).await;

        let events = drain(rx).await;
        assert_eq!(events.len(), 7);
        for (i, event) in events[..6].iter().enumerate() {
            assert_eq!(event, &StreamEvent::token(format!("t{}", i + 1)));
        }
        assert_eq!(events[6], StreamEvent::aborted("invalid text"));
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_checks_repeat_every_window() {
        let gate = Arc::new(RejectFrom {
            n: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let (_pool, reader, rx, _cancel) = reader(gate.clone(), 3, 32);
        let chunks = (1..=10).map(|i| ReplyChunk::reply(format!("t{}", i)).to_line()).collect();

        reader.run(body(chunks)).await;

        assert_eq!(drain(rx).await.len(), 11);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 3);
    }

    fn numbered(n: usize) -> Vec<String> {
        (1..=n).map(|i| ReplyChunk::reply(format!("t{}", i)).to_line()).collect()
    }

    #[tokio::test]
    async fn test_moderation_outage_mid_stream_fails_session() {
        let (pool, reader, rx, _cancel) = reader(Arc::new(Down), 6, 16);

        reader.run(body(numbered(10))).await;

        let events = drain(rx).await;
        assert_eq!(events.len(), 7);
        for (i, event) in events[..6].iter().enumerate() {
            assert_eq!(event, &StreamEvent::token(format!("t{}", i + 1)));
        }
        assert_eq!(
            events[6],
            StreamEvent::failed("moderation unavailable: connection refused")
        );
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_moderation_outage_mid_stream_fail_open() {
        let gate = Arc::new(PolicyGate::new(Arc::new(Down), FailurePolicy::FailOpen));
        let (pool, reader, rx, _cancel) = reader(gate, 6, 16);

        reader.run(body(numbered(10))).await;

        let events = drain(rx).await;
        assert_eq!(events.len(), 11);
        for (i, event) in events[..10].iter().enumerate() {
            assert_eq!(event, &StreamEvent::token(format!("t{}", i + 1)));
        }
        assert_eq!(events[10], StreamEvent::Done);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_checks_disabled_keep_no_window() {
        let gate = Arc::new(RejectFrom {
            n: 1,
            calls: AtomicUsize::new(0),
        });
        let (_pool, mut reader, mut rx, _cancel) = reader(gate.clone(), 0, 16);

        assert_eq!(reader.handle_line(&ReplyChunk::reply("a").to_line()).await, None);
        assert_eq!(rx.recv().await, Some(StreamEvent::token("a")));
        assert!(reader.progress.window.is_empty());
        assert_eq!(reader.progress.forwarded, 1);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_line_without_newline_past_limit_fails_session() {
        let (pool, reader, rx, _cancel) = reader(Arc::new(AllowAll), 6, 16);
        let mut chunks = vec![ReplyChunk::reply("a").to_line()];
        chunks.extend((0..8).map(|_| "x".repeat(256)));
        chunks.push(ReplyChunk::reply("never").to_line());

        reader.run(body(chunks)).await;

        let events = drain(rx).await;
        assert_eq!(events[0], StreamEvent::token("a"));
        assert!(matches!(&events[1], StreamEvent::Failed { reason } if reason.contains("exceeds 1024 bytes")));
        assert_eq!(events.len(), 2);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_error_fails_session() {
        let (pool, reader, rx, _cancel) = reader(Arc::new(AllowAll), 6, 16);
        let chunks: Vec<std::result::Result<Bytes, String>> = vec![
            Ok(Bytes::from(ReplyChunk::reply("a").to_line())),
            Err("connection reset".to_string()),
        ];

        reader.run(futures_util::stream::iter(chunks)).await;

        let events = drain(rx).await;
        assert_eq!(events[0], StreamEvent::token("a"));
        assert!(matches!(&events[1], StreamEvent::Failed { reason } if reason.contains("connection reset")));
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_endpoint() {
        let (pool, reader, mut rx, cancel) = reader(Arc::new(AllowAll), 6, 16);
        let pending = futures_util::stream::pending::<std::result::Result<Bytes, Infallible>>();
        let handle = tokio::spawn(reader.run(pending));

        assert_eq!(pool.idle_count(), 0);
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(rx.recv().await, Some(StreamEvent::failed("cancelled")));
        assert_eq!(rx.recv().await, None);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_consumer_drop_releases_endpoint() {
        let (pool, reader, rx, _cancel) = reader(Arc::new(AllowAll), 6, 16);
        let pending = futures_util::stream::pending::<std::result::Result<Bytes, Infallible>>();
        let handle = tokio::spawn(reader.run(pending));

        drop(rx);
        handle.await.unwrap();
        assert_eq!(pool.idle_count(), 1);
    }
}
