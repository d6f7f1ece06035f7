//! The delivery engine: take one event, send it, commit or roll back.
//!
//! ```text
//! IDLE ─take─▶ TAKEN ─send─▶ SENT ─Delivered─▶ ACKED     commit, Ready
//!  │                          ├─Transient─▶ REQUEUED  rollback, Backoff
//!  │                          └─Fatal─────▶ rollback, Err(FatalDelivery)
//!  └─empty─▶ commit, Ready
//! ```
//!
//! One call to [`HttpSink::process`] handles at most one event and makes at
//! most one HTTP request. Retrying is the caller's job: a `BACKOFF` means the
//! event is back in the channel and the caller should slow down before
//! calling again.

use std::sync::Arc;

use reqwest::{
    header::{HeaderMap, ACCEPT, CONTENT_TYPE},
    Url,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    channel::{Channel, Event, TransactionScope},
    classify::{classify, DeliveryOutcome, StatusPolicy},
    client::{
        forward_headers, ClientConfig, DeliveryAttempt, DeliveryClient, RawResult, Transport,
    },
    config::{header_value, SinkConfig},
    error::{DeliveryError, Result},
};

/// Caller-visible result of one [`HttpSink::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkStatus {
    /// The event was delivered and committed, or there was nothing to do.
    Ready,
    /// The event failed transiently and is back in the channel.
    Backoff,
}

/// What one call actually did; finer grained than [`SinkStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Processed {
    /// The channel was empty.
    Empty,
    /// Delivered and committed.
    Delivered,
    /// Rolled back after a transient failure.
    Requeued,
}

impl From<Processed> for SinkStatus {
    fn from(processed: Processed) -> Self {
        match processed {
            Processed::Empty | Processed::Delivered => Self::Ready,
            Processed::Requeued => Self::Backoff,
        }
    }
}

/// Counters for sink monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Calls that found the channel empty.
    pub empty_takes: u64,
    /// Events taken and sent.
    pub drain_attempts: u64,
    /// Events delivered and committed.
    pub drain_successes: u64,
    /// Events rolled back after a transient failure.
    pub backoffs: u64,
    /// Events rolled back after a fatal failure.
    pub fatal_failures: u64,
    /// Attempts that got no usable HTTP response at all.
    pub connection_failures: u64,
    /// Attempts aborted by an unexpected error.
    pub unexpected_errors: u64,
}

/// HTTP sink delivering one event per invocation.
///
/// Holds no mutable state besides counters; many tasks may call
/// [`HttpSink::process`] concurrently, each running its own transaction.
pub struct HttpSink {
    config: SinkConfig,
    url: Url,
    headers: HeaderMap,
    policy: StatusPolicy,
    channel: Arc<dyn Channel>,
    transport: Arc<dyn Transport>,
    stats: Arc<RwLock<SinkStats>>,
}

impl HttpSink {
    /// Creates a sink delivering over HTTP with `reqwest`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the configuration is invalid
    /// or the HTTP client cannot be built. Nothing is sent in that case.
    pub fn new(config: SinkConfig, channel: Arc<dyn Channel>) -> Result<Self> {
        config.validate()?;
        let client =
            DeliveryClient::new(ClientConfig::new(config.connect_timeout, config.request_timeout))?;
        Self::with_transport(config, channel, Arc::new(client))
    }

    /// Creates a sink with an injected transport.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the configuration is invalid.
    pub fn with_transport(
        config: SinkConfig,
        channel: Arc<dyn Channel>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let url = config.endpoint_url()?;
        let policy = StatusPolicy::from_overrides(&config.status_overrides)?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, header_value("accept header", &config.accept_header)?);
        let content_type = header_value("content-type header", &config.content_type_header)?;
        headers.insert(CONTENT_TYPE, content_type);

        info!(
            endpoint = %url,
            request_timeout_ms = config.request_timeout.as_millis(),
            connect_timeout_ms = config.connect_timeout.as_millis(),
            status_overrides = config.status_overrides.len(),
            "http sink configured"
        );

        Ok(Self {
            config,
            url,
            headers,
            policy,
            channel,
            transport,
            stats: Arc::new(RwLock::new(SinkStats::default())),
        })
    }

    /// Processes at most one event.
    ///
    /// Returns `Ready` when the event was delivered or the channel was empty,
    /// and `Backoff` when the event failed transiently and was rolled back.
    ///
    /// # Errors
    ///
    /// - `FatalDelivery` when the endpoint rejected the event; it was rolled
    ///   back first.
    /// - `Internal` when sending failed unexpectedly; it was rolled back first.
    /// - `Channel` when the channel failed to begin, take, commit, or roll back
    ///   after a transient failure. A failed rollback after `FatalDelivery` or
    ///   `Internal` is logged and the original error is returned.
    pub async fn process(&self) -> Result<SinkStatus> {
        self.process_one().await.map(SinkStatus::from)
    }

    /// Returns current counters.
    pub async fn stats(&self) -> SinkStats {
        self.stats.read().await.clone()
    }

    /// Returns the configuration the sink was built with.
    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub(crate) async fn process_one(&self) -> Result<Processed> {
        let span = info_span!("http_sink_process", endpoint = %self.url);
        async move {
            let mut scope = TransactionScope::begin(self.channel.as_ref())?;

            let Some(event) = scope.take()? else {
                scope.commit()?;
                debug!("channel empty");
                self.stats.write().await.empty_takes += 1;
                return Ok(Processed::Empty);
            };

            self.stats.write().await.drain_attempts += 1;
            let attempt = self.build_attempt(&event);
            debug!(
                attempt_id = %attempt.attempt_id,
                payload_bytes = attempt.body.len(),
                "event taken"
            );

            let raw = match self.transport.send(&attempt).await {
                Ok(raw) => raw,
                Err(error) => {
                    self.stats.write().await.unexpected_errors += 1;
                    error!(
                        attempt_id = %attempt.attempt_id,
                        error = %error,
                        "send failed unexpectedly, rolling back event"
                    );
                    release_after_failure(scope, &attempt);
                    return Err(error);
                },
            };

            let outcome = classify(&raw, &self.policy);
            self.settle(scope, &attempt, &raw, outcome).await
        }
        .instrument(span)
        .await
    }

    /// Commits or rolls back according to the outcome.
    async fn settle(
        &self,
        scope: TransactionScope<'_>,
        attempt: &DeliveryAttempt,
        raw: &RawResult,
        outcome: DeliveryOutcome,
    ) -> Result<Processed> {
        match outcome {
            DeliveryOutcome::Delivered { status_code } => {
                scope.commit()?;
                self.stats.write().await.drain_successes += 1;
                info!(attempt_id = %attempt.attempt_id, status = status_code, "event delivered");
                Ok(Processed::Delivered)
            },
            DeliveryOutcome::TransientFailure { status_code, reason } => {
                scope.rollback()?;
                {
                    let mut stats = self.stats.write().await;
                    stats.backoffs += 1;
                    if matches!(raw, RawResult::Failed(_)) {
                        stats.connection_failures += 1;
                    }
                }
                warn!(
                    attempt_id = %attempt.attempt_id,
                    status = ?status_code,
                    reason = %reason,
                    "delivery failed transiently, event rolled back"
                );
                Ok(Processed::Requeued)
            },
            DeliveryOutcome::FatalFailure { status_code, reason } => {
                self.stats.write().await.fatal_failures += 1;
                error!(
                    attempt_id = %attempt.attempt_id,
                    status = status_code,
                    reason = %reason,
                    "delivery failed with non-retryable response, rolling back event"
                );
                release_after_failure(scope, attempt);
                Err(DeliveryError::fatal(status_code, reason))
            },
        }
    }

    fn build_attempt(&self, event: &Event) -> DeliveryAttempt {
        let mut headers = self.headers.clone();
        if self.config.forward_event_headers {
            let skipped = forward_headers(&mut headers, &event.headers);
            if !skipped.is_empty() {
                warn!(?skipped, "event headers not representable in HTTP were dropped");
            }
        }

        DeliveryAttempt {
            attempt_id: Uuid::new_v4(),
            url: self.url.clone(),
            headers,
            body: event.body.clone(),
        }
    }
}

/// Rolls back after a failure that is already being reported. A rollback
/// error is logged rather than returned so the caller still sees the
/// original failure.
fn release_after_failure(scope: TransactionScope<'_>, attempt: &DeliveryAttempt) {
    if let Err(rollback_error) = scope.rollback() {
        error!(
            attempt_id = %attempt.attempt_id,
            error = %rollback_error,
            "rollback failed after delivery failure"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{future::Future, pin::Pin, sync::Mutex, time::Duration};

    use super::*;
    use crate::{
        channel::{MemoryChannel, Transaction},
        client::DeliveryResponse,
        error::TransportFailure,
    };

    /// Transport that replays scripted results and records what it was sent.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<Vec<Result<RawResult>>>,
        sent: Mutex<Vec<DeliveryAttempt>>,
    }

    impl ScriptedTransport {
        fn new(mut script: Vec<Result<RawResult>>) -> Self {
            script.reverse();
            Self { script: Mutex::new(script), sent: Mutex::new(Vec::new()) }
        }
    }

    impl Transport for ScriptedTransport {
        fn send<'a>(
            &'a self,
            attempt: &'a DeliveryAttempt,
        ) -> Pin<Box<dyn Future<Output = Result<RawResult>> + Send + 'a>> {
            self.sent.lock().unwrap().push(attempt.clone());
            let next = self.script.lock().unwrap().pop().unwrap_or_else(|| Ok(status(200)));
            Box::pin(async move { next })
        }
    }

    fn status(status_code: u16) -> RawResult {
        RawResult::Response(DeliveryResponse {
            status_code,
            body: String::new(),
            duration: Duration::from_millis(1),
        })
    }

    fn config() -> SinkConfig {
        SinkConfig::new(
            "http://localhost:8080/datastream",
            Duration::from_secs(2),
            Duration::from_secs(2),
            "application/json",
            "application/json",
        )
    }

    fn sink(channel: &MemoryChannel, transport: &Arc<ScriptedTransport>) -> HttpSink {
        HttpSink::with_transport(config(), Arc::new(channel.clone()), transport.clone()).unwrap()
    }

    #[tokio::test]
    async fn empty_channel_is_ready_without_sending() {
        let channel = MemoryChannel::new(8);
        let transport = Arc::new(ScriptedTransport::default());
        let sink = sink(&channel, &transport);

        assert_eq!(sink.process().await.unwrap(), SinkStatus::Ready);
        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(sink.stats().await.empty_takes, 1);
    }

    #[tokio::test]
    async fn delivered_event_is_committed() {
        let channel = MemoryChannel::new(8);
        channel.put(Event::new(r#"{"id":"SUCCESS"}"#)).unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(status(200))]));
        let sink = sink(&channel, &transport);

        assert_eq!(sink.process().await.unwrap(), SinkStatus::Ready);
        assert!(channel.is_empty());

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers.get(ACCEPT).unwrap(), "application/json");
        assert_eq!(sent[0].headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[tokio::test]
    async fn transient_failure_rolls_back_and_backs_off() {
        let channel = MemoryChannel::new(8);
        channel.put(Event::new("payload")).unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(RawResult::Failed(TransportFailure::ConnectTimeout {
                timeout: Duration::from_millis(100),
            })),
            Ok(status(200)),
        ]));
        let sink = sink(&channel, &transport);

        assert_eq!(sink.process().await.unwrap(), SinkStatus::Backoff);
        assert_eq!(channel.len(), 1);
        assert_eq!(sink.process().await.unwrap(), SinkStatus::Ready);
        assert!(channel.is_empty());

        let stats = sink.stats().await;
        assert_eq!(stats.backoffs, 1);
        assert_eq!(stats.connection_failures, 1);
        assert_eq!(stats.drain_successes, 1);
    }

    #[tokio::test]
    async fn fatal_failure_rolls_back_and_raises() {
        let channel = MemoryChannel::new(8);
        channel.put(Event::new("payload")).unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(status(400))]));
        let sink = sink(&channel, &transport);

        let error = sink.process().await.unwrap_err();
        assert!(matches!(error, DeliveryError::FatalDelivery { status_code: 400, .. }));
        assert_eq!(channel.len(), 1);
        assert_eq!(sink.stats().await.fatal_failures, 1);
    }

    #[tokio::test]
    async fn unexpected_error_rolls_back_and_reraises() {
        let channel = MemoryChannel::new(8);
        channel.put(Event::new("payload")).unwrap();
        let script = vec![Err(DeliveryError::internal("serializer broke"))];
        let transport = Arc::new(ScriptedTransport::new(script));
        let sink = sink(&channel, &transport);

        let error = sink.process().await.unwrap_err();
        assert!(matches!(error, DeliveryError::Internal { .. }));
        assert_eq!(channel.len(), 1);
        assert_eq!(sink.stats().await.unexpected_errors, 1);
    }

    #[tokio::test]
    async fn event_headers_forwarded_only_when_enabled() {
        let channel = MemoryChannel::new(8);
        channel.put(Event::new("a").with_header("X-Trace", "t-1")).unwrap();
        channel.put(Event::new("b").with_header("X-Trace", "t-2")).unwrap();
        let transport = Arc::new(ScriptedTransport::default());

        let plain = sink(&channel, &transport);
        plain.process().await.unwrap();

        let forwarding = HttpSink::with_transport(
            config().with_forwarded_headers(),
            Arc::new(channel.clone()),
            transport.clone(),
        )
        .unwrap();
        forwarding.process().await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert!(sent[0].headers.get("x-trace").is_none());
        assert_eq!(sent[1].headers.get("x-trace").unwrap(), "t-2");
    }

    /// Channel whose transactions take and commit normally but never roll back.
    struct RollbackFailsChannel(MemoryChannel);

    struct RollbackFailsTransaction<'a>(Box<dyn Transaction + 'a>);

    impl Channel for RollbackFailsChannel {
        fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
            Ok(Box::new(RollbackFailsTransaction(self.0.begin()?)))
        }
    }

    impl Transaction for RollbackFailsTransaction<'_> {
        fn take(&mut self) -> Result<Option<Event>> {
            self.0.take()
        }

        fn commit(&mut self) -> Result<()> {
            self.0.commit()
        }

        fn rollback(&mut self) -> Result<()> {
            Err(DeliveryError::channel("rollback broke"))
        }
    }

    fn sink_with_broken_rollback(script: Vec<Result<RawResult>>) -> HttpSink {
        let channel = MemoryChannel::new(8);
        channel.put(Event::new("payload")).unwrap();
        let transport = Arc::new(ScriptedTransport::new(script));
        HttpSink::with_transport(config(), Arc::new(RollbackFailsChannel(channel)), transport)
            .unwrap()
    }

    #[tokio::test]
    async fn fatal_failure_survives_failed_rollback() {
        let sink = sink_with_broken_rollback(vec![Ok(status(400))]);

        let error = sink.process().await.unwrap_err();
        assert!(matches!(error, DeliveryError::FatalDelivery { status_code: 400, .. }));
        assert!(!error.is_retryable());
        assert_eq!(sink.stats().await.fatal_failures, 1);
    }

    #[tokio::test]
    async fn unexpected_error_survives_failed_rollback() {
        let sink =
            sink_with_broken_rollback(vec![Err(DeliveryError::internal("serializer broke"))]);

        let error = sink.process().await.unwrap_err();
        assert!(matches!(error, DeliveryError::Internal { .. }));
        assert_eq!(sink.stats().await.unexpected_errors, 1);
    }

    #[tokio::test]
    async fn failed_rollback_after_transient_failure_is_a_channel_error() {
        let sink = sink_with_broken_rollback(vec![Ok(status(503))]);

        let error = sink.process().await.unwrap_err();
        assert!(matches!(error, DeliveryError::Channel { .. }));
    }

    #[test]
    fn invalid_configuration_refuses_to_start() {
        let channel = MemoryChannel::new(8);
        let transport = Arc::new(ScriptedTransport::default());
        let config = SinkConfig { endpoint: "localhost:8080".to_string(), ..config() };

        let result = HttpSink::with_transport(config, Arc::new(channel), transport);
        assert!(matches!(result, Err(DeliveryError::Configuration { .. })));
    }
}
