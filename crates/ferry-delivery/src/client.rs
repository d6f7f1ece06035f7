//! HTTP transport for one delivery attempt with two independent deadlines.
//!
//! The client performs exactly one POST per call and never retries. Anything
//! that prevents a complete response from arriving is reported as a
//! [`TransportFailure`]; only request-construction bugs surface as errors.

use std::{
    collections::HashMap,
    error::Error as StdError,
    future::Future,
    io,
    pin::Pin,
    time::{Duration, Instant},
};

use bytes::Bytes;
use reqwest::{header::HeaderMap, Response, Url};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{DeliveryError, Result, TransportFailure};

/// Largest response body kept for logging.
const MAX_RESPONSE_BODY_SIZE: usize = 1024;

/// Deadlines and identity of the HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Deadline for establishing a connection.
    pub connect_timeout: Duration,
    /// Deadline for the full request, response body included.
    pub request_timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl ClientConfig {
    /// Creates a client configuration with the default user agent.
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
            user_agent: concat!("ferry/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Everything needed to send one payload. Lives only for one attempt.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    /// Identifier used to correlate logs of this attempt.
    pub attempt_id: Uuid,
    /// Destination URL.
    pub url: Url,
    /// Request headers, including `Accept` and `Content-Type`.
    pub headers: HeaderMap,
    /// Raw event payload.
    pub body: Bytes,
}

/// A complete HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated for logging. Never interpreted.
    pub body: String,
    /// Time from dispatch to the end of the body.
    pub duration: Duration,
}

/// Raw result of one attempt, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawResult {
    /// The endpoint produced a complete HTTP response.
    Response(DeliveryResponse),
    /// No usable response.
    Failed(TransportFailure),
}

/// Sends one attempt to the endpoint.
///
/// `Ok` carries the raw outcome, whatever it is. `Err` is reserved for
/// unexpected errors that are not the endpoint's doing.
pub trait Transport: Send + Sync + 'static {
    /// Performs exactly one request.
    fn send<'a>(
        &'a self,
        attempt: &'a DeliveryAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<RawResult>> + Send + 'a>>;
}

/// Production transport backed by `reqwest`.
///
/// Redirects are not followed: the status the endpoint returns is the status
/// that gets classified.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn deliver(&self, attempt: &DeliveryAttempt) -> Result<RawResult> {
        let start_time = Instant::now();

        debug!(payload_bytes = attempt.body.len(), "sending payload");

        let response = match self
            .client
            .post(attempt.url.clone())
            .headers(attempt.headers.clone())
            .body(attempt.body.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Err(DeliveryError::internal(format!("failed to build request: {e}")));
            },
            Err(e) => {
                let failure = self.transport_failure(&e);
                warn!(
                    duration_ms = start_time.elapsed().as_millis(),
                    kind = %failure.kind(),
                    "request failed: {e}"
                );
                return Ok(RawResult::Failed(failure));
            },
        };

        debug!(
            status = response.status().as_u16(),
            duration_ms = start_time.elapsed().as_millis(),
            "received response headers"
        );

        Ok(self.read_response(response, start_time).await)
    }

    /// Reads the body so a truncated response is noticed before anything is
    /// committed.
    async fn read_response(&self, response: Response, start_time: Instant) -> RawResult {
        let status_code = response.status().as_u16();

        match response.bytes().await {
            Ok(bytes) => {
                let shown = &bytes[..bytes.len().min(MAX_RESPONSE_BODY_SIZE)];
                let mut body = String::from_utf8_lossy(shown).into_owned();
                if bytes.len() > MAX_RESPONSE_BODY_SIZE {
                    body.push_str("... (truncated)");
                }
                RawResult::Response(DeliveryResponse {
                    status_code,
                    body,
                    duration: start_time.elapsed(),
                })
            },
            Err(e) => {
                let failure = self.transport_failure(&e);
                warn!(
                    status = status_code,
                    kind = %failure.kind(),
                    "failed to read response body: {e}"
                );
                RawResult::Failed(failure)
            },
        }
    }

    /// Maps a `reqwest` error onto the transport failure taxonomy.
    fn transport_failure(&self, error: &reqwest::Error) -> TransportFailure {
        if error.is_connect() {
            if error.is_timeout() || io_kind(error) == Some(io::ErrorKind::TimedOut) {
                return TransportFailure::ConnectTimeout { timeout: self.config.connect_timeout };
            }
            return TransportFailure::ConnectionRefused { message: error_chain(error) };
        }

        if error.is_timeout() {
            return TransportFailure::RequestTimeout { timeout: self.config.request_timeout };
        }

        match io_kind(error) {
            Some(
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof,
            ) => TransportFailure::ConnectionReset { message: error_chain(error) },
            _ => TransportFailure::MalformedResponse { message: error_chain(error) },
        }
    }
}

impl Transport for DeliveryClient {
    fn send<'a>(
        &'a self,
        attempt: &'a DeliveryAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<RawResult>> + Send + 'a>> {
        let span = info_span!(
            "http_delivery",
            attempt_id = %attempt.attempt_id,
            url = %attempt.url,
        );
        Box::pin(self.deliver(attempt).instrument(span))
    }
}

/// Finds the first I/O error kind in an error's source chain.
fn io_kind(error: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut source: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(current) = source {
        if let Some(io_error) = current.downcast_ref::<io::Error>() {
            return Some(io_error.kind());
        }
        source = current.source();
    }
    None
}

/// Renders an error with its sources, `outer: inner: root`.
fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(current) = source {
        rendered.push_str(": ");
        rendered.push_str(&current.to_string());
        source = current.source();
    }
    rendered
}

/// Checks if a header is managed by the sink and must not be copied from an
/// event.
pub fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "accept"
            | "content-type"
            | "content-length"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copies event headers that are valid and not managed into `headers`.
///
/// Returns the names of headers that were skipped because they could not be
/// represented on the wire.
pub fn forward_headers(
    headers: &mut HeaderMap,
    event_headers: &HashMap<String, String>,
) -> Vec<String> {
    use reqwest::header::{HeaderName, HeaderValue};

    let mut skipped = Vec::new();
    for (key, value) in event_headers {
        if is_managed_header(key) {
            continue;
        }
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            },
            _ => skipped.push(key.clone()),
        }
    }
    skipped
}
