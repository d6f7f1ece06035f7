//! Error types for the HTTP sink.
//!
//! Two families live here. `DeliveryError` is what the sink raises to its
//! caller: configuration refusals, fatal deliveries, channel faults and
//! unexpected runtime errors. `TransportFailure` describes why a single HTTP
//! attempt produced no usable response; it never escapes the sink as an error
//! because every transport failure is classified as transient.

use std::{fmt, time::Duration};

use thiserror::Error;

/// Result type alias for sink operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised by the sink to its caller.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Invalid sink configuration, reported before any delivery attempt.
    #[error("invalid sink configuration: {message}")]
    Configuration {
        /// What was wrong with the configuration
        message: String,
    },

    /// The endpoint answered with a response that an identical retry cannot
    /// fix. The unit of work has already been rolled back.
    #[error("fatal delivery failure (HTTP {status_code}): {reason}")]
    FatalDelivery {
        /// HTTP status code returned by the endpoint
        status_code: u16,
        /// Human readable reason
        reason: String,
    },

    /// The upstream channel failed during take, commit or rollback.
    #[error("channel error: {message}")]
    Channel {
        /// Channel error message
        message: String,
    },

    /// Runner was asked to stop.
    #[error("sink runner shutdown requested")]
    Shutdown,

    /// Unexpected error while preparing or sending a request.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a fatal delivery error for a non-retryable response.
    pub fn fatal(status_code: u16, reason: impl Into<String>) -> Self {
        Self::FatalDelivery { status_code, reason: reason.into() }
    }

    /// Creates a channel error.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether invoking the sink again could plausibly succeed without an
    /// operator changing anything.
    ///
    /// Channel faults are treated as retryable since the queue may recover.
    /// Fatal deliveries, configuration errors, shutdown and internal errors
    /// are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Channel { .. } => true,

            Self::Configuration { .. }
            | Self::FatalDelivery { .. }
            | Self::Shutdown
            | Self::Internal { .. } => false,
        }
    }
}

/// Why a single HTTP attempt yielded no usable response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFailure {
    /// The endpoint actively refused the connection.
    #[error("connection refused: {message}")]
    ConnectionRefused {
        /// Underlying error text
        message: String,
    },

    /// No connection was established within the connect deadline.
    #[error("connect timeout after {}ms", timeout.as_millis())]
    ConnectTimeout {
        /// The connect deadline that expired
        timeout: Duration,
    },

    /// Connected, but no complete response arrived within the request
    /// deadline.
    #[error("request timeout after {}ms", timeout.as_millis())]
    RequestTimeout {
        /// The request deadline that expired
        timeout: Duration,
    },

    /// The connection was closed or reset before a complete response.
    #[error("connection reset: {message}")]
    ConnectionReset {
        /// Underlying error text
        message: String,
    },

    /// The endpoint sent bytes that are not a valid HTTP response, or the
    /// response body was cut short.
    #[error("malformed response: {message}")]
    MalformedResponse {
        /// Underlying error text
        message: String,
    },
}

impl TransportFailure {
    /// Short stable label for logs and counters.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ConnectionRefused { .. } => FailureKind::Refused,
            Self::ConnectTimeout { .. } => FailureKind::ConnectTimeout,
            Self::RequestTimeout { .. } => FailureKind::RequestTimeout,
            Self::ConnectionReset { .. } => FailureKind::Reset,
            Self::MalformedResponse { .. } => FailureKind::Malformed,
        }
    }
}

/// Category of transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connection refused.
    Refused,
    /// Connect deadline expired.
    ConnectTimeout,
    /// Request deadline expired.
    RequestTimeout,
    /// Connection closed mid-flight.
    Reset,
    /// Garbled or truncated response.
    Malformed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused => write!(f, "refused"),
            Self::ConnectTimeout => write!(f, "connect_timeout"),
            Self::RequestTimeout => write!(f, "request_timeout"),
            Self::Reset => write!(f, "reset"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::channel("queue locked").is_retryable());

        assert!(!DeliveryError::fatal(400, "bad request").is_retryable());
        assert!(!DeliveryError::configuration("missing endpoint").is_retryable());
        assert!(!DeliveryError::internal("boom").is_retryable());
        assert!(!DeliveryError::Shutdown.is_retryable());
    }

    #[test]
    fn error_display_format() {
        let error = DeliveryError::fatal(404, "not found");
        assert_eq!(error.to_string(), "fatal delivery failure (HTTP 404): not found");

        let timeout = TransportFailure::ConnectTimeout { timeout: Duration::from_millis(250) };
        assert_eq!(timeout.to_string(), "connect timeout after 250ms");
    }

    #[test]
    fn failure_kinds_mapped_correctly() {
        let reset = TransportFailure::ConnectionReset { message: "eof".to_string() };
        assert_eq!(reset.kind(), FailureKind::Reset);
        assert_eq!(reset.kind().to_string(), "reset");

        let read = TransportFailure::RequestTimeout { timeout: Duration::from_secs(2) };
        assert_eq!(read.kind(), FailureKind::RequestTimeout);
    }
}
