//! Test infrastructure for the ferry HTTP sink.
//!
//! Provides a scripted wiremock endpoint, a raw TCP server for connection
//! level faults, a channel that records how each transaction was resolved,
//! and payload fixtures.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use ferry_delivery::SinkConfig;

pub mod channel;
pub mod fault;
pub mod http;

pub use channel::{RecordingChannel, TransactionRecord};
pub use fault::{Fault, FaultServer};
pub use http::{MockEndpoint, RecordedRequest, ResponseSequence, ENDPOINT_PATH};

/// JSON payload `{"id":"<id>"}`.
pub fn payload(id: &str) -> Bytes {
    Bytes::from(serde_json::json!({ "id": id }).to_string())
}

/// Sink configuration for `endpoint` with JSON headers and the given
/// deadlines.
pub fn sink_config(
    endpoint: &str,
    request_timeout: Duration,
    connect_timeout: Duration,
) -> SinkConfig {
    SinkConfig::new(
        endpoint,
        request_timeout,
        connect_timeout,
        "application/json",
        "application/json",
    )
}

/// Sink configuration with two second deadlines on both phases.
pub fn default_sink_config(endpoint: &str) -> SinkConfig {
    sink_config(endpoint, Duration::from_secs(2), Duration::from_secs(2))
}
