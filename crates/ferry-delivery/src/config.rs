//! Sink configuration and startup validation.

use std::{collections::BTreeMap, time::Duration};

use http::HeaderValue;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{
    classify::{OutcomeClass, StatusPolicy},
    error::{DeliveryError, Result},
};

/// Configuration for one HTTP sink.
///
/// Read once at startup and never mutated afterwards. The endpoint, both
/// deadlines and both header values are mandatory; [`SinkConfig::validate`]
/// rejects anything a delivery attempt would later trip over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Absolute `http` or `https` URL every payload is POSTed to.
    pub endpoint: String,
    /// Deadline for the whole request once dispatched.
    pub request_timeout: Duration,
    /// Deadline for establishing the TCP (and TLS) connection.
    pub connect_timeout: Duration,
    /// Value of the `Accept` request header.
    pub accept_header: String,
    /// Value of the `Content-Type` request header.
    pub content_type_header: String,
    /// Per status code (`"409"`) or class (`"4XX"`) treatment overrides.
    #[serde(default)]
    pub status_overrides: BTreeMap<String, OutcomeClass>,
    /// Copy the event's own headers onto the request.
    #[serde(default)]
    pub forward_event_headers: bool,
}

impl SinkConfig {
    /// Creates a configuration with no status overrides and no header
    /// forwarding.
    pub fn new(
        endpoint: impl Into<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
        accept_header: impl Into<String>,
        content_type_header: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout,
            connect_timeout,
            accept_header: accept_header.into(),
            content_type_header: content_type_header.into(),
            status_overrides: BTreeMap::new(),
            forward_event_headers: false,
        }
    }

    /// Adds a status override.
    #[must_use]
    pub fn with_status_override(mut self, key: impl Into<String>, class: OutcomeClass) -> Self {
        self.status_overrides.insert(key.into(), class);
        self
    }

    /// Enables forwarding of event headers.
    #[must_use]
    pub fn with_forwarded_headers(mut self) -> Self {
        self.forward_event_headers = true;
        self
    }

    /// Validates every field.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` describing the first invalid
    /// field.
    pub fn validate(&self) -> Result<()> {
        self.endpoint_url()?;

        if self.request_timeout.is_zero() {
            return Err(DeliveryError::configuration("request timeout must be greater than 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(DeliveryError::configuration("connect timeout must be greater than 0"));
        }

        header_value("accept header", &self.accept_header)?;
        header_value("content-type header", &self.content_type_header)?;

        StatusPolicy::from_overrides(&self.status_overrides)?;
        Ok(())
    }

    /// Parses the endpoint into a URL.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the endpoint is not an
    /// absolute `http` or `https` URL with a host.
    pub fn endpoint_url(&self) -> Result<Url> {
        let trimmed = self.endpoint.trim();
        if trimmed.is_empty() {
            return Err(DeliveryError::configuration("endpoint must be set"));
        }

        let url = Url::parse(trimmed).map_err(|e| {
            DeliveryError::configuration(format!("invalid endpoint '{trimmed}': {e}"))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(DeliveryError::configuration(format!(
                "endpoint scheme must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(DeliveryError::configuration(format!("endpoint '{trimmed}' has no host")));
        }

        Ok(url)
    }
}

/// Parses a configured header value.
pub(crate) fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    if value.trim().is_empty() {
        return Err(DeliveryError::configuration(format!("{name} must be set")));
    }
    HeaderValue::from_str(value)
        .map_err(|e| DeliveryError::configuration(format!("invalid {name} '{value}': {e}")))
}
