//! Configuration for the ferry forwarder.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use ferry_delivery::{BackoffPolicy, OutcomeClass, RunnerConfig, SinkConfig};
use figment::{
    providers::{Env, Format, Toml},
    value::{Dict, Map},
    Figment, Metadata, Profile, Provider,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "ferry.toml";

/// Environment variable naming an alternative configuration file.
pub const CONFIG_PATH_VAR: &str = "FERRY_CONFIG";

/// Flume sink property names and the keys they stand for.
const FLUME_NAMES: [(&str, &str); 4] = [
    ("requestTimeout", "request_timeout"),
    ("connectionTimeout", "connect_timeout"),
    ("acceptHeader", "accept_header"),
    ("contentTypeHeader", "content_type_header"),
];

/// Complete forwarder configuration from file and environment.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed `FERRY_` (highest priority)
/// 2. Configuration file (`ferry.toml`, or the path in `FERRY_CONFIG`)
///
/// The endpoint, both timeouts and both header values have no defaults and
/// must be given. The file may use the Flume property names
/// (`requestTimeout`, `connectionTimeout`, `acceptHeader`,
/// `contentTypeHeader`).
///
/// # Example
///
/// ```toml
/// endpoint = "http://localhost:8080/datastream"
/// requestTimeout = 2000
/// connectionTimeout = 2000
/// acceptHeader = "application/json"
/// contentTypeHeader = "application/json"
///
/// [status_overrides]
/// "409" = "delivered"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Endpoint
    /// Absolute URL every payload is POSTed to.
    ///
    /// Environment variable: `FERRY_ENDPOINT`
    pub endpoint: String,
    /// Whole-request deadline in milliseconds.
    ///
    /// Environment variable: `FERRY_REQUEST_TIMEOUT`
    pub request_timeout: u64,
    /// Connection deadline in milliseconds.
    ///
    /// Environment variable: `FERRY_CONNECT_TIMEOUT`
    pub connect_timeout: u64,
    /// `Accept` header value.
    ///
    /// Environment variable: `FERRY_ACCEPT_HEADER`
    pub accept_header: String,
    /// `Content-Type` header value.
    ///
    /// Environment variable: `FERRY_CONTENT_TYPE_HEADER`
    pub content_type_header: String,

    // Classification
    /// Status code or class overrides, e.g. `"4XX" = "transient"`.
    #[serde(default)]
    pub status_overrides: BTreeMap<String, OutcomeClass>,
    /// Copy event headers onto each request.
    ///
    /// Environment variable: `FERRY_FORWARD_EVENT_HEADERS`
    #[serde(default)]
    pub forward_event_headers: bool,

    // Runner
    /// Wait between polls of an empty channel in milliseconds.
    ///
    /// Environment variable: `FERRY_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay after the first back-off in milliseconds.
    ///
    /// Environment variable: `FERRY_BACKOFF_BASE_MS`
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on back-off delays in milliseconds.
    ///
    /// Environment variable: `FERRY_BACKOFF_MAX_MS`
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Jitter factor for back-off delays (0.0 to 1.0).
    ///
    /// Environment variable: `FERRY_BACKOFF_JITTER`
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    /// Maximum events buffered between stdin and the sink.
    ///
    /// Environment variable: `FERRY_CHANNEL_CAPACITY`
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    // Logging
    /// Log filter used when `RUST_LOG` is unset.
    ///
    /// Environment variable: `FERRY_RUST_LOG`
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Loads from the configuration file and `FERRY_` environment variables.
    ///
    /// The file is `ferry.toml` in the working directory unless
    /// `FERRY_CONFIG` names another. A missing file is not an error; missing
    /// required values are.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_VAR)
            .map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from);
        Self::load_from(&path)
    }

    /// Loads from `path` and `FERRY_` environment variables.
    pub fn load_from(path: &Path) -> Result<Self> {
        let figment = Figment::new()
            .merge(FlumeNames(Toml::file(path)))
            .merge(Env::prefixed("FERRY_").ignore(&["config"]));
        Self::from_figment(&figment)
    }

    /// Extracts and validates a configuration.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the delivery crate's sink configuration.
    pub fn to_sink_config(&self) -> SinkConfig {
        SinkConfig {
            endpoint: self.endpoint.clone(),
            request_timeout: Duration::from_millis(self.request_timeout),
            connect_timeout: Duration::from_millis(self.connect_timeout),
            accept_header: self.accept_header.clone(),
            content_type_header: self.content_type_header.clone(),
            status_overrides: self.status_overrides.clone(),
            forward_event_headers: self.forward_event_headers,
        }
    }

    /// Convert to runner timing.
    pub fn to_runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms),
                jitter_factor: self.backoff_jitter,
            },
        }
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        self.to_sink_config().validate().context("Invalid sink configuration")?;

        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }

        if self.backoff_base_ms == 0 {
            anyhow::bail!("backoff_base_ms must be greater than 0");
        }

        if self.backoff_base_ms > self.backoff_max_ms {
            anyhow::bail!("backoff_base_ms cannot exceed backoff_max_ms");
        }

        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            anyhow::bail!("backoff_jitter must be between 0.0 and 1.0");
        }

        if self.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be greater than 0");
        }

        Ok(())
    }
}

/// Renames Flume property names in a provider's data to native keys. A
/// native key present in the same source wins.
struct FlumeNames<P>(P);

impl<P: Provider> Provider for FlumeNames<P> {
    fn metadata(&self) -> Metadata {
        self.0.metadata()
    }

    fn data(&self) -> figment::Result<Map<Profile, Dict>> {
        let mut data = self.0.data()?;
        for dict in data.values_mut() {
            for (flume, native) in FLUME_NAMES {
                if let Some(value) = dict.remove(flume) {
                    dict.entry(native.to_string()).or_insert(value);
                }
            }
        }
        Ok(data)
    }
}

fn default_poll_interval_ms() -> u64 {
    ferry_delivery::DEFAULT_POLL_INTERVAL_MS
}

fn default_backoff_base_ms() -> u64 {
    ferry_delivery::DEFAULT_BACKOFF_BASE_MS
}

fn default_backoff_max_ms() -> u64 {
    ferry_delivery::DEFAULT_BACKOFF_MAX_MS
}

fn default_backoff_jitter() -> f64 {
    0.25
}

fn default_channel_capacity() -> usize {
    ferry_delivery::DEFAULT_CHANNEL_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}
