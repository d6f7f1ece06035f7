//! At-least-once HTTP forwarding of events from a transactional channel.
//!
//! This crate implements the sink side of an event pipeline: it takes one
//! event from an upstream [`Channel`], POSTs the payload to a fixed endpoint
//! and commits the take only when the endpoint answered 2xx. Everything else
//! rolls the event back so it is offered again.
//!
//! # Architecture
//!
//! One call to [`HttpSink::process`] runs the complete lifecycle:
//!
//! 1. **Take** - Open a transaction scope and take at most one event
//! 2. **Send** - POST the bytes with connect and request deadlines
//! 3. **Classify** - Map the raw result to delivered, transient or fatal
//! 4. **Settle** - Commit, or roll back and signal `Backoff` or an error
//!
//! [`SinkRunner`] calls the sink in a loop and applies exponential backoff
//! with jitter after transient failures.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use ferry_delivery::{Event, HttpSink, MemoryChannel, SinkConfig, SinkStatus};
//!
//! # async fn example() -> ferry_delivery::Result<()> {
//! let channel = MemoryChannel::new(1024);
//! channel.put(Event::new(r#"{"id":"1"}"#))?;
//!
//! let config = SinkConfig::new(
//!     "http://localhost:8080/datastream",
//!     Duration::from_secs(2),
//!     Duration::from_secs(2),
//!     "application/json",
//!     "application/json",
//! );
//! let sink = HttpSink::new(config, Arc::new(channel))?;
//!
//! match sink.process().await? {
//!     SinkStatus::Ready => println!("delivered"),
//!     SinkStatus::Backoff => println!("try again later"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod runner;
pub mod sink;

pub use channel::{Channel, Event, MemoryChannel, Transaction, TransactionScope};
pub use classify::{classify, DeliveryOutcome, OutcomeClass, StatusMatcher, StatusPolicy};
pub use client::{DeliveryClient, RawResult, Transport};
pub use config::SinkConfig;
pub use error::{DeliveryError, FailureKind, Result, TransportFailure};
pub use runner::{BackoffPolicy, RunnerConfig, SinkRunner};
pub use sink::{HttpSink, SinkStats, SinkStatus};

/// Default wait between polls of an empty channel, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default delay after the first consecutive back-off, in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// Default upper bound on back-off delays, in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default capacity of the in-memory channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;
