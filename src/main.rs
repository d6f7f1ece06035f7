//! Ferry HTTP event forwarder.
//!
//! Reads events from stdin, one per line, and forwards each to the
//! configured endpoint with at-least-once delivery. Exits once stdin is
//! exhausted and every event has been delivered, on Ctrl-C, or with an error
//! when the endpoint rejects an event.

use std::{io::BufRead, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use ferry_delivery::{Event, HttpSink, MemoryChannel, SinkRunner};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod config;

use crate::config::Config;

/// Delay before retrying a put into a full channel.
const FULL_CHANNEL_RETRY: Duration = Duration::from_millis(50);

/// Lines buffered between the stdin thread and the channel.
const STDIN_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();
    init_tracing(config.as_ref().map_or("info", |config| config.rust_log.as_str()));
    let config = config?;

    info!(
        endpoint = %config.endpoint,
        request_timeout_ms = config.request_timeout,
        connect_timeout_ms = config.connect_timeout,
        "Starting ferry"
    );

    let channel = MemoryChannel::new(config.channel_capacity);
    let sink = Arc::new(
        HttpSink::new(config.to_sink_config(), Arc::new(channel.clone()))
            .context("Failed to configure HTTP sink")?,
    );

    let token = CancellationToken::new();
    let runner = SinkRunner::new(sink.clone(), config.to_runner_config(), token.clone());

    let reader = tokio::spawn(read_events(channel.clone(), token.clone()));
    tokio::spawn(cancel_when_drained(reader, sink.clone(), token.clone()));
    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            token.cancel();
        }
    });

    let result = runner.run().await;
    token.cancel();

    let stats = sink.stats().await;
    info!(
        delivered = stats.drain_successes,
        backoffs = stats.backoffs,
        fatal = stats.fatal_failures,
        pending = channel.len(),
        "Ferry stopped"
    );

    result.context("Delivery stopped")
}

/// Initializes tracing, preferring `RUST_LOG` over the configured filter.
fn init_tracing(fallback: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Reads stdin on a dedicated thread so a blocked read never holds up
/// runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<std::io::Result<String>> {
    let (sender, receiver) = mpsc::channel(STDIN_BUFFER);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if sender.blocking_send(line).is_err() {
                break;
            }
        }
    });
    receiver
}

/// Puts every non-empty stdin line into the channel. Returns the number of
/// events queued.
async fn read_events(channel: MemoryChannel, token: CancellationToken) -> Result<u64> {
    let mut lines = spawn_stdin_reader();
    let mut queued = 0_u64;

    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            () = token.cancelled() => break,
        };
        let Some(line) = line else {
            debug!(queued, "stdin closed");
            break;
        };
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let event = Event::new(line);
        loop {
            match channel.put(event.clone()) {
                Ok(()) => break,
                Err(error) => {
                    debug!(error = %error, "channel full, waiting");
                    tokio::select! {
                        () = tokio::time::sleep(FULL_CHANNEL_RETRY) => {}
                        () = token.cancelled() => return Ok(queued),
                    }
                },
            }
        }
        queued += 1;
    }

    Ok(queued)
}

/// Cancels the runner once stdin is exhausted and every queued event has been
/// delivered.
async fn cancel_when_drained(
    reader: tokio::task::JoinHandle<Result<u64>>,
    sink: Arc<HttpSink>,
    token: CancellationToken,
) {
    let queued = match reader.await {
        Ok(Ok(queued)) => queued,
        Ok(Err(error)) => {
            error!(error = %error, "stdin reader failed");
            token.cancel();
            return;
        },
        Err(error) => {
            warn!(error = %error, "stdin reader task ended abnormally");
            token.cancel();
            return;
        },
    };

    while !token.is_cancelled() {
        if sink.stats().await.drain_successes >= queued {
            info!(delivered = queued, "All events delivered");
            token.cancel();
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
            () = token.cancelled() => return,
        }
    }
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(error) => {
                warn!(error = %error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
