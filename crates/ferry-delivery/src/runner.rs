//! Drives a sink until cancelled, pacing calls after `BACKOFF`.
//!
//! The sink never retries inside one call; this loop is the caller that
//! reacts to its signals. Delivered events are followed immediately by the
//! next call, an empty channel is polled every `poll_interval`, and
//! consecutive back-offs wait exponentially longer with jitter until a call
//! succeeds again.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    sink::{HttpSink, Processed},
};

/// Delay schedule between consecutive back-offs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first back-off.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Jitter fraction (0.0 to 1.0) applied symmetrically.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(crate::DEFAULT_BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(crate::DEFAULT_BACKOFF_MAX_MS),
            jitter_factor: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next call after `consecutive` back-offs in a row
    /// (1-based). Doubles each time, capped at `max_delay`.
    pub fn delay_for(&self, consecutive: u32) -> Duration {
        let exponent = consecutive.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let base = self.base_delay.saturating_mul(multiplier);
        let capped = base.min(self.max_delay);

        self.spread(capped).min(self.max_delay)
    }

    /// Scales `delay` by a random factor in `1 ± jitter_factor` so runners
    /// sharing an endpoint drift apart.
    fn spread(&self, delay: Duration) -> Duration {
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter.is_nan() || jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        delay.mul_f64(rand::rng().random_range(1.0 - jitter..=1.0 + jitter))
    }
}

/// Runner timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Wait between calls while the channel is empty.
    pub poll_interval: Duration,
    /// Schedule after transient failures.
    pub backoff: BackoffPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Repeatedly invokes [`HttpSink`] until cancelled or a non-retryable error.
pub struct SinkRunner {
    sink: Arc<HttpSink>,
    config: RunnerConfig,
    cancellation_token: CancellationToken,
}

impl SinkRunner {
    /// Creates a runner. Cancel `cancellation_token` to stop it.
    pub fn new(
        sink: Arc<HttpSink>,
        config: RunnerConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { sink, config, cancellation_token }
    }

    /// Runs until cancelled.
    ///
    /// A call in flight when cancellation arrives is allowed to finish, so
    /// the event it took is either committed or rolled back normally.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error raised by the sink, such as
    /// `FatalDelivery`. The event involved has already been rolled back.
    pub async fn run(&self) -> Result<()> {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "sink runner starting"
        );

        let mut consecutive_backoffs: u32 = 0;

        loop {
            if self.cancellation_token.is_cancelled() {
                info!("sink runner received shutdown signal");
                break;
            }

            let pause = match self.sink.process_one().await {
                Ok(Processed::Delivered) => {
                    consecutive_backoffs = 0;
                    None
                },
                Ok(Processed::Empty) => {
                    consecutive_backoffs = 0;
                    Some(self.config.poll_interval)
                },
                Ok(Processed::Requeued) => {
                    consecutive_backoffs = consecutive_backoffs.saturating_add(1);
                    let delay = self.config.backoff.delay_for(consecutive_backoffs);
                    debug!(
                        consecutive_backoffs,
                        delay_ms = delay.as_millis(),
                        "backing off before next attempt"
                    );
                    Some(delay)
                },
                Err(error) if error.is_retryable() => {
                    consecutive_backoffs = consecutive_backoffs.saturating_add(1);
                    let delay = self.config.backoff.delay_for(consecutive_backoffs);
                    warn!(
                        error = %error,
                        delay_ms = delay.as_millis(),
                        "sink call failed, retrying after delay"
                    );
                    Some(delay)
                },
                Err(error) => {
                    error!(error = %error, "sink runner stopping on non-retryable error");
                    return Err(error);
                },
            };

            if let Some(delay) = pause {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        info!("sink runner stopped");
        Ok(())
    }

    /// Runs until cancelled, mapping a clean stop to `Shutdown`.
    ///
    /// Convenient for callers that treat every exit as an error path.
    ///
    /// # Errors
    ///
    /// `Shutdown` after cancellation, otherwise as [`SinkRunner::run`].
    pub async fn run_to_shutdown(&self) -> Result<()> {
        self.run().await?;
        Err(DeliveryError::Shutdown)
    }
}
