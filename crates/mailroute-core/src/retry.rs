use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{info, warn};

use crate::config::RetryConfig;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(1500);

/// Suspension point used between attempts. Swappable so tests can observe
/// the schedule without waiting on the clock.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bounded retry with exponential backoff and additive jitter.
///
/// The policy carries no per-call state; every `run` owns its own attempt loop.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    multiplier: f64,
    max_jitter: f64,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            multiplier: 2.0,
            max_jitter: 0.1,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("multiplier", &self.multiplier)
            .field("max_jitter", &self.max_jitter)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            ..Self::default()
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.multiplier,
            max_jitter: config.max_jitter.clamp(0.0, 1.0),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before jitter for the given zero-based retry index.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry as i32);
        Duration::from_secs_f64(self.initial_backoff.as_secs_f64() * factor)
    }

    fn jittered(&self, nominal: Duration) -> Duration {
        let jitter: f64 = if self.max_jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.max_jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64(nominal.as_secs_f64() * (1.0 + jitter))
    }

    /// Run `op` until it succeeds, fails with an error `is_transient` rejects,
    /// or the attempt budget is spent. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, is_transient: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_transient(&err) {
                warn!(error = %err, "non-transient failure, not retrying");
                return Err(err);
            }

            if attempt >= self.max_attempts {
                warn!(
                    error = %err,
                    attempts = attempt,
                    "retries exhausted, giving up"
                );
                return Err(err);
            }

            let delay = self.jittered(self.nominal_delay(attempt - 1));
            warn!(
                error = %err,
                attempt,
                max_attempts = self.max_attempts,
                "request failed"
            );
            info!(delay_ms = delay.as_millis() as u64, "retrying after backoff");
            self.sleeper.sleep(delay).await;
        }
    }
}
