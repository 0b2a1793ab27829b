//! Retry policy shared by every backplane and worker-stub caller.

use std::future::Future;
use std::time::Duration;

use granary_api::{Code, Status};
use rand::Rng;
use tracing::debug;

/// Exponential backoff with jitter.
#[derive(Clone, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub attempts: u32,
}

impl Backoff {
    pub fn exponential(
        initial: Duration,
        max: Duration,
        multiplier: f64,
        jitter: f64,
        attempts: u32,
    ) -> Backoff {
        Backoff {
            initial,
            max,
            multiplier,
            jitter,
            attempts,
        }
    }

    /// Delay ahead of retry number `attempt` (1-based).
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        let capped = base.min(self.max.as_secs_f64());
        let spread = capped * self.jitter;
        let jittered = if spread > 0.0 {
            rand::thread_rng().gen_range(capped - spread..=capped + spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

impl Default for Backoff {
    /// 100 ms -> 5 s, x2, +/-10 %, 5 attempts.
    fn default() -> Backoff {
        Backoff::exponential(
            Duration::from_millis(100),
            Duration::from_millis(5000),
            2.0,
            0.1,
            5,
        )
    }
}

/// Errors that can say whether they are transient.
pub trait Retriable {
    fn code(&self) -> Code;
}

impl Retriable for Status {
    fn code(&self) -> Code {
        self.code
    }
}

impl Retriable for crate::BackplaneError {
    fn code(&self) -> Code {
        crate::BackplaneError::code(self)
    }
}

/// Retries transient failures with exponential backoff; structural errors
/// surface immediately.
#[derive(Clone, Debug, Default)]
pub struct Retrier {
    backoff: Backoff,
}

impl Retrier {
    pub fn new(backoff: Backoff) -> Retrier {
        Retrier { backoff }
    }

    pub async fn execute<T, E, F, Fut>(&self, mut call: F) -> Result<T, E>
    where
        E: Retriable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.code().is_retriable() && attempt < self.backoff.attempts => {
                    let delay = self.backoff.delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
