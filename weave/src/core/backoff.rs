//! Bounded exponential backoff schedule with jitter.

use std::time::Duration;

use rand::Rng;

/// Spread applied to each sleep so contending processes fall out of step.
pub const DEFAULT_JITTER: f64 = 0.25;

/// Retry budget for an operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Attempts after the first one.
    pub retries: u32,
    pub initial: Duration,
    pub max: Duration,
    /// Each sleep is scaled by a random factor in `1 ± jitter`.
    pub jitter: f64,
}

impl Backoff {
    pub fn new(retries: u32, initial_ms: u64) -> Self {
        Self {
            retries,
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_secs(5),
            jitter: DEFAULT_JITTER,
        }
    }

    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// `delay` scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let base = self.delay(retry);
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
        base.mul_f64(factor)
    }

    /// Total attempts including the first.
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Run `op` until it succeeds, `should_retry` rejects the error, or the
    /// budget is spent. The last error is returned.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        should_retry: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt <= self.retries && should_retry(&err) => {
                    std::thread::sleep(self.jittered_delay(attempt));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
