use crate::config::RetryConfig;
use std::time::Duration;
use tracing::warn;

/// Decision returned by the retry policy after a pipeline attempt exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Exit code 0: the loop is done.
    Done,
    /// Non-zero exit: sleep `delay`, then run again. `failures` is 1-based.
    Retry { failures: u32, delay: Duration },
    /// Non-zero exit and `max_attempts` reached.
    Exhausted { failures: u32 },
}

/// Retry policy for a failing pipeline.
///
/// Any non-zero exit code counts as a failure; there is no distinction
/// between crashes, bad input, or a missing dependency. The delay for the
/// n-th failure is `initial_delay * factor^(n-1)`, capped at `max_delay`.
/// With the defaults (`factor = 1.0`, no attempt limit) this is a fixed
/// interval retried forever.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
    max_attempts: Option<u32>,
    failures: u32,
}

impl RetryPolicy {
    /// `max_attempts` of `None` retries forever.
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        factor: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor,
            max_attempts,
            failures: 0,
        }
    }

    /// Fixed-interval policy that never gives up.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0, None)
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let max_attempts = match config.max_attempts {
            0 => None,
            n => Some(n),
        };
        Self::new(
            Duration::from_secs(config.initial_delay_secs),
            Duration::from_secs(config.max_delay_secs),
            config.factor,
            max_attempts,
        )
    }

    /// Evaluate an attempt's exit code and decide what to do next.
    pub fn evaluate(&mut self, exit_code: i32) -> RetryDecision {
        if exit_code == 0 {
            return RetryDecision::Done;
        }

        self.failures = self.failures.saturating_add(1);

        if let Some(max) = self.max_attempts {
            if self.failures >= max {
                warn!(
                    exit_code,
                    failures = self.failures,
                    max_attempts = max,
                    "pipeline retries exhausted"
                );
                return RetryDecision::Exhausted {
                    failures: self.failures,
                };
            }
        }

        let delay = self.delay_for(self.failures - 1);
        warn!(
            exit_code,
            failures = self.failures,
            delay_secs = delay.as_secs_f64(),
            "pipeline failed, scheduling retry"
        );
        RetryDecision::Retry {
            failures: self.failures,
            delay,
        }
    }

    /// Backoff for the given 0-based retry index.
    pub fn delay_for(&self, index: u32) -> Duration {
        let exp = index.min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Failures recorded so far.
    #[allow(dead_code)]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}
