// Retry Policy
// Attempt limits and backoff shapes shared by the engine and the provider adapters

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the delay between two attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately
    None,
    /// Same delay before every retry
    Fixed { delay_ms: u64 },
    /// `initial_ms * multiplier^(attempt - 1)`, capped at `max_ms`
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: 200,
            multiplier: 2.0,
            max_ms: 5_000,
        }
    }
}

/// How many times a unit of work may be attempted and how long to wait in between
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (always at least 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay shape between attempts
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }

    /// Exponential backoff starting at `initial`, capped at `max`
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial_ms: initial.as_millis() as u64,
                multiplier: 2.0,
                max_ms: max.as_millis() as u64,
            },
        }
    }

    /// Effective attempt budget; a zero in configuration still means one try
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.attempts()
    }

    /// Delay to wait after the given (1-indexed) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match &self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let factor = multiplier.max(1.0).powi(attempt as i32 - 1);
                let delay = (*initial_ms as f64 * factor).min(*max_ms as f64);
                Duration::from_millis(delay as u64)
            }
        }
    }
}
