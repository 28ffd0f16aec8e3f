//! Exponential backoff for transient handler failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::traits::RetryPolicy;

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExponentialBackoff {
    /// Total attempts (1 = no retry). Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff in milliseconds. Default: 100.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Backoff multiplier per attempt. Default: 2.0.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// If non-empty, only retry causes containing one of these strings.
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retryable_errors: Vec::new(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    100
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32, cause: &str) -> Option<Duration> {
        if attempt >= self.max_attempts.max(1) {
            return None;
        }
        if !self.retryable_errors.is_empty()
            && !self.retryable_errors.iter().any(|p| cause.contains(p.as_str()))
        {
            return None;
        }
        let backoff =
            self.backoff_ms as f64 * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Some(Duration::from_millis(backoff as u64))
    }
}
