//! Retry wrapper for collaborator calls
//!
//! Bounded exponential backoff. Only transient failures are retried:
//! transport errors, HTTP 429 and 5xx. Anything else fails immediately.

use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::rag::HttpError;

/// Backoff settings for one call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// True when another attempt may succeed
pub fn is_transient(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<HttpError>() {
        Some(HttpError::Status { code, .. }) => *code == 429 || *code >= 500,
        Some(HttpError::Transport(_)) => true,
        _ => false,
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
///
/// Blocks the calling thread between attempts; collaborator calls already
/// run on blocking workers.
pub fn with_retry<T, F>(policy: &RetryPolicy, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if attempt + 1 < attempts && is_transient(&e) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    call = what,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_retries_transient_until_success() {
        let calls = Cell::new(0);
        let result = with_retry(&fast(), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(HttpError::Status { code: 503, body: String::new() }.into())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retry(&fast(), "test", || {
            calls.set(calls.get() + 1);
            Err(HttpError::Status { code: 401, body: "bad key".into() }.into())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_attempts_bounded() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retry(&fast(), "test", || {
            calls.set(calls.get() + 1);
            Err(HttpError::Transport("reset".into()).into())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }
}
