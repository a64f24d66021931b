use crate::config::EndpointConfig;
use std::time::Duration;

/// Longest a single backoff wait may last.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// How a send result is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    /// Retried after a backoff wait
    Transient,
    /// Dropped without retry
    Permanent,
}

/// 2xx succeeds; 429 and 5xx are retried; everything else is dropped.
pub fn classify_status(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Success,
        429 | 500..=599 => Classification::Transient,
        _ => Classification::Permanent,
    }
}

/// Exponential backoff schedule for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    /// Retries allowed per batch; 0 retries forever
    pub max_retries: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max_retries,
            max_delay: MAX_BACKOFF,
        }
    }

    pub fn from_endpoint(config: &EndpointConfig) -> Self {
        Self::new(config.retry_backoff, config.max_retry_backoff_attempts)
    }

    /// Wait before retry number `retry` (1-based): `initial * 2^(retry-1)`,
    /// saturating and capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max_delay)
    }

    /// Like [`delay_for`](Self::delay_for), but never shorter than a
    /// server-provided `Retry-After`.
    pub fn delay_with_hint(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for(retry);
        match retry_after {
            Some(hint) => delay.max(hint.min(self.max_delay)),
            None => delay,
        }
    }

    pub fn allows(&self, retry: u32) -> bool {
        self.max_retries == 0 || retry <= self.max_retries
    }
}
