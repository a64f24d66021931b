use std::time::Duration;

/// Result of checking a timestamp against the accepted window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Older than `now - ttl`
    Stale,
    /// Newer than `now`
    Future,
}

/// Accepts timestamps inside `[now - ttl, now]`.
///
/// Applied twice: when a sample is appended, and again when a persisted batch
/// is dequeued for delivery (where only the lower bound matters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlFilter {
    ttl_ms: i64,
}

impl TtlFilter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms as u64)
    }

    /// Oldest timestamp still accepted at `now_ms`.
    pub fn cutoff_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.ttl_ms)
    }

    pub fn check(&self, timestamp_ms: i64, now_ms: i64) -> Freshness {
        if timestamp_ms < self.cutoff_ms(now_ms) {
            Freshness::Stale
        } else if timestamp_ms > now_ms {
            Freshness::Future
        } else {
            Freshness::Fresh
        }
    }
}
