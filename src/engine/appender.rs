use super::endpoint::EndpointPipeline;
use super::stats::IngestStats;
use crate::clock::Clock;
use crate::series::{Freshness, Sample, TtlFilter};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Why a sample was not taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Older than `now - ttl`
    StaleSample,
    /// Timestamp ahead of the local clock
    FutureSample,
    ShuttingDown,
    /// No endpoint could buffer the sample
    ShardUnavailable,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::StaleSample => "stale_sample",
            DropReason::FutureSample => "future_sample",
            DropReason::ShuttingDown => "shutting_down",
            DropReason::ShardUnavailable => "shard_unavailable",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted,
    Dropped(DropReason),
}

impl AppendOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AppendOutcome::Accepted)
    }
}

/// Ingestion entry point for sample producers.
#[async_trait]
pub trait Appendable: Send + Sync {
    /// Buffers a sample for every endpoint. Waits when a shard's sealed
    /// batch buffer is full; never does disk or network I/O itself.
    async fn append(&self, sample: Sample) -> AppendOutcome;
}

/// State shared between the engine and all appender handles.
pub(crate) struct IngestContext {
    pub endpoints: Vec<EndpointPipeline>,
    pub ttl: TtlFilter,
    pub clock: Arc<dyn Clock>,
    pub closed: AtomicBool,
    pub stats: IngestStats,
}

impl IngestContext {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Cloneable handle for appending samples to a running engine.
#[derive(Clone)]
pub struct Appender {
    ctx: Arc<IngestContext>,
}

impl Appender {
    pub(crate) fn new(ctx: Arc<IngestContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Appendable for Appender {
    async fn append(&self, sample: Sample) -> AppendOutcome {
        let ctx = &self.ctx;

        match ctx.ttl.check(sample.timestamp_ms, ctx.clock.now_ms()) {
            Freshness::Fresh => {}
            Freshness::Stale => {
                ctx.stats.record_stale();
                trace!(series = %sample.series, timestamp_ms = sample.timestamp_ms, "Dropping stale sample");
                return AppendOutcome::Dropped(DropReason::StaleSample);
            }
            Freshness::Future => {
                ctx.stats.record_future();
                trace!(series = %sample.series, timestamp_ms = sample.timestamp_ms, "Dropping future sample");
                return AppendOutcome::Dropped(DropReason::FutureSample);
            }
        }

        if ctx.is_closed() {
            ctx.stats.record_shutting_down();
            return AppendOutcome::Dropped(DropReason::ShuttingDown);
        }

        let mut accepted = false;
        for endpoint in &ctx.endpoints {
            match endpoint.push(sample.clone()).await {
                Ok(()) => accepted = true,
                Err(e) if !ctx.is_closed() => {
                    ctx.stats.record_shard_unavailable();
                    debug!(endpoint = endpoint.name(), error = %e, "Shard unavailable, sample not buffered");
                }
                Err(_) => {}
            }
        }

        if accepted {
            ctx.stats.record_accepted();
            AppendOutcome::Accepted
        } else if ctx.is_closed() {
            ctx.stats.record_shutting_down();
            AppendOutcome::Dropped(DropReason::ShuttingDown)
        } else {
            AppendOutcome::Dropped(DropReason::ShardUnavailable)
        }
    }
}
