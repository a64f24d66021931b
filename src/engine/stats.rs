use crate::queue::QueueStats;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Live counters for one shard of one endpoint.
#[derive(Debug, Default)]
pub struct ShardStats {
    samples_appended: AtomicU64,
    batches_persisted: AtomicU64,
    requests_sent: AtomicU64,
    retries: AtomicU64,
    batches_delivered: AtomicU64,
    samples_delivered: AtomicU64,
    dropped_permanent: AtomicU64,
    dropped_retry_exhausted: AtomicU64,
    dropped_serialization: AtomicU64,
    samples_dropped: AtomicU64,
    degraded: AtomicBool,
}

impl ShardStats {
    pub fn record_appended(&self) {
        self.samples_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self) {
        self.batches_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_samples_delivered(&self, samples: usize) {
        self.samples_delivered
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_batch_delivered(&self) {
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_permanent(&self, samples: usize) {
        self.dropped_permanent.fetch_add(1, Ordering::Relaxed);
        self.samples_dropped.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_dropped_retry_exhausted(&self, samples: usize) {
        self.dropped_retry_exhausted.fetch_add(1, Ordering::Relaxed);
        self.samples_dropped.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_dropped_serialization(&self, samples: usize) {
        self.dropped_serialization.fetch_add(1, Ordering::Relaxed);
        self.samples_dropped.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Release);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn snapshot(&self, shard: usize, drain_only: bool, queue: QueueStats) -> ShardSnapshot {
        ShardSnapshot {
            shard,
            drain_only,
            degraded: self.is_degraded(),
            samples_appended: self.samples_appended.load(Ordering::Relaxed),
            batches_persisted: self.batches_persisted.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            samples_delivered: self.samples_delivered.load(Ordering::Relaxed),
            dropped_permanent: self.dropped_permanent.load(Ordering::Relaxed),
            dropped_retry_exhausted: self.dropped_retry_exhausted.load(Ordering::Relaxed),
            dropped_serialization: self.dropped_serialization.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            queue_depth: queue.depth() as u64,
            in_flight: queue.in_flight as u64,
            segments: queue.segments as u64,
            disk_bytes: queue.disk_bytes,
            corrupted_records: queue.corrupted_records,
            expired_batches: queue.expired_batches,
            expired_samples: queue.expired_samples,
        }
    }
}

/// Append-side counters shared by every appender handle.
#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_future: AtomicU64,
    dropped_shutting_down: AtomicU64,
    dropped_shard_unavailable: AtomicU64,
}

impl IngestStats {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.dropped_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_future(&self) {
        self.dropped_future.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shutting_down(&self) {
        self.dropped_shutting_down.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shard_unavailable(&self) {
        self.dropped_shard_unavailable
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            dropped_future: self.dropped_future.load(Ordering::Relaxed),
            dropped_shutting_down: self.dropped_shutting_down.load(Ordering::Relaxed),
            dropped_shard_unavailable: self.dropped_shard_unavailable.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub accepted: u64,
    pub dropped_stale: u64,
    pub dropped_future: u64,
    pub dropped_shutting_down: u64,
    /// Per endpoint copy that could not be buffered
    pub dropped_shard_unavailable: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShardSnapshot {
    pub shard: usize,
    pub drain_only: bool,
    pub degraded: bool,
    pub samples_appended: u64,
    pub batches_persisted: u64,
    pub requests_sent: u64,
    pub retries: u64,
    pub batches_delivered: u64,
    pub samples_delivered: u64,
    pub dropped_permanent: u64,
    pub dropped_retry_exhausted: u64,
    pub dropped_serialization: u64,
    pub samples_dropped: u64,
    pub queue_depth: u64,
    pub in_flight: u64,
    pub segments: u64,
    pub disk_bytes: u64,
    pub corrupted_records: u64,
    pub expired_batches: u64,
    pub expired_samples: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub name: String,
    pub shards: Vec<ShardSnapshot>,
}

impl EndpointStats {
    /// Sums one counter across shards.
    pub fn total(&self, counter: impl Fn(&ShardSnapshot) -> u64) -> u64 {
        self.shards.iter().map(counter).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub ingest: IngestSnapshot,
    pub endpoints: Vec<EndpointStats>,
}

impl EngineStats {
    pub fn endpoint(&self, name: &str) -> Option<&EndpointStats> {
        self.endpoints.iter().find(|e| e.name == name)
    }
}
