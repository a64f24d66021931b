use crate::series::SeriesLabels;
use sha2::{Digest, Sha256};

/// Stable 64-bit hash of a series identity.
///
/// Derived from SHA-256 of the canonical label encoding, so it does not change
/// across processes, platforms, or compiler versions.
pub fn series_hash(series: &SeriesLabels) -> u64 {
    let digest = Sha256::digest(series.canonical_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Assigns every series to one of `queue_count` shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    queue_count: usize,
}

impl ShardRouter {
    /// `queue_count` is validated to be non-zero by config loading; a zero
    /// here is treated as a single shard.
    pub fn new(queue_count: usize) -> Self {
        Self {
            queue_count: queue_count.max(1),
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queue_count
    }

    pub fn shard_of(&self, series: &SeriesLabels) -> usize {
        (series_hash(series) % self.queue_count as u64) as usize
    }
}
