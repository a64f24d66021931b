//! Per-shard batching and durable storage.
//!
//! Samples flow `Batcher` -> persist channel -> `DurableQueue` (via
//! `ShardQueue`) -> delivery worker.

pub mod batch;
pub mod batcher;
pub mod durable;
pub mod router;
pub mod segment;
pub mod shard;

pub use batch::Batch;
pub use batcher::{Batcher, BatcherError, FlushReason};
pub use durable::{DurableQueue, QueueError, QueueStats};
pub use router::{series_hash, ShardRouter};
pub use shard::{run_persister, ShardQueue};

/// Directory name for a shard's queue under its endpoint directory.
pub fn shard_dir_name(shard: usize) -> String {
    format!("shard-{:04}", shard)
}

/// Inverse of [`shard_dir_name`].
pub fn parse_shard_dir_name(name: &str) -> Option<usize> {
    let digits = name.strip_prefix("shard-")?;
    if digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_dir_names() {
        assert_eq!(shard_dir_name(3), "shard-0003");
        assert_eq!(parse_shard_dir_name("shard-0003"), Some(3));
        assert_eq!(parse_shard_dir_name("shard-12345"), Some(12345));
        assert_eq!(parse_shard_dir_name("shard-3"), None);
        assert_eq!(parse_shard_dir_name("other"), None);
    }
}
