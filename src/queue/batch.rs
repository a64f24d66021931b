use crate::series::Sample;
use serde::{Deserialize, Serialize};

/// A sealed group of samples for one shard.
///
/// Batches are immutable once sealed; the queue persists them as-is and the
/// delivery worker only ever reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub shard: usize,

    /// Strictly increasing per shard, starting at 1. Survives restarts.
    pub sequence: u64,

    /// Wall-clock time the batch was sealed (ms since epoch)
    pub created_at_ms: i64,

    /// Samples in append order
    pub samples: Vec<Sample>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drops samples older than `cutoff_ms` and returns how many were removed.
    pub fn retain_fresh(&mut self, cutoff_ms: i64) -> usize {
        let before = self.samples.len();
        self.samples.retain(|s| s.timestamp_ms >= cutoff_ms);
        before - self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::SeriesLabels;

    fn sample(ts: i64) -> Sample {
        Sample::new(SeriesLabels::from_pairs([("__name__", "up")]), ts, 1.0)
    }

    #[test]
    fn test_retain_fresh_keeps_order() {
        let mut batch = Batch {
            shard: 0,
            sequence: 1,
            created_at_ms: 0,
            samples: vec![sample(5), sample(1), sample(7), sample(2)],
        };

        let removed = batch.retain_fresh(5);
        assert_eq!(removed, 2);
        let timestamps: Vec<i64> = batch.samples.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(timestamps, vec![5, 7]);
    }

    #[test]
    fn test_retain_fresh_can_empty_batch() {
        let mut batch = Batch {
            shard: 0,
            sequence: 1,
            created_at_ms: 0,
            samples: vec![sample(1), sample(2)],
        };

        assert_eq!(batch.retain_fresh(100), 2);
        assert!(batch.is_empty());
    }
}
