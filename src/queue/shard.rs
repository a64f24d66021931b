use super::batch::Batch;
use super::durable::{DurableQueue, QueueError, QueueStats};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error};

/// Cloneable async handle to one shard's durable queue.
///
/// File I/O runs on the blocking pool, and the queue lock is only ever taken
/// there. Stats come from a snapshot refreshed after every operation, so
/// reading them never waits behind disk I/O. Enqueues wake whoever is
/// waiting in [`ShardQueue::notified`].
#[derive(Clone)]
pub struct ShardQueue {
    shard: usize,
    inner: Arc<Mutex<DurableQueue>>,
    snapshot: Arc<Mutex<QueueStats>>,
    notify: Arc<Notify>,
}

fn lock(inner: &Mutex<DurableQueue>) -> Result<MutexGuard<'_, DurableQueue>, QueueError> {
    inner.lock().map_err(|_| QueueError::Poisoned)
}

fn store(snapshot: &Mutex<QueueStats>, stats: QueueStats) {
    *snapshot.lock().unwrap_or_else(PoisonError::into_inner) = stats;
}

impl ShardQueue {
    pub async fn open(
        dir: PathBuf,
        shard: usize,
        segment_max_bytes: u64,
    ) -> Result<Self, QueueError> {
        let queue =
            tokio::task::spawn_blocking(move || DurableQueue::open(dir, segment_max_bytes))
                .await??;

        Ok(Self {
            shard,
            snapshot: Arc::new(Mutex::new(queue.stats())),
            inner: Arc::new(Mutex::new(queue)),
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Runs `op` against the queue on the blocking pool and refreshes the
    /// stats snapshot, whether or not it succeeded.
    async fn run<T, F>(&self, op: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut DurableQueue) -> Result<T, QueueError> + Send + 'static,
    {
        let inner = self.inner.clone();
        let snapshot = self.snapshot.clone();
        tokio::task::spawn_blocking(move || {
            let mut queue = lock(&inner)?;
            let result = op(&mut *queue);
            store(&snapshot, queue.stats());
            result
        })
        .await?
    }

    pub async fn enqueue(&self, batch: Batch) -> Result<(), QueueError> {
        self.run(move |queue| queue.enqueue(&batch)).await?;
        self.notify.notify_one();
        Ok(())
    }

    pub async fn dequeue(&self, min_timestamp_ms: i64) -> Result<Option<Batch>, QueueError> {
        self.run(move |queue| queue.dequeue(min_timestamp_ms)).await
    }

    pub async fn ack(&self, sequence: u64) -> Result<bool, QueueError> {
        self.run(move |queue| queue.ack(sequence)).await
    }

    pub async fn release(&self, sequence: u64) -> Result<bool, QueueError> {
        self.run(move |queue| Ok(queue.release(sequence))).await
    }

    pub fn next_sequence(&self) -> u64 {
        self.stats().next_sequence
    }

    /// Snapshot as of the last completed operation.
    pub fn stats(&self) -> QueueStats {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves after the next enqueue (or immediately if one happened since
    /// the last wait).
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Drains sealed batches from the batcher onto disk.
///
/// A batch too large to store is dropped and reported through `on_oversized`;
/// the queue stays usable. Returns when the batcher side of the channel
/// closes and everything received has been handled, or at the first
/// durability error.
pub async fn run_persister(
    queue: ShardQueue,
    mut sealed: mpsc::Receiver<Batch>,
    on_persisted: impl Fn(u64, usize),
    on_oversized: impl Fn(u64, usize),
) -> Result<(), QueueError> {
    while let Some(batch) = sealed.recv().await {
        let sequence = batch.sequence;
        let samples = batch.len();

        match queue.enqueue(batch).await {
            Ok(()) => {
                debug!(shard = queue.shard(), sequence, samples, "Batch persisted");
                on_persisted(sequence, samples);
            }
            Err(QueueError::RecordTooLarge { len, .. }) => {
                error!(
                    shard = queue.shard(),
                    sequence,
                    samples,
                    bytes = len,
                    "Batch too large to persist, dropping it"
                );
                on_oversized(sequence, samples);
            }
            Err(e) => {
                error!(shard = queue.shard(), sequence, error = %e, "Failed to persist batch");
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::queue::Batcher;
    use crate::series::{Sample, SeriesLabels};
    use std::time::Duration;
    use tempfile::TempDir;

    fn batch(sequence: u64) -> Batch {
        Batch {
            shard: 0,
            sequence,
            created_at_ms: 0,
            samples: vec![Sample::new(
                SeriesLabels::from_pairs([("__name__", "up")]),
                1_000,
                1.0,
            )],
        }
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let dir = TempDir::new().unwrap();
        let queue = ShardQueue::open(dir.path().to_path_buf(), 0, 1 << 20)
            .await
            .unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.notified().await })
        };
        tokio::task::yield_now().await;

        queue.enqueue(batch(1)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();

        let dequeued = queue.dequeue(0).await.unwrap().unwrap();
        assert_eq!(dequeued.sequence, 1);
        assert!(queue.ack(1).await.unwrap());
        assert_eq!(queue.stats().depth(), 0);
    }

    #[tokio::test]
    async fn test_persister_drains_channel_then_exits() {
        let dir = TempDir::new().unwrap();
        let queue = ShardQueue::open(dir.path().to_path_buf(), 0, 1 << 20)
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(4);

        tx.send(batch(1)).await.unwrap();
        tx.send(batch(2)).await.unwrap();
        drop(tx);

        let persisted = std::sync::Mutex::new(Vec::new());
        run_persister(
            queue.clone(),
            rx,
            |sequence, _| persisted.lock().unwrap().push(sequence),
            |_, _| panic!("nothing oversized"),
        )
        .await
        .unwrap();

        assert_eq!(*persisted.lock().unwrap(), vec![1, 2]);
        assert_eq!(queue.stats().depth(), 2);
        assert_eq!(queue.next_sequence(), 3);
    }

    #[tokio::test]
    async fn test_persister_stops_on_regression() {
        let dir = TempDir::new().unwrap();
        let queue = ShardQueue::open(dir.path().to_path_buf(), 0, 1 << 20)
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(4);

        tx.send(batch(2)).await.unwrap();
        tx.send(batch(1)).await.unwrap();
        drop(tx);

        let result = run_persister(queue, rx, |_, _| {}, |_, _| {}).await;
        assert!(matches!(
            result,
            Err(QueueError::SequenceRegression { sequence: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_persister_skips_oversized_batch() {
        let dir = TempDir::new().unwrap();
        let queue = ShardQueue::open(dir.path().to_path_buf(), 0, 1 << 20)
            .await
            .unwrap();
        lock(&queue.inner).unwrap().set_max_record_len(200);

        let mut large = batch(1);
        let sample = large.samples[0].clone();
        large.samples = vec![sample; 20];

        let (tx, rx) = mpsc::channel(4);
        tx.send(large).await.unwrap();
        tx.send(batch(2)).await.unwrap();
        drop(tx);

        let persisted = std::sync::Mutex::new(Vec::new());
        let oversized = std::sync::Mutex::new(Vec::new());
        run_persister(
            queue.clone(),
            rx,
            |sequence, _| persisted.lock().unwrap().push(sequence),
            |sequence, samples| oversized.lock().unwrap().push((sequence, samples)),
        )
        .await
        .unwrap();

        assert_eq!(*oversized.lock().unwrap(), vec![(1, 20)]);
        assert_eq!(*persisted.lock().unwrap(), vec![2]);
        assert_eq!(queue.stats().depth(), 1);
    }

    #[tokio::test]
    async fn test_stats_snapshot_tracks_operations() {
        let dir = TempDir::new().unwrap();
        let queue = ShardQueue::open(dir.path().to_path_buf(), 0, 1 << 20)
            .await
            .unwrap();
        assert_eq!(queue.next_sequence(), 1);

        queue.enqueue(batch(1)).await.unwrap();
        assert_eq!(queue.stats().ready, 1);

        // Queue lock held elsewhere; stats readers do not wait on it
        let guard = lock(&queue.inner).unwrap();
        assert_eq!(queue.stats().ready, 1);
        assert_eq!(queue.next_sequence(), 2);
        drop(guard);

        queue.dequeue(0).await.unwrap().unwrap();
        assert_eq!(queue.stats().in_flight, 1);
        assert!(queue.release(1).await.unwrap());
        assert_eq!(queue.stats().ready, 1);
    }

    #[tokio::test]
    async fn test_full_persist_buffer_holds_back_push() {
        let dir = TempDir::new().unwrap();
        let queue = ShardQueue::open(dir.path().to_path_buf(), 0, 1 << 20)
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(1);
        let batcher = Batcher::new(0, 1, Duration::from_secs(5), 1, tx, Arc::new(MockClock::new()));
        let persister = tokio::spawn(run_persister(queue.clone(), rx, |_, _| {}, |_, _| {}));
        let sample = |ts| Sample::new(SeriesLabels::from_pairs([("__name__", "up")]), ts, 1.0);

        // Stalls the persister inside its first write
        let guard = lock(&queue.inner).unwrap();
        assert_eq!(batcher.push(sample(1)).await.unwrap(), Some(1));
        assert_eq!(batcher.push(sample(2)).await.unwrap(), Some(2));

        let blocked = tokio::time::timeout(Duration::from_millis(100), batcher.push(sample(3))).await;
        assert!(blocked.is_err());
        drop(guard);

        assert_eq!(batcher.push(sample(3)).await.unwrap(), Some(3));
        batcher.close().await.unwrap();
        persister.await.unwrap().unwrap();
        assert_eq!(queue.stats().depth(), 3);
        assert_eq!(queue.next_sequence(), 4);
    }
}
