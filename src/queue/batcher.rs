use super::batch::Batch;
use crate::clock::Clock;
use crate::series::Sample;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatcherError {
    /// The batcher was closed, or its persist task has stopped
    #[error("shard {0} is not accepting samples")]
    Closed(usize),
}

/// Why a batch was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Count,
    Timer,
    Close,
}

impl FlushReason {
    fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Count => "count",
            FlushReason::Timer => "timer",
            FlushReason::Close => "close",
        }
    }
}

struct BatcherState {
    samples: Vec<Sample>,
    /// When the first sample of the active batch arrived
    opened_at: Option<Instant>,
    next_sequence: u64,
    sealed_tx: Option<mpsc::Sender<Batch>>,
}

/// Accumulates samples for one shard and seals them into batches.
///
/// A batch is sealed when it reaches `max_samples`, or `frequency` after its
/// first sample, whichever comes first. Sealed batches go to the persist
/// channel while the state lock is held, so sequence order is persist order.
pub struct Batcher {
    shard: usize,
    max_samples: usize,
    frequency: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<BatcherState>,
    wakeup: Notify,
}

impl Batcher {
    pub fn new(
        shard: usize,
        max_samples: usize,
        frequency: Duration,
        next_sequence: u64,
        sealed_tx: mpsc::Sender<Batch>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shard,
            max_samples: max_samples.max(1),
            frequency,
            clock,
            state: Mutex::new(BatcherState {
                samples: Vec::new(),
                opened_at: None,
                next_sequence: next_sequence.max(1),
                sealed_tx: Some(sealed_tx),
            }),
            wakeup: Notify::new(),
        }
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Adds a sample to the active batch.
    ///
    /// Returns the sequence of the batch sealed by this call, if the sample
    /// filled it. Waits while the persist channel is full.
    ///
    /// Cancel safe: a push dropped while waiting for channel capacity leaves
    /// the active batch and the sequence counter as they were, and its sample
    /// is not accepted.
    pub async fn push(&self, sample: Sample) -> Result<Option<u64>, BatcherError> {
        let mut state = self.state.lock().await;
        if state.sealed_tx.is_none() {
            return Err(BatcherError::Closed(self.shard));
        }

        if state.samples.len() + 1 >= self.max_samples {
            return self
                .seal(&mut state, Some(sample), FlushReason::Count)
                .await
                .map(Some);
        }

        if state.samples.is_empty() {
            state.opened_at = Some(Instant::now());
            self.wakeup.notify_one();
        }
        state.samples.push(sample);
        Ok(None)
    }

    /// Seals the active batch if its time trigger has passed.
    pub async fn flush_if_due(&self) -> Result<Option<u64>, BatcherError> {
        let mut state = self.state.lock().await;
        let due = state
            .opened_at
            .map(|opened| opened.elapsed() >= self.frequency)
            .unwrap_or(false);

        if due && !state.samples.is_empty() {
            return self
                .seal(&mut state, None, FlushReason::Timer)
                .await
                .map(Some);
        }
        Ok(None)
    }

    /// When the active batch must be sealed, if one is open.
    pub async fn deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .await
            .opened_at
            .map(|opened| opened + self.frequency)
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.samples.len()
    }

    /// Seals any partial batch and closes the persist channel.
    ///
    /// Later pushes fail with [`BatcherError::Closed`].
    pub async fn close(&self) -> Result<Option<u64>, BatcherError> {
        let mut state = self.state.lock().await;
        if state.sealed_tx.is_none() {
            return Ok(None);
        }

        let sealed = if state.samples.is_empty() {
            None
        } else {
            Some(self.seal(&mut state, None, FlushReason::Close).await?)
        };
        state.sealed_tx = None;
        self.wakeup.notify_one();
        Ok(sealed)
    }

    /// Seals the active batch, plus `last` if given. Channel capacity is
    /// reserved before any state changes.
    async fn seal(
        &self,
        state: &mut BatcherState,
        last: Option<Sample>,
        reason: FlushReason,
    ) -> Result<u64, BatcherError> {
        let Some(tx) = state.sealed_tx.clone() else {
            return Err(BatcherError::Closed(self.shard));
        };
        let permit = match tx.reserve().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    shard = self.shard,
                    sequence = state.next_sequence,
                    "Persist task gone, shard stops accepting samples"
                );
                state.sealed_tx = None;
                return Err(BatcherError::Closed(self.shard));
            }
        };

        let mut samples = std::mem::take(&mut state.samples);
        samples.extend(last);
        state.opened_at = None;

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let batch = Batch {
            shard: self.shard,
            sequence,
            created_at_ms: self.clock.now_ms(),
            samples,
        };
        let count = batch.len();
        permit.send(batch);

        debug!(
            shard = self.shard,
            sequence,
            samples = count,
            reason = reason.as_str(),
            "Sealed batch"
        );
        Ok(sequence)
    }

    /// Time trigger loop. Sleeps until the open batch's deadline, or until a
    /// new batch opens, and exits on shutdown or once the batcher is closed.
    pub async fn run_timer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if self.state.lock().await.sealed_tx.is_none() {
                break;
            }
            let deadline = self.deadline().await;

            tokio::select! {
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => self.wakeup.notified().await,
                    }
                } => {
                    if deadline.is_some() {
                        match self.flush_if_due().await {
                            Ok(Some(sequence)) => {
                                trace!(shard = self.shard, sequence, "Timer sealed batch");
                            }
                            Ok(None) => {}
                            Err(_) => break,
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        trace!(shard = self.shard, "Flush timer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::series::SeriesLabels;

    fn sample(name: &str) -> Sample {
        Sample::new(SeriesLabels::from_pairs([("__name__", name)]), 1_000, 1.0)
    }

    fn batcher(max: usize, frequency: Duration) -> (Arc<Batcher>, mpsc::Receiver<Batch>) {
        let (tx, rx) = mpsc::channel(8);
        let batcher = Batcher::new(0, max, frequency, 1, tx, Arc::new(MockClock::new()));
        (Arc::new(batcher), rx)
    }

    #[tokio::test]
    async fn test_count_trigger_seals_inside_push() {
        let (batcher, mut rx) = batcher(2, Duration::from_secs(5));

        assert_eq!(batcher.push(sample("a")).await.unwrap(), None);
        assert_eq!(batcher.push(sample("b")).await.unwrap(), Some(1));

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.sequence, 1);
        assert_eq!(batch.len(), 2);
        assert_eq!(batcher.pending().await, 0);
        assert_eq!(batcher.deadline().await, None);
    }

    #[tokio::test]
    async fn test_batches_never_exceed_max() {
        let (batcher, mut rx) = batcher(3, Duration::from_secs(5));
        for i in 0..7 {
            batcher.push(sample(&format!("m{}", i))).await.unwrap();
        }
        batcher.close().await.unwrap();

        let mut sizes = Vec::new();
        let mut sequences = Vec::new();
        while let Some(batch) = rx.recv().await {
            sizes.push(batch.len());
            sequences.push(batch.sequence);
        }
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_seals_after_frequency() {
        let (batcher, mut rx) = batcher(100, Duration::from_secs(5));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(batcher.clone().run_timer(shutdown_rx));

        let start = Instant::now();
        batcher.push(sample("a")).await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_close_seals_partial_and_rejects_pushes() {
        let (batcher, mut rx) = batcher(10, Duration::from_secs(5));
        batcher.push(sample("a")).await.unwrap();

        assert_eq!(batcher.close().await.unwrap(), Some(1));
        assert_eq!(batcher.close().await.unwrap(), None);
        assert_eq!(
            batcher.push(sample("b")).await,
            Err(BatcherError::Closed(0))
        );

        assert_eq!(rx.recv().await.unwrap().len(), 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_push_fails_when_persister_gone() {
        let (batcher, rx) = batcher(1, Duration::from_secs(5));
        drop(rx);

        assert_eq!(
            batcher.push(sample("a")).await,
            Err(BatcherError::Closed(0))
        );
        assert_eq!(
            batcher.push(sample("b")).await,
            Err(BatcherError::Closed(0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_waits_for_persist_capacity() {
        let (tx, mut rx) = mpsc::channel(1);
        let batcher = Batcher::new(0, 1, Duration::from_secs(5), 1, tx, Arc::new(MockClock::new()));

        assert_eq!(batcher.push(sample("a")).await.unwrap(), Some(1));
        let blocked = tokio::time::timeout(Duration::from_millis(50), batcher.push(sample("b"))).await;
        assert!(blocked.is_err());

        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert_eq!(batcher.push(sample("c")).await.unwrap(), Some(2));
        assert_eq!(rx.recv().await.unwrap().samples[0].series.get("__name__"), Some("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_push_keeps_accepted_samples() {
        let (tx, mut rx) = mpsc::channel(1);
        let batcher = Batcher::new(0, 2, Duration::from_secs(5), 1, tx, Arc::new(MockClock::new()));

        batcher.push(sample("a")).await.unwrap();
        assert_eq!(batcher.push(sample("b")).await.unwrap(), Some(1));
        assert_eq!(batcher.push(sample("c")).await.unwrap(), None);

        let cancelled = tokio::time::timeout(Duration::from_millis(50), batcher.push(sample("d"))).await;
        assert!(cancelled.is_err());
        assert_eq!(batcher.pending().await, 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.len(), 2);

        assert_eq!(batcher.close().await.unwrap(), Some(2));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.sequence, 2);
        let names: Vec<_> = second.samples.iter().map(|s| s.series.get("__name__")).collect();
        assert_eq!(names, vec![Some("c")]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_resumes_from_given_sequence() {
        let (tx, mut rx) = mpsc::channel(8);
        let batcher = Batcher::new(3, 1, Duration::from_secs(5), 42, tx, Arc::new(MockClock::new()));

        batcher.push(sample("a")).await.unwrap();
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.sequence, 42);
        assert_eq!(batch.shard, 3);
    }
}
