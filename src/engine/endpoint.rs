use super::runner::EngineError;
use super::stats::{EndpointStats, ShardStats};
use crate::clock::Clock;
use crate::config::{Config, EndpointConfig};
use crate::delivery::{DeliveryWorker, WorkerDeps};
use crate::queue::{
    parse_shard_dir_name, run_persister, shard_dir_name, Batcher, BatcherError, ShardQueue,
    ShardRouter,
};
use crate::series::Sample;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Background tasks spawned for all endpoints.
#[derive(Default)]
pub(crate) struct EngineTasks {
    pub timers: Vec<JoinHandle<()>>,
    pub persisters: Vec<JoinHandle<()>>,
    pub workers: Vec<JoinHandle<()>>,
}

impl EngineTasks {
    pub fn abort_all(&self) {
        self.timers
            .iter()
            .chain(&self.persisters)
            .chain(&self.workers)
            .for_each(|handle| handle.abort());
    }
}

struct ShardHandle {
    index: usize,
    /// None for orphaned shards that are only drained
    batcher: Option<Arc<Batcher>>,
    queue: ShardQueue,
    stats: Arc<ShardStats>,
}

/// One endpoint's complete shard set.
pub(crate) struct EndpointPipeline {
    name: String,
    router: ShardRouter,
    shards: Vec<ShardHandle>,
    orphans: Vec<ShardHandle>,
}

impl EndpointPipeline {
    /// Opens every shard queue (running recovery) and spawns its timer,
    /// persist, and delivery tasks.
    pub async fn start(
        endpoint: &EndpointConfig,
        config: &Config,
        clock: Arc<dyn Clock>,
        deps: WorkerDeps,
        shutdown: &watch::Receiver<bool>,
        tasks: &mut EngineTasks,
    ) -> Result<Self, EngineError> {
        let dir = config.data_dir.join(&endpoint.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| EngineError::Io {
                path: dir.clone(),
                source,
            })?;

        let serialization = &config.serialization;
        let mut shards = Vec::with_capacity(endpoint.queue_count);

        for index in 0..endpoint.queue_count {
            let queue = open_queue(endpoint, &dir, index, serialization.segment_max_bytes).await?;
            let next_sequence = queue.next_sequence();
            let stats = Arc::new(ShardStats::default());

            let (sealed_tx, sealed_rx) = mpsc::channel(serialization.buffer_limit.max(1));
            let batcher = Arc::new(Batcher::new(
                index,
                serialization.max_signals_to_batch,
                serialization.batch_frequency,
                next_sequence,
                sealed_tx,
                clock.clone(),
            ));
            tasks
                .timers
                .push(tokio::spawn(batcher.clone().run_timer(shutdown.clone())));

            let persist_queue = queue.clone();
            let persist_stats = stats.clone();
            tasks.persisters.push(tokio::spawn(async move {
                let result = run_persister(
                    persist_queue,
                    sealed_rx,
                    |_, _| persist_stats.record_persisted(),
                    |_, samples| persist_stats.record_dropped_serialization(samples),
                )
                .await;
                if result.is_err() {
                    persist_stats.mark_degraded();
                }
            }));

            let worker = DeliveryWorker::new(endpoint, queue.clone(), deps.clone(), stats.clone());
            tasks.workers.push(tokio::spawn(worker.run(shutdown.clone())));

            shards.push(ShardHandle {
                index,
                batcher: Some(batcher),
                queue,
                stats,
            });
        }

        let mut orphans = Vec::new();
        for index in orphaned_shards(&dir, endpoint.queue_count)? {
            let queue = open_queue(endpoint, &dir, index, serialization.segment_max_bytes).await?;
            let depth = queue.stats().depth();
            if depth == 0 {
                debug!(endpoint = %endpoint.name, shard = index, "Orphaned shard directory is empty");
                continue;
            }

            warn!(
                endpoint = %endpoint.name,
                shard = index,
                pending = depth,
                queue_count = endpoint.queue_count,
                "Shard directory outside configured queue_count, draining it"
            );
            let stats = Arc::new(ShardStats::default());
            let worker = DeliveryWorker::new(endpoint, queue.clone(), deps.clone(), stats.clone())
                .drain_only();
            tasks.workers.push(tokio::spawn(worker.run(shutdown.clone())));
            orphans.push(ShardHandle {
                index,
                batcher: None,
                queue,
                stats,
            });
        }

        info!(
            endpoint = %endpoint.name,
            url = %endpoint.url,
            shards = shards.len(),
            orphans = orphans.len(),
            "Endpoint started"
        );

        Ok(Self {
            name: endpoint.name.clone(),
            router: ShardRouter::new(endpoint.queue_count),
            shards,
            orphans,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Routes a sample to its shard's batcher.
    pub async fn push(&self, sample: Sample) -> Result<(), BatcherError> {
        let shard = &self.shards[self.router.shard_of(&sample.series)];
        if shard.stats.is_degraded() {
            return Err(BatcherError::Closed(shard.index));
        }
        let Some(batcher) = &shard.batcher else {
            return Err(BatcherError::Closed(shard.index));
        };

        batcher.push(sample).await?;
        shard.stats.record_appended();
        Ok(())
    }

    /// Seals every partial batch and closes the persist channels.
    pub async fn close(&self) {
        for shard in &self.shards {
            if let Some(batcher) = &shard.batcher {
                match batcher.close().await {
                    Ok(Some(sequence)) => {
                        debug!(endpoint = %self.name, shard = shard.index, sequence, "Sealed partial batch on close")
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(endpoint = %self.name, shard = shard.index, error = %e, "Partial batch lost on close")
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> EndpointStats {
        let shards = self
            .shards
            .iter()
            .map(|s| (s, false))
            .chain(self.orphans.iter().map(|s| (s, true)))
            .map(|(shard, drain_only)| {
                let queue = shard.queue.stats();
                shard.stats.snapshot(shard.index, drain_only, queue)
            })
            .collect();

        EndpointStats {
            name: self.name.clone(),
            shards,
        }
    }

    pub fn degraded_shards(&self) -> Vec<usize> {
        self.shards
            .iter()
            .chain(&self.orphans)
            .filter(|s| s.stats.is_degraded())
            .map(|s| s.index)
            .collect()
    }
}

async fn open_queue(
    endpoint: &EndpointConfig,
    dir: &Path,
    index: usize,
    segment_max_bytes: u64,
) -> Result<ShardQueue, EngineError> {
    ShardQueue::open(dir.join(shard_dir_name(index)), index, segment_max_bytes)
        .await
        .map_err(|source| EngineError::Queue {
            endpoint: endpoint.name.clone(),
            shard: index,
            source,
        })
}

/// Shard directories left over from a larger `queue_count`.
fn orphaned_shards(dir: &Path, queue_count: usize) -> Result<Vec<usize>, EngineError> {
    let io_err = |source: std::io::Error| EngineError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut orphans = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !entry.file_type().map_err(io_err)?.is_dir() {
            continue;
        }
        if let Some(index) = entry.file_name().to_str().and_then(parse_shard_dir_name) {
            if index >= queue_count {
                orphans.push(index);
            }
        }
    }
    orphans.sort_unstable();
    Ok(orphans)
}
