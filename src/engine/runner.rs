use super::appender::{Appender, IngestContext};
use super::endpoint::{EndpointPipeline, EngineTasks};
use super::stats::{EngineStats, IngestStats};
use crate::clock::{Clock, SystemClock};
use crate::config::{validate_config, Config, ConfigError};
use crate::delivery::{HttpTransport, JsonEncoder, Transport, TransportError, WireEncoder, WorkerDeps};
use crate::queue::QueueError;
use crate::series::TtlFilter;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

/// Extra time on top of `shutdown_grace` for workers to release their batch
/// and exit.
const DRAIN_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("endpoint '{endpoint}' shard {shard}: {source}")]
    Queue {
        endpoint: String,
        shard: usize,
        #[source]
        source: QueueError,
    },

    #[error("endpoint '{endpoint}': {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to create {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedShard {
    pub endpoint: String,
    pub shard: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Shards whose queue hit a durability error. They reject new samples
    /// until the engine is rebuilt.
    Degraded { shards: Vec<DegradedShard> },
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

/// Configures and starts an [`Engine`].
pub struct EngineBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    encoder: Option<Arc<dyn WireEncoder>>,
    transports: HashMap<String, Arc<dyn Transport>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: None,
            encoder: None,
            transports: HashMap::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn WireEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Replaces the HTTP transport of one endpoint.
    pub fn transport(mut self, endpoint: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(endpoint.into(), transport);
        self
    }

    /// Validates the config, recovers every queue, and spawns all tasks.
    pub async fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        validate_config(&config)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let encoder = self.encoder.unwrap_or_else(|| Arc::new(JsonEncoder));
        let ttl = TtlFilter::new(config.ttl);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = EngineTasks::default();
        let mut endpoints = Vec::with_capacity(config.endpoints.len());

        for endpoint in &config.endpoints {
            let transport: Arc<dyn Transport> = match self.transports.get(&endpoint.name) {
                Some(transport) => transport.clone(),
                None => match HttpTransport::new(endpoint) {
                    Ok(transport) => Arc::new(transport),
                    Err(source) => {
                        tasks.abort_all();
                        return Err(EngineError::Transport {
                            endpoint: endpoint.name.clone(),
                            source,
                        });
                    }
                },
            };

            let deps = WorkerDeps {
                transport,
                encoder: encoder.clone(),
                clock: clock.clone(),
                ttl,
                shutdown_grace: config.shutdown_grace,
            };

            let started =
                EndpointPipeline::start(endpoint, &config, clock.clone(), deps, &shutdown_rx, &mut tasks)
                    .await;
            match started {
                Ok(pipeline) => endpoints.push(pipeline),
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        info!(
            data_dir = %config.data_dir.display(),
            endpoints = endpoints.len(),
            ttl = ?config.ttl,
            "Engine started"
        );

        Ok(Engine {
            ingest: Arc::new(IngestContext {
                endpoints,
                ttl,
                clock,
                closed: Default::default(),
                stats: IngestStats::default(),
            }),
            shutdown_tx,
            tasks,
            shutdown_grace: config.shutdown_grace,
        })
    }
}

/// A running set of endpoint pipelines.
pub struct Engine {
    ingest: Arc<IngestContext>,
    shutdown_tx: watch::Sender<bool>,
    tasks: EngineTasks,
    shutdown_grace: Duration,
}

impl Engine {
    /// Starts an engine with the system clock, JSON encoding, and HTTP
    /// transports.
    pub async fn start(config: Config) -> Result<Self, EngineError> {
        EngineBuilder::new(config).build().await
    }

    pub fn appender(&self) -> Appender {
        Appender::new(self.ingest.clone())
    }

    pub fn stats(&self) -> EngineStats {
        collect_stats(&self.ingest)
    }

    pub fn health(&self) -> Health {
        let shards: Vec<DegradedShard> = self
            .ingest
            .endpoints
            .iter()
            .flat_map(|endpoint| {
                endpoint
                    .degraded_shards()
                    .into_iter()
                    .map(|shard| DegradedShard {
                        endpoint: endpoint.name().to_string(),
                        shard,
                    })
            })
            .collect();

        if shards.is_empty() {
            Health::Healthy
        } else {
            Health::Degraded { shards }
        }
    }

    /// Stops ingestion, persists partial batches, and stops delivery.
    ///
    /// In-flight sends get `shutdown_grace`; whatever is not acknowledged
    /// by then stays on disk for the next start.
    pub async fn shutdown(self) -> EngineStats {
        info!("Shutting down engine");
        self.ingest.closed.store(true, Ordering::Release);

        for endpoint in &self.ingest.endpoints {
            endpoint.close().await;
        }

        let EngineTasks {
            timers,
            persisters,
            workers,
        } = self.tasks;

        for persister in persisters {
            if let Err(e) = persister.await {
                warn!(error = %e, "Persist task ended abnormally");
            }
        }

        let _ = self.shutdown_tx.send(true);

        let abort_handles: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        let drain = futures::future::join_all(workers);
        if tokio::time::timeout(self.shutdown_grace + DRAIN_MARGIN, drain)
            .await
            .is_err()
        {
            warn!("Delivery workers did not stop in time, aborting");
            abort_handles.iter().for_each(|h| h.abort());
        }
        timers.iter().for_each(|t| t.abort());

        let stats = collect_stats(&self.ingest);

        info!(
            accepted = stats.ingest.accepted,
            dropped_stale = stats.ingest.dropped_stale,
            pending = stats
                .endpoints
                .iter()
                .map(|e| e.total(|s| s.queue_depth))
                .sum::<u64>(),
            "Engine stopped"
        );
        stats
    }
}

fn collect_stats(ingest: &IngestContext) -> EngineStats {
    EngineStats {
        ingest: ingest.stats.snapshot(),
        endpoints: ingest.endpoints.iter().map(|e| e.stats()).collect(),
    }
}
