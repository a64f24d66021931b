use super::backoff::{classify_status, Classification, RetryPolicy};
use super::encoder::WireEncoder;
use super::transport::{Transport, WriteRequest};
use crate::clock::Clock;
use crate::config::EndpointConfig;
use crate::engine::stats::ShardStats;
use crate::queue::{Batch, ShardQueue};
use crate::series::TtlFilter;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Why a batch was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    /// Non-retryable status from the endpoint
    Permanent { status: u16 },
    RetryExhausted,
    /// The encoder could not produce a request body
    Serialization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Delivered,
    /// Chunks already accepted by the endpoint are not counted in
    /// `undelivered`
    Dropped { cause: DropCause, undelivered: usize },
    /// Shutdown arrived before the batch was settled
    Interrupted,
}

enum RequestOutcome {
    Sent,
    Dropped(DropCause),
    Interrupted,
}

enum Attempt {
    Success,
    Transient {
        retry_after: Option<Duration>,
        reason: String,
    },
    Permanent {
        status: u16,
    },
}

/// Shared collaborators for every worker of an endpoint.
#[derive(Clone)]
pub struct WorkerDeps {
    pub transport: Arc<dyn Transport>,
    pub encoder: Arc<dyn WireEncoder>,
    pub clock: Arc<dyn Clock>,
    pub ttl: TtlFilter,
    pub shutdown_grace: Duration,
}

/// Sends one shard's persisted batches to one endpoint, in order.
///
/// Per batch: dequeue, split into requests of at most `batch_count`
/// samples, send each with retries, then acknowledge. A batch that keeps
/// failing blocks only this shard.
pub struct DeliveryWorker {
    endpoint: String,
    shard: usize,
    queue: ShardQueue,
    deps: WorkerDeps,
    external_labels: BTreeMap<String, String>,
    batch_count: usize,
    write_timeout: Duration,
    flush_frequency: Duration,
    policy: RetryPolicy,
    stats: Arc<ShardStats>,
    drain_only: bool,
}

impl DeliveryWorker {
    pub fn new(
        config: &EndpointConfig,
        queue: ShardQueue,
        deps: WorkerDeps,
        stats: Arc<ShardStats>,
    ) -> Self {
        Self {
            endpoint: config.name.clone(),
            shard: queue.shard(),
            queue,
            deps,
            external_labels: config.external_labels.clone(),
            batch_count: config.batch_count.max(1),
            write_timeout: config.write_timeout,
            flush_frequency: config.flush_frequency,
            policy: RetryPolicy::from_endpoint(config),
            stats,
            drain_only: false,
        }
    }

    /// Exit once the queue is empty instead of waiting for more batches.
    pub fn drain_only(mut self) -> Self {
        self.drain_only = true;
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            endpoint = %self.endpoint,
            shard = self.shard,
            drain_only = self.drain_only,
            "Delivery worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let cutoff = self.deps.ttl.cutoff_ms(self.deps.clock.now_ms());
            let batch = match self.queue.dequeue(cutoff).await {
                Ok(Some(batch)) => batch,
                Ok(None) if self.drain_only => {
                    info!(endpoint = %self.endpoint, shard = self.shard, "Orphaned shard drained");
                    break;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.queue.notified() => {}
                        _ = tokio::time::sleep(self.flush_frequency) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
                Err(e) => {
                    error!(endpoint = %self.endpoint, shard = self.shard, error = %e, "Dequeue failed, shard degraded");
                    self.stats.mark_degraded();
                    break;
                }
            };

            let sequence = batch.sequence;
            let outcome = self.deliver(&batch, &mut shutdown).await;
            match outcome {
                BatchOutcome::Interrupted => {
                    if let Err(e) = self.queue.release(sequence).await {
                        error!(endpoint = %self.endpoint, shard = self.shard, sequence, error = %e, "Release failed");
                        self.stats.mark_degraded();
                    }
                    debug!(endpoint = %self.endpoint, shard = self.shard, sequence, "Batch left on disk for next start");
                    break;
                }
                BatchOutcome::Delivered => self.stats.record_batch_delivered(),
                BatchOutcome::Dropped { cause, undelivered } => match cause {
                    DropCause::Permanent { .. } => {
                        self.stats.record_dropped_permanent(undelivered)
                    }
                    DropCause::RetryExhausted => {
                        self.stats.record_dropped_retry_exhausted(undelivered)
                    }
                    DropCause::Serialization => {
                        self.stats.record_dropped_serialization(undelivered)
                    }
                },
            }

            if let Err(e) = self.queue.ack(sequence).await {
                error!(endpoint = %self.endpoint, shard = self.shard, sequence, error = %e, "Ack failed, shard degraded");
                self.stats.mark_degraded();
                break;
            }
        }

        info!(endpoint = %self.endpoint, shard = self.shard, "Delivery worker stopped");
    }

    /// Sends every chunk of a batch. Stops at the first chunk that is
    /// dropped or interrupted.
    pub async fn deliver(&self, batch: &Batch, shutdown: &mut watch::Receiver<bool>) -> BatchOutcome {
        let mut delivered = 0;
        for (index, chunk) in batch.samples.chunks(self.batch_count).enumerate() {
            if index > 0 && *shutdown.borrow() {
                return BatchOutcome::Interrupted;
            }

            let body = match self.deps.encoder.encode(chunk, &self.external_labels) {
                Ok(body) => body,
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint,
                        shard = self.shard,
                        sequence = batch.sequence,
                        error = %e,
                        "Failed to encode batch, dropping"
                    );
                    return BatchOutcome::Dropped {
                        cause: DropCause::Serialization,
                        undelivered: batch.len() - delivered,
                    };
                }
            };
            let request = WriteRequest {
                body,
                content_type: self.deps.encoder.content_type().to_string(),
                samples: chunk.len(),
            };

            match self.send_with_retry(&request, batch.sequence, shutdown).await {
                RequestOutcome::Sent => {
                    self.stats.record_samples_delivered(chunk.len());
                    delivered += chunk.len();
                }
                RequestOutcome::Dropped(cause) => {
                    return BatchOutcome::Dropped {
                        cause,
                        undelivered: batch.len() - delivered,
                    }
                }
                RequestOutcome::Interrupted => return BatchOutcome::Interrupted,
            }
        }

        debug!(
            endpoint = %self.endpoint,
            shard = self.shard,
            sequence = batch.sequence,
            samples = batch.len(),
            "Batch delivered"
        );
        BatchOutcome::Delivered
    }

    async fn send_with_retry(
        &self,
        request: &WriteRequest,
        sequence: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RequestOutcome {
        let mut retry = 0u32;

        loop {
            let Some(attempt) = self.send_once(request, shutdown).await else {
                return RequestOutcome::Interrupted;
            };

            let (retry_after, reason) = match attempt {
                Attempt::Success => return RequestOutcome::Sent,
                Attempt::Permanent { status } => {
                    warn!(
                        endpoint = %self.endpoint,
                        shard = self.shard,
                        sequence,
                        status,
                        "Endpoint rejected batch, dropping"
                    );
                    return RequestOutcome::Dropped(DropCause::Permanent { status });
                }
                Attempt::Transient {
                    retry_after,
                    reason,
                } => (retry_after, reason),
            };

            retry += 1;
            if !self.policy.allows(retry) {
                warn!(
                    endpoint = %self.endpoint,
                    shard = self.shard,
                    sequence,
                    attempts = retry,
                    reason = %reason,
                    "Retries exhausted, dropping batch"
                );
                return RequestOutcome::Dropped(DropCause::RetryExhausted);
            }
            if *shutdown.borrow() {
                return RequestOutcome::Interrupted;
            }

            let delay = self.policy.delay_with_hint(retry, retry_after);
            self.stats.record_retry();
            warn!(
                endpoint = %self.endpoint,
                shard = self.shard,
                sequence,
                attempt = retry,
                backoff_ms = delay.as_millis() as u64,
                reason = %reason,
                "Send failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return RequestOutcome::Interrupted,
            }
        }
    }

    /// One send bounded by `write_timeout`. Returns None when shutdown cut it
    /// short: a send already running gets `shutdown_grace` to finish.
    async fn send_once(
        &self,
        request: &WriteRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Attempt> {
        self.stats.record_request();
        let send = tokio::time::timeout(self.write_timeout, self.deps.transport.send(request));
        tokio::pin!(send);

        let result = if *shutdown.borrow() {
            tokio::time::timeout(self.deps.shutdown_grace, &mut send)
                .await
                .ok()?
        } else {
            tokio::select! {
                result = &mut send => result,
                _ = shutdown.changed() => {
                    match tokio::time::timeout(self.deps.shutdown_grace, &mut send).await {
                        Ok(result) => result,
                        Err(_) => {
                            info!(
                                endpoint = %self.endpoint,
                                shard = self.shard,
                                "Shutdown grace expired with request in flight"
                            );
                            return None;
                        }
                    }
                }
            }
        };

        Some(match result {
            Err(_) => Attempt::Transient {
                retry_after: None,
                reason: format!("timed out after {:?}", self.write_timeout),
            },
            Ok(Err(e)) => Attempt::Transient {
                retry_after: None,
                reason: e.to_string(),
            },
            Ok(Ok(response)) => match classify_status(response.status) {
                Classification::Success => Attempt::Success,
                Classification::Transient => Attempt::Transient {
                    retry_after: response.retry_after,
                    reason: format!("status {}", response.status),
                },
                Classification::Permanent => Attempt::Permanent {
                    status: response.status,
                },
            },
        })
    }
}
