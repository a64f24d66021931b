pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# REMOTE-QUEUE CONFIGURATION
# =============================================================================
# Samples appended to the engine are batched per shard, persisted to disk, and
# delivered to every endpoint below. Each endpoint gets its own independent set
# of shards, queues, and delivery workers.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/remote-queue/config.yml
#   3. /etc/remote-queue/config.yml
#
# Values may reference environment variables with $env{NAME}.

# Root directory for the durable queues (<data_dir>/<endpoint>/shard-NNNN)
data_dir: ~/.local/share/remote-queue

# Samples older than this are rejected at append time, and batches whose
# samples have all aged past it are discarded before sending.
ttl: 2h

# How long an in-flight request may keep running once shutdown starts.
# Anything not acknowledged by then stays on disk and is resent on restart.
shutdown_grace: 5s

serialization:
  # Seal a batch once it holds this many samples...
  max_signals_to_batch: 10000
  # ...or this long after its first sample, whichever comes first.
  batch_frequency: 5s
  # Sealed batches kept in memory per shard before appenders block.
  buffer_limit: 4
  # Roll to a new segment file after this many bytes.
  segment_max_bytes: 8388608

endpoints:
  - name: primary
    url: http://localhost:9009/api/v1/push
    # basic_auth:
    #   username: agent
    #   password: $env{REMOTE_WRITE_PASSWORD}
    write_timeout: 30s
    # First retry waits retry_backoff, then doubles each attempt.
    retry_backoff: 1s
    # 0 retries transient failures forever.
    max_retry_backoff_attempts: 0
    # Maximum samples per request.
    batch_count: 1000
    # Idle poll interval for delivery workers (minimum 1s).
    flush_frequency: 1s
    # Number of shards. Changing it requires a restart.
    queue_count: 4
    external_labels:
      cluster: local
"#
    .to_string()
}
