use super::secret::Secret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory holding one queue directory per endpoint and shard
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Maximum sample age accepted for delivery
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// How long an in-flight send may continue after shutdown is requested
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    #[serde(default)]
    pub serialization: SerializationConfig,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ttl: default_ttl(),
            shutdown_grace: default_shutdown_grace(),
            serialization: SerializationConfig::default(),
            endpoints: Vec::new(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_ttl() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializationConfig {
    /// Seal a batch once it holds this many samples
    #[serde(default = "default_max_signals_to_batch")]
    pub max_signals_to_batch: usize,

    /// Seal a non-empty batch this long after its first sample, even if small
    #[serde(default = "default_batch_frequency", with = "humantime_serde")]
    pub batch_frequency: Duration,

    /// Sealed batches held in memory per shard while waiting to be persisted.
    /// Appenders block once this is reached.
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: usize,

    /// Segment file size after which the queue rolls to a new file
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,
}

impl Default for SerializationConfig {
    fn default() -> Self {
        Self {
            max_signals_to_batch: default_max_signals_to_batch(),
            batch_frequency: default_batch_frequency(),
            buffer_limit: default_buffer_limit(),
            segment_max_bytes: default_segment_max_bytes(),
        }
    }
}

fn default_max_signals_to_batch() -> usize {
    10_000
}

fn default_batch_frequency() -> Duration {
    Duration::from_secs(5)
}

fn default_buffer_limit() -> usize {
    4
}

fn default_segment_max_bytes() -> u64 {
    8 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique endpoint name, also used as its queue directory name
    pub name: String,

    pub url: String,

    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Delay before the first retry; doubles on every further attempt
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Retries allowed per batch before it is dropped. 0 retries forever.
    #[serde(default)]
    pub max_retry_backoff_attempts: u32,

    /// Maximum samples per outgoing request
    #[serde(default = "default_batch_count")]
    pub batch_count: usize,

    /// How often an idle delivery worker polls its queue
    #[serde(default = "default_flush_frequency", with = "humantime_serde")]
    pub flush_frequency: Duration,

    /// Number of shards
    #[serde(default = "default_queue_count")]
    pub queue_count: usize,

    #[serde(default)]
    pub external_labels: BTreeMap<String, String>,
}

impl EndpointConfig {
    /// Endpoint with every optional field at its default.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            basic_auth: None,
            user_agent: default_user_agent(),
            write_timeout: default_write_timeout(),
            retry_backoff: default_retry_backoff(),
            max_retry_backoff_attempts: 0,
            batch_count: default_batch_count(),
            flush_frequency: default_flush_frequency(),
            queue_count: default_queue_count(),
            external_labels: BTreeMap::new(),
        }
    }
}

pub fn default_user_agent() -> String {
    format!("remote-queue/{}", env!("CARGO_PKG_VERSION"))
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_batch_count() -> usize {
    1_000
}

fn default_flush_frequency() -> Duration {
    Duration::from_secs(1)
}

fn default_queue_count() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Secret,
}
