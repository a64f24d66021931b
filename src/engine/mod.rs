//! Engine lifecycle: endpoint fanout, the appender, and stats.

pub mod appender;
pub(crate) mod endpoint;
pub mod runner;
pub mod stats;

pub use appender::{AppendOutcome, Appendable, Appender, DropReason};
pub use runner::{DegradedShard, Engine, EngineBuilder, EngineError, Health};
pub use stats::{EndpointStats, EngineStats, IngestSnapshot, ShardSnapshot};
