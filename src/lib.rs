pub mod cli;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod queue;
pub mod series;

pub use engine::{AppendOutcome, Appendable, Appender, DropReason, Engine, EngineBuilder, EngineError};
pub use series::{Exemplar, MetricMetadata, Sample, SeriesLabels};
