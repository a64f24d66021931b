pub mod labels;
pub mod sample;
pub mod ttl;

pub use labels::{is_valid_label_name, SeriesLabels};
pub use sample::{Exemplar, MetricMetadata, MetricType, Sample};
pub use ttl::{Freshness, TtlFilter};
