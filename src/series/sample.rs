use super::labels::SeriesLabels;
use serde::{Deserialize, Serialize};

/// A single observation of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub series: SeriesLabels,

    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,

    #[serde(with = "float_format")]
    pub value: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exemplar: Option<Exemplar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetricMetadata>,
}

impl Sample {
    pub fn new(series: SeriesLabels, timestamp_ms: i64, value: f64) -> Self {
        Self {
            series,
            timestamp_ms,
            value,
            exemplar: None,
            metadata: None,
        }
    }

    pub fn with_exemplar(mut self, exemplar: Exemplar) -> Self {
        self.exemplar = Some(exemplar);
        self
    }

    pub fn with_metadata(mut self, metadata: MetricMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub labels: SeriesLabels,
    pub timestamp_ms: i64,
    #[serde(with = "float_format")]
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricMetadata {
    pub metric_family: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    #[serde(rename = "gaugehistogram")]
    GaugeHistogram,
    Summary,
    Info,
    #[serde(rename = "stateset")]
    StateSet,
    Unknown,
}

/// JSON has no NaN or infinities, but stale markers are NaN. Non-finite values
/// are written as the strings "NaN", "+Inf" and "-Inf".
pub(crate) mod float_format {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("+Inf")
        } else {
            serializer.serialize_str("-Inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "+Inf" | "Inf" => Ok(f64::INFINITY),
                "-Inf" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "invalid sample value: {}",
                    other
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_value_survives_json() {
        let sample = Sample::new(SeriesLabels::from_pairs([("__name__", "up")]), 1, f64::NAN);
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains(r#""value":"NaN""#));

        let back: Sample = serde_json::from_str(&json).unwrap();
        assert!(back.value.is_nan());
    }

    #[test]
    fn test_infinities_survive_json() {
        for value in [f64::INFINITY, f64::NEG_INFINITY] {
            let sample = Sample::new(SeriesLabels::default(), 1, value);
            let json = serde_json::to_string(&sample).unwrap();
            let back: Sample = serde_json::from_str(&json).unwrap();
            assert_eq!(back.value, value);
        }
    }

    #[test]
    fn test_optional_fields_omitted() {
        let sample = Sample::new(SeriesLabels::from_pairs([("job", "a")]), 10, 1.5);
        let json = serde_json::to_string(&sample).unwrap();
        assert!(!json.contains("exemplar"));
        assert!(!json.contains("metadata"));
    }

    #[test]
    fn test_metadata_type_names() {
        let metadata = MetricMetadata {
            metric_family: "http_requests_total".to_string(),
            metric_type: MetricType::Counter,
            help: "Total requests".to_string(),
            unit: String::new(),
        };
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains(r#""type":"counter""#));
    }
}
