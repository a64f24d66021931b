use crate::series::sample::float_format;
use crate::series::{is_valid_label_name, MetricMetadata, Sample, SeriesLabels};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("invalid label name {name:?} in series {series}")]
    InvalidLabelName { series: String, name: String },

    #[error("sample has an empty label set")]
    EmptySeries,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Turns a group of samples into a request body.
///
/// `external_labels` are merged into every series; labels already on the
/// series take precedence.
pub trait WireEncoder: Send + Sync {
    fn content_type(&self) -> &str;

    fn encode(
        &self,
        samples: &[Sample],
        external_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, EncodeError>;
}

#[derive(Debug, Serialize)]
struct WriteRequestBody<'a> {
    timeseries: Vec<TimeSeries<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    metadata: Vec<&'a MetricMetadata>,
}

#[derive(Debug, Serialize)]
struct TimeSeries<'a> {
    labels: SeriesLabels,
    samples: Vec<WireSample>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    exemplars: Vec<WireExemplar<'a>>,
}

#[derive(Debug, Serialize)]
struct WireSample {
    timestamp: i64,
    #[serde(with = "float_format")]
    value: f64,
}

#[derive(Debug, Serialize)]
struct WireExemplar<'a> {
    labels: &'a SeriesLabels,
    timestamp: i64,
    #[serde(with = "float_format")]
    value: f64,
}

/// JSON rendition of a remote-write request: samples grouped per series in
/// first-seen order, exemplars alongside, metadata deduplicated by family.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

fn check_labels(labels: &SeriesLabels) -> Result<(), EncodeError> {
    for (name, _) in labels.iter() {
        if !is_valid_label_name(name) {
            return Err(EncodeError::InvalidLabelName {
                series: labels.to_string(),
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

impl WireEncoder for JsonEncoder {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn encode(
        &self,
        samples: &[Sample],
        external_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, EncodeError> {
        let mut timeseries: Vec<TimeSeries<'_>> = Vec::new();
        let mut index: HashMap<&SeriesLabels, usize> = HashMap::new();
        let mut metadata = Vec::new();
        let mut families = HashSet::new();

        for sample in samples {
            if sample.series.is_empty() {
                return Err(EncodeError::EmptySeries);
            }

            let slot = match index.get(&sample.series) {
                Some(&slot) => slot,
                None => {
                    check_labels(&sample.series)?;
                    let labels = sample.series.with_defaults(external_labels);
                    check_labels(&labels)?;
                    timeseries.push(TimeSeries {
                        labels,
                        samples: Vec::new(),
                        exemplars: Vec::new(),
                    });
                    index.insert(&sample.series, timeseries.len() - 1);
                    timeseries.len() - 1
                }
            };

            let series = &mut timeseries[slot];
            series.samples.push(WireSample {
                timestamp: sample.timestamp_ms,
                value: sample.value,
            });

            if let Some(exemplar) = &sample.exemplar {
                check_labels(&exemplar.labels)?;
                series.exemplars.push(WireExemplar {
                    labels: &exemplar.labels,
                    timestamp: exemplar.timestamp_ms,
                    value: exemplar.value,
                });
            }

            if let Some(meta) = &sample.metadata {
                if families.insert(meta.metric_family.as_str()) {
                    metadata.push(meta);
                }
            }
        }

        let body = WriteRequestBody {
            timeseries,
            metadata,
        };
        Ok(serde_json::to_vec(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::{Exemplar, MetricType};
    use serde_json::Value;

    fn labels(pairs: &[(&str, &str)]) -> SeriesLabels {
        SeriesLabels::from_pairs(pairs.iter().copied())
    }

    fn encode(samples: &[Sample], external: &[(&str, &str)]) -> Value {
        let external: BTreeMap<String, String> = external
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let bytes = JsonEncoder.encode(samples, &external).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_groups_by_series_in_first_seen_order() {
        let up = labels(&[("__name__", "up")]);
        let down = labels(&[("__name__", "down")]);
        let samples = vec![
            Sample::new(up.clone(), 1, 1.0),
            Sample::new(down.clone(), 2, 0.0),
            Sample::new(up.clone(), 3, 1.0),
        ];

        let body = encode(&samples, &[]);
        let series = body["timeseries"].as_array().unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(series[0]["labels"]["__name__"], "up");
        assert_eq!(series[0]["samples"][0]["timestamp"], 1);
        assert_eq!(series[0]["samples"][1]["timestamp"], 3);
        assert_eq!(series[1]["labels"]["__name__"], "down");
        assert!(body.get("metadata").is_none());
    }

    #[test]
    fn test_series_labels_win_over_external() {
        let series = labels(&[("__name__", "up"), ("cluster", "from-series")]);
        let body = encode(
            &[Sample::new(series, 1, 1.0)],
            &[("cluster", "external"), ("region", "eu")],
        );

        let merged = &body["timeseries"][0]["labels"];
        assert_eq!(merged["cluster"], "from-series");
        assert_eq!(merged["region"], "eu");
    }

    #[test]
    fn test_non_finite_values_encoded_as_strings() {
        let body = encode(&[Sample::new(labels(&[("__name__", "up")]), 1, f64::NAN)], &[]);
        assert_eq!(body["timeseries"][0]["samples"][0]["value"], "NaN");
    }

    #[test]
    fn test_exemplars_and_metadata() {
        let series = labels(&[("__name__", "http_requests_total")]);
        let meta = MetricMetadata {
            metric_family: "http_requests_total".to_string(),
            metric_type: MetricType::Counter,
            help: "Requests served".to_string(),
            unit: String::new(),
        };
        let samples = vec![
            Sample::new(series.clone(), 1, 10.0)
                .with_exemplar(Exemplar {
                    labels: labels(&[("trace_id", "abc")]),
                    timestamp_ms: 1,
                    value: 10.0,
                })
                .with_metadata(meta.clone()),
            Sample::new(series, 2, 11.0).with_metadata(meta),
        ];

        let body = encode(&samples, &[]);
        assert_eq!(body["timeseries"][0]["exemplars"][0]["labels"]["trace_id"], "abc");
        let metadata = body["metadata"].as_array().unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0]["type"], "counter");
    }

    #[test]
    fn test_invalid_label_name_rejected() {
        let series = labels(&[("__name__", "up"), ("bad-name", "x")]);
        let err = JsonEncoder
            .encode(&[Sample::new(series, 1, 1.0)], &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, EncodeError::InvalidLabelName { ref name, .. } if name == "bad-name"));
    }

    #[test]
    fn test_empty_series_rejected() {
        let err = JsonEncoder
            .encode(&[Sample::new(SeriesLabels::default(), 1, 1.0)], &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, EncodeError::EmptySeries));
    }
}
