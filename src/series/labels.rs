use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Prometheus label name rule: `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    static LABEL_NAME: OnceLock<Regex> = OnceLock::new();
    LABEL_NAME
        .get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("label name pattern compiles"))
        .is_match(name)
}

/// Immutable label set identifying a series.
///
/// Keys are unique and kept sorted, so two label sets with the same pairs are
/// equal and hash the same regardless of construction order. Cloning is cheap:
/// the map is shared.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeriesLabels(Arc<BTreeMap<String, String>>);

impl SeriesLabels {
    /// Build a label set from name/value pairs. A repeated name keeps the
    /// last value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(Arc::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new label set with every label from `defaults` whose name is
    /// not already present. Existing labels always win.
    pub fn with_defaults(&self, defaults: &BTreeMap<String, String>) -> SeriesLabels {
        if defaults.keys().all(|k| self.0.contains_key(k)) {
            return self.clone();
        }

        let mut merged = (*self.0).clone();
        for (name, value) in defaults {
            merged
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        Self(Arc::new(merged))
    }

    /// Canonical byte encoding used for stable hashing: each pair as
    /// `name 0xff value 0xff`, in name order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.iter().map(|(k, v)| k.len() + v.len() + 2).sum());
        for (name, value) in self.0.iter() {
            out.extend_from_slice(name.as_bytes());
            out.push(0xff);
            out.extend_from_slice(value.as_bytes());
            out.push(0xff);
        }
        out
    }
}

impl fmt::Debug for SeriesLabels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for SeriesLabels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", name, value)?;
        }
        f.write_str("}")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SeriesLabels {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_independent_equality() {
        let a = SeriesLabels::from_pairs([("job", "api"), ("__name__", "up")]);
        let b = SeriesLabels::from_pairs([("__name__", "up"), ("job", "api")]);
        assert_eq!(a, b);
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn test_duplicate_key_keeps_last_value() {
        let labels = SeriesLabels::from_pairs([("job", "a"), ("job", "b")]);
        assert_eq!(labels.len(), 1);
        assert_eq!(labels.get("job"), Some("b"));
    }

    #[test]
    fn test_with_defaults_does_not_override() {
        let labels = SeriesLabels::from_pairs([("__name__", "up"), ("cluster", "local")]);
        let defaults = BTreeMap::from([
            ("cluster".to_string(), "prod".to_string()),
            ("region".to_string(), "eu".to_string()),
        ]);

        let merged = labels.with_defaults(&defaults);
        assert_eq!(merged.get("cluster"), Some("local"));
        assert_eq!(merged.get("region"), Some("eu"));
        // Original is untouched
        assert_eq!(labels.get("region"), None);
    }

    #[test]
    fn test_canonical_bytes_distinguishes_boundaries() {
        let a = SeriesLabels::from_pairs([("ab", "c")]);
        let b = SeriesLabels::from_pairs([("a", "bc")]);
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn test_label_name_validation() {
        assert!(is_valid_label_name("__name__"));
        assert!(is_valid_label_name("job_2"));
        assert!(!is_valid_label_name(""));
        assert!(!is_valid_label_name("2job"));
        assert!(!is_valid_label_name("job-name"));
    }

    #[test]
    fn test_serializes_as_map() {
        let labels = SeriesLabels::from_pairs([("job", "api")]);
        let json = serde_json::to_string(&labels).unwrap();
        assert_eq!(json, r#"{"job":"api"}"#);

        let back: SeriesLabels = serde_json::from_str(&json).unwrap();
        assert_eq!(back, labels);
    }
}
