use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum ScalarValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
}

impl ScalarValue {
    fn into_string(self) -> String {
        match self {
            ScalarValue::Text(s) => s,
            ScalarValue::Integer(i) => i.to_string(),
            ScalarValue::Float(f) => f.to_string(),
            ScalarValue::Flag(b) => b.to_string(),
        }
    }
}

// YAML authors write `k: 3`; values are kept as their string form.
impl<'de> Deserialize<'de> for ParameterSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, ScalarValue>::deserialize(deserializer)?;
        Ok(Self(
            raw.into_iter()
                .map(|(k, v)| (k, v.into_string()))
                .collect(),
        ))
    }
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn values_for(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .map(|n| self.0.get(n).cloned().unwrap_or_default())
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(","))
    }
}

pub const NOT_TERMINATED: &str = "NT";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityValue {
    Value(f64),
    NotTerminated,
}

impl QualityValue {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw == NOT_TERMINATED {
            return Ok(QualityValue::NotTerminated);
        }
        raw.parse::<f64>()
            .map(QualityValue::Value)
            .map_err(|_| anyhow!("invalid quality value: {:?}", raw))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            QualityValue::Value(v) => Some(*v),
            QualityValue::NotTerminated => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, QualityValue::Value(_))
    }
}

impl fmt::Display for QualityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityValue::Value(v) => write!(f, "{}", v),
            QualityValue::NotTerminated => f.write_str(NOT_TERMINATED),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualitySet(BTreeMap<String, QualityValue>);

impl QualitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn not_terminated<S: AsRef<str>>(measures: &[S]) -> Self {
        measures
            .iter()
            .map(|m| (m.as_ref().to_string(), QualityValue::NotTerminated))
            .collect()
    }

    pub fn insert(&mut self, measure: impl Into<String>, value: QualityValue) {
        self.0.insert(measure.into(), value);
    }

    pub fn get(&self, measure: &str) -> Option<QualityValue> {
        self.0.get(measure).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, QualityValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values_for(&self, measures: &[String]) -> Vec<String> {
        measures
            .iter()
            .map(|m| {
                self.0
                    .get(m)
                    .copied()
                    .unwrap_or(QualityValue::NotTerminated)
                    .to_string()
            })
            .collect()
    }
}

impl<K: Into<String>> FromIterator<(K, QualityValue)> for QualitySet {
    fn from_iter<I: IntoIterator<Item = (K, QualityValue)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn parameter_sets_hash_by_content() {
        let a: ParameterSet = [("k", "3"), ("seed", "1")].into_iter().collect();
        let mut b = ParameterSet::new();
        b.insert("seed", "1");
        b.insert("k", "3");
        assert_eq!(a, b);
        let mut seen = HashSet::new();
        seen.insert(a);
        assert!(!seen.insert(b));
    }

    #[test]
    fn parameter_set_accepts_yaml_scalars() {
        let ps: ParameterSet = serde_yaml::from_str("k: 3\nalpha: 0.5\nmode: fast\n").expect("yaml");
        assert_eq!(ps.get("k"), Some("3"));
        assert_eq!(ps.get("alpha"), Some("0.5"));
        assert_eq!(ps.get("mode"), Some("fast"));
    }

    #[test]
    fn quality_value_parses_sentinel_and_numbers() {
        assert_eq!(
            QualityValue::parse("NT").expect("nt"),
            QualityValue::NotTerminated
        );
        assert_eq!(
            QualityValue::parse("0.82").expect("number"),
            QualityValue::Value(0.82)
        );
        assert!(QualityValue::parse("fast").is_err());
        assert_eq!(QualityValue::Value(0.5).to_string(), "0.5");
    }

    #[test]
    fn missing_measures_render_as_not_terminated() {
        let mut q = QualitySet::new();
        q.insert("F1", QualityValue::Value(0.25));
        let cols = q.values_for(&["F1".to_string(), "Rand".to_string()]);
        assert_eq!(cols, vec!["0.25".to_string(), "NT".to_string()]);
    }
}
