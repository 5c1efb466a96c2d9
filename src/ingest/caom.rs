use crate::ingest::record::FieldMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductType {
    #[default]
    Science,
    Noise,
    Weight,
    Auxiliary,
    Preview,
    Thumbnail,
    Info,
    Calibration,
}

impl ProductType {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(Value::String(raw.trim().to_ascii_lowercase())).ok()
    }

    pub fn carries_data(self) -> bool {
        matches!(self, Self::Science | Self::Noise)
    }
}

/// Interval in MJD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalAxis {
    pub samples: Vec<TimeRange>,
    pub timesys: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Chunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<TemporalAxis>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Part {
    pub product_type: ProductType,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Artifact {
    pub uri: String,
    pub product_type: ProductType,
    pub parts: BTreeMap<String, Part>,
}

impl Artifact {
    pub fn new(uri: impl Into<String>, product_type: ProductType) -> Self {
        Self {
            uri: uri.into(),
            product_type,
            parts: BTreeMap::new(),
        }
    }

    /// Part names in numeric order; names that are not numbers sort last.
    pub fn sorted_part_names(&self) -> Vec<String> {
        let mut names = self.parts.keys().cloned().collect::<Vec<_>>();
        names.sort_by_key(|name| name.parse::<u64>().map_err(|_| name.clone()));
        names
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneRecord {
    pub product_id: String,
    /// Plane metadata not modelled explicitly (calibration level, metrics, ...).
    pub metadata: FieldMap,
    pub meta_release: Option<String>,
    pub data_release: Option<String>,
    pub provenance_name: Option<String>,
    pub provenance_run_id: Option<String>,
    pub provenance_inputs: Vec<String>,
    /// Overall time coverage, MJD.
    pub time_bounds: Option<TimeRange>,
    pub artifacts: BTreeMap<String, Artifact>,
}

impl PlaneRecord {
    pub fn new(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            ..Self::default()
        }
    }
}

/// Stored representation of one observation in the archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationRecord {
    pub collection: String,
    pub observation_id: String,
    pub algorithm: String,
    pub members: Vec<String>,
    pub meta_release: Option<String>,
    pub planes: BTreeMap<String, PlaneRecord>,
}

impl ObservationRecord {
    pub fn new(collection: impl Into<String>, observation_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            observation_id: observation_id.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_names_sort_numerically() {
        let mut artifact = Artifact::new("ad:JCMT/f", ProductType::Science);
        for name in ["10", "2", "0", "x", "1"] {
            artifact.parts.insert(name.to_string(), Part::default());
        }
        assert_eq!(artifact.sorted_part_names(), ["0", "1", "2", "10", "x"]);
    }

    #[test]
    fn product_type_parses_case_insensitively() {
        assert_eq!(ProductType::parse("Noise"), Some(ProductType::Noise));
        assert_eq!(ProductType::parse("bogus"), None);
        assert!(ProductType::Science.carries_data());
        assert!(!ProductType::Preview.carries_data());
    }
}
