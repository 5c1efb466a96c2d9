use crate::ingest::overrides::ExplicitOverride;
use crate::ingest::uri::{ObservationUri, PlaneUri};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Override fields, keyed by dotted metadata name (`plane.dataRelease`).
pub type FieldMap = BTreeMap<String, String>;

/// Auxiliary values kept apart from the override fields.
pub type CustomMap = BTreeMap<String, CustomValue>;

pub const SOURCE_DENSITY_KEY: &str = "metrics.sourceNumberDensity";
pub const OBS_META_RELEASE_KEY: &str = "obs.metaRelease";
pub const PLANE_META_RELEASE_KEY: &str = "plane.metaRelease";
pub const PLANE_DATA_RELEASE_KEY: &str = "plane.dataRelease";
pub const ALGORITHM_KEY: &str = "algorithm.name";
pub const MEMBERS_KEY: &str = "members";
pub const PROVENANCE_NAME_KEY: &str = "provenance.name";
pub const PROVENANCE_INPUTS_KEY: &str = "provenance.inputs";
pub const RUN_ID_KEY: &str = "provenance.runID";

/// Algorithm name of a simple, single-exposure observation.
pub const EXPOSURE_ALGORITHM: &str = "exposure";

const RELEASE_KEYS: [&str; 4] = [
    "release_date",
    OBS_META_RELEASE_KEY,
    PLANE_META_RELEASE_KEY,
    PLANE_DATA_RELEASE_KEY,
];

pub fn is_release_key(key: &str) -> bool {
    RELEASE_KEYS.contains(&key)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CustomValue {
    Number(f64),
    Interval { start: f64, end: f64 },
    Text(String),
}

impl CustomValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(raw) => raw.trim().parse().ok(),
            Self::Interval { .. } => None,
        }
    }

    pub fn as_interval(&self) -> Option<(f64, f64)> {
        match self {
            Self::Interval { start, end } => Some((*start, *end)),
            _ => None,
        }
    }
}

/// One file's metadata with every cross-reference already linked, ready to
/// be folded into the metadata tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileRecord {
    pub observation_id: String,
    pub product_id: String,
    pub uri: String,
    pub local_path: PathBuf,
    pub plane_fields: FieldMap,
    pub plane_custom_fields: CustomMap,
    pub sub_record_fields: BTreeMap<String, FieldMap>,
    pub sub_record_custom_fields: BTreeMap<String, CustomMap>,
    pub members: BTreeSet<ObservationUri>,
    pub inputs: BTreeSet<PlaneUri>,
}

impl FileRecord {
    pub fn has_content(&self) -> bool {
        !(self.plane_fields.is_empty()
            && self.sub_record_fields.is_empty()
            && self.sub_record_custom_fields.is_empty())
    }
}

/// Run identifier as written by the processing system: either a string
/// (`jac-123`, `0x1f`, free text) or a bare integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunIdValue {
    Integer(i64),
    Text(String),
}

/// Per-file descriptor emitted by the external header extractor. References
/// to other observations and files are still unresolved here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawFileRecord {
    pub observation_id: Option<String>,
    pub product_id: Option<String>,
    pub file_id: Option<String>,
    pub uri: Option<String>,
    /// The plane's principal product; only it carries provenance and time intervals.
    pub main_product: bool,
    /// Derive release dates from the latest member release.
    pub derive_release: bool,
    pub plane: FieldMap,
    pub plane_custom: CustomMap,
    pub sections: BTreeMap<String, FieldMap>,
    pub section_custom: BTreeMap<String, CustomMap>,
    /// Members as `caom:<raw collection>/<obsid>`.
    pub mbr: Option<Vec<String>>,
    /// Members as raw plane ids `<obsid>_<subsysnr>`.
    pub obs: Option<Vec<String>>,
    /// Provenance inputs given directly as plane URIs.
    pub inp: Option<Vec<String>>,
    /// Provenance inputs given as file names.
    pub prv: Option<Vec<String>>,
    pub run_id: Option<RunIdValue>,
    pub part_count: Option<usize>,
    pub explicit_override: Option<ExplicitOverride>,
    #[serde(skip)]
    pub local_path: PathBuf,
}

impl RawFileRecord {
    pub fn has_content(&self) -> bool {
        !(self.plane.is_empty() && self.sections.is_empty() && self.section_custom.is_empty())
    }
}

fn parse_release(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

/// Order two release timestamps chronologically, falling back to plain
/// string order when either side does not parse.
pub fn compare_release(a: &str, b: &str) -> Ordering {
    match (parse_release(a), parse_release(b)) {
        (Some(left), Some(right)) => left.cmp(&right),
        _ => a.cmp(b),
    }
}

pub fn is_zero_value(raw: &str) -> bool {
    raw.trim().parse::<f64>().is_ok_and(|value| value == 0.0)
}
