use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;

const CAOM_SCHEME: &str = "caom:";

/// `caom:<collection>/<observationID>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObservationUri {
    pub collection: String,
    pub observation_id: String,
}

/// `caom:<collection>/<observationID>/<productID>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaneUri {
    pub collection: String,
    pub observation_id: String,
    pub product_id: String,
}

fn is_uri_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.chars().any(|ch| ch.is_whitespace() || ch == '/')
}

impl ObservationUri {
    pub fn new(collection: impl Into<String>, observation_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            observation_id: observation_id.into(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.trim().strip_prefix(CAOM_SCHEME)?;
        let (collection, observation_id) = rest.split_once('/')?;
        if !is_uri_segment(collection) || !is_uri_segment(observation_id) {
            return None;
        }
        Some(Self::new(collection, observation_id))
    }
}

impl PlaneUri {
    pub fn new(
        collection: impl Into<String>,
        observation_id: impl Into<String>,
        product_id: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            observation_id: observation_id.into(),
            product_id: product_id.into(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.trim().strip_prefix(CAOM_SCHEME)?;
        let mut segments = rest.splitn(3, '/');
        let collection = segments.next()?;
        let observation_id = segments.next()?;
        let product_id = segments.next()?;
        if ![collection, observation_id, product_id]
            .iter()
            .all(|segment| is_uri_segment(segment))
        {
            return None;
        }
        Some(Self::new(collection, observation_id, product_id))
    }
}

impl fmt::Display for ObservationUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CAOM_SCHEME}{}/{}", self.collection, self.observation_id)
    }
}

impl fmt::Display for PlaneUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CAOM_SCHEME}{}/{}/{}",
            self.collection, self.observation_id, self.product_id
        )
    }
}

macro_rules! string_serde {
    ($ty:ty, $what:literal) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                <$ty>::parse(&raw)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid {}: {raw}", $what)))
            }
        }
    };
}

string_serde!(ObservationUri, "observation URI");
string_serde!(PlaneUri, "plane URI");

/// Space-joined list of URIs sorted by their string form.
pub fn join_sorted<'a, T, I>(items: I) -> String
where
    T: fmt::Display + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut rendered = items
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    rendered.sort();
    rendered.dedup();
    rendered.join(" ")
}

/// Artifact URI of a whole file: `ad:<archive>/<file_id>`.
pub fn file_uri(archive: &str, file_id: &str) -> String {
    format!("ad:{archive}/{file_id}")
}

/// Strip the `ad:<archive>/` namespace from an artifact URI.
pub fn file_id_from_artifact_uri(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix("ad:")?;
    let (_, file_id) = rest.split_once('/')?;
    let file_id = file_id.split('#').next().unwrap_or(file_id);
    if file_id.is_empty() {
        None
    } else {
        Some(file_id)
    }
}

/// Split `ad:<archive>/<file_id>#[1,2]` into the file URI and its extension numbers.
pub fn split_extension_uri(uri: &str) -> Option<(&str, Vec<u32>)> {
    let (base, suffix) = uri.split_once("#[")?;
    let inner = suffix.strip_suffix(']')?;
    let mut out = Vec::new();
    for piece in inner.split(',') {
        out.push(piece.trim().parse::<u32>().ok()?);
    }
    Some((base, out))
}

/// File identifier of a path or bare file name: the base name minus its extension.
pub fn make_file_id(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

/// Raw plane identifiers look like `<obsid>_<subsysnr>`; recover the obsid.
pub fn obsid_from_raw_plane_id(raw_plane_id: &str) -> &str {
    match raw_plane_id.rsplit_once('_') {
        Some((obsid, subsys))
            if !obsid.is_empty()
                && !subsys.is_empty()
                && subsys.chars().all(|ch| ch.is_ascii_digit()) =>
        {
            obsid
        }
        _ => raw_plane_id,
    }
}

/// Observation identifier reduced to `[-_A-Za-z0-9]`, for use as a file stem.
pub fn sanitize_observation_id(observation_id: &str) -> String {
    observation_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
