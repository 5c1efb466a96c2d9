use crate::error::IngestError;
use crate::ingest::uri::{self, ObservationUri, PlaneUri};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Outcome of a cached lookup. `Pending` means nobody asked the archive yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Pending,
    Present(T),
    Absent,
}

impl<T> Lookup<T> {
    pub fn as_ref(&self) -> Lookup<&T> {
        match self {
            Self::Pending => Lookup::Pending,
            Self::Present(value) => Lookup::Present(value),
            Self::Absent => Lookup::Absent,
        }
    }
}

/// One plane/artifact row of an observation already held by the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsInfoRow {
    pub product_id: String,
    /// MJD
    pub date_obs: Option<f64>,
    /// MJD
    pub date_end: Option<f64>,
    pub release: Option<String>,
    pub artifact_uri: String,
}

/// A plane holding an artifact that shares a file with the queried one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRow {
    pub collection: String,
    pub observation_id: String,
    pub product_id: String,
    pub artifact_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPlaneRow {
    pub observation_id: String,
    pub product_id: String,
}

/// Read-only questions the engine asks the archive while linking records.
pub trait CrossReferenceQuery {
    /// Every plane/artifact row of one observation in the raw collection.
    fn observation_info(&self, observation_id: &str) -> Result<Vec<ObsInfoRow>>;

    /// Rows for every artifact of every plane holding `artifact_uri`.
    fn planes_sharing_artifact(&self, artifact_uri: &str) -> Result<Vec<ArtifactRow>>;

    /// Planes in `collection` whose provenance run id is one of `run_ids`.
    fn planes_with_run_ids(&self, collection: &str, run_ids: &[String])
    -> Result<Vec<RunPlaneRow>>;
}

/// A membership reference in one of its two encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRef {
    /// `caom:<raw collection>/<obsid>`
    Observation(String),
    /// `<obsid>_<subsysnr>`
    RawPlane(String),
}

impl MemberRef {
    pub fn observation_id(&self) -> &str {
        match self {
            Self::Observation(obsid) => obsid,
            Self::RawPlane(raw_plane_id) => uri::obsid_from_raw_plane_id(raw_plane_id),
        }
    }

    fn describe(&self) -> &str {
        match self {
            Self::Observation(obsid) | Self::RawPlane(obsid) => obsid,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMember {
    pub observation: ObservationUri,
    pub start: f64,
    pub end: f64,
    pub release: String,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub archive: String,
    pub raw_collection: String,
    /// Collections whose planes may serve as provenance inputs.
    pub input_collections: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub member_queries: usize,
    pub artifact_queries: usize,
    pub cached_files: usize,
}

/// Run-scoped memo of membership and provenance lookups.
///
/// Entries are never invalidated during a run. Every query also records the
/// sibling rows it returned, so later references into the same observation
/// are answered without another round trip.
#[derive(Debug)]
pub struct CrossReferenceCache {
    settings: CacheSettings,
    members: BTreeMap<String, Lookup<ResolvedMember>>,
    files: BTreeMap<String, Lookup<PlaneUri>>,
    stats: CacheStats,
}

impl CrossReferenceCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            members: BTreeMap::new(),
            files: BTreeMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cached_files: self
                .files
                .values()
                .filter(|entry| matches!(entry, Lookup::Present(_)))
                .count(),
            ..self.stats
        }
    }

    pub fn lookup_member(&self, observation_id: &str) -> Lookup<&ResolvedMember> {
        self.members
            .get(observation_id)
            .map(Lookup::as_ref)
            .unwrap_or(Lookup::Pending)
    }

    pub fn lookup_file(&self, file_id: &str) -> Lookup<&PlaneUri> {
        self.files
            .get(file_id)
            .map(Lookup::as_ref)
            .unwrap_or(Lookup::Pending)
    }

    /// Record that `file_id` belongs to `plane`. Files seen in the current
    /// batch always win over answers from earlier queries.
    pub fn register_file(&mut self, file_id: impl Into<String>, plane: PlaneUri) {
        self.files.insert(file_id.into(), Lookup::Present(plane));
    }

    fn cache_sibling(&mut self, file_id: &str, plane: PlaneUri) {
        match self.files.get(file_id) {
            Some(Lookup::Present(_)) => {}
            _ => {
                self.files
                    .insert(file_id.to_string(), Lookup::Present(plane));
            }
        }
    }

    /// Resolve a membership reference, querying the archive at most once per
    /// member observation. A member the archive does not know is fatal.
    pub fn resolve_member(
        &mut self,
        reference: &MemberRef,
        query: &dyn CrossReferenceQuery,
    ) -> Result<ResolvedMember> {
        let obsid = reference.observation_id().to_string();
        if matches!(self.lookup_member(&obsid), Lookup::Pending) {
            let entry = self.query_member(&obsid, query)?;
            self.members.insert(obsid.clone(), entry);
        }

        match self.lookup_member(&obsid) {
            Lookup::Present(member) => Ok(member.clone()),
            _ => Err(IngestError::UnresolvedMember {
                reference: reference.describe().to_string(),
            }
            .into()),
        }
    }

    fn query_member(
        &mut self,
        obsid: &str,
        query: &dyn CrossReferenceQuery,
    ) -> Result<Lookup<ResolvedMember>> {
        self.stats.member_queries += 1;
        let rows = query
            .observation_info(obsid)
            .with_context(|| format!("observation info query failed for {obsid}"))?;
        debug!(observation = obsid, rows = rows.len(), "member query");

        let raw_collection = self.settings.raw_collection.clone();
        let mut resolved = Lookup::Absent;
        for row in rows {
            if let Some(file_id) = uri::file_id_from_artifact_uri(&row.artifact_uri) {
                self.cache_sibling(
                    file_id,
                    PlaneUri::new(&raw_collection, obsid, &row.product_id),
                );
            }

            if !matches!(resolved, Lookup::Absent) || !row.product_id.starts_with("raw") {
                continue;
            }
            let (Some(start), Some(end), Some(release)) = (row.date_obs, row.date_end, row.release)
            else {
                continue;
            };
            resolved = Lookup::Present(ResolvedMember {
                observation: ObservationUri::new(&raw_collection, obsid),
                start,
                end,
                release,
            });
        }
        Ok(resolved)
    }

    /// Map a provenance file identifier to the plane that holds it, or
    /// `None` when neither this batch nor the archive knows the file.
    pub fn resolve_provenance_file(
        &mut self,
        file_id: &str,
        query: &dyn CrossReferenceQuery,
    ) -> Result<Option<PlaneUri>> {
        match self.lookup_file(file_id) {
            Lookup::Present(plane) => return Ok(Some(plane.clone())),
            Lookup::Absent => return Ok(None),
            Lookup::Pending => {}
        }

        self.stats.artifact_queries += 1;
        let artifact_uri = uri::file_uri(&self.settings.archive, file_id);
        let rows = query
            .planes_sharing_artifact(&artifact_uri)
            .with_context(|| format!("artifact query failed for {artifact_uri}"))?;
        for row in rows {
            if !self.settings.input_collections.contains(&row.collection) {
                continue;
            }
            let Some(sibling) = uri::file_id_from_artifact_uri(&row.artifact_uri) else {
                continue;
            };
            debug!(file = sibling, plane = %row.product_id, "cache provenance sibling");
            self.cache_sibling(
                sibling,
                PlaneUri::new(&row.collection, &row.observation_id, &row.product_id),
            );
        }

        match self.lookup_file(file_id) {
            Lookup::Present(plane) => Ok(Some(plane.clone())),
            _ => {
                self.files.insert(file_id.to_string(), Lookup::Absent);
                Ok(None)
            }
        }
    }
}
