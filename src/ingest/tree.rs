use crate::error::IngestError;
use crate::ingest::cache::{CrossReferenceCache, CrossReferenceQuery};
use crate::ingest::record::{
    CustomMap, FieldMap, FileRecord, SOURCE_DENSITY_KEY, compare_release, is_release_key,
    is_zero_value,
};
use crate::ingest::uri::{ObservationUri, PlaneUri};
use crate::ingest::warn::{self, WarnEvent};
use anyhow::Result;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubRecord {
    pub fields: FieldMap,
    pub custom: CustomMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plane {
    pub fields: FieldMap,
    pub custom_fields: CustomMap,
    pub inputset: BTreeSet<PlaneUri>,
    /// Provenance file ids not yet matched to a plane.
    pub fileset: BTreeSet<String>,
    /// Files backing this plane's artifacts: URI -> local path.
    pub uri_to_path: BTreeMap<String, PathBuf>,
    pub sub_records: BTreeMap<String, SubRecord>,
}

impl Plane {
    fn merge_fields(&mut self, incoming: &FieldMap) {
        for (key, value) in incoming {
            if let Some(existing) = self.fields.get(key) {
                if is_release_key(key) && compare_release(value, existing) == Ordering::Less {
                    continue;
                }
                if key == SOURCE_DENSITY_KEY && is_zero_value(value) && !is_zero_value(existing) {
                    continue;
                }
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Observation {
    pub memberset: BTreeSet<ObservationUri>,
    pub planes: BTreeMap<String, Plane>,
}

/// Observation id -> observation, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetadataTree {
    pub observations: BTreeMap<String, Observation>,
}

impl MetadataTree {
    pub fn plane(&self, observation_id: &str, product_id: &str) -> Option<&Plane> {
        self.observations
            .get(observation_id)
            .and_then(|observation| observation.planes.get(product_id))
    }

    pub fn plane_count(&self) -> usize {
        self.observations
            .values()
            .map(|observation| observation.planes.len())
            .sum()
    }
}

/// Fold one linked record into the tree.
///
/// `pending` holds the provenance file ids of this record that could not be
/// resolved yet; they join the plane's `fileset`. Records without content
/// are ignored and `false` is returned.
pub fn merge_record(
    tree: &mut MetadataTree,
    record: &FileRecord,
    pending: &BTreeSet<String>,
) -> Result<bool> {
    if !record.has_content() {
        return Ok(false);
    }

    let file = record.local_path.display().to_string();
    for (field, value) in [
        ("observation_id", &record.observation_id),
        ("product_id", &record.product_id),
        ("uri", &record.uri),
    ] {
        if value.trim().is_empty() {
            return Err(IngestError::structural(&file, field, "required key is missing").into());
        }
    }

    let observation = tree
        .observations
        .entry(record.observation_id.clone())
        .or_default();
    observation.memberset.extend(record.members.iter().cloned());

    let plane = observation
        .planes
        .entry(record.product_id.clone())
        .or_default();
    plane.merge_fields(&record.plane_fields);
    plane.custom_fields.extend(
        record
            .plane_custom_fields
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    plane.inputset.extend(record.inputs.iter().cloned());
    plane.fileset.extend(pending.iter().cloned());
    plane
        .uri_to_path
        .entry(record.uri.clone())
        .or_insert_with(|| record.local_path.clone());

    for (sub_id, fields) in &record.sub_record_fields {
        let sub = plane.sub_records.entry(sub_id.clone()).or_default();
        sub.fields
            .extend(fields.iter().map(|(key, value)| (key.clone(), value.clone())));
    }
    for (sub_id, custom) in &record.sub_record_custom_fields {
        let sub = plane.sub_records.entry(sub_id.clone()).or_default();
        sub.custom
            .extend(custom.iter().map(|(key, value)| (key.clone(), value.clone())));
    }
    Ok(true)
}

/// Merge phase. Cross-plane resolution is not available on this type.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    tree: MetadataTree,
    tolerant: bool,
    merged: usize,
    skipped: Vec<String>,
}

impl TreeBuilder {
    /// A tolerant builder skips records with missing mandatory keys instead
    /// of failing the batch.
    pub fn new(tolerant: bool) -> Self {
        Self {
            tolerant,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, record: &FileRecord, pending: &BTreeSet<String>) -> Result<bool> {
        match merge_record(&mut self.tree, record, pending) {
            Ok(merged) => {
                if merged {
                    self.merged += 1;
                }
                Ok(merged)
            }
            Err(err) if self.tolerant && err.downcast_ref::<IngestError>().is_some() => {
                warn::emit(WarnEvent {
                    code: "RECORD_SKIPPED",
                    stage: "merge",
                    action: "skip",
                    observation: &record.observation_id,
                    plane: &record.product_id,
                    err: &err.to_string(),
                    ..WarnEvent::default()
                });
                self.skipped.push(err.to_string());
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub fn tree(&self) -> &MetadataTree {
        &self.tree
    }

    pub fn finish(self) -> MergedTree {
        MergedTree {
            tree: self.tree,
            merged: self.merged,
            skipped: self.skipped,
        }
    }
}

/// Provenance file that matched no plane and was dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedInput {
    pub observation_id: String,
    pub product_id: String,
    pub file_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeferredOutcome {
    pub attempted: usize,
    pub resolved: usize,
    pub dropped: Vec<DroppedInput>,
}

/// Output of the merge phase: every record of the batch has been folded in.
#[derive(Debug)]
pub struct MergedTree {
    tree: MetadataTree,
    merged: usize,
    skipped: Vec<String>,
}

impl MergedTree {
    pub fn tree(&self) -> &MetadataTree {
        &self.tree
    }

    pub fn merged_records(&self) -> usize {
        self.merged
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Second pass: match every pending provenance file against the batch
    /// and the archive. Each entry is attempted once and always leaves the
    /// pending set, either into `inputset` or dropped with a warning.
    pub fn resolve_deferred_inputs(
        mut self,
        cache: &mut CrossReferenceCache,
        query: &dyn CrossReferenceQuery,
    ) -> Result<(ResolvedTree, DeferredOutcome)> {
        let mut outcome = DeferredOutcome::default();
        for (observation_id, observation) in self.tree.observations.iter_mut() {
            for (product_id, plane) in observation.planes.iter_mut() {
                for file_id in std::mem::take(&mut plane.fileset) {
                    outcome.attempted += 1;
                    match cache.resolve_provenance_file(&file_id, query)? {
                        Some(input) => {
                            if plane.inputset.insert(input.clone()) {
                                info!(
                                    input = %input,
                                    observation = %observation_id,
                                    plane = %product_id,
                                    "added provenance input"
                                );
                            }
                            outcome.resolved += 1;
                        }
                        None => {
                            warn::emit(WarnEvent {
                                code: "PROVENANCE_DROPPED",
                                stage: "resolve",
                                action: "drop",
                                observation: observation_id,
                                plane: product_id,
                                reason: &format!(
                                    "input {file_id} is neither in the archive nor in this batch"
                                ),
                                ..WarnEvent::default()
                            });
                            outcome.dropped.push(DroppedInput {
                                observation_id: observation_id.clone(),
                                product_id: product_id.clone(),
                                file_id,
                            });
                        }
                    }
                }
            }
        }

        Ok((ResolvedTree { tree: self.tree }, outcome))
    }
}

/// Fully resolved tree, read-only from here on.
#[derive(Debug)]
pub struct ResolvedTree {
    tree: MetadataTree,
}

impl ResolvedTree {
    pub fn tree(&self) -> &MetadataTree {
        &self.tree
    }

    pub fn observations(&self) -> impl Iterator<Item = (&String, &Observation)> {
        self.tree.observations.iter()
    }

    pub fn contains(&self, observation_id: &str) -> bool {
        self.tree.observations.contains_key(observation_id)
    }
}
