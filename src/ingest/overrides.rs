use crate::error::IngestError;
use crate::ingest::caom::{Chunk, ObservationRecord, PlaneRecord};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Replacement coordinate metadata for one artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplicitOverride {
    pub spatial: Option<Value>,
    pub spectral: Option<Value>,
    /// Only overwrite parts whose first chunk already has a (broken) spatial frame.
    pub replace_only: bool,
}

#[derive(Debug, Default)]
pub struct ExplicitOverrideStore {
    entries: BTreeMap<String, ExplicitOverride>,
}

impl ExplicitOverrideStore {
    /// Record an override for `artifact_uri`. The first declaration wins.
    pub fn declare(&mut self, artifact_uri: impl Into<String>, entry: ExplicitOverride) -> bool {
        let artifact_uri = artifact_uri.into();
        if self.entries.contains_key(&artifact_uri) {
            return false;
        }
        self.entries.insert(artifact_uri, entry);
        true
    }

    pub fn get(&self, artifact_uri: &str) -> Option<&ExplicitOverride> {
        self.entries.get(artifact_uri)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Write the stored corrections into the first chunk of each qualifying
    /// part of `plane`. Returns the number of parts touched.
    pub fn apply(&self, plane: &mut PlaneRecord) -> Result<usize> {
        let mut touched = 0;
        for (uri, artifact) in plane.artifacts.iter_mut() {
            let Some(entry) = self.entries.get(uri) else {
                continue;
            };

            for (part_name, part) in artifact.parts.iter_mut() {
                if entry.replace_only {
                    let has_position = part
                        .chunks
                        .first()
                        .is_some_and(|chunk| chunk.position.is_some());
                    if !has_position {
                        continue;
                    }
                } else if !(part.product_type.carries_data()
                    || (uri.contains("_extent-mask") && part_name == "0"))
                {
                    continue;
                }

                if part.chunks.is_empty() {
                    part.chunks.push(Chunk::default());
                } else if part.chunks.len() != 1 {
                    return Err(IngestError::structural(
                        uri.as_str(),
                        format!("part {part_name}"),
                        format!(
                            "more than one chunk in explicit override part: {}",
                            part.chunks.len()
                        ),
                    )
                    .into());
                }

                let chunk = &mut part.chunks[0];
                if let Some(spatial) = &entry.spatial {
                    chunk.position = Some(spatial.clone());
                }
                if let Some(spectral) = &entry.spectral {
                    chunk.energy = Some(spectral.clone());
                }
                debug!(artifact = %uri, part = %part_name, "explicit override applied");
                touched += 1;
            }
        }
        Ok(touched)
    }
}

/// Number of parts each artifact had when its file was scanned in this run.
#[derive(Debug, Default)]
pub struct PartCountTable {
    counts: BTreeMap<String, usize>,
}

impl PartCountTable {
    pub fn record(&mut self, artifact_uri: impl Into<String>, count: usize) {
        self.counts.insert(artifact_uri.into(), count);
    }

    pub fn get(&self, artifact_uri: &str) -> Option<usize> {
        self.counts.get(artifact_uri).copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ExcessPartReport {
    pub removed: BTreeMap<String, usize>,
    pub oversize: Vec<String>,
}

/// Trim parts left behind by earlier ingestions of files that have since
/// shrunk. Artifacts without a known count are only flagged when they hold
/// more than `threshold` parts.
pub fn remove_excess_parts(
    observation: &mut ObservationRecord,
    counts: &PartCountTable,
    threshold: usize,
) -> ExcessPartReport {
    let mut report = ExcessPartReport::default();
    for plane in observation.planes.values_mut() {
        for artifact in plane.artifacts.values_mut() {
            let Some(expected) = counts.get(&artifact.uri) else {
                if artifact.parts.len() > threshold {
                    report.oversize.push(artifact.uri.clone());
                }
                continue;
            };

            let mut names = artifact.sorted_part_names();
            if names.len() <= expected {
                debug!(artifact = %artifact.uri, "no excess parts");
                continue;
            }
            let excess = names.split_off(expected);
            let removed = excess.len();
            for name in excess.iter().rev() {
                artifact.parts.remove(name);
            }
            info!(artifact = %artifact.uri, removed, "removed excess parts");
            report.removed.insert(artifact.uri.clone(), removed);
        }
    }
    report
}
