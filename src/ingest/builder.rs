use crate::ingest::caom::{Artifact, Chunk, ObservationRecord, Part, PlaneRecord, ProductType};
use crate::ingest::record::{
    ALGORITHM_KEY, EXPOSURE_ALGORITHM, FieldMap, MEMBERS_KEY, OBS_META_RELEASE_KEY,
    PLANE_DATA_RELEASE_KEY, PLANE_META_RELEASE_KEY, PROVENANCE_INPUTS_KEY, PROVENANCE_NAME_KEY,
    RUN_ID_KEY,
};
use crate::ingest::uri;
use crate::ingest::util::run_command_with_optional_timeout;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Everything needed to produce or update one plane of a stored observation.
#[derive(Debug, Clone, Serialize)]
pub struct BuildRequest {
    pub collection: String,
    pub observation_id: String,
    pub product_id: String,
    /// Observation and plane level override fields.
    pub general: FieldMap,
    /// Per artifact/part override fields, keyed by artifact or extension URI.
    pub sections: BTreeMap<String, FieldMap>,
    pub file_uris: Vec<String>,
    pub local_paths: Vec<PathBuf>,
}

pub trait RecordBuilder {
    fn build(
        &self,
        existing: Option<ObservationRecord>,
        request: &BuildRequest,
    ) -> Result<ObservationRecord>;
}

/// Builds planes directly from override fields without touching the files.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinBuilder;

fn split_list(raw: &str) -> Vec<String> {
    let mut items = raw.split_whitespace().map(str::to_string).collect::<Vec<_>>();
    items.sort();
    items.dedup();
    items
}

fn parse_wcs(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn apply_part_fields(part: &mut Part, fields: &FieldMap) {
    if let Some(product_type) = fields
        .get("part.productType")
        .and_then(|raw| ProductType::parse(raw))
    {
        part.product_type = product_type;
    }
    let position = fields.get("chunk.position").map(|raw| parse_wcs(raw));
    let energy = fields.get("chunk.energy").map(|raw| parse_wcs(raw));
    if position.is_none() && energy.is_none() {
        return;
    }
    if part.chunks.is_empty() {
        part.chunks.push(Chunk::default());
    }
    let chunk = &mut part.chunks[0];
    if position.is_some() {
        chunk.position = position;
    }
    if energy.is_some() {
        chunk.energy = energy;
    }
}

fn ensure_part<'a>(artifact: &'a mut Artifact, name: &str) -> &'a mut Part {
    let product_type = artifact.product_type;
    artifact
        .parts
        .entry(name.to_string())
        .or_insert_with(|| Part {
            product_type,
            chunks: Vec::new(),
        })
}

fn apply_plane_fields(plane: &mut PlaneRecord, general: &FieldMap) {
    plane.provenance_inputs = general
        .get(PROVENANCE_INPUTS_KEY)
        .map(|raw| split_list(raw))
        .unwrap_or_default();

    for (key, value) in general {
        match key.as_str() {
            ALGORITHM_KEY | MEMBERS_KEY | OBS_META_RELEASE_KEY | PROVENANCE_INPUTS_KEY => {}
            PLANE_META_RELEASE_KEY => plane.meta_release = Some(value.clone()),
            PLANE_DATA_RELEASE_KEY => plane.data_release = Some(value.clone()),
            PROVENANCE_NAME_KEY => plane.provenance_name = Some(value.clone()),
            RUN_ID_KEY => plane.provenance_run_id = Some(value.clone()),
            _ => {
                plane.metadata.insert(key.clone(), value.clone());
            }
        }
    }
}

impl RecordBuilder for BuiltinBuilder {
    fn build(
        &self,
        existing: Option<ObservationRecord>,
        request: &BuildRequest,
    ) -> Result<ObservationRecord> {
        let mut record = existing.unwrap_or_else(|| {
            ObservationRecord::new(&request.collection, &request.observation_id)
        });
        let general = &request.general;

        if let Some(algorithm) = general.get(ALGORITHM_KEY) {
            record.algorithm = algorithm.clone();
        }
        match general.get(MEMBERS_KEY) {
            Some(members) => record.members = split_list(members),
            None if record.algorithm == EXPOSURE_ALGORITHM => record.members.clear(),
            None => {}
        }
        if let Some(release) = general.get(OBS_META_RELEASE_KEY) {
            record.meta_release = Some(release.clone());
        }

        let plane = record
            .planes
            .entry(request.product_id.clone())
            .or_insert_with(|| PlaneRecord::new(&request.product_id));
        apply_plane_fields(plane, general);

        for file_uri in &request.file_uris {
            let artifact = plane
                .artifacts
                .entry(file_uri.clone())
                .or_insert_with(|| Artifact::new(file_uri, ProductType::Science));
            if let Some(fields) = request.sections.get(file_uri) {
                if let Some(product_type) = fields
                    .get("artifact.productType")
                    .and_then(|raw| ProductType::parse(raw))
                {
                    artifact.product_type = product_type;
                }
                apply_part_fields(ensure_part(artifact, "0"), fields);
            } else if artifact.parts.is_empty() {
                ensure_part(artifact, "0");
            }
        }

        for (section, fields) in &request.sections {
            let Some((base, extensions)) = uri::split_extension_uri(section) else {
                continue;
            };
            let Some(artifact) = plane.artifacts.get_mut(base) else {
                debug!(section = %section, "section does not match an artifact of this plane");
                continue;
            };
            for extension in extensions {
                apply_part_fields(ensure_part(artifact, &extension.to_string()), fields);
            }
        }

        debug!(
            observation = %request.observation_id,
            plane = %request.product_id,
            files = request.local_paths.len(),
            "built plane"
        );
        Ok(record)
    }
}

/// Delegates building to an external tool speaking JSON over files:
/// `<bin> --request <request.json> --output <observation.json>`.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    pub bin: PathBuf,
    pub timeout_secs: Option<u64>,
    pub work_dir: PathBuf,
}

#[derive(Serialize)]
struct CommandRequest<'a> {
    request: &'a BuildRequest,
    existing: Option<&'a ObservationRecord>,
}

fn resolve_builder_bin(bin: &Path) -> Result<PathBuf> {
    if bin.exists() {
        return Ok(bin.to_path_buf());
    }
    let found = which::which(bin)
        .with_context(|| format!("builder `{}` not found as a path or on PATH", bin.display()))?;
    Ok(found)
}

impl RecordBuilder for CommandBuilder {
    fn build(
        &self,
        existing: Option<ObservationRecord>,
        request: &BuildRequest,
    ) -> Result<ObservationRecord> {
        let bin = resolve_builder_bin(&self.bin)?;
        fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("failed to create {}", self.work_dir.display()))?;
        let scratch = tempfile::Builder::new()
            .prefix("build-")
            .tempdir_in(&self.work_dir)
            .with_context(|| {
                format!(
                    "failed to create scratch dir in {}",
                    self.work_dir.display()
                )
            })?;

        let request_path = scratch.path().join("request.json");
        let output_path = scratch.path().join("observation.json");
        let payload = serde_json::to_string_pretty(&CommandRequest {
            request,
            existing: existing.as_ref(),
        })?;
        fs::write(&request_path, payload)
            .with_context(|| format!("failed to write {}", request_path.display()))?;

        let mut cmd = Command::new(&bin);
        cmd.arg("--request")
            .arg(&request_path)
            .arg("--output")
            .arg(&output_path);
        let output = run_command_with_optional_timeout(&mut cmd, self.timeout_secs)
            .with_context(|| format!("failed to run `{}`", bin.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "builder failed for {}/{}\nstdout: {}\nstderr: {}",
                request.observation_id,
                request.product_id,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let raw = fs::read_to_string(&output_path)
            .with_context(|| format!("builder produced no {}", output_path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", output_path.display()))
    }
}
