use crate::ingest::cache::{ArtifactRow, CrossReferenceQuery, ObsInfoRow, RunPlaneRow};
use crate::ingest::caom::ObservationRecord;
use crate::ingest::repository::{
    AcquireOptions, Change, CommitOutcome, LockGuard, ObservationHandle, RepositoryClient,
};
use crate::ingest::uri::{self, ObservationUri};
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Observation store kept as one JSON document per observation under
/// `<root>/<collection>/`.
#[derive(Debug, Clone)]
pub struct FsRepository {
    root: PathBuf,
    raw_collection: String,
}

impl FsRepository {
    pub fn new(root: impl Into<PathBuf>, raw_collection: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            raw_collection: raw_collection.into(),
        }
    }

    pub fn record_path(&self, uri: &ObservationUri) -> PathBuf {
        self.root
            .join(&uri.collection)
            .join(format!("{}.json", encode_file_stem(&uri.observation_id)))
    }

    fn lock_path(&self, uri: &ObservationUri) -> PathBuf {
        self.root
            .join(&uri.collection)
            .join(format!("{}.lock", encode_file_stem(&uri.observation_id)))
    }

    pub fn load(&self, uri: &ObservationUri) -> Result<Option<ObservationRecord>> {
        read_record(&self.record_path(uri))
    }

    fn records_in(&self, collection: &str) -> Result<Vec<ObservationRecord>> {
        let dir = self.root.join(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(record) = read_record(&path)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn collections(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = fs::read_dir(&self.root)
            .with_context(|| format!("failed to read {}", self.root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }
}

/// Percent-escape every byte outside `[-_A-Za-z0-9]` so distinct
/// observation ids never share a document or a lock.
fn encode_file_stem(observation_id: &str) -> String {
    let mut out = String::with_capacity(observation_id.len());
    for byte in observation_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn read_record(path: &Path) -> Result<Option<ObservationRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}

fn write_atomic(path: &Path, record: &ObservationRecord) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut tmp, record)?;
    writeln!(tmp)?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

impl RepositoryClient for FsRepository {
    fn acquire(&self, uri: &ObservationUri, options: AcquireOptions) -> Result<ObservationHandle> {
        let lock = LockGuard::try_acquire(&self.lock_path(uri), uri)?;
        let record = self.load(uri)?;
        debug!(uri = %uri, existed = record.is_some(), "acquired");
        ObservationHandle::new(uri.clone(), record, None, options, Some(lock))
    }

    fn commit(&self, handle: ObservationHandle) -> Result<CommitOutcome> {
        let path = self.record_path(&handle.uri);
        let outcome = match handle.change()? {
            Change::Nothing => CommitOutcome::Skipped,
            Change::Unchanged => CommitOutcome::Unchanged,
            Change::Delete => {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                info!(uri = %handle.uri, "removed observation");
                CommitOutcome::Deleted
            }
            Change::Write(record) => {
                write_atomic(&path, record)?;
                CommitOutcome::Written
            }
        };
        drop(handle);
        Ok(outcome)
    }
}

impl CrossReferenceQuery for FsRepository {
    fn observation_info(&self, observation_id: &str) -> Result<Vec<ObsInfoRow>> {
        let uri = ObservationUri::new(&self.raw_collection, observation_id);
        let Some(record) = self.load(&uri)? else {
            return Ok(Vec::new());
        };
        let mut rows = Vec::new();
        for plane in record.planes.values() {
            for artifact in plane.artifacts.values() {
                rows.push(ObsInfoRow {
                    product_id: plane.product_id.clone(),
                    date_obs: plane.time_bounds.map(|bounds| bounds.start),
                    date_end: plane.time_bounds.map(|bounds| bounds.end),
                    release: plane.data_release.clone(),
                    artifact_uri: artifact.uri.clone(),
                });
            }
        }
        Ok(rows)
    }

    fn planes_sharing_artifact(&self, artifact_uri: &str) -> Result<Vec<ArtifactRow>> {
        let wanted = uri::file_id_from_artifact_uri(artifact_uri);
        let mut rows = Vec::new();
        for collection in self.collections()? {
            for record in self.records_in(&collection)? {
                for plane in record.planes.values() {
                    let holds = plane
                        .artifacts
                        .values()
                        .any(|artifact| uri::file_id_from_artifact_uri(&artifact.uri) == wanted);
                    if !holds {
                        continue;
                    }
                    rows.extend(plane.artifacts.values().map(|artifact| ArtifactRow {
                        collection: record.collection.clone(),
                        observation_id: record.observation_id.clone(),
                        product_id: plane.product_id.clone(),
                        artifact_uri: artifact.uri.clone(),
                    }));
                }
            }
        }
        Ok(rows)
    }

    fn planes_with_run_ids(
        &self,
        collection: &str,
        run_ids: &[String],
    ) -> Result<Vec<RunPlaneRow>> {
        let mut rows = Vec::new();
        for record in self.records_in(collection)? {
            for plane in record.planes.values() {
                let matches = plane
                    .provenance_run_id
                    .as_ref()
                    .is_some_and(|run| run_ids.contains(run));
                if matches {
                    rows.push(RunPlaneRow {
                        observation_id: record.observation_id.clone(),
                        product_id: plane.product_id.clone(),
                    });
                }
            }
        }
        Ok(rows)
    }
}
