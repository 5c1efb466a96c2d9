use crate::error::IngestError;
use crate::ingest::caom::ObservationRecord;
use crate::ingest::uri::ObservationUri;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Permit deleting the observation when it ends up with no planes.
    pub allow_remove: bool,
    /// Compute everything, persist nothing.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    Written,
    Deleted,
    Unchanged,
    DryRun,
    /// Nothing existed and nothing was produced.
    Skipped,
}

impl CommitOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Written => "written",
            Self::Deleted => "deleted",
            Self::Unchanged => "unchanged",
            Self::DryRun => "dry_run",
            Self::Skipped => "skipped",
        }
    }
}

/// What committing a handle has to do to the store.
#[derive(Debug, PartialEq)]
pub enum Change<'a> {
    Write(&'a ObservationRecord),
    Delete,
    Unchanged,
    Nothing,
}

/// Advisory lock held for the lifetime of a handle.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn try_acquire(path: &Path, uri: &ObservationUri) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(IngestError::Locked {
                uri: uri.to_string(),
            }
            .into()),
            Err(err) => Err(err).with_context(|| format!("failed to lock {}", path.display())),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), "unlock failed: {err}");
        }
    }
}

pub fn record_digest(record: &ObservationRecord) -> Result<String> {
    let bytes = serde_json::to_vec(record).context("failed to serialise observation record")?;
    Ok(format!("{:x}", Sha256::digest(bytes)))
}

/// Exclusive, versioned view of one stored observation.
#[derive(Debug)]
pub struct ObservationHandle {
    pub uri: ObservationUri,
    record: Option<ObservationRecord>,
    existed: bool,
    version: Option<String>,
    original_digest: Option<String>,
    options: AcquireOptions,
    _lock: Option<LockGuard>,
}

impl ObservationHandle {
    pub fn new(
        uri: ObservationUri,
        record: Option<ObservationRecord>,
        version: Option<String>,
        options: AcquireOptions,
        lock: Option<LockGuard>,
    ) -> Result<Self> {
        let original_digest = record.as_ref().map(record_digest).transpose()?;
        Ok(Self {
            uri,
            existed: record.is_some(),
            record,
            version,
            original_digest,
            options,
            _lock: lock,
        })
    }

    pub fn existed(&self) -> bool {
        self.existed
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// The stored record, created empty on first access when absent.
    pub fn record_mut(&mut self) -> &mut ObservationRecord {
        let uri = &self.uri;
        self.record
            .get_or_insert_with(|| ObservationRecord::new(&uri.collection, &uri.observation_id))
    }

    pub fn take_record(&mut self) -> Option<ObservationRecord> {
        self.record.take()
    }

    pub fn replace_record(&mut self, record: ObservationRecord) {
        self.record = Some(record);
    }

    /// Decide what a commit must do, refusing to empty an observation
    /// unless removal was allowed at acquire time.
    pub fn change(&self) -> Result<Change<'_>> {
        match &self.record {
            None => Ok(Change::Nothing),
            Some(record) if record.is_empty() => {
                if !self.existed {
                    Ok(Change::Nothing)
                } else if self.options.allow_remove {
                    Ok(Change::Delete)
                } else {
                    Err(IngestError::reconciliation(
                        self.uri.to_string(),
                        "commit would remove every plane but removal is not allowed",
                    )
                    .into())
                }
            }
            Some(record) => {
                if self.original_digest.as_deref() == Some(record_digest(record)?.as_str()) {
                    Ok(Change::Unchanged)
                } else {
                    Ok(Change::Write(record))
                }
            }
        }
    }
}

/// Read-modify-write access to stored observations.
pub trait RepositoryClient {
    fn acquire(&self, uri: &ObservationUri, options: AcquireOptions) -> Result<ObservationHandle>;

    /// Persist the handle's record and release it.
    fn commit(&self, handle: ObservationHandle) -> Result<CommitOutcome>;

    /// Release the handle, discarding any changes.
    fn release(&self, handle: ObservationHandle) {
        debug!(uri = %handle.uri, "released without commit");
    }
}

/// Run `apply` against an acquired handle. The handle is committed only when
/// `apply` succeeds outside dry-run mode and is released in every case.
pub fn process<T>(
    repo: &dyn RepositoryClient,
    uri: &ObservationUri,
    options: AcquireOptions,
    apply: impl FnOnce(&mut ObservationHandle) -> Result<T>,
) -> Result<(T, CommitOutcome)> {
    let mut handle = repo.acquire(uri, options)?;
    match apply(&mut handle) {
        Ok(value) if options.dry_run => {
            repo.release(handle);
            Ok((value, CommitOutcome::DryRun))
        }
        Ok(value) => {
            let outcome = repo
                .commit(handle)
                .with_context(|| format!("failed to commit {uri}"))?;
            Ok((value, outcome))
        }
        Err(err) => {
            repo.release(handle);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::caom::PlaneRecord;

    fn stored() -> ObservationRecord {
        let mut record = ObservationRecord::new("JCMT", "o");
        record
            .planes
            .insert("A".to_string(), PlaneRecord::new("A"));
        record
    }

    fn handle(record: Option<ObservationRecord>, allow_remove: bool) -> ObservationHandle {
        ObservationHandle::new(
            ObservationUri::new("JCMT", "o"),
            record,
            None,
            AcquireOptions {
                allow_remove,
                dry_run: false,
            },
            None,
        )
        .expect("handle")
    }

    #[test]
    fn untouched_record_is_unchanged() {
        let handle = handle(Some(stored()), false);
        assert_eq!(handle.change().expect("change"), Change::Unchanged);
    }

    #[test]
    fn modified_record_is_written() {
        let mut handle = handle(Some(stored()), false);
        handle.record_mut().algorithm = "custom".to_string();
        assert!(matches!(handle.change().expect("change"), Change::Write(_)));
    }

    #[test]
    fn emptied_record_needs_allow_remove() {
        let mut strict = handle(Some(stored()), false);
        strict.record_mut().planes.clear();
        assert_eq!(crate::error::classify(&strict.change().unwrap_err()), "reconciliation");

        let mut sweeping = handle(Some(stored()), true);
        sweeping.record_mut().planes.clear();
        assert_eq!(sweeping.change().expect("change"), Change::Delete);
    }

    #[test]
    fn absent_record_is_created_on_demand() {
        let mut fresh = handle(None, false);
        assert_eq!(fresh.change().expect("change"), Change::Nothing);
        fresh.record_mut().planes.insert("B".to_string(), PlaneRecord::new("B"));
        assert!(!fresh.existed());
        assert!(matches!(fresh.change().expect("change"), Change::Write(_)));
    }

    #[test]
    fn second_lock_reports_locked() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("o.lock");
        let uri = ObservationUri::new("JCMT", "o");
        let first = LockGuard::try_acquire(&path, &uri).expect("first lock");
        let err = LockGuard::try_acquire(&path, &uri).unwrap_err();
        assert_eq!(crate::error::classify(&err), "locked");
        drop(first);
        LockGuard::try_acquire(&path, &uri).expect("relock");
    }
}
