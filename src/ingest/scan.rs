use crate::ingest::record::RawFileRecord;
use crate::ingest::uri::make_file_id;
use crate::ingest::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DESCRIPTOR_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    /// Descriptors in ascending file id order, `local_path` pointing at the data file.
    pub records: Vec<RawFileRecord>,
    pub skipped: Vec<SkippedFile>,
    /// Descriptors that exist but could not be parsed.
    pub invalid: Vec<SkippedFile>,
}

fn collect_descriptors(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_descriptors(&path, out)?;
        } else if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(DESCRIPTOR_SUFFIX))
        {
            out.push(path);
        }
    }
    Ok(())
}

fn data_path_for(descriptor: &Path) -> Option<PathBuf> {
    let name = descriptor.file_name()?.to_str()?;
    let data_name = name.strip_suffix(DESCRIPTOR_SUFFIX)?;
    if data_name.is_empty() {
        return None;
    }
    Some(descriptor.with_file_name(data_name))
}

fn skip(report: &mut ScanReport, path: &Path, reason: String) {
    warn::emit(WarnEvent {
        code: "FILE_SKIPPED",
        stage: "scan",
        action: "skip",
        reason: &format!("{}: {reason}", path.display()),
        ..WarnEvent::default()
    });
    report.skipped.push(SkippedFile {
        path: path.to_path_buf(),
        reason,
    });
}

/// Find every data file under `indir` that has an extracted metadata
/// descriptor next to it.
pub fn scan_directory(indir: &Path, prefix: Option<&str>) -> Result<ScanReport> {
    let mut descriptors = Vec::new();
    collect_descriptors(indir, &mut descriptors)?;

    let mut report = ScanReport::default();
    let mut found = Vec::new();
    for descriptor in descriptors {
        let Some(data_path) = data_path_for(&descriptor) else {
            skip(&mut report, &descriptor, "descriptor names no data file".to_string());
            continue;
        };
        let size = match fs::metadata(&data_path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                skip(&mut report, &data_path, "data file is missing".to_string());
                continue;
            }
        };
        if size == 0 {
            skip(&mut report, &data_path, "data file is empty".to_string());
            continue;
        }
        let file_id = make_file_id(&data_path);
        if let Some(prefix) = prefix.filter(|prefix| !prefix.is_empty()) {
            if !file_id.starts_with(prefix) {
                skip(
                    &mut report,
                    &data_path,
                    format!("file name does not start with prefix `{prefix}`"),
                );
                continue;
            }
        }

        let parsed = fs::read_to_string(&descriptor)
            .with_context(|| format!("failed to read {}", descriptor.display()))
            .and_then(|raw| {
                serde_json::from_str::<RawFileRecord>(&raw)
                    .with_context(|| format!("failed to parse {}", descriptor.display()))
            });
        match parsed {
            Ok(mut record) => {
                record.local_path = data_path;
                let file_id = record.file_id.get_or_insert(file_id).clone();
                found.push((file_id, record));
            }
            Err(err) => report.invalid.push(SkippedFile {
                path: descriptor,
                reason: format!("{err:#}"),
            }),
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    report.records = found.into_iter().map(|(_, record)| record).collect();
    Ok(report)
}
