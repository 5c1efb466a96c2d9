use anyhow::Result;
use std::path::PathBuf;

use crate::commands::{CommandReport, load_run_config};
use crate::ingest::pipeline::{self, RunOptions, RunSummary};

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub indir: PathBuf,
    pub collection: Option<String>,
    pub prefix: Option<String>,
}

pub fn batch_details(report: &mut CommandReport, summary: &RunSummary) {
    report.detail(format!("collection={}", summary.collection));
    report.detail(format!("indir={}", summary.indir.display()));
    report.detail(format!("scanned={}", summary.scanned));
    report.detail(format!("skipped_files={}", summary.skipped_files.len()));
    report.detail(format!("linked={}", summary.batch.linked));
    report.detail(format!("merged={}", summary.batch.merged));
    report.detail(format!("observations={}", summary.batch.observations));
    report.detail(format!("planes={}", summary.batch.planes));
    report.detail(format!(
        "deferred_inputs attempted={} resolved={} dropped={}",
        summary.batch.deferred.attempted,
        summary.batch.deferred.resolved,
        summary.batch.deferred.dropped.len()
    ));
    for dropped in &summary.batch.deferred.dropped {
        report.detail(format!(
            "unresolved_input observation={} plane={} file={}",
            dropped.observation_id, dropped.product_id, dropped.file_id
        ));
    }
    report.detail(format!("stale_runs_checked={}", summary.stale_runs_checked));
    report.detail(format!(
        "cache member_queries={} artifact_queries={} cached_files={}",
        summary.cache.member_queries, summary.cache.artifact_queries, summary.cache.cached_files
    ));

    for invalid in &summary.invalid_files {
        report.issue(format!(
            "invalid descriptor {}: {}",
            invalid.path.display(),
            invalid.reason
        ));
    }
}

pub fn run(options: &CheckOptions) -> Result<CommandReport> {
    let (paths, cfg) = load_run_config(options.collection.as_deref(), options.prefix.as_deref())?;
    let mut report = CommandReport::new("check");

    let summary = pipeline::run(
        &cfg,
        &paths,
        &RunOptions {
            indir: options.indir.clone(),
            check_only: true,
            ..RunOptions::default()
        },
    )?;

    batch_details(&mut report, &summary);
    for skipped in &summary.batch.skipped_records {
        report.issue(format!("record skipped: {skipped}"));
    }
    Ok(report)
}
