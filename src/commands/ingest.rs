use anyhow::Result;
use std::path::PathBuf;

use crate::commands::check::batch_details;
use crate::commands::{CommandReport, load_run_config};
use crate::ingest::pipeline::{self, RunOptions};

#[derive(Debug, Clone)]
pub struct IngestCommandOptions {
    pub indir: PathBuf,
    pub collection: Option<String>,
    pub prefix: Option<String>,
    pub dry_run: bool,
    pub side_output: Option<PathBuf>,
}

pub fn run(options: &IngestCommandOptions) -> Result<CommandReport> {
    let (paths, cfg) = load_run_config(options.collection.as_deref(), options.prefix.as_deref())?;
    let mut report = CommandReport::new("ingest");

    let summary = pipeline::run(
        &cfg,
        &paths,
        &RunOptions {
            indir: options.indir.clone(),
            check_only: false,
            dry_run: options.dry_run,
            side_output: options.side_output.clone(),
        },
    )?;

    batch_details(&mut report, &summary);
    report.detail(format!("dry_run={}", summary.dry_run));
    if let Some(dir) = &options.side_output {
        report.detail(format!("side_output={}", dir.display()));
    }

    let Some(reconcile) = &summary.reconcile else {
        return Ok(report);
    };
    let mut reconciled = CommandReport::new("reconcile");
    for outcome in &reconcile.committed {
        reconciled.detail(format!(
            "observation={} status={} planes={} removed_planes={} excess_parts_removed={}",
            outcome.observation_id,
            outcome.status.as_str(),
            outcome.planes.join(","),
            outcome.removed_planes.join(","),
            outcome.excess_parts_removed
        ));
    }
    for outcome in &reconcile.swept {
        reconciled.detail(format!(
            "swept observation={} status={} removed_planes={}",
            outcome.observation_id,
            outcome.status.as_str(),
            outcome.removed_planes.join(",")
        ));
    }
    for failure in &reconcile.failed {
        reconciled.issue(format!(
            "{} failed for {} ({}): {}",
            failure.phase, failure.observation_id, failure.kind, failure.message
        ));
    }
    report.merge(reconciled);
    report.detail(format!("elapsed_ms={}", summary.elapsed_ms));
    Ok(report)
}
