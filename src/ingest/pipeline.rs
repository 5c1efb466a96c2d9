use crate::error::{IngestError, classify};
use crate::ingest::audit;
use crate::ingest::builder::{BuiltinBuilder, CommandBuilder, RecordBuilder};
use crate::ingest::cache::{CacheStats, CrossReferenceQuery};
use crate::ingest::config::IngestConfig;
use crate::ingest::context::IngestContext;
use crate::ingest::fs_repo::FsRepository;
use crate::ingest::http::HttpArchive;
use crate::ingest::paths::IngestPaths;
use crate::ingest::reconcile::{ReconcileOptions, ReconcileReport, Reconciler};
use crate::ingest::record::RawFileRecord;
use crate::ingest::repository::RepositoryClient;
use crate::ingest::resolve::link_record;
use crate::ingest::scan::{SkippedFile, scan_directory};
use crate::ingest::stale::RunAliasTable;
use crate::ingest::tree::{DeferredOutcome, ResolvedTree, TreeBuilder};
use crate::ingest::warn::{self, WarnEvent};
use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub indir: PathBuf,
    /// Merge and resolve only, tolerating bad records; nothing is written.
    pub check_only: bool,
    pub dry_run: bool,
    pub side_output: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub linked: usize,
    pub merged: usize,
    pub skipped_records: Vec<String>,
    pub observations: usize,
    pub planes: usize,
    pub deferred: DeferredOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub collection: String,
    pub indir: PathBuf,
    pub check_only: bool,
    pub dry_run: bool,
    pub scanned: usize,
    pub skipped_files: Vec<SkippedFile>,
    pub invalid_files: Vec<SkippedFile>,
    pub batch: BatchStats,
    pub stale_runs_checked: usize,
    pub cache: CacheStats,
    pub reconcile: Option<ReconcileReport>,
    pub elapsed_ms: u128,
}

impl RunSummary {
    pub fn is_ok(&self) -> bool {
        self.invalid_files.is_empty()
            && self
                .reconcile
                .as_ref()
                .is_none_or(|report| report.failed.is_empty())
    }
}

/// External collaborators of one run.
pub struct Services {
    pub repository: Box<dyn RepositoryClient>,
    pub query: Box<dyn CrossReferenceQuery>,
    pub builder: Box<dyn RecordBuilder>,
}

fn open_repository(cfg: &IngestConfig, paths: &IngestPaths) -> Result<Box<dyn RepositoryClient>> {
    match cfg.repository.kind.as_str() {
        "fs" => Ok(Box::new(FsRepository::new(
            cfg.repository_root(paths),
            cfg.archive.raw_collection.clone(),
        ))),
        "http" => {
            let url = cfg
                .repository
                .base_url
                .as_deref()
                .ok_or_else(|| IngestError::Config("repository.base_url is not set".into()))?;
            Ok(Box::new(HttpArchive::new(
                url,
                cfg.repository.timeout_secs,
                cfg.archive.raw_collection.clone(),
            )?))
        }
        other => Err(IngestError::Config(format!("unknown repository kind `{other}`")).into()),
    }
}

fn open_query(cfg: &IngestConfig, paths: &IngestPaths) -> Result<Box<dyn CrossReferenceQuery>> {
    match (cfg.query.kind.as_str(), cfg.repository.kind.as_str()) {
        ("repository", "fs") => Ok(Box::new(FsRepository::new(
            cfg.repository_root(paths),
            cfg.archive.raw_collection.clone(),
        ))),
        ("repository", "http") => {
            let url = cfg
                .repository
                .base_url
                .as_deref()
                .ok_or_else(|| IngestError::Config("repository.base_url is not set".into()))?;
            Ok(Box::new(HttpArchive::new(
                url,
                cfg.query.timeout_secs,
                cfg.archive.raw_collection.clone(),
            )?))
        }
        ("http", _) => {
            let url = cfg
                .query
                .base_url
                .as_deref()
                .ok_or_else(|| IngestError::Config("query.base_url is not set".into()))?;
            Ok(Box::new(HttpArchive::new(
                url,
                cfg.query.timeout_secs,
                cfg.archive.raw_collection.clone(),
            )?))
        }
        (query, repository) => Err(IngestError::Config(format!(
            "query kind `{query}` cannot be used with repository kind `{repository}`"
        ))
        .into()),
    }
}

fn open_builder(cfg: &IngestConfig, paths: &IngestPaths) -> Result<Box<dyn RecordBuilder>> {
    match cfg.builder.mode.as_str() {
        "builtin" => Ok(Box::new(BuiltinBuilder)),
        "command" => Ok(Box::new(CommandBuilder {
            bin: PathBuf::from(&cfg.builder.bin),
            timeout_secs: cfg.builder.timeout_secs,
            work_dir: paths.work_dir.clone(),
        })),
        other => Err(IngestError::Config(format!("unknown builder mode `{other}`")).into()),
    }
}

impl Services {
    pub fn open(cfg: &IngestConfig, paths: &IngestPaths) -> Result<Self> {
        Ok(Self {
            repository: open_repository(cfg, paths)?,
            query: open_query(cfg, paths)?,
            builder: open_builder(cfg, paths)?,
        })
    }
}

pub fn load_aliases(cfg: &IngestConfig) -> Result<RunAliasTable> {
    match &cfg.ingest.alias_table {
        Some(path) => {
            let table = RunAliasTable::load(path)?;
            info!(aliases = table.len(), path = %path.display(), "loaded run alias table");
            Ok(table)
        }
        None => Ok(RunAliasTable::default()),
    }
}

/// Link every record in order, merge it, then resolve what was deferred.
///
/// Records are merged in the order given. A structural problem stops the
/// batch unless `tolerant` is set, in which case the record is skipped.
/// Unresolvable members stop the batch in both modes.
pub fn resolve_batch(
    records: &[RawFileRecord],
    ctx: &mut IngestContext,
    query: &dyn CrossReferenceQuery,
    tolerant: bool,
) -> Result<(ResolvedTree, BatchStats)> {
    let mut stats = BatchStats::default();
    let mut builder = TreeBuilder::new(tolerant);

    for raw in records {
        let file = raw.local_path.display().to_string();
        let linked = match link_record(raw, ctx, query) {
            Ok(linked) => linked,
            Err(err)
                if tolerant
                    && matches!(
                        err.downcast_ref::<IngestError>(),
                        Some(IngestError::Structural { .. })
                    ) =>
            {
                warn::emit(WarnEvent {
                    code: "RECORD_SKIPPED",
                    stage: "link",
                    action: "skip",
                    reason: &file,
                    err: &err.to_string(),
                    ..WarnEvent::default()
                });
                stats.skipped_records.push(format!("{file}: {err}"));
                continue;
            }
            Err(err) => return Err(err.context(format!("failed to link {file}"))),
        };
        stats.linked += 1;
        builder
            .merge(&linked.record, &linked.pending_files)
            .with_context(|| format!("failed to merge {file}"))?;
    }

    let merged = builder.finish();
    stats.merged = merged.merged_records();
    stats
        .skipped_records
        .extend(merged.skipped().iter().cloned());
    stats.observations = merged.tree().observations.len();
    stats.planes = merged.tree().plane_count();

    let (tree, deferred) = merged.resolve_deferred_inputs(&mut ctx.cache, query)?;
    ctx.pending_files.clear();
    stats.deferred = deferred;
    Ok((tree, stats))
}

fn record_audit(paths: Option<&IngestPaths>, report: &ReconcileReport) {
    let Some(paths) = paths else {
        return;
    };
    let events = report
        .committed
        .iter()
        .map(|o| ("reconcile", "ok", o.observation_id.as_str(), o.status.as_str().to_string()))
        .chain(report.swept.iter().map(|o| {
            (
                "sweep",
                "ok",
                o.observation_id.as_str(),
                format!("removed {}", o.removed_planes.join(",")),
            )
        }))
        .chain(report.failed.iter().map(|f| {
            (f.phase, "failed", f.observation_id.as_str(), format!("{}: {}", f.kind, f.message))
        }));
    for (phase, status, observation, message) in events {
        if let Err(err) = audit::append_event(paths, phase, status, observation, &message) {
            warn!("failed to append audit event: {err:#}");
        }
    }
}

/// Scan, link, merge, resolve and (unless checking) reconcile one batch.
pub fn execute(
    cfg: &IngestConfig,
    options: &RunOptions,
    services: &Services,
    audit_paths: Option<&IngestPaths>,
) -> Result<RunSummary> {
    let started = Instant::now();
    if !options.indir.is_dir() {
        return Err(anyhow!(
            "input directory {} does not exist",
            options.indir.display()
        ));
    }

    let scan = scan_directory(&options.indir, cfg.ingest.prefix.as_deref())?;
    info!(
        records = scan.records.len(),
        skipped = scan.skipped.len(),
        invalid = scan.invalid.len(),
        "scanned {}",
        options.indir.display()
    );
    // Reconciliation prunes planes missing from the tree, so it needs every
    // descriptor. Only a check run may continue past unreadable ones.
    if !options.check_only {
        if let Some(first) = scan.invalid.first() {
            return Err(IngestError::structural(
                first.path.display().to_string(),
                "descriptor",
                format!(
                    "{} ({} unreadable descriptor(s) in batch)",
                    first.reason,
                    scan.invalid.len()
                ),
            )
            .into());
        }
    }

    let mut ctx = IngestContext::new(cfg.archive.clone(), load_aliases(cfg)?);
    let (tree, batch) = resolve_batch(
        &scan.records,
        &mut ctx,
        services.query.as_ref(),
        options.check_only,
    )?;

    debug!(
        overrides = ctx.overrides.len(),
        part_counts = ctx.part_counts.len(),
        stale_observations = ctx.stale.pending_observations(),
        "batch linked"
    );

    let reconcile = if options.check_only {
        None
    } else {
        let reconciler = Reconciler::new(
            services.repository.as_ref(),
            services.builder.as_ref(),
            ReconcileOptions {
                dry_run: options.dry_run,
                excess_parts: cfg.ingest.excess_parts,
                side_output: options.side_output.clone(),
            },
        );
        let report = reconciler.run(&tree, &mut ctx);
        record_audit(audit_paths, &report);
        Some(report)
    };

    let summary = RunSummary {
        collection: cfg.archive.collection.clone(),
        indir: options.indir.clone(),
        check_only: options.check_only,
        dry_run: options.dry_run,
        scanned: scan.records.len(),
        skipped_files: scan.skipped,
        invalid_files: scan.invalid,
        batch,
        stale_runs_checked: ctx.stale.checked_runs(),
        cache: ctx.cache.stats(),
        reconcile,
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(
        observations = summary.batch.observations,
        ok = summary.is_ok(),
        "DONE"
    );
    Ok(summary)
}

/// Open the configured services and run.
pub fn run(cfg: &IngestConfig, paths: &IngestPaths, options: &RunOptions) -> Result<RunSummary> {
    let services = Services::open(cfg, paths)?;
    execute(cfg, options, &services, Some(paths)).inspect_err(|err| {
        let kind = classify(err);
        if let Err(audit_err) =
            audit::append_event(paths, "run", "failed", "", &format!("{kind}: {err:#}"))
        {
            warn!("failed to append audit event: {audit_err:#}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::cache::tests::FakeArchive;
    use crate::ingest::config::ArchiveConfig;
    use crate::ingest::record::{PLANE_DATA_RELEASE_KEY, RunIdValue, SOURCE_DENSITY_KEY};
    use crate::ingest::uri::PlaneUri;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;

    fn raw(file_id: &str, product_id: &str, fields: &[(&str, &str)]) -> RawFileRecord {
        RawFileRecord {
            observation_id: Some("o1".to_string()),
            product_id: Some(product_id.to_string()),
            file_id: Some(file_id.to_string()),
            main_product: true,
            plane: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            run_id: Some(RunIdValue::Text("jac-5".to_string())),
            local_path: PathBuf::from(format!("/in/{file_id}.sdf")),
            ..RawFileRecord::default()
        }
    }

    fn context() -> IngestContext {
        IngestContext::new(ArchiveConfig::default(), RunAliasTable::default())
    }

    #[test]
    fn three_file_batch_resolves_release_density_and_inputs() {
        // `a_derived` sorts first so its input is still unknown when linked.
        let mut derived = raw("a_derived", "P2", &[("plane.calibrationLevel", "3")]);
        derived.prv = Some(vec!["b_first".to_string()]);
        let records = vec![
            derived,
            raw(
                "b_first",
                "P1",
                &[(PLANE_DATA_RELEASE_KEY, "2020-01-01"), (SOURCE_DENSITY_KEY, "0")],
            ),
            raw(
                "c_second",
                "P1",
                &[(PLANE_DATA_RELEASE_KEY, "2019-06-01"), (SOURCE_DENSITY_KEY, "5.0")],
            ),
        ];

        let mut ctx = context();
        let (tree, stats) =
            resolve_batch(&records, &mut ctx, &FakeArchive::default(), false).expect("batch");

        let p1 = tree.tree().plane("o1", "P1").expect("P1");
        assert_eq!(p1.fields[PLANE_DATA_RELEASE_KEY], "2020-01-01");
        assert_eq!(p1.fields[SOURCE_DENSITY_KEY], "5.0");

        let p2 = tree.tree().plane("o1", "P2").expect("P2");
        assert_eq!(
            p2.inputset,
            BTreeSet::from([PlaneUri::new("JCMT", "o1", "P1")])
        );
        assert!(p2.fileset.is_empty());
        assert_eq!(stats.deferred.attempted, 1);
        assert_eq!(stats.deferred.resolved, 1);
        assert!(ctx.pending_files.is_empty());
    }

    #[test]
    fn tolerant_batch_skips_records_without_run_id() {
        let mut broken = raw("a", "P1", &[("plane.calibrationLevel", "2")]);
        broken.run_id = None;
        let records = vec![broken.clone(), raw("b", "P1", &[("plane.calibrationLevel", "2")])];

        let (tree, stats) =
            resolve_batch(&records, &mut context(), &FakeArchive::default(), true).expect("batch");
        assert_eq!(stats.linked, 1);
        assert_eq!(stats.skipped_records.len(), 1);
        assert_eq!(tree.tree().plane_count(), 1);

        let err = resolve_batch(&records, &mut context(), &FakeArchive::default(), false)
            .unwrap_err();
        assert_eq!(classify(&err), "structural");
    }

    #[test]
    fn unresolved_member_stops_even_a_tolerant_batch() {
        let mut composite = raw("a", "P1", &[("plane.calibrationLevel", "2")]);
        composite.mbr = Some(vec!["caom:JCMT/missing".to_string()]);
        let err = resolve_batch(&[composite], &mut context(), &FakeArchive::default(), true)
            .unwrap_err();
        assert_eq!(classify(&err), "unresolved-member");
    }

    fn write_descriptor(dir: &Path, file_id: &str, body: serde_json::Value) {
        fs::write(dir.join(format!("{file_id}.sdf")), b"data").expect("data");
        fs::write(
            dir.join(format!("{file_id}.sdf.meta.json")),
            serde_json::to_vec(&body).expect("json"),
        )
        .expect("descriptor");
    }

    #[test]
    fn execute_ingests_into_the_file_repository() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let indir = tmp.path().join("in");
        fs::create_dir_all(&indir).expect("indir");
        write_descriptor(
            &indir,
            "jcmts_850",
            serde_json::json!({
                "observation_id": "o1",
                "product_id": "reduced-850",
                "main_product": true,
                "run_id": "jac-12",
                "plane": {"algorithm.name": "custom", "plane.dataRelease": "2020-01-01"}
            }),
        );

        let repo = FsRepository::new(tmp.path().join("repo"), "JCMT");
        let services = Services {
            repository: Box::new(repo.clone()),
            query: Box::new(FakeArchive::default()),
            builder: Box::new(BuiltinBuilder),
        };
        let options = RunOptions {
            indir,
            ..RunOptions::default()
        };
        let summary =
            execute(&IngestConfig::default(), &options, &services, None).expect("execute");

        assert!(summary.is_ok());
        assert_eq!(summary.scanned, 1);
        let stored = repo
            .load(&crate::ingest::uri::ObservationUri::new("JCMT", "o1"))
            .expect("load")
            .expect("stored");
        let plane = &stored.planes["reduced-850"];
        assert_eq!(plane.data_release.as_deref(), Some("2020-01-01"));
        assert_eq!(plane.provenance_run_id.as_deref(), Some("jac-000000012"));
        assert!(plane.artifacts.contains_key("ad:JCMT/jcmts_850"));
    }

    #[test]
    fn unreadable_descriptor_stops_ingest_before_pruning() {
        use crate::ingest::caom::PlaneRecord;
        use crate::ingest::repository::{AcquireOptions, process};
        use crate::ingest::uri::ObservationUri;

        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = FsRepository::new(tmp.path().join("repo"), "JCMT");
        let uri = ObservationUri::new("JCMT", "o1");
        process(&repo, &uri, AcquireOptions::default(), |handle| {
            for product_id in ["A", "B"] {
                let mut plane = PlaneRecord::new(product_id);
                plane.provenance_run_id = Some("jac-000000012".to_string());
                handle
                    .record_mut()
                    .planes
                    .insert(product_id.to_string(), plane);
            }
            Ok(())
        })
        .expect("seed");

        let indir = tmp.path().join("in");
        fs::create_dir_all(&indir).expect("indir");
        write_descriptor(
            &indir,
            "jcmts_a",
            serde_json::json!({
                "observation_id": "o1",
                "product_id": "A",
                "main_product": true,
                "run_id": "jac-12",
                "plane": {"algorithm.name": "custom"}
            }),
        );
        fs::write(indir.join("jcmts_b.sdf"), b"data").expect("data");
        fs::write(indir.join("jcmts_b.sdf.meta.json"), b"{\"observation_id\": \"o1\", ")
            .expect("truncated descriptor");

        let services = Services {
            repository: Box::new(repo.clone()),
            query: Box::new(FakeArchive::default()),
            builder: Box::new(BuiltinBuilder),
        };
        let ingest = RunOptions {
            indir: indir.clone(),
            ..RunOptions::default()
        };
        let err = execute(&IngestConfig::default(), &ingest, &services, None).unwrap_err();
        assert_eq!(classify(&err), "structural");
        let stored = repo.load(&uri).expect("load").expect("stored");
        assert_eq!(
            stored.planes.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["A", "B"]
        );

        let check = RunOptions {
            indir,
            check_only: true,
            ..RunOptions::default()
        };
        let summary =
            execute(&IngestConfig::default(), &check, &services, None).expect("check");
        assert_eq!(summary.invalid_files.len(), 1);
        assert!(summary.reconcile.is_none());
    }

    #[test]
    fn missing_input_directory_is_an_error() {
        let services = Services {
            repository: Box::new(FsRepository::new("/nonexistent", "JCMT")),
            query: Box::new(FakeArchive::default()),
            builder: Box::new(BuiltinBuilder),
        };
        let options = RunOptions {
            indir: PathBuf::from("/nonexistent/indir"),
            ..RunOptions::default()
        };
        assert!(execute(&IngestConfig::default(), &options, &services, None).is_err());
    }
}
