use crate::error::{IngestError, classify};
use crate::ingest::builder::{BuildRequest, RecordBuilder};
use crate::ingest::caom::{ObservationRecord, TemporalAxis, TimeRange};
use crate::ingest::context::IngestContext;
use crate::ingest::overrides::remove_excess_parts;
use crate::ingest::record::{
    ALGORITHM_KEY, EXPOSURE_ALGORITHM, FieldMap, MEMBERS_KEY, PROVENANCE_INPUTS_KEY,
    PROVENANCE_NAME_KEY, SOURCE_DENSITY_KEY,
};
use crate::ingest::repository::{AcquireOptions, CommitOutcome, RepositoryClient, process};
use crate::ingest::tree::{Observation, Plane, ResolvedTree};
use crate::ingest::uri::{self, ObservationUri};
use crate::ingest::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub dry_run: bool,
    /// Soft limit on parts per artifact when no expected count is known.
    pub excess_parts: usize,
    /// Mirror each final record as `<dir>/<sanitised observation id>.json`.
    pub side_output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservationOutcome {
    pub observation_id: String,
    pub status: CommitOutcome,
    pub planes: Vec<String>,
    pub removed_planes: Vec<String>,
    pub excess_parts_removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservationFailure {
    pub observation_id: String,
    pub phase: &'static str,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub committed: Vec<ObservationOutcome>,
    pub swept: Vec<ObservationOutcome>,
    pub failed: Vec<ObservationFailure>,
}

/// Per-observation upsert driver: acquire, pre-clean, rebuild every plane,
/// drop planes a superseded run left behind, commit.
pub struct Reconciler<'a> {
    repo: &'a dyn RepositoryClient,
    builder: &'a dyn RecordBuilder,
    options: ReconcileOptions,
}

const SOURCE_COUNT_KEY: &str = "source_count";
const AREA_COVERED_KEY: &str = "area_covered";

fn format_number(value: f64) -> String {
    format!("{value:?}")
}

/// Source density for a plane, from its own custom fields or, for a
/// `peak-*` catalogue, the area of the matching `extent-*` plane.
fn source_density(observation: &Observation, product_id: &str, plane: &Plane) -> Option<String> {
    let count = plane
        .custom_fields
        .get(SOURCE_COUNT_KEY)
        .and_then(|value| value.as_number());
    let mut area = plane
        .custom_fields
        .get(AREA_COVERED_KEY)
        .and_then(|value| value.as_number());
    if area.is_none() {
        if let Some(rest) = product_id.strip_prefix("peak-") {
            area = observation
                .planes
                .get(&format!("extent-{rest}"))
                .and_then(|extent| extent.custom_fields.get(AREA_COVERED_KEY))
                .and_then(|value| value.as_number());
        }
    }

    match (count, area) {
        (None, Some(_)) => Some("0".to_string()),
        (Some(count), Some(area)) if area > 0.0 => Some(format_number(count / area)),
        (Some(_), Some(area)) => {
            warn::emit(WarnEvent {
                code: "DENSITY_SKIPPED",
                stage: "prepare",
                action: "skip",
                plane: product_id,
                reason: &format!("area covered is {area}"),
                ..WarnEvent::default()
            });
            None
        }
        (Some(_), None) => {
            warn::emit(WarnEvent {
                code: "DENSITY_SKIPPED",
                stage: "prepare",
                action: "skip",
                plane: product_id,
                reason: "source count is defined but area covered is not",
                ..WarnEvent::default()
            });
            None
        }
        (None, None) => None,
    }
}

/// Override fields and sections for one plane, with resolved members and
/// inputs substituted in.
pub fn prepare_request(
    collection: &str,
    observation_id: &str,
    product_id: &str,
    observation: &Observation,
    plane: &Plane,
) -> Result<BuildRequest> {
    if plane.uri_to_path.is_empty() {
        return Err(IngestError::structural(
            format!("{collection}/{observation_id}/{product_id}"),
            "files",
            "plane has no files, nothing to ingest",
        )
        .into());
    }

    let mut general: FieldMap = plane.fields.clone();
    if let Some(algorithm) = general.get(ALGORITHM_KEY).cloned() {
        if !observation.memberset.is_empty() && algorithm != EXPOSURE_ALGORITHM {
            general.insert(
                MEMBERS_KEY.to_string(),
                uri::join_sorted(&observation.memberset),
            );
        } else {
            general.remove(MEMBERS_KEY);
        }
    }
    if general.contains_key(PROVENANCE_NAME_KEY) {
        if plane.inputset.is_empty() {
            general.remove(PROVENANCE_INPUTS_KEY);
        } else {
            general.insert(
                PROVENANCE_INPUTS_KEY.to_string(),
                uri::join_sorted(&plane.inputset),
            );
        }
    }
    if let Some(density) = source_density(observation, product_id, plane) {
        general.insert(SOURCE_DENSITY_KEY.to_string(), density);
    }

    let sections = plane
        .sub_records
        .iter()
        .map(|(id, sub)| (id.clone(), sub.fields.clone()))
        .collect();

    Ok(BuildRequest {
        collection: collection.to_string(),
        observation_id: observation_id.to_string(),
        product_id: product_id.to_string(),
        general,
        sections,
        file_uris: plane.uri_to_path.keys().cloned().collect(),
        local_paths: plane.uri_to_path.values().cloned().collect(),
    })
}

/// Give science and noise chunks of composite observations a time axis made
/// of the member intervals recorded against their artifact.
pub fn update_time_information(record: &mut ObservationRecord, product_id: &str, plane: &Plane) {
    if record.algorithm == EXPOSURE_ALGORITHM || record.members.len() <= 1 {
        return;
    }
    let observation_id = record.observation_id.clone();
    let Some(stored) = record.planes.get_mut(product_id) else {
        return;
    };

    for (sub_id, sub) in &plane.sub_records {
        if sub.custom.is_empty() {
            continue;
        }
        let Some(artifact) = stored.artifacts.get_mut(sub_id) else {
            debug!(section = %sub_id, "custom data does not point to an artifact");
            continue;
        };
        let mut samples = sub
            .custom
            .values()
            .filter_map(|value| value.as_interval())
            .map(|(start, end)| TimeRange { start, end })
            .collect::<Vec<_>>();
        if samples.is_empty() {
            warn::emit(WarnEvent {
                code: "NO_TIME_RANGES",
                stage: "reconcile",
                action: "skip",
                observation: &observation_id,
                plane: product_id,
                reason: sub_id,
                ..WarnEvent::default()
            });
            continue;
        }
        samples.sort_by(|a, b| a.start.total_cmp(&b.start));

        for part in artifact.parts.values_mut() {
            if !part.product_type.carries_data() {
                continue;
            }
            for chunk in part.chunks.iter_mut().filter(|chunk| chunk.position.is_some()) {
                chunk.time = Some(TemporalAxis {
                    samples: samples.clone(),
                    timesys: "UTC".to_string(),
                });
            }
        }

        let start = samples.iter().map(|range| range.start).fold(f64::INFINITY, f64::min);
        let end = samples.iter().map(|range| range.end).fold(f64::NEG_INFINITY, f64::max);
        stored.time_bounds = Some(match stored.time_bounds {
            Some(bounds) => TimeRange {
                start: bounds.start.min(start),
                end: bounds.end.max(end),
            },
            None => TimeRange { start, end },
        });
    }
}

/// Delete planes an earlier execution of the same run produced that this
/// batch no longer generates.
pub fn remove_stale_planes(
    record: &mut ObservationRecord,
    stale: &BTreeSet<String>,
    observation: &Observation,
) -> Vec<String> {
    let mut removed = Vec::new();
    for product_id in stale {
        if observation.planes.contains_key(product_id) {
            continue;
        }
        if record.planes.remove(product_id).is_some() {
            warn::emit(WarnEvent {
                code: "PLANE_REMOVED",
                stage: "reconcile",
                action: "remove",
                observation: &record.observation_id,
                plane: product_id,
                reason: "obsolete output of this run",
                ..WarnEvent::default()
            });
            removed.push(product_id.clone());
        }
    }
    removed
}

fn write_side_output(dir: &Path, record: &ObservationRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!(
        "{}.json",
        uri::sanitize_observation_id(&record.observation_id)
    ));
    let data = serde_json::to_string_pretty(record)?;
    fs::write(&path, format!("{data}\n"))
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

impl<'a> Reconciler<'a> {
    pub fn new(
        repo: &'a dyn RepositoryClient,
        builder: &'a dyn RecordBuilder,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            repo,
            builder,
            options,
        }
    }

    /// Reconcile every observation of the tree, then sweep observations that
    /// only hold stale planes. One failing observation never stops the rest.
    pub fn run(&self, tree: &ResolvedTree, ctx: &mut IngestContext) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for (observation_id, observation) in tree.observations() {
            let stale = ctx.stale.consume_for_observation(observation_id);
            match self.reconcile_observation(observation_id, observation, &stale, ctx) {
                Ok(outcome) => {
                    info!("SUCCESS observationID=\"{observation_id}\"");
                    report.committed.push(outcome);
                }
                Err(err) => {
                    let kind = classify(&err);
                    error!(observation = %observation_id, kind, "{err:#}");
                    warn::emit(WarnEvent {
                        code: "OBSERVATION_FAILED",
                        stage: "reconcile",
                        action: "continue",
                        observation: observation_id,
                        reason: kind,
                        err: &format!("{err:#}"),
                        ..WarnEvent::default()
                    });
                    report.failed.push(ObservationFailure {
                        observation_id: observation_id.clone(),
                        phase: "reconcile",
                        kind,
                        message: format!("{err:#}"),
                    });
                }
            }
        }

        info!("Removing old observations and planes");
        self.sweep(tree, ctx, &mut report);
        report
    }

    fn reconcile_observation(
        &self,
        observation_id: &str,
        observation: &Observation,
        stale: &BTreeSet<String>,
        ctx: &IngestContext,
    ) -> Result<ObservationOutcome> {
        let collection = ctx.archive.collection.as_str();
        let uri = ObservationUri::new(collection, observation_id);
        let options = AcquireOptions {
            allow_remove: false,
            dry_run: self.options.dry_run,
        };

        let ((excess_parts_removed, removed_planes), status) =
            process(self.repo, &uri, options, |handle| {
                let mut excess = 0;
                if handle.existed() {
                    let cleanup = remove_excess_parts(
                        handle.record_mut(),
                        &ctx.part_counts,
                        self.options.excess_parts,
                    );
                    for artifact in &cleanup.oversize {
                        warn::emit(WarnEvent {
                            code: "EXCESS_PARTS",
                            stage: "preclean",
                            action: "keep",
                            observation: observation_id,
                            reason: &format!(
                                "more than {} parts for {artifact}",
                                self.options.excess_parts
                            ),
                            ..WarnEvent::default()
                        });
                    }
                    excess = cleanup.removed.values().sum::<usize>();
                }

                for (product_id, plane) in &observation.planes {
                    info!(
                        "PROGRESS ingesting collection=\"{collection}\" observationID=\"{observation_id}\" productID=\"{product_id}\""
                    );
                    let request = prepare_request(
                        collection,
                        observation_id,
                        product_id,
                        observation,
                        plane,
                    )?;
                    let built = self
                        .builder
                        .build(handle.take_record(), &request)
                        .map_err(|err| {
                            IngestError::reconciliation(
                                observation_id,
                                format!("builder failed for {product_id}: {err:#}"),
                            )
                        })?;
                    handle.replace_record(built);
                    info!("INGESTED: observationID={observation_id} productID=\"{product_id}\"");

                    let record = handle.record_mut();
                    update_time_information(record, product_id, plane);
                    if let Some(stored) = record.planes.get_mut(product_id) {
                        ctx.overrides.apply(stored)?;
                    }
                }

                let removed = remove_stale_planes(handle.record_mut(), stale, observation);
                if let Some(dir) = &self.options.side_output {
                    let path = write_side_output(dir, handle.record_mut())?;
                    debug!(path = %path.display(), "wrote side output");
                }
                Ok((excess, removed))
            })?;

        Ok(ObservationOutcome {
            observation_id: observation_id.to_string(),
            status,
            planes: observation.planes.keys().cloned().collect(),
            removed_planes,
            excess_parts_removed,
        })
    }

    /// Observations holding stale planes that this batch never touched.
    fn sweep(&self, tree: &ResolvedTree, ctx: &mut IngestContext, report: &mut ReconcileReport) {
        let options = AcquireOptions {
            allow_remove: true,
            dry_run: self.options.dry_run,
        };
        for (observation_id, stale) in ctx.stale.drain_remaining() {
            if tree.contains(&observation_id) {
                error!(observation = %observation_id, "current observation still pending removal");
                continue;
            }

            let uri = ObservationUri::new(&ctx.archive.collection, &observation_id);
            let result = process(self.repo, &uri, options, |handle| {
                let mut removed = Vec::new();
                if !handle.existed() {
                    return Ok(removed);
                }
                let record = handle.record_mut();
                for product_id in &stale {
                    if record.planes.remove(product_id).is_some() {
                        warn::emit(WarnEvent {
                            code: "PLANE_REMOVED",
                            stage: "sweep",
                            action: "remove",
                            observation: &observation_id,
                            plane: product_id,
                            reason: "observation no longer produced by this run",
                            ..WarnEvent::default()
                        });
                        removed.push(product_id.clone());
                    }
                }
                Ok(removed)
            });

            match result {
                Ok((removed_planes, status)) => report.swept.push(ObservationOutcome {
                    observation_id,
                    status,
                    planes: Vec::new(),
                    removed_planes,
                    excess_parts_removed: 0,
                }),
                Err(err) => {
                    let kind = classify(&err);
                    error!(observation = %observation_id, kind, "sweep failed: {err:#}");
                    report.failed.push(ObservationFailure {
                        observation_id,
                        phase: "sweep",
                        kind,
                        message: format!("{err:#}"),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::builder::BuiltinBuilder;
    use crate::ingest::caom::{Artifact, Chunk, Part, PlaneRecord, ProductType};
    use crate::ingest::config::ArchiveConfig;
    use crate::ingest::fs_repo::FsRepository;
    use crate::ingest::record::{CustomValue, FileRecord, RUN_ID_KEY};
    use crate::ingest::stale::RunAliasTable;
    use crate::ingest::tree::{SubRecord, TreeBuilder};
    use serde_json::json;

    const RUN: &str = "jac-000000007";

    fn stored_plane(product_id: &str) -> PlaneRecord {
        let mut plane = PlaneRecord::new(product_id);
        plane.provenance_run_id = Some(RUN.to_string());
        let uri = format!("ad:JCMT/{product_id}_old");
        plane
            .artifacts
            .insert(uri.clone(), Artifact::new(uri, ProductType::Science));
        plane
    }

    fn seed(repo: &FsRepository, obsid: &str, products: &[&str]) {
        let uri = ObservationUri::new("JCMT", obsid);
        process(repo, &uri, AcquireOptions::default(), |handle| {
            for product in products {
                handle
                    .record_mut()
                    .planes
                    .insert(product.to_string(), stored_plane(product));
            }
            Ok(())
        })
        .expect("seed");
    }

    fn file_record(obsid: &str, product: &str, file: &str) -> FileRecord {
        let mut record = FileRecord {
            observation_id: obsid.to_string(),
            product_id: product.to_string(),
            uri: format!("ad:JCMT/{file}"),
            local_path: PathBuf::from(format!("/in/{file}.sdf")),
            ..FileRecord::default()
        };
        record
            .plane_fields
            .insert(RUN_ID_KEY.to_string(), RUN.to_string());
        record
            .plane_fields
            .insert(ALGORITHM_KEY.to_string(), "custom".to_string());
        record
    }

    fn resolve(
        ctx: &mut IngestContext,
        repo: &FsRepository,
        records: &[FileRecord],
    ) -> ResolvedTree {
        let mut builder = TreeBuilder::new(false);
        for record in records {
            builder.merge(record, &BTreeSet::new()).expect("merge");
        }
        let (tree, _) = builder
            .finish()
            .resolve_deferred_inputs(&mut ctx.cache, repo)
            .expect("resolve");
        tree
    }

    #[test]
    fn stale_planes_of_the_run_are_removed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = FsRepository::new(tmp.path(), "JCMT");
        seed(&repo, "o", &["A", "B", "C"]);

        let mut ctx = IngestContext::new(ArchiveConfig::default(), RunAliasTable::default());
        ctx.stale.track_run(RUN, &repo).expect("track");
        let tree = resolve(&mut ctx, &repo, &[file_record("o", "A", "a_new")]);

        let reconciler = Reconciler::new(&repo, &BuiltinBuilder, ReconcileOptions {
            excess_parts: 50,
            ..ReconcileOptions::default()
        });
        let report = reconciler.run(&tree, &mut ctx);
        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert_eq!(report.committed[0].removed_planes, ["B", "C"]);

        let stored = repo
            .load(&ObservationUri::new("JCMT", "o"))
            .expect("load")
            .expect("exists");
        assert_eq!(stored.planes.keys().collect::<Vec<_>>(), ["A"]);
        assert!(stored.planes["A"].artifacts.contains_key("ad:JCMT/a_new"));
    }

    #[test]
    fn sweep_removes_wholly_stale_observations() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = FsRepository::new(tmp.path(), "JCMT");
        seed(&repo, "current", &["A"]);
        seed(&repo, "retired", &["X", "Y"]);

        let mut ctx = IngestContext::new(ArchiveConfig::default(), RunAliasTable::default());
        ctx.stale.track_run(RUN, &repo).expect("track");
        let tree = resolve(&mut ctx, &repo, &[file_record("current", "A", "a")]);

        let report = Reconciler::new(&repo, &BuiltinBuilder, ReconcileOptions {
            excess_parts: 50,
            ..ReconcileOptions::default()
        })
        .run(&tree, &mut ctx);

        assert_eq!(report.swept.len(), 1);
        assert_eq!(report.swept[0].status, CommitOutcome::Deleted);
        assert!(
            repo.load(&ObservationUri::new("JCMT", "retired"))
                .expect("load")
                .is_none()
        );
        assert!(
            repo.load(&ObservationUri::new("JCMT", "current"))
                .expect("load")
                .is_some()
        );
    }

    #[test]
    fn dry_run_computes_without_writing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = FsRepository::new(tmp.path().join("repo"), "JCMT");
        let mut ctx = IngestContext::new(ArchiveConfig::default(), RunAliasTable::default());
        let tree = resolve(&mut ctx, &repo, &[file_record("o", "A", "a")]);

        let side = tmp.path().join("side");
        let report = Reconciler::new(&repo, &BuiltinBuilder, ReconcileOptions {
            dry_run: true,
            excess_parts: 50,
            side_output: Some(side.clone()),
        })
        .run(&tree, &mut ctx);

        assert_eq!(report.committed[0].status, CommitOutcome::DryRun);
        assert!(repo.load(&ObservationUri::new("JCMT", "o")).expect("load").is_none());
        assert!(side.join("o.json").exists());
    }

    #[test]
    fn one_failing_observation_does_not_stop_the_rest() {
        struct FailOn(&'static str);
        impl RecordBuilder for FailOn {
            fn build(
                &self,
                existing: Option<ObservationRecord>,
                request: &BuildRequest,
            ) -> Result<ObservationRecord> {
                if request.observation_id == self.0 {
                    anyhow::bail!("cannot read file");
                }
                BuiltinBuilder.build(existing, request)
            }
        }

        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = FsRepository::new(tmp.path(), "JCMT");
        let mut ctx = IngestContext::new(ArchiveConfig::default(), RunAliasTable::default());
        let tree = resolve(
            &mut ctx,
            &repo,
            &[file_record("bad", "A", "x"), file_record("good", "A", "y")],
        );
        let report = Reconciler::new(&repo, &FailOn("bad"), ReconcileOptions {
            excess_parts: 50,
            ..ReconcileOptions::default()
        })
        .run(&tree, &mut ctx);

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].kind, "reconciliation");
        assert_eq!(report.committed.len(), 1);
        assert!(repo.load(&ObservationUri::new("JCMT", "bad")).expect("load").is_none());
    }

    #[test]
    fn members_and_inputs_are_substituted_sorted() {
        let mut observation = Observation::default();
        observation
            .memberset
            .insert(ObservationUri::new("JCMT", "b"));
        observation
            .memberset
            .insert(ObservationUri::new("JCMT", "a"));
        let mut plane = Plane::default();
        plane
            .uri_to_path
            .insert("ad:JCMT/f".to_string(), PathBuf::from("/in/f"));
        plane
            .fields
            .insert(ALGORITHM_KEY.to_string(), "custom".to_string());
        plane
            .fields
            .insert(PROVENANCE_NAME_KEY.to_string(), "jsa".to_string());
        plane
            .inputset
            .insert(crate::ingest::uri::PlaneUri::new("JCMT", "a", "raw-1"));
        observation.planes.insert("p".to_string(), plane.clone());

        let request = prepare_request("JCMT", "o", "p", &observation, &plane).expect("request");
        assert_eq!(request.general[MEMBERS_KEY], "caom:JCMT/a caom:JCMT/b");
        assert_eq!(request.general[PROVENANCE_INPUTS_KEY], "caom:JCMT/a/raw-1");

        plane
            .fields
            .insert(ALGORITHM_KEY.to_string(), EXPOSURE_ALGORITHM.to_string());
        plane
            .fields
            .insert(MEMBERS_KEY.to_string(), "caom:JCMT/stale".to_string());
        plane.inputset.clear();
        plane
            .fields
            .insert(PROVENANCE_INPUTS_KEY.to_string(), "caom:JCMT/x/y".to_string());
        let request = prepare_request("JCMT", "o", "p", &observation, &plane).expect("request");
        assert!(!request.general.contains_key(MEMBERS_KEY));
        assert!(!request.general.contains_key(PROVENANCE_INPUTS_KEY));
    }

    #[test]
    fn density_uses_extent_area_for_peak_catalogues() {
        let mut observation = Observation::default();
        let mut extent = Plane::default();
        extent
            .custom_fields
            .insert(AREA_COVERED_KEY.to_string(), CustomValue::Number(4.0));
        let mut peak = Plane::default();
        peak.uri_to_path
            .insert("ad:JCMT/peak".to_string(), PathBuf::from("/in/peak"));
        peak.custom_fields
            .insert(SOURCE_COUNT_KEY.to_string(), CustomValue::Number(10.0));
        observation.planes.insert("extent-850".to_string(), extent.clone());
        observation.planes.insert("peak-850".to_string(), peak.clone());

        let request =
            prepare_request("JCMT", "o", "peak-850", &observation, &peak).expect("request");
        assert_eq!(request.general[SOURCE_DENSITY_KEY], "2.5");

        let mut moc = Plane::default();
        moc.uri_to_path
            .insert("ad:JCMT/moc".to_string(), PathBuf::from("/in/moc"));
        moc.custom_fields
            .insert(AREA_COVERED_KEY.to_string(), CustomValue::Number(4.0));
        let request = prepare_request("JCMT", "o", "tile", &observation, &moc).expect("request");
        assert_eq!(request.general[SOURCE_DENSITY_KEY], "0");

        let orphan = Plane {
            custom_fields: [(SOURCE_COUNT_KEY.to_string(), CustomValue::Number(3.0))]
                .into_iter()
                .collect(),
            ..moc.clone()
        };
        let request = prepare_request("JCMT", "o", "lonely", &Observation::default(), &orphan)
            .expect("request");
        assert!(!request.general.contains_key(SOURCE_DENSITY_KEY));
    }

    #[test]
    fn plane_without_files_is_structural() {
        let err = prepare_request("JCMT", "o", "p", &Observation::default(), &Plane::default())
            .unwrap_err();
        assert_eq!(classify(&err), "structural");
    }

    #[test]
    fn time_axis_is_added_to_positioned_data_chunks() {
        let mut record = ObservationRecord::new("JCMT", "o");
        record.algorithm = "custom".to_string();
        record.members = vec!["caom:JCMT/a".to_string(), "caom:JCMT/b".to_string()];
        let mut stored = PlaneRecord::new("p");
        let mut artifact = Artifact::new("ad:JCMT/f", ProductType::Science);
        artifact.parts.insert(
            "0".to_string(),
            Part {
                product_type: ProductType::Science,
                chunks: vec![Chunk {
                    position: Some(json!("wcs")),
                    ..Chunk::default()
                }],
            },
        );
        artifact.parts.insert(
            "1".to_string(),
            Part {
                product_type: ProductType::Preview,
                chunks: vec![Chunk {
                    position: Some(json!("wcs")),
                    ..Chunk::default()
                }],
            },
        );
        stored.artifacts.insert("ad:JCMT/f".to_string(), artifact);
        record.planes.insert("p".to_string(), stored);

        let mut plane = Plane::default();
        let mut sub = SubRecord::default();
        sub.custom.insert(
            "caom:JCMT/b".to_string(),
            CustomValue::Interval { start: 5.0, end: 6.0 },
        );
        sub.custom.insert(
            "caom:JCMT/a".to_string(),
            CustomValue::Interval { start: 1.0, end: 2.0 },
        );
        plane.sub_records.insert("ad:JCMT/f".to_string(), sub);

        update_time_information(&mut record, "p", &plane);
        let stored = &record.planes["p"];
        let axis = stored.artifacts["ad:JCMT/f"].parts["0"].chunks[0]
            .time
            .as_ref()
            .expect("time axis");
        assert_eq!(axis.timesys, "UTC");
        assert_eq!(
            axis.samples,
            [TimeRange { start: 1.0, end: 2.0 }, TimeRange { start: 5.0, end: 6.0 }]
        );
        assert!(stored.artifacts["ad:JCMT/f"].parts["1"].chunks[0].time.is_none());
        assert_eq!(stored.time_bounds, Some(TimeRange { start: 1.0, end: 6.0 }));
    }
}
