use crate::error::IngestError;
use crate::ingest::cache::{CrossReferenceQuery, Lookup, MemberRef};
use crate::ingest::context::IngestContext;
use crate::ingest::record::{
    ALGORITHM_KEY, CustomValue, EXPOSURE_ALGORITHM, FileRecord, OBS_META_RELEASE_KEY,
    PLANE_DATA_RELEASE_KEY, PLANE_META_RELEASE_KEY, RUN_ID_KEY, RawFileRecord, RunIdValue,
    compare_release,
};
use crate::ingest::uri::{self, ObservationUri, PlaneUri};
use anyhow::Result;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// A record ready for merging plus the provenance files it could not
/// resolve yet.
#[derive(Debug, Clone)]
pub struct LinkedRecord {
    pub file_id: String,
    pub record: FileRecord,
    pub pending_files: BTreeSet<String>,
}

/// Canonical form of a processing run id.
///
/// `jac-<n>` is zero-padded to nine digits, hexadecimal ids become decimal
/// strings, integers are printed as-is and any other text is kept.
pub fn normalize_run_id(value: &RunIdValue) -> Option<String> {
    match value {
        RunIdValue::Integer(n) => Some(n.to_string()),
        RunIdValue::Text(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return None;
            }
            if let Some(job) = raw.strip_prefix("jac-") {
                if let Ok(job) = job.parse::<u64>() {
                    return Some(format!("jac-{job:09}"));
                }
            }
            if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
                return u64::from_str_radix(hex, 16).ok().map(|n| n.to_string());
            }
            Some(raw.to_string())
        }
    }
}

fn member_refs(raw: &RawFileRecord, file: &str, raw_collection: &str) -> Result<Vec<MemberRef>> {
    if let Some(mbr) = &raw.mbr {
        let mut refs = Vec::with_capacity(mbr.len());
        for value in mbr {
            let parsed =
                ObservationUri::parse(value).filter(|parsed| parsed.collection == raw_collection);
            let Some(parsed) = parsed else {
                return Err(IngestError::structural(
                    file,
                    "mbr",
                    format!(
                        "{value} must point to an observation in the {raw_collection} collection"
                    ),
                )
                .into());
            };
            refs.push(MemberRef::Observation(parsed.observation_id));
        }
        return Ok(refs);
    }

    Ok(raw
        .obs
        .iter()
        .flatten()
        .map(|value| MemberRef::RawPlane(value.trim().to_string()))
        .collect())
}

/// Turn an extracted descriptor into a mergeable `FileRecord`, resolving
/// membership and provenance through the run's cache and registering the
/// file's run id with the stale-entry tracker.
pub fn link_record(
    raw: &RawFileRecord,
    ctx: &mut IngestContext,
    query: &dyn CrossReferenceQuery,
) -> Result<LinkedRecord> {
    let file = raw.local_path.display().to_string();
    let file_id = raw
        .file_id
        .clone()
        .unwrap_or_else(|| uri::make_file_id(&raw.local_path));

    let mut record = FileRecord {
        observation_id: raw.observation_id.clone().unwrap_or_default(),
        product_id: raw.product_id.clone().unwrap_or_default(),
        uri: raw
            .uri
            .clone()
            .unwrap_or_else(|| uri::file_uri(&ctx.archive.archive, &file_id)),
        local_path: raw.local_path.clone(),
        plane_fields: raw.plane.clone(),
        plane_custom_fields: raw.plane_custom.clone(),
        sub_record_fields: raw.sections.clone(),
        sub_record_custom_fields: raw.section_custom.clone(),
        ..FileRecord::default()
    };
    let mut pending_files = BTreeSet::new();

    if !raw.has_content() {
        debug!(file = %file, "descriptor has no metadata");
        return Ok(LinkedRecord {
            file_id,
            record,
            pending_files,
        });
    }

    let algorithm = raw.plane.get(ALGORITHM_KEY).map(String::as_str);
    let raw_collection = ctx.archive.raw_collection.clone();

    let mut latest_release: Option<String> = None;
    for reference in member_refs(raw, &file, &raw_collection)? {
        let member = ctx.cache.resolve_member(&reference, query)?;
        if latest_release
            .as_deref()
            .is_none_or(|latest| compare_release(&member.release, latest) == Ordering::Greater)
        {
            latest_release = Some(member.release.clone());
        }
        if raw.main_product {
            record
                .sub_record_custom_fields
                .entry(record.uri.clone())
                .or_default()
                .entry(member.observation.to_string())
                .or_insert(CustomValue::Interval {
                    start: member.start,
                    end: member.end,
                });
        }
        record.members.insert(member.observation);
    }

    if raw.derive_release {
        let Some(release) = latest_release else {
            return Err(IngestError::structural(
                &file,
                "release",
                "release date could not be calculated from membership",
            )
            .into());
        };
        if algorithm != Some(EXPOSURE_ALGORITHM) {
            record
                .plane_fields
                .insert(OBS_META_RELEASE_KEY.to_string(), release.clone());
        }
        record
            .plane_fields
            .insert(PLANE_META_RELEASE_KEY.to_string(), release.clone());
        record
            .plane_fields
            .insert(PLANE_DATA_RELEASE_KEY.to_string(), release);
    }

    if !record.observation_id.is_empty() && !record.product_id.is_empty() {
        ctx.cache.register_file(
            file_id.clone(),
            PlaneUri::new(
                &ctx.archive.collection,
                &record.observation_id,
                &record.product_id,
            ),
        );
    }

    if raw.main_product {
        if let Some(inputs) = &raw.inp {
            for value in inputs {
                let Some(input) = PlaneUri::parse(value) else {
                    return Err(IngestError::structural(
                        &file,
                        "inp",
                        format!("{value} is not a plane URI"),
                    )
                    .into());
                };
                record.inputs.insert(input);
            }
        } else if let Some(provenance) = &raw.prv {
            for value in provenance {
                if value.starts_with("oractemp") {
                    warn!(file = %file, input = %value, "provenance contains oractemp file");
                    continue;
                }
                let input_id = uri::make_file_id(value);
                if input_id == file_id {
                    warn!(file = %file, "file includes itself in its provenance");
                    continue;
                }
                match ctx.cache.lookup_file(&input_id) {
                    Lookup::Present(plane) => {
                        record.inputs.insert(plane.clone());
                    }
                    _ => {
                        ctx.pending_files.insert(input_id.clone());
                        pending_files.insert(input_id);
                    }
                }
            }
        }
    }

    let Some(run_id) = raw.run_id.as_ref().and_then(normalize_run_id) else {
        return Err(IngestError::structural(
            &file,
            "run_id",
            "could not determine the processing run id",
        )
        .into());
    };
    ctx.stale.track_run(&run_id, query)?;
    record.plane_fields.insert(RUN_ID_KEY.to_string(), run_id);

    if let Some(count) = raw.part_count {
        ctx.part_counts.record(record.uri.clone(), count);
    }
    if let Some(entry) = &raw.explicit_override {
        ctx.overrides.declare(record.uri.clone(), entry.clone());
    }

    Ok(LinkedRecord {
        file_id,
        record,
        pending_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::cache::RunPlaneRow;
    use crate::ingest::cache::tests::FakeArchive;
    use crate::ingest::config::ArchiveConfig;
    use crate::ingest::overrides::ExplicitOverride;
    use crate::ingest::stale::RunAliasTable;
    use std::path::PathBuf;

    fn context() -> IngestContext {
        IngestContext::new(ArchiveConfig::default(), RunAliasTable::default())
    }

    fn descriptor(file_id: &str) -> RawFileRecord {
        let mut raw = RawFileRecord {
            observation_id: Some("jcmt_obs".to_string()),
            product_id: Some("reduced-850um".to_string()),
            file_id: Some(file_id.to_string()),
            main_product: true,
            run_id: Some(RunIdValue::Text("jac-42".to_string())),
            local_path: PathBuf::from(format!("/in/{file_id}.fits")),
            ..RawFileRecord::default()
        };
        raw.plane
            .insert(ALGORITHM_KEY.to_string(), "custom".to_string());
        raw
    }

    #[test]
    fn run_ids_normalise() {
        let text = |raw: &str| normalize_run_id(&RunIdValue::Text(raw.to_string()));
        assert_eq!(text("jac-42").as_deref(), Some("jac-000000042"));
        assert_eq!(text("0x1F").as_deref(), Some("31"));
        assert_eq!(text("0xzz"), None);
        assert_eq!(text("legacy-run").as_deref(), Some("legacy-run"));
        assert_eq!(text("  "), None);
        assert_eq!(normalize_run_id(&RunIdValue::Integer(77)).as_deref(), Some("77"));
    }

    #[test]
    fn members_set_release_and_time_intervals() {
        let archive = FakeArchive::default()
            .with_raw_observation("raw_a", &["a0"])
            .with_raw_observation("raw_b", &["b0", "b1"]);
        let mut ctx = context();
        let mut raw = descriptor("f1");
        raw.derive_release = true;
        raw.obs = Some(vec!["raw_a_1".to_string(), "raw_b_2".to_string(), "raw_b_3".to_string()]);

        let linked = link_record(&raw, &mut ctx, &archive).expect("link");
        let record = linked.record;
        assert_eq!(record.members.len(), 2);
        assert_eq!(record.plane_fields[PLANE_DATA_RELEASE_KEY], "2014-01-01T00:00:00.000");
        assert_eq!(record.plane_fields[OBS_META_RELEASE_KEY], "2014-01-01T00:00:00.000");
        assert_eq!(record.plane_fields[RUN_ID_KEY], "jac-000000042");
        let intervals = &record.sub_record_custom_fields["ad:JCMT/f1"];
        assert_eq!(
            intervals["caom:JCMT/raw_b"],
            CustomValue::Interval { start: 56_000.0, end: 56_000.5 }
        );
        assert_eq!(archive.call_count("obs:"), 2);
    }

    #[test]
    fn exposures_do_not_set_observation_release() {
        let archive = FakeArchive::default().with_raw_observation("raw_a", &["a0"]);
        let mut ctx = context();
        let mut raw = descriptor("f1");
        raw.plane
            .insert(ALGORITHM_KEY.to_string(), EXPOSURE_ALGORITHM.to_string());
        raw.derive_release = true;
        raw.mbr = Some(vec!["caom:JCMT/raw_a".to_string()]);

        let record = link_record(&raw, &mut ctx, &archive).expect("link").record;
        assert!(!record.plane_fields.contains_key(OBS_META_RELEASE_KEY));
        assert!(record.plane_fields.contains_key(PLANE_META_RELEASE_KEY));
    }

    #[test]
    fn mbr_dominates_obs_and_must_be_raw() {
        let archive = FakeArchive::default().with_raw_observation("raw_a", &["a0"]);
        let mut ctx = context();
        let mut raw = descriptor("f1");
        raw.mbr = Some(vec!["caom:JCMT/raw_a".to_string()]);
        raw.obs = Some(vec!["unknown_9".to_string()]);
        let record = link_record(&raw, &mut ctx, &archive).expect("link").record;
        assert_eq!(record.members.len(), 1);
        assert_eq!(archive.call_count("obs:unknown"), 0);

        raw.mbr = Some(vec!["caom:SANDBOX/raw_a".to_string()]);
        let err = link_record(&raw, &mut ctx, &archive).unwrap_err();
        assert_eq!(crate::error::classify(&err), "structural");
    }

    #[test]
    fn unknown_member_is_fatal() {
        let archive = FakeArchive::default();
        let mut ctx = context();
        let mut raw = descriptor("f1");
        raw.obs = Some(vec!["ghost_1".to_string()]);
        let err = link_record(&raw, &mut ctx, &archive).unwrap_err();
        assert_eq!(crate::error::classify(&err), "unresolved-member");
    }

    #[test]
    fn derived_release_without_members_is_structural() {
        let archive = FakeArchive::default();
        let mut ctx = context();
        let mut raw = descriptor("f1");
        raw.derive_release = true;
        let err = link_record(&raw, &mut ctx, &archive).unwrap_err();
        assert!(err.to_string().contains("release date"));
    }

    #[test]
    fn provenance_files_resolve_or_wait() {
        let archive = FakeArchive::default();
        let mut ctx = context();
        let first = descriptor("earlier");
        link_record(&first, &mut ctx, &archive).expect("link first");

        let mut raw = descriptor("later");
        raw.product_id = Some("cube-850um".to_string());
        raw.prv = Some(
            ["earlier.sdf", "oractemp123", "later.fits", "not_seen_yet.sdf"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        );
        let linked = link_record(&raw, &mut ctx, &archive).expect("link");
        assert_eq!(
            linked.record.inputs.iter().map(ToString::to_string).collect::<Vec<_>>(),
            ["caom:JCMT/jcmt_obs/reduced-850um"]
        );
        assert_eq!(linked.pending_files.iter().collect::<Vec<_>>(), ["not_seen_yet"]);
        assert!(ctx.pending_files.contains("not_seen_yet"));
    }

    #[test]
    fn inp_dominates_prv_and_rejects_garbage() {
        let archive = FakeArchive::default();
        let mut ctx = context();
        let mut raw = descriptor("f1");
        raw.inp = Some(vec!["caom:JCMT/o/p".to_string()]);
        raw.prv = Some(vec!["other.sdf".to_string()]);
        let linked = link_record(&raw, &mut ctx, &archive).expect("link");
        assert_eq!(linked.record.inputs.len(), 1);
        assert!(linked.pending_files.is_empty());

        raw.inp = Some(vec!["not a uri".to_string()]);
        assert!(link_record(&raw, &mut ctx, &archive).is_err());
    }

    #[test]
    fn run_id_is_required_and_tracked_once() {
        let mut archive = FakeArchive::default();
        archive.runs.insert(
            "jac-000000042".to_string(),
            vec![RunPlaneRow {
                observation_id: "jcmt_obs".to_string(),
                product_id: "old".to_string(),
            }],
        );
        let mut ctx = context();
        link_record(&descriptor("f1"), &mut ctx, &archive).expect("link");
        link_record(&descriptor("f2"), &mut ctx, &archive).expect("link");
        assert_eq!(archive.call_count("run:"), 1);
        assert!(ctx.stale.contains("jcmt_obs"));

        let mut raw = descriptor("f3");
        raw.run_id = None;
        assert!(link_record(&raw, &mut ctx, &archive).is_err());
    }

    #[test]
    fn part_counts_and_overrides_are_recorded() {
        let archive = FakeArchive::default();
        let mut ctx = context();
        let mut raw = descriptor("f1");
        raw.part_count = Some(3);
        raw.explicit_override = Some(ExplicitOverride::default());
        link_record(&raw, &mut ctx, &archive).expect("link");
        assert_eq!(ctx.part_counts.get("ad:JCMT/f1"), Some(3));
        assert!(ctx.overrides.get("ad:JCMT/f1").is_some());
    }
}
