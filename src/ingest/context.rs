use crate::ingest::cache::{CacheSettings, CrossReferenceCache};
use crate::ingest::config::ArchiveConfig;
use crate::ingest::overrides::{ExplicitOverrideStore, PartCountTable};
use crate::ingest::stale::{RunAliasTable, StaleEntryTracker};
use std::collections::BTreeSet;

/// Everything one ingestion run accumulates while linking its records.
///
/// Created once per run and handed by reference to the linker, the deferred
/// resolver and the reconciler. Nothing here outlives the run.
#[derive(Debug)]
pub struct IngestContext {
    pub archive: ArchiveConfig,
    pub cache: CrossReferenceCache,
    pub stale: StaleEntryTracker,
    pub overrides: ExplicitOverrideStore,
    pub part_counts: PartCountTable,
    /// Union of every provenance file id still awaiting the deferred pass.
    pub pending_files: BTreeSet<String>,
}

impl IngestContext {
    pub fn new(archive: ArchiveConfig, aliases: RunAliasTable) -> Self {
        let mut input_collections = archive
            .input_collections
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>();
        input_collections.insert(archive.collection.clone());

        let cache = CrossReferenceCache::new(CacheSettings {
            archive: archive.archive.clone(),
            raw_collection: archive.raw_collection.clone(),
            input_collections,
        });
        let stale = StaleEntryTracker::new(archive.collection.clone(), aliases);
        Self {
            archive,
            cache,
            stale,
            overrides: ExplicitOverrideStore::default(),
            part_counts: PartCountTable::default(),
            pending_files: BTreeSet::new(),
        }
    }
}
