use crate::ingest::cache::CrossReferenceQuery;
use anyhow::{Context, Result, anyhow};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Historical identifiers of processing runs, keyed by current run id.
#[derive(Debug, Clone, Default)]
pub struct RunAliasTable {
    aliases: BTreeMap<String, Vec<String>>,
}

impl RunAliasTable {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Lines of `<old run id> <job number> <tag>`; `#` starts a comment.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut table = Self::default();
        for (index, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(old_run), Some(job)) = (fields.next(), fields.next()) else {
                return Err(anyhow!("line {}: expected `<run id> <job> <tag>`", index + 1));
            };
            let job: u64 = job
                .parse()
                .map_err(|_| anyhow!("line {}: job number `{job}` is not an integer", index + 1))?;
            table.insert(format!("jac-{job:09}"), old_run);
        }
        Ok(table)
    }

    pub fn insert(&mut self, run_id: impl Into<String>, alias: impl Into<String>) {
        let alias = alias.into();
        let entry = self.aliases.entry(run_id.into()).or_default();
        if !entry.contains(&alias) {
            entry.push(alias);
        }
    }

    pub fn aliases(&self, run_id: &str) -> &[String] {
        self.aliases.get(run_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }
}

/// Planes that earlier executions of a run produced, pending removal unless
/// the current batch regenerates them.
#[derive(Debug, Default)]
pub struct StaleEntryTracker {
    collection: String,
    aliases: RunAliasTable,
    checked_runs: BTreeSet<String>,
    candidates: BTreeMap<String, BTreeSet<String>>,
}

impl StaleEntryTracker {
    pub fn new(collection: impl Into<String>, aliases: RunAliasTable) -> Self {
        Self {
            collection: collection.into(),
            aliases,
            checked_runs: BTreeSet::new(),
            candidates: BTreeMap::new(),
        }
    }

    /// Ask the archive once per run id (and its aliases) which planes it holds.
    pub fn track_run(&mut self, run_id: &str, query: &dyn CrossReferenceQuery) -> Result<()> {
        if !self.checked_runs.insert(run_id.to_string()) {
            return Ok(());
        }

        let mut run_ids = vec![run_id.to_string()];
        run_ids.extend(self.aliases.aliases(run_id).iter().cloned());

        let rows = query
            .planes_with_run_ids(&self.collection, &run_ids)
            .with_context(|| format!("run id query failed for {}", run_ids.join(",")))?;
        debug!(run = run_id, planes = rows.len(), "tracked run");
        for row in rows {
            self.candidates
                .entry(row.observation_id)
                .or_default()
                .insert(row.product_id);
        }
        Ok(())
    }

    pub fn checked_runs(&self) -> usize {
        self.checked_runs.len()
    }

    pub fn pending_observations(&self) -> usize {
        self.candidates.len()
    }

    pub fn contains(&self, observation_id: &str) -> bool {
        self.candidates.contains_key(observation_id)
    }

    /// Take the candidate planes of one observation, leaving none behind.
    pub fn consume_for_observation(&mut self, observation_id: &str) -> BTreeSet<String> {
        self.candidates.remove(observation_id).unwrap_or_default()
    }

    /// Everything never consumed: observations this batch did not touch.
    pub fn drain_remaining(&mut self) -> BTreeMap<String, BTreeSet<String>> {
        for (observation_id, planes) in &self.candidates {
            for plane in planes {
                info!(observation = %observation_id, plane = %plane, "stale candidate");
            }
        }
        std::mem::take(&mut self.candidates)
    }
}
