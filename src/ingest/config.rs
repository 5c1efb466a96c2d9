use crate::error::IngestError;
use crate::ingest::paths::IngestPaths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const COLLECTIONS: [&str; 4] = ["JCMT", "JCMTLS", "JCMTUSER", "SANDBOX"];

/// Collections fed by external teams; ingesting into them needs a file prefix.
pub const EXTERNAL_COLLECTIONS: [&str; 2] = ["JCMTLS", "JCMTUSER"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Namespace of file URIs: `ad:<archive>/<file_id>`.
    pub archive: String,
    pub collection: String,
    pub raw_collection: String,
    pub input_collections: Vec<String>,
}

fn default_input_collections() -> Vec<String> {
    ["JCMT", "JCMTLS", "JCMTUSER"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            archive: "JCMT".to_string(),
            collection: "JCMT".to_string(),
            raw_collection: "JCMT".to_string(),
            input_collections: default_input_collections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub kind: String,
    pub root: Option<PathBuf>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            kind: "fs".to_string(),
            root: None,
            base_url: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub kind: String,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            kind: "repository".to_string(),
            base_url: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub mode: String,
    pub bin: String,
    pub timeout_secs: Option<u64>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            mode: "builtin".to_string(),
            bin: "fits2caom2".to_string(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestOptions {
    pub excess_parts: usize,
    pub alias_table: Option<PathBuf>,
    pub prefix: Option<String>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            excess_parts: 50,
            alias_table: None,
            prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestConfig {
    pub archive: ArchiveConfig,
    pub repository: RepositoryConfig,
    pub query: QueryConfig,
    pub builder: BuilderConfig,
    pub ingest: IngestOptions,
}

impl IngestConfig {
    pub fn repository_root(&self, paths: &IngestPaths) -> PathBuf {
        self.repository
            .root
            .clone()
            .unwrap_or_else(|| paths.repository_dir.clone())
    }

    /// Apply command-line choices on top of file and environment settings.
    pub fn with_overrides(
        mut self,
        collection: Option<&str>,
        prefix: Option<&str>,
    ) -> Result<Self> {
        if let Some(collection) = collection {
            self.archive.collection = collection.trim().to_string();
        }
        if let Some(prefix) = prefix {
            self.ingest.prefix = Some(prefix.trim().to_string());
        }
        validate(&self)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialIngestConfig {
    archive: Option<ArchiveConfig>,
    repository: Option<RepositoryConfig>,
    query: Option<QueryConfig>,
    builder: Option<BuilderConfig>,
    ingest: Option<IngestOptions>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_optional_string(var: &str, fallback: Option<String>) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => fallback,
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

fn invalid(detail: impl Into<String>) -> anyhow::Error {
    IngestError::Config(detail.into()).into()
}

pub fn validate(cfg: &IngestConfig) -> Result<()> {
    if cfg.archive.archive.trim().is_empty() {
        return Err(invalid("archive name cannot be empty"));
    }
    if !COLLECTIONS.contains(&cfg.archive.collection.as_str()) {
        return Err(invalid(format!(
            "collection `{}` is not one of {}",
            cfg.archive.collection,
            COLLECTIONS.join(", ")
        )));
    }
    if cfg.archive.raw_collection.trim().is_empty() {
        return Err(invalid("raw collection cannot be empty"));
    }
    match cfg.repository.kind.as_str() {
        "fs" => {}
        "http" if cfg.repository.base_url.is_some() => {}
        "http" => return Err(invalid("http repository requires `base_url`")),
        other => return Err(invalid(format!("repository kind `{other}`: use `fs` or `http`"))),
    }
    match cfg.query.kind.as_str() {
        "repository" => {}
        "http" if cfg.query.base_url.is_some() => {}
        "http" => return Err(invalid("http query service requires `base_url`")),
        other => {
            return Err(invalid(format!(
                "query kind `{other}`: use `repository` or `http`"
            )));
        }
    }
    if cfg.builder.mode != "builtin" && cfg.builder.mode != "command" {
        return Err(invalid("builder mode: use `builtin` or `command`"));
    }
    if cfg.builder.mode == "command" && cfg.builder.bin.trim().is_empty() {
        return Err(invalid("command builder requires `bin`"));
    }
    if cfg.ingest.excess_parts == 0 {
        return Err(invalid("excess part threshold must be >= 1"));
    }
    if EXTERNAL_COLLECTIONS.contains(&cfg.archive.collection.as_str())
        && cfg
            .ingest
            .prefix
            .as_deref()
            .is_none_or(|prefix| prefix.trim().is_empty())
    {
        return Err(invalid(format!(
            "collection {} requires a file name prefix",
            cfg.archive.collection
        )));
    }
    Ok(())
}

pub fn resolve_config_path(paths: &IngestPaths) -> PathBuf {
    if let Ok(custom) = env::var("INGEST_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    paths.ingest_home.join("ingest.toml")
}

fn merge_file_config(base: &mut IngestConfig, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: PartialIngestConfig = toml::from_str(&raw)
        .map_err(|err| invalid(format!("failed to parse {}: {err}", path.display())))?;
    if let Some(archive) = parsed.archive {
        base.archive = archive;
    }
    if let Some(repository) = parsed.repository {
        base.repository = repository;
    }
    if let Some(query) = parsed.query {
        base.query = query;
    }
    if let Some(builder) = parsed.builder {
        base.builder = builder;
    }
    if let Some(ingest) = parsed.ingest {
        base.ingest = ingest;
    }
    Ok(())
}

fn apply_env(cfg: &mut IngestConfig) {
    cfg.archive.archive = env_or_string("INGEST_ARCHIVE", &cfg.archive.archive);
    cfg.archive.collection = env_or_string("INGEST_COLLECTION", &cfg.archive.collection);
    cfg.archive.raw_collection =
        env_or_string("INGEST_RAW_COLLECTION", &cfg.archive.raw_collection);
    cfg.archive.input_collections =
        env_or_csv("INGEST_INPUT_COLLECTIONS", &cfg.archive.input_collections);

    cfg.repository.kind = env_or_string("INGEST_REPOSITORY_KIND", &cfg.repository.kind);
    if let Some(root) = env_or_optional_string("INGEST_REPOSITORY_ROOT", None) {
        cfg.repository.root = Some(PathBuf::from(root));
    }
    cfg.repository.base_url =
        env_or_optional_string("INGEST_REPOSITORY_URL", cfg.repository.base_url.take());
    cfg.repository.timeout_secs =
        env_or_u64("INGEST_HTTP_TIMEOUT_SECS", cfg.repository.timeout_secs);

    cfg.query.kind = env_or_string("INGEST_QUERY_KIND", &cfg.query.kind);
    cfg.query.base_url = env_or_optional_string("INGEST_QUERY_URL", cfg.query.base_url.take());
    cfg.query.timeout_secs = env_or_u64("INGEST_HTTP_TIMEOUT_SECS", cfg.query.timeout_secs);

    cfg.builder.mode = env_or_string("INGEST_BUILDER_MODE", &cfg.builder.mode);
    cfg.builder.bin = env_or_string("INGEST_BUILDER_BIN", &cfg.builder.bin);
    if let Ok(raw) = env::var("INGEST_BUILDER_TIMEOUT_SECS") {
        cfg.builder.timeout_secs = raw.trim().parse::<u64>().ok().filter(|secs| *secs > 0);
    }

    cfg.ingest.excess_parts =
        env_or_u64("INGEST_EXCESS_PARTS", cfg.ingest.excess_parts as u64) as usize;
    if let Some(table) = env_or_optional_string("INGEST_ALIAS_TABLE", None) {
        cfg.ingest.alias_table = Some(PathBuf::from(table));
    }
    cfg.ingest.prefix = env_or_optional_string("INGEST_PREFIX", cfg.ingest.prefix.take());
}

pub fn load_config(paths: &IngestPaths) -> Result<IngestConfig> {
    let mut cfg = IngestConfig::default();
    merge_file_config(&mut cfg, &resolve_config_path(paths))?;
    apply_env(&mut cfg);
    Ok(cfg)
}
