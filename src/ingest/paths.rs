use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct IngestPaths {
    pub ingest_home: PathBuf,
    pub logs_dir: PathBuf,
    pub work_dir: PathBuf,
    /// Default root of the file-system repository.
    pub repository_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<IngestPaths> {
    let ingest_home = match env::var("INGEST_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join(".jsaingest"),
    };

    let logs_dir = env_or_default_path("INGEST_LOGS_DIR", ingest_home.join("logs"));
    let work_dir = env_or_default_path("INGEST_WORK_DIR", ingest_home.join("work"));
    let repository_dir = ingest_home.join("repository");

    Ok(IngestPaths {
        ingest_home,
        logs_dir,
        work_dir,
        repository_dir,
    })
}
