pub mod check;
pub mod ingest;
pub mod status;

use anyhow::Result;
use serde::Serialize;

use crate::ingest::config::{IngestConfig, load_config};
use crate::ingest::paths::{IngestPaths, resolve_paths};

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn merge(&mut self, mut other: CommandReport) {
        self.ok &= other.ok;
        self.details.append(&mut other.details);
        self.issues.append(&mut other.issues);
    }
}

/// Paths plus the validated configuration with command-line choices applied.
pub fn load_run_config(
    collection: Option<&str>,
    prefix: Option<&str>,
) -> Result<(IngestPaths, IngestConfig)> {
    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?.with_overrides(collection, prefix)?;
    Ok((paths, cfg))
}

#[cfg(test)]
mod tests {
    use super::CommandReport;

    #[test]
    fn merge_keeps_failures() {
        let mut report = CommandReport::new("ingest");
        report.detail("scanned=2");
        let mut other = CommandReport::new("sweep");
        other.issue("sweep failed for o1");
        report.merge(other);
        assert!(!report.ok);
        assert_eq!(report.details, ["scanned=2"]);
        assert_eq!(report.issues, ["sweep failed for o1"]);
    }
}
