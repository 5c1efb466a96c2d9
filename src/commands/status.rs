use anyhow::Result;

use crate::commands::CommandReport;
use crate::env_loader::known_env_keys;
use crate::ingest::config::{load_config, resolve_config_path, validate};
use crate::ingest::paths::resolve_paths;

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");

    report.detail(format!("build_id={}", env!("BUILD_UUID")));
    report.detail(format!("ingest_home={}", paths.ingest_home.display()));
    report.detail(format!("logs_dir={}", paths.logs_dir.display()));
    report.detail(format!("work_dir={}", paths.work_dir.display()));

    let config_path = resolve_config_path(&paths);
    report.detail(format!(
        "config_path={} exists={}",
        config_path.display(),
        config_path.is_file()
    ));

    match load_config(&paths) {
        Ok(cfg) => {
            report.detail(format!("archive={}", cfg.archive.archive));
            report.detail(format!("collection={}", cfg.archive.collection));
            report.detail(format!("raw_collection={}", cfg.archive.raw_collection));
            report.detail(format!(
                "input_collections={}",
                cfg.archive.input_collections.join(",")
            ));
            report.detail(format!("repository_kind={}", cfg.repository.kind));
            if cfg.repository.kind == "fs" {
                report.detail(format!(
                    "repository_root={}",
                    cfg.repository_root(&paths).display()
                ));
            }
            if let Some(url) = &cfg.repository.base_url {
                report.detail(format!("repository_url={url}"));
            }
            report.detail(format!("query_kind={}", cfg.query.kind));
            report.detail(format!("builder_mode={}", cfg.builder.mode));
            if cfg.builder.mode == "command" {
                report.detail(format!("builder_bin={}", cfg.builder.bin));
            }
            report.detail(format!("excess_parts={}", cfg.ingest.excess_parts));
            if let Err(err) = validate(&cfg) {
                report.issue(format!("invalid config: {err}"));
            }
        }
        Err(err) => report.issue(format!("failed to load config: {err:#}")),
    }

    let set = known_env_keys()
        .into_iter()
        .filter(|(_, present)| *present)
        .map(|(key, _)| key)
        .collect::<Vec<_>>();
    report.detail(format!(
        "env_set={}",
        if set.is_empty() { "none".to_string() } else { set.join(",") }
    ));

    Ok(report)
}
