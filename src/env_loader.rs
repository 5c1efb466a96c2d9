use std::env;
use std::path::PathBuf;

include!(concat!(env!("OUT_DIR"), "/ingest_env_allowlist.rs"));

fn fallback_dotenv_path(
    ingest_home: Option<PathBuf>,
    home_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    match ingest_home {
        Some(base) => Some(base.join(".env")),
        None => Some(home_dir?.join(".jsaingest/.env")),
    }
}

pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("INGEST_HOME").map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}

/// Every `INGEST_*` variable the binary reads, paired with whether it is
/// currently set in the environment.
pub fn known_env_keys() -> Vec<(&'static str, bool)> {
    GENERATED_INGEST_ENV_ALLOWLIST
        .iter()
        .map(|key| (*key, env::var_os(key).is_some()))
        .collect()
}
