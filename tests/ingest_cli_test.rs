use predicates::prelude::*;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn jsaingest(home: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("jsaingest");
    cmd.current_dir(home)
        .env("INGEST_HOME", home)
        .env("INGEST_CONFIG_PATH", home.join("ingest.toml"))
        .env("INGEST_LOG", "warn")
        .env_remove("INGEST_COLLECTION")
        .env_remove("INGEST_PREFIX")
        .env_remove("INGEST_REPOSITORY_ROOT");
    cmd
}

fn repository_file(home: &Path, collection: &str, observation_id: &str) -> PathBuf {
    home.join("repository")
        .join(collection)
        .join(format!("{observation_id}.json"))
}

fn seed_raw_observation(home: &Path, observation_id: &str, file: &str) {
    let path = repository_file(home, "JCMT", observation_id);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir repository");
    let uri = format!("ad:JCMT/{file}");
    let mut artifacts = serde_json::Map::new();
    artifacts.insert(uri.clone(), json!({"uri": uri, "product_type": "science"}));
    let record = json!({
        "collection": "JCMT",
        "observation_id": observation_id,
        "algorithm": "exposure",
        "planes": {
            "raw-850": {
                "product_id": "raw-850",
                "data_release": "2015-03-01T00:00:00",
                "provenance_run_id": "raw-run",
                "time_bounds": {"start": 57000.25, "end": 57000.5},
                "artifacts": artifacts
            }
        }
    });
    fs::write(&path, serde_json::to_vec_pretty(&record).expect("json")).expect("seed raw");
}

fn write_descriptor(indir: &Path, file_id: &str, body: Value) {
    fs::create_dir_all(indir).expect("mkdir indir");
    fs::write(indir.join(format!("{file_id}.sdf")), b"SIMPLE").expect("write data");
    fs::write(
        indir.join(format!("{file_id}.sdf.meta.json")),
        serde_json::to_vec_pretty(&body).expect("json"),
    )
    .expect("write descriptor");
}

fn composite_descriptor(member: &str) -> Value {
    json!({
        "observation_id": "comp-1",
        "product_id": "reduced-850",
        "main_product": true,
        "derive_release": true,
        "mbr": [format!("caom:JCMT/{member}")],
        "run_id": "jac-3",
        "plane": {"algorithm.name": "custom", "plane.calibrationLevel": "2"}
    })
}

#[test]
fn status_reports_paths_and_environment() {
    let tmp = tempdir().expect("tempdir");
    jsaingest(tmp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("ingest_home="))
        .stdout(predicate::str::contains("collection=JCMT"))
        .stdout(predicate::str::contains("INGEST_HOME"));
}

#[test]
fn ingest_writes_composite_with_resolved_member_and_release() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    seed_raw_observation(home, "raw-1", "a20150301_00001_850");
    let indir = home.join("in");
    write_descriptor(&indir, "jcmts_comp_850", composite_descriptor("raw-1"));

    jsaingest(home)
        .arg("ingest")
        .arg("--indir")
        .arg(&indir)
        .assert()
        .success()
        .stdout(predicate::str::contains("observation=comp-1 status=written"));

    let stored: Value = serde_json::from_slice(
        &fs::read(repository_file(home, "JCMT", "comp-1")).expect("stored record"),
    )
    .expect("parse stored");
    assert_eq!(stored["members"], json!(["caom:JCMT/raw-1"]));
    let plane = &stored["planes"]["reduced-850"];
    assert_eq!(plane["data_release"], "2015-03-01T00:00:00");
    assert_eq!(plane["provenance_run_id"], "jac-000000003");
    assert!(plane["artifacts"]["ad:JCMT/jcmts_comp_850"].is_object());

    let audit = fs::read_to_string(home.join("logs/audit.log")).expect("audit log");
    assert!(audit.contains("\"observation\":\"comp-1\""));
}

#[test]
fn dry_run_leaves_repository_untouched_and_writes_side_output() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    seed_raw_observation(home, "raw-1", "a20150301_00001_850");
    let indir = home.join("in");
    let side = home.join("side");
    write_descriptor(&indir, "jcmts_comp_850", composite_descriptor("raw-1"));

    let output = jsaingest(home)
        .arg("ingest")
        .arg("--json")
        .arg("--dry-run")
        .arg("--indir")
        .arg(&indir)
        .arg("--xmloutdir")
        .arg(&side)
        .output()
        .expect("run");
    assert!(output.status.success());
    let report: Value = serde_json::from_slice(&output.stdout).expect("json report");
    assert_eq!(report["command"], "ingest");
    assert_eq!(report["ok"], true);

    assert!(!repository_file(home, "JCMT", "comp-1").exists());
    assert!(side.join("comp-1.json").exists());
}

#[test]
fn check_fails_on_unresolvable_member() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    let indir = home.join("in");
    write_descriptor(&indir, "jcmts_comp_850", composite_descriptor("missing"));

    jsaingest(home)
        .arg("check")
        .arg("--indir")
        .arg(&indir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("membership reference missing"));
}

#[test]
fn check_reports_batch_without_writing() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    seed_raw_observation(home, "raw-1", "a20150301_00001_850");
    let indir = home.join("in");
    write_descriptor(&indir, "jcmts_comp_850", composite_descriptor("raw-1"));
    fs::write(indir.join("empty.sdf"), b"").expect("empty data");
    fs::write(indir.join("empty.sdf.meta.json"), b"{}").expect("empty descriptor");

    jsaingest(home)
        .arg("check")
        .arg("--indir")
        .arg(&indir)
        .assert()
        .success()
        .stdout(predicate::str::contains("observations=1"))
        .stdout(predicate::str::contains("skipped_files=1"));
    assert!(!repository_file(home, "JCMT", "comp-1").exists());
}

#[test]
fn external_collection_requires_prefix() {
    let tmp = tempdir().expect("tempdir");
    let indir = tmp.path().join("in");
    fs::create_dir_all(&indir).expect("mkdir indir");

    jsaingest(tmp.path())
        .arg("ingest")
        .arg("--indir")
        .arg(&indir)
        .arg("--collection")
        .arg("JCMTLS")
        .assert()
        .failure()
        .stderr(predicate::str::contains("prefix"));
}
