#![allow(missing_docs)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn run(dir: &Path, args: &[&str]) -> String {
    let output = cargo_bin_cmd!("ridbag")
        .arg(dir)
        .args(args)
        .env_remove("RIDBAG_CONFIG")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8_lossy(&output).into_owned()
}

fn seed(dir: &Path) {
    for (key, value) in [("1:0:10", "5"), ("1:0:20", "-7"), ("2:3:1", "9")] {
        let out = run(dir, &["put", key, value]);
        assert_eq!(out.trim(), "inserted");
    }
}

#[test]
fn put_get_and_remove_round_trip_through_the_cli() {
    let dir = TempDir::new().expect("tempdir");
    seed(dir.path());

    assert_eq!(run(dir.path(), &["get", "1:0:20"]).trim(), "1:0:20\t-7");
    assert_eq!(run(dir.path(), &["put", "1:0:20", "8"]).trim(), "updated");
    assert_eq!(run(dir.path(), &["remove", "1:0:20"]).trim(), "1:0:20\t8");
    assert_eq!(run(dir.path(), &["get", "1:0:20"]).trim(), "1:0:20\t(absent)");
}

#[test]
fn dump_honours_bounds_direction_and_json_output() {
    let dir = TempDir::new().expect("tempdir");
    seed(dir.path());

    let out = run(dir.path(), &["dump", "--desc"]);
    let keys: Vec<&str> = out
        .lines()
        .filter_map(|line| line.split('\t').next())
        .collect();
    assert_eq!(keys, vec!["2:3:1", "1:0:20", "1:0:10"]);

    let out = run(
        dir.path(),
        &["--format", "json", "dump", "--from", "1:0:15", "--to", "2:0:0"],
    );
    let rows: Vec<Value> = out
        .lines()
        .map(|line| serde_json::from_str(line).expect("json row"))
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["target_position"], 20);
    assert_eq!(rows[0]["value"], -7);
}

#[test]
fn verify_and_stats_report_the_tree() {
    let dir = TempDir::new().expect("tempdir");
    seed(dir.path());

    let out = run(dir.path(), &["verify"]);
    assert!(out.starts_with("ridbag: 3 entries"), "{out}");

    let out = run(dir.path(), &["--format", "json", "stats"]);
    let stats: Value = serde_json::from_str(&out).expect("stats json");
    assert_eq!(stats["trees"][0]["name"], "ridbag");
    assert_eq!(stats["trees"][0]["entries"], 3);
    assert_eq!(stats["trees"][0]["first_key"], "1:0:10");
}

#[test]
fn missing_directory_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("ridbag")
        .arg(dir.path().join("absent"))
        .arg("stats")
        .env_remove("RIDBAG_CONFIG")
        .assert()
        .failure();
}
