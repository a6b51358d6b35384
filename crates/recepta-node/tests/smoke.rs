//! Process-level smoke tests for the node binary: documented exit codes for
//! configuration and store failures.
//!
//! Run with:
//!   cargo test -p recepta-node --test smoke

use std::process::Command;

fn node() -> Command {
    Command::new(env!("CARGO_BIN_EXE_recepta-node"))
}

#[test]
fn missing_config_exits_one() {
    let data_dir = tempfile::tempdir().unwrap();
    let status = node()
        .args([
            "--config",
            "/nonexistent/recepta.json",
            "--data-dir",
            data_dir.path().to_str().unwrap(),
        ])
        .status()
        .expect("spawn node");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn malformed_config_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.json");
    std::fs::write(&config, "{not json").unwrap();
    let status = node()
        .args([
            "--config",
            config.to_str().unwrap(),
            "--data-dir",
            dir.path().join("data").to_str().unwrap(),
        ])
        .status()
        .expect("spawn node");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn unknown_flag_exits_one() {
    let status = node().arg("--definitely-not-a-flag").status().expect("spawn node");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn unusable_data_dir_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.json");
    std::fs::write(&config, "{}").unwrap();
    // A plain file where the data directory should be.
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, "").unwrap();
    let status = node()
        .args([
            "--config",
            config.to_str().unwrap(),
            "--data-dir",
            blocked.to_str().unwrap(),
        ])
        .status()
        .expect("spawn node");
    assert_eq!(status.code(), Some(2));
}
