use assert_fs::prelude::*;
use assert_fs::TempDir;
use std::process::{Command, Output};

/// Integration tests for mirrorsync CLI commands
/// These tests run the actual binary and verify its behavior

fn mirrorsync(args: &[&str], temp_dir: &TempDir) -> Output {
    let base = temp_dir.child("base");
    base.create_dir_all().unwrap();

    Command::new(env!("CARGO_BIN_EXE_mirrorsync"))
        .args(args)
        .env_remove("GITHUB_PAT")
        .env_remove("GITHUB_REPO")
        .env_remove("SYNC_TARGETS")
        .env_remove("EXCLUDE_PATHS")
        .env_remove("SYNC_READY_FILE")
        .env_remove("SYNC_REMOTE_URL")
        .env_remove("SYNC_INTERVAL")
        .env_remove("SYNC_PORT")
        .env_remove("GIT_BRANCH")
        .env_remove("RUST_LOG")
        .env("BASE", base.path())
        .env("HIST_DIR", temp_dir.child("mirror").path())
        .env("GIT_CONFIG_GLOBAL", temp_dir.child("gitconfig").path())
        .output()
        .expect("Failed to execute command")
}

#[test]
fn test_cli_help() {
    let temp_dir = TempDir::new().unwrap();
    let output = mirrorsync(&["--help"], &temp_dir);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);

    // Verify help contains expected commands
    for command in ["run", "daemon", "init", "sync-now", "relink", "track-empty", "status", "doctor"] {
        assert!(stdout.contains(command), "help is missing {}", command);
    }
}

#[test]
fn test_cli_version() {
    let temp_dir = TempDir::new().unwrap();
    let output = mirrorsync(&["--version"], &temp_dir);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("mirrorsync"));
}

#[test]
fn test_doctor_command() {
    let temp_dir = TempDir::new().unwrap();
    let output = mirrorsync(&["doctor"], &temp_dir);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);

    // Verify doctor output contains diagnostic information
    assert!(stdout.contains("System Diagnostics"));
    assert!(stdout.contains("Git Installation"));
    assert!(stdout.contains("Remote not configured"));
    assert!(stdout.contains("Some checks failed"));
}

#[test]
fn test_status_json_before_init() {
    let temp_dir = TempDir::new().unwrap();
    let output = mirrorsync(&["status", "--json"], &temp_dir);

    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["git_initialized"], false);
    assert_eq!(status["branch"], "main");
    assert_eq!(status["targets"], serde_json::json!(["data/"]));
    assert_eq!(status["phase"], "idle");
}

#[test]
fn test_relink_command_links_targets() {
    let temp_dir = TempDir::new().unwrap();
    temp_dir.child("base/data/world.sav").write_str("progress").unwrap();

    let output = mirrorsync(&["relink"], &temp_dir);

    assert!(output.status.success());
    temp_dir
        .child("base/data")
        .assert(predicates::path::is_symlink());
    temp_dir.child("mirror/data/world.sav").assert("progress");
}

#[test]
fn test_init_without_credentials_fails() {
    let temp_dir = TempDir::new().unwrap();
    let output = mirrorsync(&["init"], &temp_dir);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("GITHUB_PAT is not configured"));
    temp_dir.child("mirror").assert(predicates::path::missing());
}

#[test]
fn test_daemon_exits_with_error_on_missing_credentials() {
    let temp_dir = TempDir::new().unwrap();
    let output = mirrorsync(&["daemon"], &temp_dir);

    assert_eq!(output.status.code(), Some(1));
}
