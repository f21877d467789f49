//! Integration tests for the svchub binary
//!
//! Tests cover:
//! - Hashing in each service format
//! - Configuration errors and exit codes
//! - Listing services without touching the account store

use std::process::Command;

fn svchub() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_svchub"));
    cmd.env_clear().env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_hash_sha1_is_deterministic() {
    let output = svchub()
        .args(["hash", "sha1", "--password", "hunter2"])
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sha1: f3bbbd66a63d4bf1747940578ec3d0103530e21d"));
    assert!(!stdout.contains("password:"));
}

#[test]
fn test_hash_generates_password_when_omitted() {
    let output = svchub()
        .args(["hash", "phpass", "--cost", "8"])
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("password: "));
    assert!(stdout.contains("phpass: $H$"));
}

#[test]
fn test_hash_sha1_username_requires_username() {
    let output = svchub()
        .args(["hash", "sha1-username", "--password", "x"])
        .output()
        .expect("Failed to execute command");

    assert_eq!(output.status.code(), Some(4));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--username"));
}

#[test]
fn test_missing_database_url_exits_with_config_error() {
    let output = svchub()
        .arg("services")
        .output()
        .expect("Failed to execute command");

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("SVCHUB_DATABASE_URL"));
}

#[test]
fn test_services_json_lists_configured_services() {
    let output = svchub()
        .args(["services", "--json"])
        .env("SVCHUB_DATABASE_URL", "postgres://hub:pw@127.0.0.1:1/hub")
        .env("SVCHUB_MUMBLE_DATABASE_URL", "postgres://m:pw@127.0.0.1:1/mumble")
        .env("SVCHUB_MUMBLE_NAME_FORMAT", "[{corp_ticker}]{character_name}")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let services: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("valid JSON on stdout");
    assert_eq!(services[0]["id"], "mumble");
    assert_eq!(services[0]["permission"], "mumble.access_mumble");
    assert_eq!(services[0]["name_format"], "[{corp_ticker}]{character_name}");
}

#[test]
fn test_disable_all_requires_confirmation() {
    let output = svchub()
        .args(["disable-all", "mumble"])
        .env("SVCHUB_DATABASE_URL", "postgres://hub:pw@127.0.0.1:1/hub")
        .output()
        .expect("Failed to execute command");

    assert_eq!(output.status.code(), Some(4));
}
