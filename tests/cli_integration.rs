//! CLI Integration Tests
//!
//! These tests drive the `rhizome` binary end-to-end against a database
//! file in a temp directory, parsing its JSON output.
//!
//! Run with:
//! ```bash
//! cargo test --test cli_integration
//! ```

use serde_json::Value;
use std::process::Command;
use tempfile::{tempdir, TempDir};

/// Run rhizome and return (stdout, stderr, success)
fn run_rhizome(args: &[&str], db_path: &str) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_rhizome"))
        .args(["-d", db_path, "-f", "json"])
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute rhizome");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

/// Run a command that must succeed and parse its JSON output
fn run_json(args: &[&str], db_path: &str) -> Value {
    let (stdout, stderr, success) = run_rhizome(args, db_path);
    assert!(success, "{:?} failed: {}", args, stderr);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|e| panic!("bad JSON from {:?}: {} ({})", args, stdout, e))
}

fn init_db() -> (TempDir, String) {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.rhizome").to_str().unwrap().to_string();
    run_json(&["init"], &db_path);
    (dir, db_path)
}

// ============================================================================
// Database Initialization Tests
// ============================================================================

#[test]
fn test_cli_init_creates_database() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join(".rhizome");
    let db_str = db_path.to_str().unwrap();

    let json = run_json(&["init"], db_str);
    assert_eq!(json["status"], "ok");
    assert!(db_path.exists(), "database file should be created");

    // a second init must not clobber the existing file
    let (_, _, success) = run_rhizome(&["init"], db_str);
    assert!(!success);
}

#[test]
fn test_cli_default_path_is_dot_rhizome() {
    let output = Command::new(env!("CARGO_BIN_EXE_rhizome"))
        .args(["--help"])
        .output()
        .expect("Failed to execute rhizome");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("[default: .rhizome]"),
        "Default database path should be .rhizome, got: {}",
        stdout
    );
}

#[test]
fn test_cli_requires_init() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("missing.rhizome");
    let (_, stderr, success) = run_rhizome(&["get", "k"], db_path.to_str().unwrap());
    assert!(!success);
    assert!(stderr.contains("rhizome init"), "got: {}", stderr);
}

// ============================================================================
// Key/Value Tests
// ============================================================================

#[test]
fn test_cli_put_get_delete() {
    let (_dir, db) = init_db();

    let put = run_json(&["put", "fruit/apple", "red"], &db);
    assert_eq!(put["branch"], "main");
    assert_eq!(put["commit"].as_str().unwrap().len(), 64);

    let get = run_json(&["get", "fruit/apple"], &db);
    assert_eq!(get["found"], true);
    assert_eq!(get["value"], "red");

    run_json(&["delete", "fruit/apple"], &db);
    let get = run_json(&["get", "fruit/apple"], &db);
    assert_eq!(get["found"], false);
    assert!(get["value"].is_null());
}

#[test]
fn test_cli_list_prefix() {
    let (_dir, db) = init_db();
    run_json(&["put", "fruit/apple", "red"], &db);
    run_json(&["put", "fruit/banana", "yellow"], &db);
    run_json(&["put", "veg/kale", "green"], &db);

    let all = run_json(&["list"], &db);
    assert_eq!(all["count"], 3);

    let fruit = run_json(&["list", "-p", "fruit/"], &db);
    assert_eq!(fruit["count"], 2);
    assert_eq!(fruit["entries"][0]["key"], "fruit/apple");
    assert_eq!(fruit["entries"][1]["key"], "fruit/banana");
}

// ============================================================================
// Branch and History Tests
// ============================================================================

#[test]
fn test_cli_branch_log_and_merge() {
    let (_dir, db) = init_db();
    let first = run_json(&["put", "a", "1"], &db);

    let created = run_json(&["branch", "create", "feature"], &db);
    assert_eq!(created["commit"], first["commit"]);

    run_json(&["put", "b", "2", "-b", "feature", "-m", "feature work"], &db);
    run_json(&["put", "c", "3"], &db);

    let branches = run_json(&["branch", "list"], &db);
    let names: Vec<&str> = branches["branches"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["feature", "main"]);

    let log = run_json(&["log", "-r", "feature"], &db);
    assert_eq!(log["count"], 2);
    assert_eq!(log["commits"][0]["message"], "feature work");
    assert_eq!(log["commits"][0]["author"], "rhizome-cli");

    let merged = run_json(&["merge", "main", "feature"], &db);
    let log = run_json(&["log"], &db);
    assert_eq!(log["commits"][0]["hash"], merged["commit"]);
    assert_eq!(log["commits"][0]["parents"].as_array().unwrap().len(), 2);
    assert_eq!(log["count"], 4);

    let limited = run_json(&["log", "-n", "2"], &db);
    assert_eq!(limited["count"], 2);

    run_json(&["branch", "delete", "feature"], &db);
    let (_, _, success) = run_rhizome(&["log", "-r", "feature"], &db);
    assert!(!success);
}

#[test]
fn test_cli_diff_between_refs() {
    let (_dir, db) = init_db();
    let first = run_json(&["put", "a", "1"], &db);
    run_json(&["put", "a", "2"], &db);
    run_json(&["put", "b", "x"], &db);

    let diff = run_json(&["diff", first["commit"].as_str().unwrap(), "main"], &db);
    assert_eq!(diff["added"], 1);
    assert_eq!(diff["modified"], 1);
    assert_eq!(diff["removed"], 0);
    assert_eq!(diff["entries"][0]["type"], "modified");
    assert_eq!(diff["entries"][0]["old_value"], "1");
    assert_eq!(diff["entries"][0]["new_value"], "2");
}

// ============================================================================
// Proof Tests
// ============================================================================

#[test]
fn test_cli_prove_and_verify() {
    let (_dir, db) = init_db();
    run_json(&["put", "apple", "red"], &db);
    run_json(&["put", "banana", "yellow"], &db);

    let proof = run_json(&["prove", "apple"], &db);
    assert_eq!(proof["inclusion"], true);
    let root = proof["root"].as_str().unwrap();
    let bytes = proof["proof"].as_str().unwrap();

    let ok = run_json(&["verify", root, "apple", bytes, "--value", "red"], &db);
    assert_eq!(ok["valid"], true);

    let (stdout, _, success) = run_rhizome(&["verify", root, "apple", bytes, "--value", "green"], &db);
    assert!(!success);
    assert!(stdout.contains("\"valid\":false"));

    let absent = run_json(&["prove", "cherry"], &db);
    assert_eq!(absent["inclusion"], false);
    let ok = run_json(&["verify", root, "cherry", absent["proof"].as_str().unwrap()], &db);
    assert_eq!(ok["valid"], true);
}

// ============================================================================
// Maintenance Tests
// ============================================================================

#[test]
fn test_cli_prune_and_compact() {
    let (_dir, db) = init_db();
    let first = run_json(&["put", "k", &"x".repeat(100)], &db);
    for i in 0..5 {
        run_json(&["put", "k", &format!("{}{}", i, "y".repeat(100))], &db);
    }

    let (_, stderr, success) = run_rhizome(&["prune"], &db);
    assert!(!success);
    assert!(stderr.contains("nothing to retain"));

    let report = run_json(&["prune", "--keep", "main", "--depth", "0"], &db);
    assert_eq!(report["removed_commits"], 5);
    assert!(report["removed_values"].as_u64().unwrap() >= 5);

    let (_, _, success) = run_rhizome(&["log", "-r", first["commit"].as_str().unwrap()], &db);
    assert!(!success, "pruned commit should be gone");

    let compact = run_json(&["compact"], &db);
    assert!(compact["reclaimed_bytes"].as_u64().unwrap() > 0);

    let get = run_json(&["get", "k"], &db);
    assert_eq!(get["value"], format!("4{}", "y".repeat(100)));
}

#[test]
fn test_cli_dot_output() {
    let (_dir, db) = init_db();
    run_json(&["put", "a", "1"], &db);
    run_json(&["branch", "create", "old"], &db);
    run_json(&["put", "b", "2"], &db);

    let (stdout, stderr, success) = run_rhizome(&["dot", "-r", "main", "-r", "old"], &db);
    assert!(success, "{}", stderr);
    assert!(stdout.starts_with("digraph rhizome {"));
    assert!(stdout.contains("label=\"main\""));
    assert!(stdout.contains("label=\"old\""));
}

#[test]
fn test_cli_hashed_ordering_is_remembered() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("hashed.rhizome").to_str().unwrap().to_string();

    let (_, _, success) = run_rhizome(&["--ordering", "hashed", "init"], &db);
    assert!(success);

    let (_, stderr, success) = run_rhizome(&["put", "a", "1"], &db);
    assert!(!success, "default ordering must not open a hashed database");
    assert!(stderr.contains("ordering"), "got: {}", stderr);

    let (_, _, success) = run_rhizome(&["--ordering", "hashed", "put", "a", "1"], &db);
    assert!(success);
}
