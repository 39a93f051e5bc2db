use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn mem_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mem"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("deploy.md"),
        "# Deploy\n\nHow to deploy the service and roll back a bad release.\n",
    )
    .unwrap();
    fs::write(
        files_dir.join("garden.md"),
        "# Garden\n\nNotes about compost, seedlings, and watering.\n",
    )
    .unwrap();
    fs::write(files_dir.join("settings.json"), r#"{"replicas": 3}"#).unwrap();
    fs::write(files_dir.join("binary.md"), [0x23, 0x20, 0xff, 0xfe, 0x0a]).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/mem.sqlite"

[object_store]
kind = "fs"
root = "{root}/data/objects"

[retrieval]
limit = 5

[retry]
max_attempts = 2
initial_backoff_ms = 1

[logging]
level = "warn"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("mem.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_mem(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = mem_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run mem binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn file(config_path: &Path, name: &str) -> String {
    let root = config_path.parent().unwrap().parent().unwrap();
    root.join("files").join(name).to_str().unwrap().to_string()
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_mem(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_mem(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_store_and_get() {
    let (_tmp, config_path) = setup_test_env();
    run_mem(&config_path, &["init"]);

    let deploy = file(&config_path, "deploy.md");
    let (stdout, stderr, success) = run_mem(
        &config_path,
        &["store", &deploy, "--id", "deploy", "--meta", "team=infra"],
    );
    assert!(success, "store failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("stored deploy"));
    assert!(stdout.contains("version: 1"));
    assert!(stdout.contains("chunks: 1"));

    let (stdout, _, success) = run_mem(&config_path, &["get", "deploy"]);
    assert!(success);
    assert!(stdout.contains("--- Document ---"));
    assert!(stdout.contains("version:      1"));
    assert!(stdout.contains(r#""team":"infra""#));
    assert!(stdout.contains("roll back a bad release"));
}

#[test]
fn test_store_update_requires_current_version() {
    let (_tmp, config_path) = setup_test_env();
    run_mem(&config_path, &["init"]);
    let deploy = file(&config_path, "deploy.md");
    let garden = file(&config_path, "garden.md");

    run_mem(&config_path, &["store", &deploy, "--id", "doc"]);

    let (_, stderr, success) = run_mem(&config_path, &["store", &garden, "--id", "doc"]);
    assert!(!success, "stale update should fail");
    assert!(stderr.contains("conflict"), "stderr: {}", stderr);

    let (stdout, _, success) = run_mem(
        &config_path,
        &["store", &garden, "--id", "doc", "--base-version", "1"],
    );
    assert!(success);
    assert!(stdout.contains("version: 2"));
}

#[test]
fn test_store_rejects_invalid_input() {
    let (_tmp, config_path) = setup_test_env();
    run_mem(&config_path, &["init"]);

    let binary = file(&config_path, "binary.md");
    let (_, stderr, success) = run_mem(&config_path, &["store", &binary]);
    assert!(!success);
    assert!(stderr.contains("not valid UTF-8"), "stderr: {}", stderr);

    let deploy = file(&config_path, "deploy.md");
    let (_, _, success) = run_mem(&config_path, &["store", &deploy, "--format", "json"]);
    assert!(!success, "markdown stored as json should fail validation");

    let settings = file(&config_path, "settings.json");
    let (stdout, _, success) = run_mem(&config_path, &["store", &settings, "--id", "settings"]);
    assert!(success);
    assert!(stdout.contains("stored settings"));
}

#[test]
fn test_search_without_engines() {
    let (_tmp, config_path) = setup_test_env();
    run_mem(&config_path, &["init"]);
    run_mem(&config_path, &["store", &file(&config_path, "deploy.md"), "--id", "deploy"]);
    run_mem(&config_path, &["store", &file(&config_path, "garden.md"), "--id", "garden"]);

    let (stdout, stderr, success) = run_mem(&config_path, &["search", "compost seedlings"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(
        stdout.starts_with("1. [1.00] garden (metadata_only)"),
        "unexpected output: {}",
        stdout
    );
}

#[test]
fn test_search_filter_and_empty_result() {
    let (_tmp, config_path) = setup_test_env();
    run_mem(&config_path, &["init"]);
    run_mem(
        &config_path,
        &["store", &file(&config_path, "deploy.md"), "--id", "deploy", "--meta", "team=infra"],
    );

    let (stdout, _, success) = run_mem(&config_path, &["search", "deploy", "--filter", "team=data"]);
    assert!(success);
    assert!(stdout.contains("No results."));

    let (stdout, _, success) = run_mem(&config_path, &["search", "deploy", "--filter", "team=infra"]);
    assert!(success);
    assert!(stdout.contains("deploy (metadata_only)"));

    let (_, _, success) = run_mem(&config_path, &["search", "deploy", "--strategy", "psychic"]);
    assert!(!success);
}

#[test]
fn test_delete_and_purge() {
    let (_tmp, config_path) = setup_test_env();
    run_mem(&config_path, &["init"]);
    run_mem(&config_path, &["store", &file(&config_path, "deploy.md"), "--id", "deploy"]);

    let (stdout, stderr, success) = run_mem(&config_path, &["delete", "deploy", "--version", "1"]);
    assert!(success, "delete failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("deleted deploy"));
    assert!(stdout.contains("version: 2"));

    let (_, _, success) = run_mem(&config_path, &["get", "deploy"]);
    assert!(!success, "deleted document should not be readable");

    let (stdout, _, success) = run_mem(&config_path, &["purge", "deploy"]);
    assert!(success);
    assert!(stdout.contains("objects removed: 2"));
}

#[test]
fn test_reconcile_resume_health() {
    let (_tmp, config_path) = setup_test_env();
    run_mem(&config_path, &["init"]);
    run_mem(&config_path, &["store", &file(&config_path, "deploy.md"), "--id", "deploy"]);

    let (stdout, _, success) = run_mem(&config_path, &["reconcile"]);
    assert!(success);
    assert!(stdout.contains("documents scanned: 1"));
    assert!(stdout.contains("index entries repaired: 0"));

    let (stdout, _, success) = run_mem(&config_path, &["resume"]);
    assert!(success);
    assert!(stdout.contains("completed: 0"));

    let (stdout, _, success) = run_mem(&config_path, &["health"]);
    assert!(success);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["status"], "ok");
    assert_eq!(report["capabilities"]["embeddings"], false);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (_, stderr, success) = run_mem(&missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
