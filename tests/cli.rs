use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn vault_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("vault");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("rust.md"),
        "# Ownership\n\nRust ownership rules let the borrow checker prove memory safety at \
         compile time. References borrow values without taking ownership and lifetimes \
         describe how long each borrow stays valid.",
    )
    .unwrap();
    fs::write(
        files_dir.join("bread.txt"),
        "Sourdough bread needs an active starter, strong flour, water and salt. Ferment the \
         dough slowly, shape the loaf, proof it overnight and bake it hot in a covered pot.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/vault.sqlite"

[storage]
root = "{root}/data/store"

[chunking]
window_tokens = 16
overlap_tokens = 4
min_tokens = 4

[embedding]
provider = "hash"
dims = 256

[indexing]
backoff_base_ms = 1
"#,
        root = root.display()
    );

    let config_path = config_dir.join("vault.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_vault(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = vault_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run vault binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn upload(config_path: &Path, file: &Path) -> String {
    let (stdout, stderr, success) = run_vault(config_path, &["upload", file.to_str().unwrap()]);
    assert!(success, "upload failed: stdout={}, stderr={}", stdout, stderr);
    stdout.trim().to_string()
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_vault(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_vault(&config_path, &["init"]);
    assert!(success, "second init failed");
}

#[test]
fn test_upload_dedups_and_get_roundtrips() {
    let (tmp, config_path) = setup_test_env();
    let rust = tmp.path().join("files/rust.md");

    let first = upload(&config_path, &rust);
    let second = upload(&config_path, &rust);
    assert_ne!(first, second);

    let (stdout, _, success) = run_vault(&config_path, &["stats", "--json"]);
    assert!(success);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["storage"]["total_files"], 2);
    assert_eq!(stats["storage"]["unique_contents"], 1);

    let out = tmp.path().join("out.md");
    let (stdout, _, success) = run_vault(
        &config_path,
        &["get", &first, "--output", out.to_str().unwrap()],
    );
    assert!(success);
    assert!(stdout.contains("text/markdown"));
    assert!(stdout.contains("done"));
    assert_eq!(fs::read(&out).unwrap(), fs::read(&rust).unwrap());
}

#[test]
fn test_search_ranks_matching_file_first() {
    let (tmp, config_path) = setup_test_env();
    upload(&config_path, &tmp.path().join("files/rust.md"));
    let bread = upload(&config_path, &tmp.path().join("files/bread.txt"));

    let (stdout, stderr, success) = run_vault(
        &config_path,
        &["search", "sourdough starter flour", "--threshold", "0", "--json"],
    );
    assert!(success, "search failed: {}", stderr);
    let results: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(results[0]["file_id"], bread.as_str());
    assert_eq!(results[0]["display_name"], "bread.txt");

    let (stdout, _, success) = run_vault(
        &config_path,
        &["search", "borrow checker", "--threshold", "0", "--aggregation", "weighted"],
    );
    assert!(success);
    assert!(stdout.starts_with("1. "), "got: {}", stdout);
    assert!(stdout.contains("rust.md"));
}

#[test]
fn test_search_rejects_bad_input() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_vault(&config_path, &["search", "ab"]);
    assert!(!success);
    assert!(stderr.contains("invalid request"));

    let (_, _, success) = run_vault(
        &config_path,
        &["search", "borrow checker", "--aggregation", "median"],
    );
    assert!(!success);
}

#[test]
fn test_delete_then_get_fails() {
    let (tmp, config_path) = setup_test_env();
    let id = upload(&config_path, &tmp.path().join("files/bread.txt"));

    let (stdout, stderr, success) = run_vault(&config_path, &["delete", &id]);
    assert!(success, "delete failed: {}", stderr);
    assert!(stdout.contains("content removed"));

    let (_, stderr, success) = run_vault(&config_path, &["get", &id]);
    assert!(!success);
    assert!(stderr.contains("not found"));

    let (stdout, _, success) = run_vault(&config_path, &["search", "sourdough starter", "--threshold", "0"]);
    assert!(success);
    assert!(!stdout.contains("bread.txt"));
}

#[test]
fn test_reset_and_reindex() {
    let (tmp, config_path) = setup_test_env();
    let id = upload(&config_path, &tmp.path().join("files/rust.md"));

    let (stdout, _, success) = run_vault(&config_path, &["reset-index"]);
    assert!(success);
    assert!(stdout.contains("Removed"));

    let (stdout, _, success) = run_vault(&config_path, &["search", "borrow checker", "--threshold", "0"]);
    assert!(success);
    assert!(stdout.contains("No results."));

    let (stdout, _, success) = run_vault(&config_path, &["reindex", "--all"]);
    assert!(success);
    assert!(stdout.contains("1 indexed"));

    let (stdout, _, success) = run_vault(&config_path, &["reindex", &id]);
    assert!(success);
    assert!(stdout.contains("done"));

    let (_, _, success) = run_vault(&config_path, &["reindex"]);
    assert!(!success, "reindex without id or --all must fail");
}

#[test]
fn test_repair_and_stats_render() {
    let (tmp, config_path) = setup_test_env();
    upload(&config_path, &tmp.path().join("files/rust.md"));

    let (stdout, _, success) = run_vault(&config_path, &["repair"]);
    assert!(success);
    assert!(stdout.contains("0 completed"));

    let (stdout, _, success) = run_vault(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("File Vault Stats"));
    assert!(stdout.contains("feature-hash-256"));
}
