use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn chx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("chx");
    path
}

fn archive_json(session_id: i64, bodies: &[(&str, &str)]) -> String {
    let comments: Vec<serde_json::Value> = bodies
        .iter()
        .enumerate()
        .map(|(i, (id, body))| {
            serde_json::json!({
                "_id": id,
                "content_offset_seconds": i as f64 * 2.5,
                "commenter": { "_id": "5001", "name": "viewer", "display_name": "Viewer" },
                "message": { "body": body }
            })
        })
        .collect();
    serde_json::json!({
        "streamer": { "id": 77, "login": "alice", "name": "Alice" },
        "video": { "id": session_id, "title": "Late night" },
        "comments": comments
    })
    .to_string()
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let archives = root.join("archives");
    fs::create_dir_all(&archives).unwrap();
    fs::write(
        archives.join("1001.json"),
        archive_json(1001, &[("c1", "hello chat"), ("c2", "pog")]),
    )
    .unwrap();
    fs::write(archives.join("README.txt"), "not an archive").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/chx.sqlite"

[archives]
dir = "{root}/archives"

[index]
dir = "{root}/index"

[server]
bind = "127.0.0.1:8199"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("chx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_chx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = chx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run chx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_chx(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/chx.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_chx(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_chx(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_then_unchanged() {
    let (_tmp, config_path) = setup_test_env();
    run_chx(&config_path, &["init"]);

    let (stdout, stderr, success) = run_chx(&config_path, &["ingest"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("archives found: 1"));
    assert!(stdout.contains("ingested: 1"));
    assert!(stdout.contains("comments upserted: 2"));
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_chx(&config_path, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("ingested: 0"));
    assert!(stdout.contains("unchanged: 1"));
}

#[test]
fn test_ingest_dry_run() {
    let (_tmp, config_path) = setup_test_env();
    run_chx(&config_path, &["init"]);

    let (stdout, _, success) = run_chx(&config_path, &["ingest", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("1001.json: process"));

    let (stdout, _, _) = run_chx(&config_path, &["stats"]);
    assert!(stdout.contains("comments: 0"));
}

#[test]
fn test_drift_is_reported() {
    let (tmp, config_path) = setup_test_env();
    run_chx(&config_path, &["init"]);
    run_chx(&config_path, &["ingest"]);

    fs::write(
        tmp.path().join("archives/1001.json"),
        archive_json(1001, &[("c1", "hello chat, edited"), ("c2", "pog")]),
    )
    .unwrap();

    let (stdout, _, success) = run_chx(&config_path, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("drifted: 1"));

    let (stdout, _, success) = run_chx(&config_path, &["ingest", "--reingest"]);
    assert!(success);
    assert!(stdout.contains("ingested: 1"));
}

#[test]
fn test_invalid_archive_fails_the_run() {
    let (tmp, config_path) = setup_test_env();
    run_chx(&config_path, &["init"]);
    fs::write(tmp.path().join("archives/1002.json"), "{ broken").unwrap();

    let (stdout, _, success) = run_chx(&config_path, &["ingest"]);
    assert!(!success);
    assert!(stdout.contains("ingested: 1"));
    assert!(stdout.contains("failed: 1"));
    assert!(stdout.contains("1002.json"));
}

#[test]
fn test_react_and_stats() {
    let (_tmp, config_path) = setup_test_env();
    run_chx(&config_path, &["init"]);
    run_chx(&config_path, &["ingest"]);

    let (stdout, stderr, success) = run_chx(&config_path, &["react", "like", "c1", "--count", "2"]);
    assert!(success, "react failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("likes: 2"));

    let (stdout, _, success) = run_chx(&config_path, &["react", "dislike", "c1"]);
    assert!(success);
    assert!(stdout.contains("dislikes: 1"));

    let (stdout, _, success) = run_chx(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("alice:"));
    assert!(stdout.contains("comments: 2"));
    assert!(stdout.contains("likes: 2"));
}

#[test]
fn test_react_rejects_bad_input() {
    let (_tmp, config_path) = setup_test_env();
    run_chx(&config_path, &["init"]);
    run_chx(&config_path, &["ingest"]);

    let (_, stderr, success) = run_chx(&config_path, &["react", "like", "nope"]);
    assert!(!success);
    assert!(stderr.contains("comment not found"));

    let (_, _, success) = run_chx(&config_path, &["react", "like", "c1", "--count", "0"]);
    assert!(!success);
}

#[test]
fn test_index_build_errors_when_embeddings_disabled() {
    let (_tmp, config_path) = setup_test_env();
    run_chx(&config_path, &["init"]);
    run_chx(&config_path, &["ingest"]);

    let (stdout, _, success) = run_chx(&config_path, &["index", "build"]);
    assert!(!success);
    assert!(stdout.contains("alice:"));
    assert!(stdout.contains("disabled"));
}

#[test]
fn test_index_status_without_index() {
    let (_tmp, config_path) = setup_test_env();
    run_chx(&config_path, &["init"]);
    run_chx(&config_path, &["ingest"]);

    let (stdout, _, success) = run_chx(&config_path, &["index", "status"]);
    assert!(success);
    assert!(stdout.contains("generation: none"));
}

#[test]
fn test_search_without_index_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_chx(&config_path, &["init"]);

    let (_, stderr, success) = run_chx(&config_path, &["search", "centroid", "alice"]);
    assert!(!success);
    assert!(stderr.contains("no index published"));
}

#[test]
fn test_search_emotion_requires_weight() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, success) = run_chx(&config_path, &["search", "emotion", "alice"]);
    assert!(!success);
    let (_, _, success) = run_chx(&config_path, &["search", "emotion", "alice", "--weight", "joy"]);
    assert!(!success);
}

#[test]
fn test_notes_generate_errors_when_disabled() {
    let (_tmp, config_path) = setup_test_env();
    run_chx(&config_path, &["init"]);

    let (_, stderr, success) = run_chx(&config_path, &["notes", "generate"]);
    assert!(!success);
    assert!(stderr.contains("disabled"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_chx(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
