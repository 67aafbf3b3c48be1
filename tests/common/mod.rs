#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

use comment_harness::config::{parse_config, Config};
use comment_harness::migrate;
use comment_harness_core::embedding::{EmbedError, EmbeddingProvider};

pub const DIMS: usize = 4;

/// Deterministic stand-in for an embedding model: each byte of the text
/// feeds one of `DIMS` buckets.
pub struct HashEmbedder {
    pub texts_embedded: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            texts_embedded: AtomicUsize::new(0),
        }
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![1.0f32; DIMS];
        for (i, b) in text.bytes().enumerate() {
            v[i % DIMS] += (b as f32) * ((i / DIMS) as f32 + 1.0);
        }
        v
    }

    pub fn embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-embedder"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

pub struct TestEnv {
    pub tmp: TempDir,
    pub config: Config,
}

impl TestEnv {
    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.tmp.path().join("archives")
    }
}

/// Temp directory with a migrated database and an empty archive directory.
pub async fn setup() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("archives")).unwrap();

    let toml = format!(
        r#"[db]
path = "{root}/data/chx.sqlite"

[archives]
dir = "{root}/archives"

[index]
dir = "{root}/index"

[retrieval]
default_k = 10
max_k = 50

[[emotion.anchors]]
key = "joy"
label = "Joy"
vector = [1.0, 0.0, 0.0, 0.0]

[[emotion.anchors]]
key = "gloom"
vector = [-1.0, 0.0, 0.0, 0.0]

[notes]
request_interval_ms = 0
backup_dir = "{root}/backups"
"#,
        root = root.display()
    );
    let config = parse_config(&toml).unwrap();
    migrate::run_migrations(&config).await.unwrap();
    TestEnv { tmp, config }
}

/// One comment record: `(id, offset_seconds, body)`.
pub fn comment(id: &str, offset: f64, body: &str) -> serde_json::Value {
    json!({
        "_id": id,
        "created_at": "2024-03-01T12:00:05Z",
        "content_offset_seconds": offset,
        "commenter": { "_id": "5001", "name": "Viewer", "display_name": "Viewer" },
        "message": { "body": body, "user_color": "#FF0000" }
    })
}

/// Archive JSON for `session_id` owned by `login`.
pub fn archive(owner_id: i64, login: &str, session_id: i64, comments: Vec<serde_json::Value>) -> String {
    json!({
        "streamer": { "id": owner_id, "login": login, "name": login },
        "video": {
            "id": session_id.to_string(),
            "title": format!("Session {}", session_id),
            "created_at": "2024-03-01T12:00:00Z",
            "length": 3600
        },
        "comments": comments
    })
    .to_string()
}

pub fn write_archive(env: &TestEnv, session_id: i64, content: &str) {
    fs::write(env.archives_dir().join(format!("{}.json", session_id)), content).unwrap();
}
