//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` is optional and falls back to defaults, so
//! a minimal config only needs a database path. See [`load_config`] for
//! the validation rules applied after parsing.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use comment_harness_core::retrieval::Metric;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub archives: ArchivesConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub emotion: EmotionConfig,
    #[serde(default)]
    pub notes: NotesConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchivesConfig {
    #[serde(default = "default_archives_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_platform")]
    pub platform: String,
}

impl Default for ArchivesConfig {
    fn default() -> Self {
        Self {
            dir: default_archives_dir(),
            platform: default_platform(),
        }
    }
}

fn default_archives_dir() -> PathBuf {
    PathBuf::from("./data/comments")
}
fn default_platform() -> String {
    "twitch".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,
    /// Subjects to build when none are named. Empty means every session owner.
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default = "default_max_parallel_builds")]
    pub max_parallel_builds: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
            subjects: Vec::new(),
            max_parallel_builds: default_max_parallel_builds(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("./data/index")
}
fn default_max_parallel_builds() -> usize {
    2
}
fn default_snippet_chars() -> usize {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub metric: Metric,
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            default_k: default_k(),
            max_k: default_max_k(),
        }
    }
}

impl RetrievalConfig {
    /// Resolve a caller-supplied `k` against the configured default and cap.
    pub fn effective_k(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_k).clamp(1, self.max_k)
    }
}

fn default_k() -> usize {
    20
}
fn default_max_k() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EmotionConfig {
    #[serde(default)]
    pub anchors: Vec<AnchorConfig>,
}

/// One emotion axis. Exactly one of `text` or `vector` must be given.
#[derive(Debug, Deserialize, Clone)]
pub struct AnchorConfig {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
}

impl AnchorConfig {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.key)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotesConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_notes_model")]
    pub model: String,
    #[serde(default = "default_notes_url")]
    pub url: String,
    #[serde(default = "default_dislike_threshold")]
    pub dislike_threshold: i64,
    #[serde(default)]
    pub system_prompt_path: Option<PathBuf>,
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    #[serde(default = "default_notes_retries")]
    pub max_retries: u32,
    #[serde(default = "default_notes_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_notes_model(),
            url: default_notes_url(),
            dislike_threshold: default_dislike_threshold(),
            system_prompt_path: None,
            prompt_version: default_prompt_version(),
            request_interval_ms: default_request_interval_ms(),
            max_retries: default_notes_retries(),
            timeout_secs: default_notes_timeout(),
            backup_dir: default_backup_dir(),
        }
    }
}

impl NotesConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_notes_model() -> String {
    "openai/gpt-oss-120b".to_string()
}
fn default_notes_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_dislike_threshold() -> i64 {
    1
}
fn default_prompt_version() -> String {
    "v1".to_string()
}
fn default_request_interval_ms() -> u64 {
    1000
}
fn default_notes_retries() -> u32 {
    2
}
fn default_notes_timeout() -> u64 {
    60
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from("./data/note_backups")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8100".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a config from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // Retrieval
    if config.retrieval.default_k < 1 {
        bail!("retrieval.default_k must be >= 1");
    }
    if config.retrieval.default_k > config.retrieval.max_k {
        bail!(
            "retrieval.default_k ({}) must not exceed retrieval.max_k ({})",
            config.retrieval.default_k,
            config.retrieval.max_k
        );
    }

    // Index
    if config.index.max_parallel_builds < 1 {
        bail!("index.max_parallel_builds must be >= 1");
    }

    // Emotion anchors
    let mut seen = HashSet::new();
    for anchor in &config.emotion.anchors {
        if anchor.key.trim().is_empty() {
            bail!("emotion anchor key must not be empty");
        }
        if !seen.insert(anchor.key.as_str()) {
            bail!("duplicate emotion anchor key: '{}'", anchor.key);
        }
        match (&anchor.text, &anchor.vector) {
            (Some(_), None) => {}
            (None, Some(vector)) => {
                if let Some(dims) = config.embedding.dims {
                    if vector.len() != dims {
                        bail!(
                            "emotion anchor '{}' has {} dims, embedding.dims is {}",
                            anchor.key,
                            vector.len(),
                            dims
                        );
                    }
                }
            }
            _ => bail!(
                "emotion anchor '{}' needs exactly one of `text` or `vector`",
                anchor.key
            ),
        }
    }

    // Notes
    match config.notes.provider.as_str() {
        "disabled" | "openrouter" => {}
        other => bail!(
            "Unknown notes provider: '{}'. Must be disabled or openrouter.",
            other
        ),
    }
    if config.notes.is_enabled() && config.notes.system_prompt_path.is_none() {
        bail!("notes.system_prompt_path must be set when notes are enabled");
    }

    Ok(())
}
