//! Per-subject vector index builder.
//!
//! A build diffs the subject's comments in the store against the last
//! published snapshot: rows whose comment still exists with the same body
//! hash keep their vector, deleted comments are pruned, and new or edited
//! comments are embedded in batches. Blank bodies are never embedded. A
//! batch the provider rejects outright is retried one comment at a time so
//! a single bad input only costs its own row. When anything changed, the
//! result is published as the next generation.
//!
//! Builds for one subject are mutually exclusive (see
//! [`index_store::try_lock`]); builds for different subjects run in
//! parallel through [`build_subjects`].

use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use comment_harness_core::embedding::{hash_text, EmbedError, EmbeddingProvider};
use comment_harness_core::index::{IndexEntry, IndexSnapshot};

use crate::config::Config;
use crate::embedding::{embed_with_retry, RetryPolicy};
use crate::index_store;
use crate::store::{self, IndexableComment};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("a build for '{0}' is already running")]
    AlreadyBuilding(String),
    #[error("unknown subject: {0}")]
    UnknownSubject(String),
    #[error("embedding provider is disabled; set [embedding] provider in config")]
    EmbeddingDisabled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    pub login: String,
    /// Generation serving queries after the build.
    pub generation: Option<u64>,
    pub published: bool,
    pub vectors: usize,
    pub reused: usize,
    pub embedded: usize,
    pub pruned: usize,
    /// Comments whose embedding failed; the next build retries them.
    pub skipped: usize,
    /// Comments with an empty or whitespace-only body, never indexed.
    pub blank: usize,
    pub elapsed_ms: u128,
}

pub struct IndexBuilder {
    pool: SqlitePool,
    provider: Arc<dyn EmbeddingProvider>,
    index_dir: PathBuf,
    batch_size: usize,
    snippet_chars: usize,
    retry: RetryPolicy,
}

impl IndexBuilder {
    pub fn new(config: &Config, pool: SqlitePool, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            pool,
            provider,
            index_dir: config.index.dir.clone(),
            batch_size: config.embedding.batch_size.max(1),
            snippet_chars: config.index.snippet_chars,
            retry: RetryPolicy::from_config(&config.embedding),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn build_subject(&self, login: &str) -> Result<BuildReport, BuildError> {
        let started = Instant::now();
        let dir = index_store::subject_dir(&self.index_dir, login)?;
        let subject = store::find_subject_by_login(&self.pool, login)
            .await?
            .ok_or_else(|| BuildError::UnknownSubject(login.to_string()))?;
        if self.provider.dims() == 0 {
            return Err(BuildError::EmbeddingDisabled);
        }

        let _lock = index_store::try_lock(&dir)?
            .ok_or_else(|| BuildError::AlreadyBuilding(subject.login.clone()))?;

        let current = index_store::current_generation(&dir)?;
        let previous = match current {
            Some(generation) => match index_store::load_generation(&dir, generation) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    tracing::warn!(
                        login = %subject.login,
                        error = %format!("{:#}", e),
                        "published index unreadable, rebuilding from scratch"
                    );
                    None
                }
            },
            None => None,
        };
        let previous = previous.filter(|p| {
            let compatible =
                p.dims() == self.provider.dims() && p.model() == self.provider.model_name();
            if !compatible {
                tracing::info!(
                    login = %subject.login,
                    old_model = p.model(),
                    new_model = self.provider.model_name(),
                    "embedding model changed, re-embedding everything"
                );
            }
            compatible
        });

        let comments = store::comments_for_subject(&self.pool, subject.subject_id).await?;

        // comment_id -> (body_hash, vector) from the last generation
        let mut reusable: HashMap<&str, (&str, &[f32])> = HashMap::new();
        if let Some(prev) = &previous {
            for (entry, vector) in prev.rows() {
                reusable.insert(entry.comment_id.as_str(), (entry.body_hash.as_str(), vector));
            }
        }

        let hashes: Vec<String> = comments.iter().map(|c| hash_text(&c.body)).collect();
        let mut vectors: HashMap<String, Vec<f32>> = HashMap::new();
        let mut pending: Vec<usize> = Vec::new();
        let mut blank = 0usize;
        for (i, comment) in comments.iter().enumerate() {
            if is_blank(&comment.body) {
                blank += 1;
                continue;
            }
            match reusable.get(comment.comment_id.as_str()) {
                Some((hash, vector)) if *hash == hashes[i] => {
                    vectors.insert(comment.comment_id.clone(), vector.to_vec());
                }
                _ => pending.push(i),
            }
        }
        let reused = vectors.len();
        let live: HashSet<&str> = comments
            .iter()
            .filter(|c| !is_blank(&c.body))
            .map(|c| c.comment_id.as_str())
            .collect();
        let pruned = previous
            .as_ref()
            .map(|p| {
                p.entries()
                    .iter()
                    .filter(|e| !live.contains(e.comment_id.as_str()))
                    .count()
            })
            .unwrap_or(0);

        let mut embedded = 0usize;
        let mut skipped = 0usize;
        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|&i| comments[i].body.clone()).collect();
            match embed_with_retry(self.provider.as_ref(), &texts, self.retry).await {
                Ok(batch_vectors) => {
                    for (&i, vector) in batch.iter().zip(batch_vectors) {
                        vectors.insert(comments[i].comment_id.clone(), vector);
                    }
                    embedded += batch.len();
                }
                Err(e) if !e.is_transient() && batch.len() > 1 => {
                    tracing::warn!(
                        login = %subject.login,
                        batch = batch.len(),
                        error = %e,
                        "embedding batch rejected, embedding its comments one at a time"
                    );
                    for &i in batch {
                        let comment = &comments[i];
                        match self.embed_single(&comment.body).await {
                            Ok(vector) => {
                                vectors.insert(comment.comment_id.clone(), vector);
                                embedded += 1;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    login = %subject.login,
                                    comment_id = %comment.comment_id,
                                    error = %e,
                                    "comment skipped"
                                );
                                skipped += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        login = %subject.login,
                        batch = batch.len(),
                        error = %e,
                        "embedding batch skipped"
                    );
                    skipped += batch.len();
                }
            }
        }

        let mut rows = Vec::with_capacity(vectors.len());
        for (i, comment) in comments.iter().enumerate() {
            if let Some(vector) = vectors.remove(&comment.comment_id) {
                rows.push((self.entry_for(comment, &hashes[i]), vector));
            }
        }

        let unchanged = match &previous {
            Some(prev) => {
                embedded == 0
                    && prev.len() == rows.len()
                    && prev.entries().iter().zip(&rows).all(|(a, (b, _))| a == b)
            }
            None => false,
        };

        if unchanged {
            tracing::info!(login = %subject.login, generation = ?current, "index up to date");
            return Ok(BuildReport {
                login: subject.login,
                generation: current,
                published: false,
                vectors: rows.len(),
                reused,
                embedded,
                pruned,
                skipped,
                blank,
                elapsed_ms: started.elapsed().as_millis(),
            });
        }

        let generation = current.unwrap_or(0) + 1;
        let vector_count = rows.len();
        let snapshot = IndexSnapshot::from_rows(
            generation,
            self.provider.dims(),
            self.provider.model_name(),
            chrono::Utc::now().timestamp(),
            rows,
        )
        .map_err(anyhow::Error::from)?;
        index_store::publish(&dir, &snapshot)?;
        let removed = index_store::gc(&dir, generation.saturating_sub(1))?;

        tracing::info!(
            login = %subject.login,
            generation,
            vectors = vector_count,
            embedded,
            reused,
            pruned,
            skipped,
            blank,
            removed_generations = removed,
            "published index"
        );

        Ok(BuildReport {
            login: subject.login,
            generation: Some(generation),
            published: true,
            vectors: vector_count,
            reused,
            embedded,
            pruned,
            skipped,
            blank,
            elapsed_ms: started.elapsed().as_millis(),
        })
    }

    async fn embed_single(&self, body: &str) -> Result<Vec<f32>, EmbedError> {
        let texts = [body.to_string()];
        embed_with_retry(self.provider.as_ref(), &texts, self.retry)
            .await?
            .pop()
            .ok_or_else(|| EmbedError::Permanent("empty embedding response".to_string()))
    }

    fn entry_for(&self, comment: &IndexableComment, body_hash: &str) -> IndexEntry {
        IndexEntry {
            comment_id: comment.comment_id.clone(),
            session_id: comment.session_id,
            offset_seconds: comment.offset_seconds,
            created_at: comment.created_at,
            snippet: comment.body.chars().take(self.snippet_chars).collect(),
            body_hash: body_hash.to_string(),
        }
    }
}

fn is_blank(body: &str) -> bool {
    body.trim().is_empty()
}

/// Build several subjects concurrently, at most `max_parallel` at a time.
///
/// Each subject's outcome is independent; results are sorted by login.
pub async fn build_subjects(
    builder: Arc<IndexBuilder>,
    logins: Vec<String>,
    max_parallel: usize,
) -> Vec<(String, Result<BuildReport, BuildError>)> {
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut tasks = JoinSet::new();

    let mut logins = logins;
    logins.sort();
    logins.dedup();

    for login in logins {
        let builder = builder.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return (login, Err(BuildError::Other(e.into()))),
            };
            let result = builder.build_subject(&login).await;
            (login, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => results.push(outcome),
            Err(e) => tracing::error!(error = %e, "index build task panicked"),
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}

/// Subjects to build when none are named on the command line.
pub async fn default_subjects(config: &Config, pool: &SqlitePool) -> anyhow::Result<Vec<String>> {
    if !config.index.subjects.is_empty() {
        return Ok(config.index.subjects.clone());
    }
    store::session_owner_logins(pool).await
}

/// Print build outcomes in `key: value` form. Returns `true` if all succeeded.
pub fn print_results(results: &[(String, Result<BuildReport, BuildError>)]) -> bool {
    let mut ok = true;
    println!("index build");
    for (login, result) in results {
        match result {
            Ok(report) => {
                println!("  {}:", login);
                match report.generation {
                    Some(g) => println!("    generation: {}", g),
                    None => println!("    generation: none"),
                }
                println!("    published: {}", report.published);
                println!("    vectors: {}", report.vectors);
                println!("    embedded: {}", report.embedded);
                println!("    reused: {}", report.reused);
                println!("    pruned: {}", report.pruned);
                println!("    skipped: {}", report.skipped);
                println!("    blank: {}", report.blank);
                println!("    elapsed: {}ms", report.elapsed_ms);
            }
            Err(e) => {
                ok = false;
                println!("  {}:", login);
                println!("    error: {}", e);
            }
        }
    }
    if ok {
        println!("ok");
    }
    ok
}
