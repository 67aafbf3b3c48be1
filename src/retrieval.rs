//! Retrieval engine: snapshot cache, query embedding and result hydration.
//!
//! The ranking itself lives in [`comment_harness_core::retrieval`]. This
//! module keeps one [`IndexSnapshot`] per subject in memory, swaps it when
//! the subject's `CURRENT` generation moves, and turns hits into
//! [`SearchResult`]s.
//!
//! A query clones the subject's `Arc<IndexSnapshot>` once and ranks
//! against that clone, so a publish that lands mid-query is only seen by
//! later queries.

use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};

use comment_harness_core::embedding::{EmbedError, EmbeddingProvider};
use comment_harness_core::index::IndexSnapshot;
use comment_harness_core::retrieval::{
    self as ranking, CentroidScope, EmotionAnchor, Metric, Query, RetrievalError,
};

use crate::config::{AnchorConfig, Config, RetrievalConfig};
use crate::embedding::{embed_with_retry, RetryPolicy};
use crate::index_store;
use crate::store::{self, CommentDetail};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Invalid(#[from] RetrievalError),
    #[error("query text must not be empty")]
    EmptyQuery,
    #[error("no index published for '{0}'; run `chx index build {0}`")]
    NoIndex(String),
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Load `generation`, or the generation `CURRENT` names now if a publish
/// collected it between reading `CURRENT` and loading.
async fn load_latest(
    dir: PathBuf,
    generation: u64,
) -> Result<(u64, anyhow::Result<IndexSnapshot>), EngineError> {
    let load = |dir: PathBuf, generation: u64| async move {
        tokio::task::spawn_blocking(move || index_store::load_generation(&dir, generation))
            .await
            .map_err(anyhow::Error::from)
    };

    let loaded = load(dir.clone(), generation).await?;
    if loaded.is_ok() {
        return Ok((generation, loaded));
    }
    match index_store::current_generation(&dir)? {
        Some(newer) if newer != generation => {
            tracing::debug!(
                from = generation,
                to = newer,
                "generation collected while loading, retrying"
            );
            Ok((newer, load(dir, newer).await?))
        }
        _ => Ok((generation, loaded)),
    }
}

/// One ranked, hydrated result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub rank: usize,
    pub comment_id: String,
    pub distance: f32,
    pub session_id: i64,
    pub offset_seconds: i64,
    pub created_at: Option<i64>,
    pub snippet: String,
    /// Live store fields; `None` if the comment has since been deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<CommentDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub login: String,
    pub mode: &'static str,
    pub metric: Metric,
    pub generation: u64,
    pub results: Vec<SearchResult>,
}

/// Status of one subject's published index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub login: String,
    pub generation: Option<u64>,
    pub vectors: usize,
    pub dims: usize,
    pub model: Option<String>,
    pub built_at: Option<i64>,
    pub building: bool,
}

pub struct RetrievalEngine {
    index_dir: PathBuf,
    provider: Arc<dyn EmbeddingProvider>,
    retrieval: RetrievalConfig,
    retry: RetryPolicy,
    anchor_configs: Vec<AnchorConfig>,
    anchors: OnceCell<Vec<EmotionAnchor>>,
    cache: RwLock<HashMap<String, Arc<IndexSnapshot>>>,
}

impl RetrievalEngine {
    pub fn new(config: &Config, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            index_dir: config.index.dir.clone(),
            provider,
            retrieval: config.retrieval.clone(),
            retry: RetryPolicy::from_config(&config.embedding),
            anchor_configs: config.emotion.anchors.clone(),
            anchors: OnceCell::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn metric(&self) -> Metric {
        self.retrieval.metric
    }

    /// `(key, label)` of every configured emotion axis.
    pub fn axes(&self) -> Vec<(String, String)> {
        self.anchor_configs
            .iter()
            .map(|a| (a.key.clone(), a.label().to_string()))
            .collect()
    }

    /// The subject's current snapshot, reloading it if a newer generation
    /// was published since it was cached.
    pub async fn snapshot(&self, login: &str) -> Result<Arc<IndexSnapshot>, EngineError> {
        let dir = index_store::subject_dir(&self.index_dir, login)?;
        let key = login.to_lowercase();
        let current = index_store::current_generation(&dir)?
            .ok_or_else(|| EngineError::NoIndex(key.clone()))?;

        let cached = self.cache.read().await.get(&key).cloned();
        if let Some(snapshot) = &cached {
            if snapshot.generation() == current {
                return Ok(snapshot.clone());
            }
        }

        let (current, loaded) = load_latest(dir, current).await?;

        let snapshot = match loaded {
            Ok(s) => Arc::new(s),
            Err(e) => match cached {
                Some(old) => {
                    tracing::warn!(
                        login = %key,
                        generation = current,
                        error = %format!("{:#}", e),
                        "failed to load new generation, serving the cached one"
                    );
                    return Ok(old);
                }
                None => return Err(e.into()),
            },
        };

        let mut cache = self.cache.write().await;
        let entry = cache.entry(key.clone()).or_insert_with(|| snapshot.clone());
        if entry.generation() < snapshot.generation() {
            *entry = snapshot.clone();
        }
        tracing::debug!(login = %key, generation = entry.generation(), "index snapshot loaded");
        Ok(entry.clone())
    }

    /// Emotion anchors, embedding any `text` anchors on first use.
    pub async fn anchors(&self) -> Result<&[EmotionAnchor], EngineError> {
        let anchors = self
            .anchors
            .get_or_try_init(|| async {
                let texts: Vec<String> = self
                    .anchor_configs
                    .iter()
                    .filter(|a| a.vector.is_none())
                    .filter_map(|a| a.text.clone())
                    .collect();
                let embedded = if texts.is_empty() {
                    Vec::new()
                } else {
                    embed_with_retry(self.provider.as_ref(), &texts, self.retry).await?
                };
                let mut embedded = embedded.into_iter();

                let mut anchors = Vec::with_capacity(self.anchor_configs.len());
                for config in &self.anchor_configs {
                    let vector = match &config.vector {
                        Some(v) => v.clone(),
                        None => embedded.next().ok_or_else(|| {
                            EmbedError::Permanent(format!(
                                "no vector returned for anchor '{}'",
                                config.key
                            ))
                        })?,
                    };
                    anchors.push(EmotionAnchor {
                        key: config.key.clone(),
                        label: config.label().to_string(),
                        vector,
                    });
                }
                Ok::<_, EngineError>(anchors)
            })
            .await?;
        Ok(anchors.as_slice())
    }

    pub async fn similar(
        &self,
        login: &str,
        text: &str,
        k: Option<usize>,
    ) -> Result<SearchResponse, EngineError> {
        if text.trim().is_empty() {
            return Err(EngineError::EmptyQuery);
        }
        let snapshot = self.snapshot(login).await?;
        let mut vectors =
            embed_with_retry(self.provider.as_ref(), &[text.to_string()], self.retry).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| EmbedError::Permanent("empty embedding response".to_string()))?;
        self.run(login, snapshot, &Query::Similarity { vector }, k, &[])
    }

    pub async fn centroid(
        &self,
        login: &str,
        scope: CentroidScope,
        position: Option<f64>,
        k: Option<usize>,
    ) -> Result<SearchResponse, EngineError> {
        let snapshot = self.snapshot(login).await?;
        let query = Query::Centroid {
            scope,
            position: position.unwrap_or(0.0),
        };
        self.run(login, snapshot, &query, k, &[])
    }

    pub async fn emotion(
        &self,
        login: &str,
        weights: BTreeMap<String, f64>,
        k: Option<usize>,
    ) -> Result<SearchResponse, EngineError> {
        let snapshot = self.snapshot(login).await?;
        let anchors = self.anchors().await?;
        self.run(login, snapshot, &Query::Emotion { weights }, k, anchors)
    }

    fn run(
        &self,
        login: &str,
        snapshot: Arc<IndexSnapshot>,
        query: &Query,
        k: Option<usize>,
        anchors: &[EmotionAnchor],
    ) -> Result<SearchResponse, EngineError> {
        let k = self.retrieval.effective_k(k);
        let hits = ranking::execute(&snapshot, query, anchors, self.retrieval.metric, k)?;
        let results = hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| {
                let entry = snapshot.entry(hit.position);
                SearchResult {
                    rank: i + 1,
                    comment_id: hit.comment_id,
                    distance: hit.distance,
                    session_id: entry.session_id,
                    offset_seconds: entry.offset_seconds,
                    created_at: entry.created_at,
                    snippet: entry.snippet.clone(),
                    detail: None,
                }
            })
            .collect();

        Ok(SearchResponse {
            login: login.to_lowercase(),
            mode: match query {
                Query::Similarity { .. } => "similarity",
                Query::Centroid { .. } => "centroid",
                Query::Emotion { .. } => "emotion",
            },
            metric: self.retrieval.metric,
            generation: snapshot.generation(),
            results,
        })
    }

    /// Published index status, read from disk.
    pub async fn status(&self, login: &str) -> Result<IndexStatus, EngineError> {
        let dir = index_store::subject_dir(&self.index_dir, login)?;
        let building = index_store::is_locked(&dir);
        match self.snapshot(login).await {
            Ok(snapshot) => Ok(IndexStatus {
                login: login.to_lowercase(),
                generation: Some(snapshot.generation()),
                vectors: snapshot.len(),
                dims: snapshot.dims(),
                model: Some(snapshot.model().to_string()),
                built_at: Some(snapshot.built_at()),
                building,
            }),
            Err(EngineError::NoIndex(_)) => Ok(IndexStatus {
                login: login.to_lowercase(),
                generation: None,
                vectors: 0,
                dims: 0,
                model: None,
                built_at: None,
                building,
            }),
            Err(e) => Err(e),
        }
    }
}

/// Attach live store fields (reaction counts, commenter) to each result.
pub async fn attach_details(pool: &SqlitePool, response: &mut SearchResponse) -> anyhow::Result<()> {
    let ids: Vec<String> = response
        .results
        .iter()
        .map(|r| r.comment_id.clone())
        .collect();
    let mut details = store::comment_details(pool, &ids).await?;
    for result in &mut response.results {
        result.detail = details.remove(&result.comment_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use comment_harness_core::index::IndexEntry;
    use tempfile::TempDir;

    fn snapshot(generation: u64) -> IndexSnapshot {
        let entry = IndexEntry {
            comment_id: "c1".to_string(),
            session_id: 1,
            offset_seconds: 0,
            created_at: None,
            snippet: String::new(),
            body_hash: String::new(),
        };
        IndexSnapshot::from_rows(generation, 2, "m", 0, vec![(entry, vec![1.0, 0.0])]).unwrap()
    }

    #[tokio::test]
    async fn test_load_follows_current_when_generation_was_collected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("alice");
        index_store::publish(&dir, &snapshot(1)).unwrap();
        index_store::publish(&dir, &snapshot(2)).unwrap();
        assert_eq!(index_store::gc(&dir, 2).unwrap(), 1);

        let (generation, loaded) = load_latest(dir.clone(), 1).await.unwrap();
        assert_eq!(generation, 2);
        assert_eq!(loaded.unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn test_load_of_missing_current_still_fails() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("alice");
        index_store::publish(&dir, &snapshot(1)).unwrap();
        std::fs::remove_dir_all(dir.join("g1")).unwrap();

        let (generation, loaded) = load_latest(dir, 1).await.unwrap();
        assert_eq!(generation, 1);
        assert!(loaded.is_err());
    }
}
