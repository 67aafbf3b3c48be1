//! Retrieval algorithms over an [`IndexSnapshot`].
//!
//! Three query modes share one ranking routine:
//!
//! | Mode | Target vector | Candidates |
//! |------|---------------|------------|
//! | [`Query::Similarity`] | caller-supplied query embedding | whole index |
//! | [`Query::Centroid`] | arithmetic mean of the candidates | whole index or one session |
//! | [`Query::Emotion`] | `Σ wᵢ·aᵢ / Σ|wᵢ|` over emotion anchors | whole index |
//!
//! Candidates are ranked by ascending distance under a [`Metric`]. Ties
//! are broken by snapshot position (ingestion order), then comment id, so
//! every mode is a pure function of `(snapshot, query)`.
//!
//! Embedding the query text is the caller's job; this module never
//! performs I/O.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::embedding::{cosine_similarity, euclidean_distance};
use crate::index::{IndexEntry, IndexSnapshot};

#[derive(Debug, Error, PartialEq)]
pub enum RetrievalError {
    #[error("emotion weights sum to zero; at least one non-zero weight is required")]
    ZeroWeight,
    #[error("unknown emotion axis: {0}")]
    UnknownAxis(String),
    #[error("query vector has {actual} dims, index has {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("position must be within [0.0, 1.0], got {0}")]
    InvalidPosition(f64),
    #[error("weight for axis {0} is not a finite number")]
    InvalidWeight(String),
}

/// Distance metric used for every ranking in a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 − cos(a, b)`, in `[0, 2]`. Zero vectors have cosine 0.
    #[default]
    Cosine,
    /// L2 norm of `a − b`.
    Euclidean,
}

impl Metric {
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => 1.0 - cosine_similarity(a, b),
            Metric::Euclidean => euclidean_distance(a, b),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" => Ok(Metric::Euclidean),
            other => Err(format!(
                "unknown metric '{}'. Use cosine or euclidean.",
                other
            )),
        }
    }
}

/// Which comments a centroid query averages over and ranks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CentroidScope {
    #[default]
    All,
    Session(i64),
}

impl CentroidScope {
    fn admits(self, entry: &IndexEntry) -> bool {
        match self {
            CentroidScope::All => true,
            CentroidScope::Session(id) => entry.session_id == id,
        }
    }
}

/// A named reference vector used as an emotion axis.
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionAnchor {
    pub key: String,
    pub label: String,
    pub vector: Vec<f32>,
}

/// The closed set of query modes.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Similarity {
        vector: Vec<f32>,
    },
    Centroid {
        scope: CentroidScope,
        /// 0.0 returns the most typical comments, 1.0 the least typical.
        position: f64,
    },
    Emotion {
        /// Axis key → weight. Negative weights pull away from the axis.
        weights: BTreeMap<String, f64>,
    },
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    /// Row in the snapshot the hit came from.
    pub position: usize,
    pub comment_id: String,
    /// Distance to the query target; lower is closer.
    pub distance: f32,
}

/// Answer `query` against `snapshot`, returning at most `k` hits.
pub fn execute(
    snapshot: &IndexSnapshot,
    query: &Query,
    anchors: &[EmotionAnchor],
    metric: Metric,
    k: usize,
) -> Result<Vec<Hit>, RetrievalError> {
    match query {
        Query::Similarity { vector } => {
            if snapshot.is_empty() {
                return Ok(Vec::new());
            }
            check_dims(snapshot, vector)?;
            Ok(rank(snapshot, vector, metric, |_| true, k, 0))
        }
        Query::Centroid { scope, position } => {
            if !position.is_finite() || !(0.0..=1.0).contains(position) {
                return Err(RetrievalError::InvalidPosition(*position));
            }
            let Some(target) = centroid(snapshot, *scope) else {
                return Ok(Vec::new());
            };
            let total = snapshot.entries().iter().filter(|e| scope.admits(e)).count();
            let max_offset = total.saturating_sub(k);
            let offset = ((position * max_offset as f64).floor() as usize).min(max_offset);
            Ok(rank(
                snapshot,
                &target,
                metric,
                |e| scope.admits(e),
                k,
                offset,
            ))
        }
        Query::Emotion { weights } => {
            let target = emotion_target(anchors, weights)?;
            if snapshot.is_empty() {
                return Ok(Vec::new());
            }
            check_dims(snapshot, &target)?;
            Ok(rank(snapshot, &target, metric, |_| true, k, 0))
        }
    }
}

/// Rank every admitted row by distance to `target`.
///
/// Returns the hits at ranks `skip .. skip + k`.
pub fn rank<F>(
    snapshot: &IndexSnapshot,
    target: &[f32],
    metric: Metric,
    admit: F,
    k: usize,
    skip: usize,
) -> Vec<Hit>
where
    F: Fn(&IndexEntry) -> bool,
{
    if k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(usize, f32)> = snapshot
        .rows()
        .enumerate()
        .filter(|(_, (entry, _))| admit(entry))
        .map(|(i, (_, vector))| (i, metric.distance(target, vector)))
        .collect();

    let cmp = |a: &(usize, f32), b: &(usize, f32)| -> Ordering {
        a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)).then_with(|| {
            snapshot
                .entry(a.0)
                .comment_id
                .cmp(&snapshot.entry(b.0).comment_id)
        })
    };

    let wanted = skip.saturating_add(k);
    if wanted < scored.len() {
        scored.select_nth_unstable_by(wanted - 1, cmp);
        scored.truncate(wanted);
    }
    scored.sort_by(cmp);

    scored
        .into_iter()
        .skip(skip)
        .take(k)
        .map(|(position, distance)| Hit {
            position,
            comment_id: snapshot.entry(position).comment_id.clone(),
            distance,
        })
        .collect()
}

/// Arithmetic mean of the vectors admitted by `scope`.
///
/// Returns `None` when no row is admitted.
pub fn centroid(snapshot: &IndexSnapshot, scope: CentroidScope) -> Option<Vec<f32>> {
    let mut sum = vec![0.0f64; snapshot.dims()];
    let mut count = 0usize;
    for (entry, vector) in snapshot.rows() {
        if !scope.admits(entry) {
            continue;
        }
        for (acc, v) in sum.iter_mut().zip(vector) {
            *acc += *v as f64;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some(sum.into_iter().map(|s| (s / count as f64) as f32).collect())
}

/// Composite target `Σ wᵢ·aᵢ / Σ|wᵢ|`.
///
/// Weights are applied in key order so the floating-point sum is
/// reproducible. Zero total absolute weight is rejected.
pub fn emotion_target(
    anchors: &[EmotionAnchor],
    weights: &BTreeMap<String, f64>,
) -> Result<Vec<f32>, RetrievalError> {
    let mut dims: Option<usize> = None;
    let mut resolved: Vec<(&EmotionAnchor, f64)> = Vec::with_capacity(weights.len());
    for (key, &weight) in weights {
        if !weight.is_finite() {
            return Err(RetrievalError::InvalidWeight(key.clone()));
        }
        let anchor = anchors
            .iter()
            .find(|a| &a.key == key)
            .ok_or_else(|| RetrievalError::UnknownAxis(key.clone()))?;
        match dims {
            None => dims = Some(anchor.vector.len()),
            Some(d) if d != anchor.vector.len() => {
                return Err(RetrievalError::DimensionMismatch {
                    expected: d,
                    actual: anchor.vector.len(),
                })
            }
            Some(_) => {}
        }
        resolved.push((anchor, weight));
    }

    let total: f64 = resolved.iter().map(|(_, w)| w.abs()).sum();
    if total == 0.0 {
        return Err(RetrievalError::ZeroWeight);
    }

    let mut combined = vec![0.0f64; dims.unwrap_or(0)];
    for (anchor, weight) in resolved {
        for (acc, v) in combined.iter_mut().zip(&anchor.vector) {
            *acc += weight * *v as f64;
        }
    }
    Ok(combined.into_iter().map(|c| (c / total) as f32).collect())
}

fn check_dims(snapshot: &IndexSnapshot, vector: &[f32]) -> Result<(), RetrievalError> {
    if vector.len() != snapshot.dims() {
        return Err(RetrievalError::DimensionMismatch {
            expected: snapshot.dims(),
            actual: vector.len(),
        });
    }
    Ok(())
}
