//! Immutable per-subject vector index snapshots and their on-disk codec.
//!
//! An [`IndexSnapshot`] is a flat row-major `f32` matrix plus a parallel
//! table of [`IndexEntry`] records that carry just enough to render a
//! result (comment id, session, offset, timestamp, snippet) without a
//! store round-trip.
//!
//! A snapshot is persisted as two artifacts:
//!
//! ```text
//! vectors.bin   "CHXV" | u32 version | u64 generation | u32 dims | u64 count | f32 LE × dims × count
//! meta.json     IndexMeta { generation, dims, model, built_at, entries[] }
//! ```
//!
//! [`IndexSnapshot::from_artifacts`] refuses any pair whose generation,
//! dimensionality or row count disagree, so a reader can never assemble a
//! snapshot from two different builds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::{blob_to_vec, vec_to_blob};

const MAGIC: &[u8; 4] = b"CHXV";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 4 + 8;

#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    #[error("vector file has bad magic bytes")]
    BadMagic,
    #[error("unsupported vector file version {0}")]
    UnsupportedVersion(u32),
    #[error("vector file truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("vector dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("index artifacts disagree: {0}")]
    Inconsistent(String),
}

/// Per-row metadata stored next to each vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub comment_id: String,
    pub session_id: i64,
    pub offset_seconds: i64,
    /// Unix seconds, when the archive carried a timestamp.
    pub created_at: Option<i64>,
    /// Truncated comment body.
    pub snippet: String,
    /// SHA-256 of the full body the vector was computed from.
    pub body_hash: String,
}

/// The JSON companion of `vectors.bin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub generation: u64,
    pub dims: usize,
    pub model: String,
    pub built_at: i64,
    pub entries: Vec<IndexEntry>,
}

/// One published, immutable version of a subject's index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSnapshot {
    generation: u64,
    dims: usize,
    model: String,
    built_at: i64,
    entries: Vec<IndexEntry>,
    vectors: Vec<f32>,
}

impl IndexSnapshot {
    /// An empty snapshot (generation 0) that nothing has been published for.
    pub fn empty(dims: usize, model: &str) -> Self {
        Self {
            generation: 0,
            dims,
            model: model.to_string(),
            built_at: 0,
            entries: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Assemble a snapshot from rows, checking every vector's length.
    pub fn from_rows(
        generation: u64,
        dims: usize,
        model: &str,
        built_at: i64,
        rows: Vec<(IndexEntry, Vec<f32>)>,
    ) -> Result<Self, IndexError> {
        let mut entries = Vec::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len() * dims);
        for (entry, vector) in rows {
            if vector.len() != dims {
                return Err(IndexError::DimensionMismatch {
                    expected: dims,
                    actual: vector.len(),
                });
            }
            entries.push(entry);
            vectors.extend_from_slice(&vector);
        }
        Ok(Self {
            generation,
            dims,
            model: model.to_string(),
            built_at,
            entries,
            vectors,
        })
    }

    /// Rebuild a snapshot from its two persisted artifacts.
    pub fn from_artifacts(vectors_bin: &[u8], meta: IndexMeta) -> Result<Self, IndexError> {
        if vectors_bin.len() < HEADER_LEN {
            return Err(IndexError::Truncated {
                expected: HEADER_LEN,
                actual: vectors_bin.len(),
            });
        }
        if &vectors_bin[0..4] != MAGIC {
            return Err(IndexError::BadMagic);
        }
        let version = read_u32(&vectors_bin[4..8]);
        if version != FORMAT_VERSION {
            return Err(IndexError::UnsupportedVersion(version));
        }
        let generation = read_u64(&vectors_bin[8..16]);
        let dims = read_u32(&vectors_bin[16..20]) as usize;
        let count = read_u64(&vectors_bin[20..28]) as usize;

        if generation != meta.generation {
            return Err(IndexError::Inconsistent(format!(
                "vectors.bin is generation {}, meta.json is generation {}",
                generation, meta.generation
            )));
        }
        if dims != meta.dims {
            return Err(IndexError::Inconsistent(format!(
                "vectors.bin has {} dims, meta.json has {}",
                dims, meta.dims
            )));
        }
        if count != meta.entries.len() {
            return Err(IndexError::Inconsistent(format!(
                "vectors.bin has {} rows, meta.json has {}",
                count,
                meta.entries.len()
            )));
        }

        let expected = HEADER_LEN + count * dims * 4;
        if vectors_bin.len() != expected {
            return Err(IndexError::Truncated {
                expected,
                actual: vectors_bin.len(),
            });
        }

        Ok(Self {
            generation,
            dims,
            model: meta.model,
            built_at: meta.built_at,
            entries: meta.entries,
            vectors: blob_to_vec(&vectors_bin[HEADER_LEN..]),
        })
    }

    /// Serialize the vector matrix with its header.
    pub fn encode_vectors(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.vectors.len() * 4);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&(self.dims as u32).to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        out.extend_from_slice(&vec_to_blob(&self.vectors));
        out
    }

    /// The JSON companion for this snapshot.
    pub fn meta(&self) -> IndexMeta {
        IndexMeta {
            generation: self.generation,
            dims: self.dims,
            model: self.model.clone(),
            built_at: self.built_at,
            entries: self.entries.clone(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn built_at(&self) -> i64 {
        self.built_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn entry(&self, position: usize) -> &IndexEntry {
        &self.entries[position]
    }

    /// The vector stored at `position`.
    pub fn vector(&self, position: usize) -> &[f32] {
        let start = position * self.dims;
        &self.vectors[start..start + self.dims]
    }

    /// Iterate `(entry, vector)` pairs in ingestion order.
    pub fn rows(&self) -> impl Iterator<Item = (&IndexEntry, &[f32])> {
        self.entries
            .iter()
            .enumerate()
            .map(move |(i, e)| (e, self.vector(i)))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> IndexEntry {
        IndexEntry {
            comment_id: id.to_string(),
            session_id: 1,
            offset_seconds: 10,
            created_at: Some(1_700_000_000),
            snippet: format!("body {}", id),
            body_hash: String::new(),
        }
    }

    fn sample() -> IndexSnapshot {
        IndexSnapshot::from_rows(
            3,
            2,
            "test-model",
            42,
            vec![(entry("a"), vec![1.0, 0.0]), (entry("b"), vec![0.0, 1.0])],
        )
        .unwrap()
    }

    #[test]
    fn test_artifacts_reload_identically() {
        let snap = sample();
        let restored = IndexSnapshot::from_artifacts(&snap.encode_vectors(), snap.meta()).unwrap();
        assert_eq!(restored, snap);
        assert_eq!(restored.vector(1), &[0.0, 1.0]);
    }

    #[test]
    fn test_rejects_wrong_dimension_row() {
        let err = IndexSnapshot::from_rows(1, 3, "m", 0, vec![(entry("a"), vec![1.0])]).unwrap_err();
        assert_eq!(
            err,
            IndexError::DimensionMismatch {
                expected: 3,
                actual: 1
            }
        );
    }

    #[test]
    fn test_rejects_mixed_generations() {
        let snap = sample();
        let mut meta = snap.meta();
        meta.generation = 4;
        let err = IndexSnapshot::from_artifacts(&snap.encode_vectors(), meta).unwrap_err();
        assert!(matches!(err, IndexError::Inconsistent(_)));
    }

    #[test]
    fn test_rejects_row_count_mismatch() {
        let snap = sample();
        let mut meta = snap.meta();
        meta.entries.pop();
        let err = IndexSnapshot::from_artifacts(&snap.encode_vectors(), meta).unwrap_err();
        assert!(matches!(err, IndexError::Inconsistent(_)));
    }

    #[test]
    fn test_rejects_truncated_vectors() {
        let snap = sample();
        let mut bin = snap.encode_vectors();
        bin.truncate(bin.len() - 4);
        let err = IndexSnapshot::from_artifacts(&bin, snap.meta()).unwrap_err();
        assert!(matches!(err, IndexError::Truncated { .. }));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let snap = sample();
        let mut bin = snap.encode_vectors();
        bin[0] = b'X';
        assert_eq!(
            IndexSnapshot::from_artifacts(&bin, snap.meta()).unwrap_err(),
            IndexError::BadMagic
        );
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = IndexSnapshot::empty(4, "m");
        assert!(snap.is_empty());
        assert_eq!(snap.generation(), 0);
        assert_eq!(snap.rows().count(), 0);
    }
}
