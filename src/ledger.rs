//! Ingestion marker ledger.
//!
//! One row per session records the exact archive (by SHA-256) that was
//! last fully ingested for it. Ingestion consults the ledger before
//! touching any data and writes the marker inside the same transaction as
//! the comments, so a marker is only ever present for a committed archive.

use anyhow::Result;
use sqlx::{Row, SqliteConnection};

use comment_harness_core::models::IngestMarker;

/// What ingestion should do with an archive given its ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerDecision {
    /// No marker, or an explicit reingest.
    Process,
    /// Same bytes were already ingested.
    Unchanged,
    /// A different archive was ingested for this session before.
    Drifted,
}

impl MarkerDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkerDecision::Process => "process",
            MarkerDecision::Unchanged => "unchanged",
            MarkerDecision::Drifted => "drifted",
        }
    }
}

pub fn hash_matches(marker: &IngestMarker, sha256: &str) -> bool {
    marker.source_sha256.eq_ignore_ascii_case(sha256)
}

pub fn decide(marker: Option<&IngestMarker>, sha256: &str, reingest: bool) -> MarkerDecision {
    if reingest {
        return MarkerDecision::Process;
    }
    match marker {
        None => MarkerDecision::Process,
        Some(m) if hash_matches(m, sha256) => MarkerDecision::Unchanged,
        Some(_) => MarkerDecision::Drifted,
    }
}

pub async fn lookup(conn: &mut SqliteConnection, session_id: i64) -> Result<Option<IngestMarker>> {
    let row = sqlx::query(
        r#"
        SELECT session_id, source_filename, source_sha256, source_size,
               comments_ingested, completed_at, updated_at
        FROM ingest_markers
        WHERE session_id = ?
        "#,
    )
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|r| IngestMarker {
        session_id: r.get("session_id"),
        source_filename: r.get("source_filename"),
        source_sha256: r.get("source_sha256"),
        source_size: r.get("source_size"),
        comments_ingested: r.get("comments_ingested"),
        completed_at: r.get("completed_at"),
        updated_at: r.get("updated_at"),
    }))
}

/// Insert or refresh the marker for a session.
///
/// `completed_at` keeps its first value; `updated_at` advances.
pub async fn record(
    conn: &mut SqliteConnection,
    session_id: i64,
    filename: &str,
    sha256: &str,
    size: i64,
    comments_ingested: i64,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO ingest_markers
            (session_id, source_filename, source_sha256, source_size,
             comments_ingested, completed_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(session_id) DO UPDATE SET
            source_filename = excluded.source_filename,
            source_sha256 = excluded.source_sha256,
            source_size = excluded.source_size,
            comments_ingested = excluded.comments_ingested,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(session_id)
    .bind(filename)
    .bind(sha256.to_ascii_lowercase())
    .bind(size)
    .bind(comments_ingested)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
