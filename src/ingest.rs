//! Ingestion pipeline orchestration.
//!
//! Walks an archive directory in filename order and, for each archive,
//! consults the marker ledger, parses and validates the archive, then
//! writes subjects, the session, every valid comment and the marker in a
//! single transaction. A failing archive is rolled back and reported; the
//! batch carries on with the next one.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::path::PathBuf;

use crate::archive::{self, ArchiveFile, ParsedArchive};
use crate::config::Config;
use crate::db;
use crate::ledger::{self, MarkerDecision};
use crate::store;

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Overrides `archives.dir`.
    pub dir: Option<PathBuf>,
    /// Process archives even when a marker exists, rewriting the marker.
    pub reingest: bool,
    /// Report ledger decisions without writing anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub archives_seen: usize,
    pub ingested: usize,
    pub unchanged: usize,
    pub drifted: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub comments_upserted: u64,
    pub comments_skipped: u64,
    /// Per-archive ledger decision; only filled on dry runs.
    pub planned: Vec<(String, MarkerDecision)>,
}

impl IngestReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

pub async fn run_ingest(config: &Config, opts: &IngestOptions) -> Result<IngestReport> {
    let dir = opts.dir.clone().unwrap_or_else(|| config.archives.dir.clone());
    let files = archive::list_archives(&dir)?;
    let pool = db::connect(config).await?;

    let mut report = IngestReport {
        archives_seen: files.len(),
        ..Default::default()
    };

    for file in &files {
        let bytes = match tokio::fs::read(&file.path).await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(file = %file.filename, error = %e, "failed to read archive");
                report.failed.push((file.filename.clone(), e.to_string()));
                continue;
            }
        };
        let sha256 = archive::sha256_hex(&bytes);

        let marker = {
            let mut conn = pool.acquire().await?;
            ledger::lookup(&mut *conn, file.session_id).await?
        };
        let decision = ledger::decide(marker.as_ref(), &sha256, opts.reingest);

        if opts.dry_run {
            report.planned.push((file.filename.clone(), decision));
            continue;
        }

        match decision {
            MarkerDecision::Unchanged => {
                tracing::debug!(file = %file.filename, "archive unchanged, skipping");
                report.unchanged += 1;
                continue;
            }
            MarkerDecision::Drifted => {
                tracing::warn!(
                    file = %file.filename,
                    session_id = file.session_id,
                    "archive content differs from the ingested version; rerun with --reingest to replace it"
                );
                report.drifted.push(file.filename.clone());
                continue;
            }
            MarkerDecision::Process => {}
        }

        let parsed = match archive::parse_archive(&bytes, file.session_id, &config.archives.platform)
        {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(file = %file.filename, error = %format!("{:#}", e), "invalid archive");
                report.failed.push((file.filename.clone(), format!("{:#}", e)));
                continue;
            }
        };

        for rejection in &parsed.rejected {
            tracing::debug!(file = %file.filename, "skipped {}", rejection);
        }
        report.comments_skipped += parsed.rejected.len() as u64;

        match write_archive(&pool, file, &parsed, &sha256, bytes.len() as i64).await {
            Ok(count) => {
                tracing::info!(
                    file = %file.filename,
                    session_id = file.session_id,
                    comments = count,
                    skipped = parsed.rejected.len(),
                    "ingested archive"
                );
                report.ingested += 1;
                report.comments_upserted += count as u64;
            }
            Err(e) => {
                tracing::error!(file = %file.filename, error = %format!("{:#}", e), "archive rolled back");
                report.failed.push((file.filename.clone(), format!("{:#}", e)));
            }
        }
    }

    pool.close().await;
    Ok(report)
}

/// Write one parsed archive and its marker atomically.
async fn write_archive(
    pool: &SqlitePool,
    file: &ArchiveFile,
    parsed: &ParsedArchive,
    sha256: &str,
    size: i64,
) -> Result<usize> {
    let mut tx = pool.begin().await?;

    store::upsert_subject(&mut *tx, &parsed.owner)
        .await
        .context("upserting owner")?;
    store::upsert_session(&mut *tx, &parsed.session)
        .await
        .context("upserting session")?;
    for commenter in parsed.commenters() {
        store::upsert_subject(&mut *tx, commenter)
            .await
            .with_context(|| format!("upserting commenter {}", commenter.login))?;
    }
    for comment in &parsed.comments {
        store::upsert_comment(&mut *tx, comment)
            .await
            .with_context(|| format!("upserting comment {}", comment.comment_id))?;
    }
    ledger::record(
        &mut *tx,
        file.session_id,
        &file.filename,
        sha256,
        size,
        parsed.comments.len() as i64,
    )
    .await
    .context("recording marker")?;

    tx.commit().await?;
    Ok(parsed.comments.len())
}

/// Print a report in `key: value` form.
pub fn print_report(report: &IngestReport, dry_run: bool) {
    if dry_run {
        println!("ingest (dry-run)");
        println!("  archives found: {}", report.archives_seen);
        for (file, decision) in &report.planned {
            println!("  {}: {}", file, decision.as_str());
        }
        return;
    }

    println!("ingest");
    println!("  archives found: {}", report.archives_seen);
    println!("  ingested: {}", report.ingested);
    println!("  unchanged: {}", report.unchanged);
    println!("  drifted: {}", report.drifted.len());
    for file in &report.drifted {
        println!("    {}", file);
    }
    println!("  failed: {}", report.failed.len());
    for (file, err) in &report.failed {
        println!("    {}: {}", file, err);
    }
    println!("  comments upserted: {}", report.comments_upserted);
    println!("  comments skipped: {}", report.comments_skipped);
    if !report.has_failures() {
        println!("ok");
    }
}
