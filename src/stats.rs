//! Store, ledger and note counts.
//!
//! `chx stats` prints totals followed by one block per session owner, so
//! it is easy to see whether ingestion and note generation kept up.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectStats {
    pub login: String,
    pub sessions: i64,
    /// Sessions with an ingest marker.
    pub ingested: i64,
    pub comments: i64,
    pub likes: i64,
    pub dislikes: i64,
    pub notes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub subjects: i64,
    pub sessions: i64,
    pub comments: i64,
    pub markers: i64,
    pub notes: i64,
    pub by_subject: Vec<SubjectStats>,
}

async fn count_rows(pool: &SqlitePool, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    Ok(sqlx::query_scalar(&sql).fetch_one(pool).await?)
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<Stats> {
    let subjects = count_rows(pool, "subjects").await?;
    let sessions = count_rows(pool, "sessions").await?;
    let comments = count_rows(pool, "comments").await?;
    let markers = count_rows(pool, "ingest_markers").await?;
    let notes = count_rows(pool, "notes").await?;

    // Correlated subqueries keep the per-table counts from multiplying.
    let rows = sqlx::query(
        r#"
        SELECT
            s.login,
            (SELECT COUNT(*) FROM sessions se
                WHERE se.owner_subject_id = s.subject_id) AS sessions,
            (SELECT COUNT(*) FROM ingest_markers m
                JOIN sessions se ON se.session_id = m.session_id
                WHERE se.owner_subject_id = s.subject_id) AS ingested,
            (SELECT COUNT(*) FROM comments c
                JOIN sessions se ON se.session_id = c.session_id
                WHERE se.owner_subject_id = s.subject_id) AS comments,
            (SELECT COALESCE(SUM(c.likes_count), 0) FROM comments c
                JOIN sessions se ON se.session_id = c.session_id
                WHERE se.owner_subject_id = s.subject_id) AS likes,
            (SELECT COALESCE(SUM(c.dislikes_count), 0) FROM comments c
                JOIN sessions se ON se.session_id = c.session_id
                WHERE se.owner_subject_id = s.subject_id) AS dislikes,
            (SELECT COUNT(*) FROM notes n
                JOIN comments c ON c.comment_id = n.comment_id
                JOIN sessions se ON se.session_id = c.session_id
                WHERE se.owner_subject_id = s.subject_id) AS notes
        FROM subjects s
        WHERE EXISTS (SELECT 1 FROM sessions se WHERE se.owner_subject_id = s.subject_id)
        ORDER BY s.login
        "#,
    )
    .fetch_all(pool)
    .await?;

    let by_subject = rows
        .iter()
        .map(|r| SubjectStats {
            login: r.get("login"),
            sessions: r.get("sessions"),
            ingested: r.get("ingested"),
            comments: r.get("comments"),
            likes: r.get("likes"),
            dislikes: r.get("dislikes"),
            notes: r.get("notes"),
        })
        .collect();

    Ok(Stats {
        subjects,
        sessions,
        comments,
        markers,
        notes,
        by_subject,
    })
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("stats");
    println!("  database: {}", config.db.path.display());
    println!("  size: {}", format_bytes(db_size));
    println!("  subjects: {}", stats.subjects);
    println!("  sessions: {}", stats.sessions);
    println!("  ingested: {}", stats.markers);
    println!("  comments: {}", stats.comments);
    println!("  notes: {}", stats.notes);
    for s in &stats.by_subject {
        println!("  {}:", s.login);
        println!("    sessions: {} ({} ingested)", s.sessions, s.ingested);
        println!("    comments: {}", s.comments);
        println!("    likes: {}", s.likes);
        println!("    dislikes: {}", s.dislikes);
        println!("    notes: {}", s.notes);
    }
    println!("ok");
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
