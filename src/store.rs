//! Comment store: subject, session and comment persistence.
//!
//! Upserts take a `&mut SqliteConnection` so the ingestion pipeline can
//! run them all inside one transaction per archive. Reads take the pool.
//!
//! Re-ingesting a comment overwrites every field except the two reaction
//! counters. Optional metadata (display names, avatars, commenter
//! snapshots) is COALESCEd so a sparser re-download never erases values
//! that were already known.

use anyhow::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use thiserror::Error;

use comment_harness_core::models::{Comment, Reaction, Session, Subject};

pub const MAX_REACTION_AMOUNT: i64 = 100;

/// Insert or update a subject by id.
///
/// Logins are unique per platform but can move between accounts. A stored
/// subject still holding this login under another id is renamed to
/// `login#subject_id` first, so the latest archive to use a login owns it.
pub async fn upsert_subject(conn: &mut SqliteConnection, subject: &Subject) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let released = sqlx::query(
        r#"
        UPDATE subjects
        SET login = login || '#' || subject_id, updated_at = ?
        WHERE platform = ? AND login = ? AND subject_id <> ?
        "#,
    )
    .bind(now)
    .bind(&subject.platform)
    .bind(&subject.login)
    .bind(subject.subject_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if released > 0 {
        tracing::info!(
            login = %subject.login,
            subject_id = subject.subject_id,
            "login moved to a new account; released it from the previous holder"
        );
    }

    sqlx::query(
        r#"
        INSERT INTO subjects (subject_id, login, display_name, profile_image_url, platform, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(subject_id) DO UPDATE SET
            login = excluded.login,
            display_name = COALESCE(excluded.display_name, subjects.display_name),
            profile_image_url = COALESCE(excluded.profile_image_url, subjects.profile_image_url),
            platform = excluded.platform,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(subject.subject_id)
    .bind(&subject.login)
    .bind(&subject.display_name)
    .bind(&subject.profile_image_url)
    .bind(&subject.platform)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn upsert_session(conn: &mut SqliteConnection, session: &Session) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO sessions
            (session_id, owner_subject_id, title, description, created_at,
             length_seconds, start_seconds, end_seconds, view_count, game_name,
             platform, url, ingested_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(session_id) DO UPDATE SET
            owner_subject_id = excluded.owner_subject_id,
            title = excluded.title,
            description = COALESCE(excluded.description, sessions.description),
            created_at = COALESCE(excluded.created_at, sessions.created_at),
            length_seconds = COALESCE(excluded.length_seconds, sessions.length_seconds),
            start_seconds = COALESCE(excluded.start_seconds, sessions.start_seconds),
            end_seconds = COALESCE(excluded.end_seconds, sessions.end_seconds),
            view_count = COALESCE(excluded.view_count, sessions.view_count),
            game_name = COALESCE(excluded.game_name, sessions.game_name),
            platform = excluded.platform,
            url = COALESCE(excluded.url, sessions.url),
            ingested_at = excluded.ingested_at
        "#,
    )
    .bind(session.session_id)
    .bind(session.owner_subject_id)
    .bind(&session.title)
    .bind(&session.description)
    .bind(session.created_at.map(|t| t.timestamp()))
    .bind(session.length_seconds)
    .bind(session.start_seconds)
    .bind(session.end_seconds)
    .bind(session.view_count)
    .bind(&session.game_name)
    .bind(&session.platform)
    .bind(&session.url)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert a comment, or overwrite everything but its reaction counters.
pub async fn upsert_comment(conn: &mut SqliteConnection, comment: &Comment) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let commenter = comment.commenter.as_ref();
    sqlx::query(
        r#"
        INSERT INTO comments
            (comment_id, session_id, offset_seconds, created_at,
             commenter_subject_id, commenter_login, commenter_display_name,
             body, user_color, bits_spent, raw_json, ingested_at,
             likes_count, dislikes_count)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(comment_id) DO UPDATE SET
            session_id = excluded.session_id,
            offset_seconds = excluded.offset_seconds,
            created_at = excluded.created_at,
            commenter_subject_id = COALESCE(excluded.commenter_subject_id, comments.commenter_subject_id),
            commenter_login = COALESCE(excluded.commenter_login, comments.commenter_login),
            commenter_display_name = COALESCE(excluded.commenter_display_name, comments.commenter_display_name),
            body = excluded.body,
            user_color = excluded.user_color,
            bits_spent = excluded.bits_spent,
            raw_json = excluded.raw_json,
            ingested_at = excluded.ingested_at
        "#,
    )
    .bind(&comment.comment_id)
    .bind(comment.session_id)
    .bind(comment.offset_seconds)
    .bind(comment.created_at.map(|t| t.timestamp()))
    .bind(commenter.map(|s| s.subject_id))
    .bind(commenter.map(|s| s.login.clone()))
    .bind(commenter.and_then(|s| s.display_name.clone()))
    .bind(&comment.body)
    .bind(&comment.user_color)
    .bind(comment.bits_spent)
    .bind(&comment.raw_json)
    .bind(now)
    .bind(comment.likes)
    .bind(comment.dislikes)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum ReactionError {
    #[error("reaction amount must be between 1 and {MAX_REACTION_AMOUNT}, got {0}")]
    InvalidAmount(i64),
    #[error("comment not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

/// Counter values after a reaction was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ReactionCounts {
    pub likes: i64,
    pub dislikes: i64,
}

/// Atomically add `amount` to one reaction counter.
///
/// A single `UPDATE` statement, so concurrent callers never lose an
/// increment.
pub async fn add_reaction(
    pool: &SqlitePool,
    comment_id: &str,
    reaction: Reaction,
    amount: i64,
) -> Result<ReactionCounts, ReactionError> {
    if !(1..=MAX_REACTION_AMOUNT).contains(&amount) {
        return Err(ReactionError::InvalidAmount(amount));
    }

    let column = reaction.column();
    let sql = format!(
        "UPDATE comments SET {column} = {column} + ? WHERE comment_id = ? \
         RETURNING likes_count, dislikes_count"
    );
    let row = sqlx::query(&sql)
        .bind(amount)
        .bind(comment_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => Ok(ReactionCounts {
            likes: r.get("likes_count"),
            dislikes: r.get("dislikes_count"),
        }),
        None => Err(ReactionError::NotFound(comment_id.to_string())),
    }
}

pub async fn find_subject_by_login(pool: &SqlitePool, login: &str) -> Result<Option<Subject>> {
    let row = sqlx::query(
        r#"
        SELECT subject_id, login, display_name, profile_image_url, platform
        FROM subjects
        WHERE login = ?
        ORDER BY subject_id
        LIMIT 1
        "#,
    )
    .bind(login.to_lowercase())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| Subject {
        subject_id: r.get("subject_id"),
        login: r.get("login"),
        display_name: r.get("display_name"),
        profile_image_url: r.get("profile_image_url"),
        platform: r.get("platform"),
    }))
}

/// Logins of every subject that owns at least one session.
pub async fn session_owner_logins(pool: &SqlitePool) -> Result<Vec<String>> {
    let logins: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT s.login
        FROM subjects s
        JOIN sessions v ON v.owner_subject_id = s.subject_id
        ORDER BY s.login
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(logins)
}

/// The fields of a stored comment the index builder needs.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexableComment {
    pub comment_id: String,
    pub session_id: i64,
    pub offset_seconds: i64,
    pub created_at: Option<i64>,
    pub body: String,
}

/// All comments in sessions owned by `subject_id`, in stable ingestion order.
pub async fn comments_for_subject(
    pool: &SqlitePool,
    subject_id: i64,
) -> Result<Vec<IndexableComment>> {
    let rows = sqlx::query(
        r#"
        SELECT c.comment_id, c.session_id, c.offset_seconds, c.created_at, c.body
        FROM comments c
        JOIN sessions v ON v.session_id = c.session_id
        WHERE v.owner_subject_id = ?
        ORDER BY c.session_id, c.offset_seconds, c.comment_id
        "#,
    )
    .bind(subject_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| IndexableComment {
            comment_id: r.get("comment_id"),
            session_id: r.get("session_id"),
            offset_seconds: r.get("offset_seconds"),
            created_at: r.get("created_at"),
            body: r.get("body"),
        })
        .collect())
}

/// Store-side fields attached to a retrieval hit.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CommentDetail {
    pub comment_id: String,
    pub body: String,
    pub commenter_login: Option<String>,
    pub commenter_display_name: Option<String>,
    pub likes: i64,
    pub dislikes: i64,
    pub session_title: String,
}

/// Current store state for a set of comments. Ids no longer in the store
/// are simply absent from the map.
pub async fn comment_details(
    pool: &SqlitePool,
    ids: &[String],
) -> Result<HashMap<String, CommentDetail>> {
    let mut out = HashMap::with_capacity(ids.len());
    if ids.is_empty() {
        return Ok(out);
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        r#"
        SELECT c.comment_id, c.body, c.commenter_login, c.commenter_display_name,
               c.likes_count, c.dislikes_count, v.title
        FROM comments c
        JOIN sessions v ON v.session_id = c.session_id
        WHERE c.comment_id IN ({placeholders})
        "#
    );
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    for r in query.fetch_all(pool).await? {
        let detail = CommentDetail {
            comment_id: r.get("comment_id"),
            body: r.get("body"),
            commenter_login: r.get("commenter_login"),
            commenter_display_name: r.get("commenter_display_name"),
            likes: r.get("likes_count"),
            dislikes: r.get("dislikes_count"),
            session_title: r.get("title"),
        };
        out.insert(detail.comment_id.clone(), detail);
    }
    Ok(out)
}
