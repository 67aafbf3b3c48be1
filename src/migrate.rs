use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Subjects: content owners and commenters
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subjects (
            subject_id INTEGER PRIMARY KEY,
            login TEXT NOT NULL,
            display_name TEXT,
            profile_image_url TEXT,
            platform TEXT NOT NULL DEFAULT 'twitch',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(platform, login)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Sessions: one recorded VOD owned by a subject
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            session_id INTEGER PRIMARY KEY,
            owner_subject_id INTEGER NOT NULL REFERENCES subjects(subject_id),
            title TEXT NOT NULL DEFAULT '',
            description TEXT,
            created_at INTEGER,
            length_seconds INTEGER,
            start_seconds INTEGER,
            end_seconds INTEGER,
            view_count INTEGER,
            game_name TEXT,
            platform TEXT NOT NULL DEFAULT 'twitch',
            url TEXT,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS comments (
            comment_id TEXT PRIMARY KEY,
            session_id INTEGER NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
            offset_seconds INTEGER NOT NULL CHECK (offset_seconds >= 0),
            created_at INTEGER,
            commenter_subject_id INTEGER REFERENCES subjects(subject_id) ON DELETE SET NULL,
            commenter_login TEXT,
            commenter_display_name TEXT,
            body TEXT NOT NULL,
            user_color TEXT,
            bits_spent INTEGER,
            raw_json TEXT,
            ingested_at INTEGER NOT NULL,
            likes_count INTEGER NOT NULL DEFAULT 0 CHECK (likes_count >= 0),
            dislikes_count INTEGER NOT NULL DEFAULT 0 CHECK (dislikes_count >= 0)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Marker ledger: one row per fully ingested archive
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_markers (
            session_id INTEGER PRIMARY KEY REFERENCES sessions(session_id) ON DELETE CASCADE,
            source_filename TEXT NOT NULL,
            source_sha256 CHAR(64) NOT NULL,
            source_size INTEGER NOT NULL,
            comments_ingested INTEGER NOT NULL,
            completed_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notes (
            note_id INTEGER PRIMARY KEY AUTOINCREMENT,
            comment_id TEXT NOT NULL UNIQUE REFERENCES comments(comment_id) ON DELETE CASCADE,
            eligible INTEGER NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('supported', 'insufficient', 'inconsistent', 'not_applicable')),
            note TEXT NOT NULL DEFAULT '',
            verifiability INTEGER NOT NULL CHECK (verifiability BETWEEN 0 AND 100),
            harm_risk INTEGER NOT NULL CHECK (harm_risk BETWEEN 0 AND 100),
            exaggeration INTEGER NOT NULL CHECK (exaggeration BETWEEN 0 AND 100),
            evidence_gap INTEGER NOT NULL CHECK (evidence_gap BETWEEN 0 AND 100),
            subjectivity INTEGER NOT NULL CHECK (subjectivity BETWEEN 0 AND 100),
            issues TEXT NOT NULL DEFAULT '[]',
            ask TEXT NOT NULL DEFAULT '',
            note_json TEXT NOT NULL,
            model TEXT NOT NULL,
            prompt_version TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner_subject_id)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_comments_session ON comments(session_id, offset_seconds)",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_comments_commenter ON comments(commenter_subject_id)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_comments_dislikes ON comments(dislikes_count)")
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}
