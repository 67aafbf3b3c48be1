mod common;

use sqlx::Row;

use comment_harness::db;
use comment_harness::ingest::{run_ingest, IngestOptions};
use comment_harness::ledger::MarkerDecision;
use comment_harness::store::{self, ReactionError};
use comment_harness_core::models::Reaction;
use common::{archive, comment, setup, write_archive};

async fn store_rows(config: &comment_harness::config::Config) -> Vec<(String, String, i64, i64)> {
    let pool = db::connect(config).await.unwrap();
    let rows = sqlx::query(
        "SELECT comment_id, body, likes_count, dislikes_count FROM comments ORDER BY comment_id",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    pool.close().await;
    rows.iter()
        .map(|r| {
            (
                r.get("comment_id"),
                r.get("body"),
                r.get("likes_count"),
                r.get("dislikes_count"),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_ingest_is_idempotent() {
    let env = setup().await;
    write_archive(
        &env,
        1001,
        &archive(77, "alice", 1001, vec![comment("c1", 1.0, "hello"), comment("c2", 2.5, "gg")]),
    );
    write_archive(
        &env,
        1002,
        &archive(77, "alice", 1002, vec![comment("c3", 0.0, "back again")]),
    );

    let first = run_ingest(&env.config, &IngestOptions::default()).await.unwrap();
    assert_eq!(first.archives_seen, 2);
    assert_eq!(first.ingested, 2);
    assert_eq!(first.comments_upserted, 3);
    let before = store_rows(&env.config).await;

    let second = run_ingest(&env.config, &IngestOptions::default()).await.unwrap();
    assert_eq!(second.ingested, 0);
    assert_eq!(second.unchanged, 2);
    assert!(!second.has_failures());
    assert_eq!(store_rows(&env.config).await, before);
}

#[tokio::test]
async fn test_malformed_comment_is_skipped_alone() {
    let env = setup().await;
    let mut comments = vec![
        comment("c1", 1.0, "one"),
        comment("c2", 2.0, "two"),
        comment("c3", 3.0, "three"),
    ];
    comments.push(serde_json::json!({ "_id": "bad", "message": { "body": "no offset" } }));
    write_archive(&env, 1001, &archive(77, "alice", 1001, comments));

    let report = run_ingest(&env.config, &IngestOptions::default()).await.unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.comments_upserted, 3);
    assert_eq!(report.comments_skipped, 1);

    let pool = db::connect(&env.config).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments")
        .fetch_one(&pool)
        .await
        .unwrap();
    let marked: i64 =
        sqlx::query_scalar("SELECT comments_ingested FROM ingest_markers WHERE session_id = 1001")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 3);
    assert_eq!(marked, 3);
}

#[tokio::test]
async fn test_drift_is_reported_and_reingest_keeps_counters() {
    let env = setup().await;
    write_archive(
        &env,
        1001,
        &archive(77, "alice", 1001, vec![comment("c1", 1.0, "first"), comment("c2", 2.0, "second")]),
    );
    run_ingest(&env.config, &IngestOptions::default()).await.unwrap();

    let pool = db::connect(&env.config).await.unwrap();
    store::add_reaction(&pool, "c1", Reaction::Like, 3).await.unwrap();
    store::add_reaction(&pool, "c1", Reaction::Dislike, 1).await.unwrap();
    pool.close().await;

    // Same session, edited body: the hash no longer matches the marker.
    write_archive(
        &env,
        1001,
        &archive(77, "alice", 1001, vec![comment("c1", 1.0, "first, edited"), comment("c2", 2.0, "second")]),
    );

    let drifted = run_ingest(&env.config, &IngestOptions::default()).await.unwrap();
    assert_eq!(drifted.drifted, vec!["1001.json".to_string()]);
    assert_eq!(drifted.ingested, 0);
    let rows = store_rows(&env.config).await;
    assert_eq!(rows[0], ("c1".to_string(), "first".to_string(), 3, 1));

    let opts = IngestOptions {
        reingest: true,
        ..Default::default()
    };
    let reingested = run_ingest(&env.config, &opts).await.unwrap();
    assert_eq!(reingested.ingested, 1);
    let rows = store_rows(&env.config).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], ("c1".to_string(), "first, edited".to_string(), 3, 1));

    // The marker now tracks the new content.
    let again = run_ingest(&env.config, &IngestOptions::default()).await.unwrap();
    assert_eq!(again.unchanged, 1);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let env = setup().await;
    write_archive(&env, 1001, &archive(77, "alice", 1001, vec![comment("c1", 1.0, "hi")]));

    let opts = IngestOptions {
        dry_run: true,
        ..Default::default()
    };
    let report = run_ingest(&env.config, &opts).await.unwrap();
    assert_eq!(
        report.planned,
        vec![("1001.json".to_string(), MarkerDecision::Process)]
    );
    assert!(store_rows(&env.config).await.is_empty());
}

#[tokio::test]
async fn test_bad_archive_does_not_stop_the_run() {
    let env = setup().await;
    write_archive(&env, 1001, "{ not json");
    write_archive(&env, 1002, &archive(77, "alice", 1002, vec![comment("c1", 1.0, "ok")]));

    let report = run_ingest(&env.config, &IngestOptions::default()).await.unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "1001.json");
    assert_eq!(store_rows(&env.config).await.len(), 1);
}

async fn count_for(pool: &sqlx::SqlitePool, sql: &str, id: i64) -> i64 {
    sqlx::query_scalar(sql).bind(id).fetch_one(pool).await.unwrap()
}

#[tokio::test]
async fn test_failure_mid_transaction_leaves_nothing_behind() {
    let env = setup().await;
    let pool = db::connect(&env.config).await.unwrap();
    sqlx::query(
        r#"
        CREATE TRIGGER reject_explode BEFORE INSERT ON comments
        WHEN NEW.body = 'explode'
        BEGIN
            SELECT RAISE(ABORT, 'comment rejected by trigger');
        END
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    write_archive(&env, 1001, &archive(77, "alice", 1001, vec![comment("a1", 1.0, "fine")]));
    write_archive(
        &env,
        1002,
        &archive(
            88,
            "bob",
            1002,
            vec![comment("b0", 0.0, "also fine"), comment("b1", 2.0, "explode")],
        ),
    );

    let report = run_ingest(&env.config, &IngestOptions::default()).await.unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "1002.json");
    assert!(report.failed[0].1.contains("b1"));

    let comments = "SELECT COUNT(*) FROM comments WHERE session_id = ?";
    assert_eq!(count_for(&pool, comments, 1002).await, 0);
    assert_eq!(
        count_for(&pool, "SELECT COUNT(*) FROM ingest_markers WHERE session_id = ?", 1002).await,
        0
    );
    assert_eq!(
        count_for(&pool, "SELECT COUNT(*) FROM sessions WHERE session_id = ?", 1002).await,
        0
    );
    assert_eq!(
        count_for(&pool, "SELECT COUNT(*) FROM subjects WHERE subject_id = ?", 88).await,
        0
    );
    assert_eq!(count_for(&pool, comments, 1001).await, 1);

    sqlx::query("DROP TRIGGER reject_explode")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let rerun = run_ingest(&env.config, &IngestOptions::default()).await.unwrap();
    assert_eq!(rerun.ingested, 1);
    assert_eq!(rerun.unchanged, 1);
    assert!(!rerun.has_failures());
}

#[tokio::test]
async fn test_reclaimed_login_does_not_fail_the_archive() {
    let env = setup().await;
    let by = |id: &str, user_id: &str, name: &str| {
        serde_json::json!({
            "_id": id,
            "content_offset_seconds": 1.0,
            "commenter": { "_id": user_id, "name": name, "display_name": name },
            "message": { "body": "hi" }
        })
    };
    write_archive(&env, 1001, &archive(77, "alice", 1001, vec![by("a0", "5001", "viewer")]));
    write_archive(&env, 1002, &archive(77, "alice", 1002, vec![by("b0", "5002", "Viewer")]));

    let report = run_ingest(&env.config, &IngestOptions::default()).await.unwrap();
    assert!(!report.has_failures(), "{:?}", report.failed);
    assert_eq!(report.ingested, 2);
    assert_eq!(report.comments_upserted, 2);

    let pool = db::connect(&env.config).await.unwrap();
    let holder = store::find_subject_by_login(&pool, "viewer").await.unwrap().unwrap();
    assert_eq!(holder.subject_id, 5002);
    let previous: String = sqlx::query_scalar("SELECT login FROM subjects WHERE subject_id = 5001")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(previous, "viewer#5001");
    let commenter: String =
        sqlx::query_scalar("SELECT commenter_login FROM comments WHERE comment_id = 'b0'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(commenter, "viewer");
    pool.close().await;
}

#[tokio::test]
async fn test_marker_counts_repeated_ids_once() {
    let env = setup().await;
    write_archive(
        &env,
        1001,
        &archive(
            77,
            "alice",
            1001,
            vec![
                comment("c1", 1.0, "first"),
                comment("c2", 2.0, "second"),
                comment("c1", 3.0, "first, again"),
            ],
        ),
    );

    let report = run_ingest(&env.config, &IngestOptions::default()).await.unwrap();
    assert_eq!(report.comments_upserted, 2);

    let pool = db::connect(&env.config).await.unwrap();
    let recorded = count_for(
        &pool,
        "SELECT comments_ingested FROM ingest_markers WHERE session_id = ?",
        1001,
    )
    .await;
    pool.close().await;
    assert_eq!(recorded, 2);

    let rows = store_rows(&env.config).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].1, "first, again");
}

#[tokio::test]
async fn test_reactions_validate_amount_and_id() {
    let env = setup().await;
    write_archive(&env, 1001, &archive(77, "alice", 1001, vec![comment("c1", 1.0, "hi")]));
    run_ingest(&env.config, &IngestOptions::default()).await.unwrap();

    let pool = db::connect(&env.config).await.unwrap();
    assert!(matches!(
        store::add_reaction(&pool, "c1", Reaction::Like, 0).await,
        Err(ReactionError::InvalidAmount(0))
    ));
    assert!(matches!(
        store::add_reaction(&pool, "c1", Reaction::Like, 101).await,
        Err(ReactionError::InvalidAmount(101))
    ));
    assert!(matches!(
        store::add_reaction(&pool, "missing", Reaction::Like, 1).await,
        Err(ReactionError::NotFound(_))
    ));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            store::add_reaction(&pool, "c1", Reaction::Dislike, 2).await.unwrap()
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    let counts = store::add_reaction(&pool, "c1", Reaction::Like, 1).await.unwrap();
    assert_eq!(counts.likes, 1);
    assert_eq!(counts.dislikes, 20);
}
