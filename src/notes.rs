//! Context notes for heavily disliked comments.
//!
//! `chx notes generate` selects comments whose dislike counter reached
//! `notes.dislike_threshold` and that have no note yet, asks a
//! [`NoteProducer`] for a note, and stores the normalised result. With
//! `--force` every comment over the threshold is regenerated, and the notes
//! being replaced are first written to a JSON backup file.
//!
//! A producer that cannot come up with a usable note returns `None`; that
//! comment is counted as failed and the run continues.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;

use comment_harness_core::models::{NoteDraft, NoteScores, NoteStatus};

use crate::config::{Config, NotesConfig};
use crate::db;

const MAX_ISSUES: usize = 3;
const MAX_ASK_CHARS: usize = 255;

#[async_trait]
pub trait NoteProducer: Send + Sync {
    fn model_name(&self) -> &str;
    /// Produce a note for one comment. `Ok(None)` means no usable note.
    async fn produce(&self, comment_id: &str, body: &str) -> Result<Option<NoteDraft>>;
}

// ============ Reply parsing ============

/// Pull the JSON object out of a chat reply, tolerating code fences and
/// leading prose.
pub fn extract_json(content: &str) -> Option<serde_json::Value> {
    let mut cleaned = content.trim();
    if cleaned.starts_with("```") {
        cleaned = match cleaned.find('\n') {
            Some(nl) => &cleaned[nl + 1..],
            None => "",
        };
        cleaned = cleaned.trim_end();
        if let Some(stripped) = cleaned.strip_suffix("```") {
            cleaned = stripped;
        }
    }
    if let Some(brace) = cleaned.find('{') {
        cleaned = &cleaned[brace..];
    }
    serde_json::from_str(cleaned.trim()).ok()
}

fn clamp_score(value: Option<&serde_json::Value>) -> u8 {
    let n = match value {
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_f64().map(|f| f as i64))
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .unwrap_or(0),
        None => 0,
    };
    n.clamp(0, 100) as u8
}

/// Validate and normalise a producer payload.
///
/// `eligible` must be a JSON bool; everything else is coerced: unknown
/// status becomes `not_applicable`, scores are clamped to `0..=100`, at
/// most three issues are kept and `ask` is cut to 255 characters.
pub fn normalize_note(
    payload: serde_json::Value,
    model: &str,
    prompt_version: &str,
) -> Option<NoteDraft> {
    let eligible = payload.get("eligible")?.as_bool()?;

    let status = payload
        .get("status")
        .and_then(|s| s.as_str())
        .and_then(|s| s.parse::<NoteStatus>().ok())
        .unwrap_or(NoteStatus::NotApplicable);

    let scores = payload.get("scores");
    let score = |name: &str| clamp_score(scores.and_then(|s| s.get(name)));
    let scores = NoteScores {
        verifiability: score("verifiability"),
        harm_risk: score("harm_risk"),
        exaggeration: score("exaggeration"),
        evidence_gap: score("evidence_gap"),
        subjectivity: score("subjectivity"),
    };

    let issues = payload
        .get("issues")
        .and_then(|i| i.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .take(MAX_ISSUES)
                .collect()
        })
        .unwrap_or_default();

    let note = payload
        .get("note")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();
    let ask = payload
        .get("ask")
        .and_then(|a| a.as_str())
        .unwrap_or_default()
        .chars()
        .take(MAX_ASK_CHARS)
        .collect();

    Some(NoteDraft {
        eligible,
        status,
        note,
        scores,
        issues,
        ask,
        note_json: payload,
        model: model.to_string(),
        prompt_version: prompt_version.to_string(),
    })
}

// ============ OpenRouter producer ============

/// OpenAI-compatible chat completions against OpenRouter.
/// Requires `OPENROUTER_API_KEY`.
pub struct OpenRouterProducer {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    system_prompt: String,
    prompt_version: String,
    max_attempts: u32,
    retry_delay: Duration,
}

impl OpenRouterProducer {
    pub fn new(config: &NotesConfig) -> Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENROUTER_API_KEY environment variable not set"))?;
        let prompt_path = config
            .system_prompt_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("notes.system_prompt_path is not set"))?;
        let system_prompt = std::fs::read_to_string(prompt_path)
            .with_context(|| format!("Failed to read system prompt {}", prompt_path.display()))?
            .trim()
            .to_string();
        if system_prompt.is_empty() {
            bail!("System prompt file is empty: {}", prompt_path.display());
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            url: format!("{}/chat/completions", config.url.trim_end_matches('/')),
            model: config.model.clone(),
            system_prompt,
            prompt_version: config.prompt_version.clone(),
            max_attempts: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.request_interval_ms),
        })
    }
}

#[async_trait]
impl NoteProducer for OpenRouterProducer {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn produce(&self, comment_id: &str, body: &str) -> Result<Option<NoteDraft>> {
        let user_content = serde_json::json!({ "statement": body }).to_string();
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                { "role": "user", "content": user_content },
            ],
            "max_tokens": 1024,
            "temperature": 0.3,
        });

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry_delay).await;
            }

            let response = match self
                .client
                .post(&self.url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&payload)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(comment_id, attempt, error = %e, "note request failed");
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::warn!(comment_id, attempt, %status, "note request rejected, retrying");
                    continue;
                }
                bail!("OpenRouter API error {}: {}", status, text);
            }

            let data: serde_json::Value = response.json().await?;
            let choice = &data["choices"][0];
            let content = choice["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .trim();
            let finish_reason = choice["finish_reason"].as_str().unwrap_or_default();

            if content.is_empty() {
                tracing::warn!(comment_id, attempt, finish_reason, "empty note reply");
                continue;
            }
            if finish_reason == "length" && attempt < self.max_attempts {
                tracing::warn!(comment_id, attempt, "note reply truncated by max_tokens");
                continue;
            }

            let Some(parsed) = extract_json(content) else {
                tracing::warn!(comment_id, attempt, "note reply is not JSON");
                tracing::debug!(comment_id, content, "raw note reply");
                continue;
            };
            match normalize_note(parsed, &self.model, &self.prompt_version) {
                Some(draft) => return Ok(Some(draft)),
                None => {
                    tracing::warn!(comment_id, attempt, "note reply has no boolean `eligible`");
                    continue;
                }
            }
        }

        Ok(None)
    }
}

pub fn create_producer(config: &NotesConfig) -> Result<Box<dyn NoteProducer>> {
    match config.provider.as_str() {
        "openrouter" => Ok(Box::new(OpenRouterProducer::new(config)?)),
        "disabled" => bail!("Notes provider is disabled; set [notes] provider in config"),
        other => bail!("Unknown notes provider: {}", other),
    }
}

// ============ Persistence ============

#[derive(Debug, Clone, PartialEq)]
pub struct NoteTarget {
    pub comment_id: String,
    pub body: String,
    pub dislikes: i64,
    /// Existing `note_json`, only loaded on forced runs.
    pub existing: Option<String>,
}

/// Comments over the dislike threshold, most disliked first.
pub async fn note_targets(
    pool: &SqlitePool,
    threshold: i64,
    force: bool,
    limit: Option<usize>,
) -> Result<Vec<NoteTarget>> {
    let sql = if force {
        r#"
        SELECT c.comment_id, c.body, c.dislikes_count, n.note_json
        FROM comments c
        LEFT JOIN notes n ON n.comment_id = c.comment_id
        WHERE c.dislikes_count >= ?
        ORDER BY c.dislikes_count DESC, c.comment_id
        LIMIT ?
        "#
    } else {
        r#"
        SELECT c.comment_id, c.body, c.dislikes_count, NULL AS note_json
        FROM comments c
        LEFT JOIN notes n ON n.comment_id = c.comment_id
        WHERE c.dislikes_count >= ? AND n.note_id IS NULL
        ORDER BY c.dislikes_count DESC, c.comment_id
        LIMIT ?
        "#
    };
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let rows = sqlx::query(sql)
        .bind(threshold)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|r| NoteTarget {
            comment_id: r.get("comment_id"),
            body: r.get("body"),
            dislikes: r.get("dislikes_count"),
            existing: r.get("note_json"),
        })
        .collect())
}

/// Insert or replace the note for a comment, keeping its `created_at`.
pub async fn save_note(pool: &SqlitePool, comment_id: &str, draft: &NoteDraft) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO notes
            (comment_id, eligible, status, note,
             verifiability, harm_risk, exaggeration, evidence_gap, subjectivity,
             issues, ask, note_json, model, prompt_version, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(comment_id) DO UPDATE SET
            eligible = excluded.eligible,
            status = excluded.status,
            note = excluded.note,
            verifiability = excluded.verifiability,
            harm_risk = excluded.harm_risk,
            exaggeration = excluded.exaggeration,
            evidence_gap = excluded.evidence_gap,
            subjectivity = excluded.subjectivity,
            issues = excluded.issues,
            ask = excluded.ask,
            note_json = excluded.note_json,
            model = excluded.model,
            prompt_version = excluded.prompt_version,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(comment_id)
    .bind(draft.eligible)
    .bind(draft.status.as_str())
    .bind(&draft.note)
    .bind(draft.scores.verifiability as i64)
    .bind(draft.scores.harm_risk as i64)
    .bind(draft.scores.exaggeration as i64)
    .bind(draft.scores.evidence_gap as i64)
    .bind(draft.scores.subjectivity as i64)
    .bind(serde_json::to_string(&draft.issues)?)
    .bind(&draft.ask)
    .bind(draft.note_json.to_string())
    .bind(&draft.model)
    .bind(&draft.prompt_version)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Serialize)]
struct BackupEntry<'a> {
    comment_id: &'a str,
    old_note_json: &'a str,
}

/// Write the notes about to be replaced to `dir/backup_<timestamp>.json`.
pub fn backup_notes(dir: &Path, targets: &[NoteTarget]) -> Result<Option<PathBuf>> {
    let entries: Vec<BackupEntry> = targets
        .iter()
        .filter_map(|t| {
            t.existing.as_deref().map(|json| BackupEntry {
                comment_id: &t.comment_id,
                old_note_json: json,
            })
        })
        .collect();
    if entries.is_empty() {
        return Ok(None);
    }

    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%.3f");
    let path = dir.join(format!("backup_{}.json", stamp));
    std::fs::write(&path, serde_json::to_string_pretty(&entries)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(Some(path))
}

// ============ Batch run ============

#[derive(Debug, Clone, Default)]
pub struct NotesOptions {
    pub force: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotesReport {
    pub targets: usize,
    pub generated: usize,
    pub failed: usize,
    pub backup: Option<PathBuf>,
}

pub async fn run_generate_notes(
    config: &Config,
    producer: &dyn NoteProducer,
    opts: &NotesOptions,
) -> Result<NotesReport> {
    let pool = db::connect(config).await?;
    let targets = note_targets(
        &pool,
        config.notes.dislike_threshold,
        opts.force,
        opts.limit,
    )
    .await?;

    let mut report = NotesReport {
        targets: targets.len(),
        ..Default::default()
    };
    if targets.is_empty() {
        pool.close().await;
        return Ok(report);
    }

    if opts.force {
        report.backup = backup_notes(&config.notes.backup_dir, &targets)?;
        if let Some(path) = &report.backup {
            tracing::info!(path = %path.display(), "backed up existing notes");
        }
    }

    tracing::info!(
        model = producer.model_name(),
        targets = targets.len(),
        force = opts.force,
        "generating notes"
    );
    let interval = Duration::from_millis(config.notes.request_interval_ms);
    for (i, target) in targets.iter().enumerate() {
        if i > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }

        match producer.produce(&target.comment_id, &target.body).await {
            Ok(Some(draft)) => {
                save_note(&pool, &target.comment_id, &draft).await?;
                tracing::info!(
                    comment_id = %target.comment_id,
                    eligible = draft.eligible,
                    status = %draft.status,
                    danger = draft.scores.danger(),
                    "note saved"
                );
                report.generated += 1;
            }
            Ok(None) => {
                tracing::warn!(comment_id = %target.comment_id, "no usable note, skipping");
                report.failed += 1;
            }
            Err(e) => {
                tracing::warn!(comment_id = %target.comment_id, error = %format!("{:#}", e), "note generation failed");
                report.failed += 1;
            }
        }
    }

    pool.close().await;
    Ok(report)
}

pub fn print_report(report: &NotesReport) {
    println!("notes generate");
    println!("  targets: {}", report.targets);
    println!("  generated: {}", report.generated);
    println!("  failed: {}", report.failed);
    if let Some(path) = &report.backup {
        println!("  backup: {}", path.display());
    }
    if report.failed == 0 {
        println!("ok");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "```json\n{\"eligible\": true, \"note\": \"x\"}\n```";
        let v = extract_json(reply).unwrap();
        assert_eq!(v["eligible"], json!(true));
    }

    #[test]
    fn test_extract_json_skips_leading_prose() {
        let v = extract_json("only.{\"eligible\": false}").unwrap();
        assert_eq!(v["eligible"], json!(false));
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn test_normalize_requires_bool_eligible() {
        assert!(normalize_note(json!({ "eligible": "yes" }), "m", "v1").is_none());
        assert!(normalize_note(json!({ "note": "x" }), "m", "v1").is_none());
    }

    #[test]
    fn test_normalize_clamps_and_truncates() {
        let payload = json!({
            "eligible": true,
            "status": "supported",
            "note": "context",
            "scores": {
                "verifiability": 150,
                "harm_risk": -5,
                "exaggeration": "40",
                "evidence_gap": 12.9
            },
            "issues": ["a", "b", "c", "d"],
            "ask": "q".repeat(400)
        });
        let draft = normalize_note(payload, "model-x", "v3").unwrap();
        assert_eq!(draft.status, NoteStatus::Supported);
        assert_eq!(draft.scores.verifiability, 100);
        assert_eq!(draft.scores.harm_risk, 0);
        assert_eq!(draft.scores.exaggeration, 40);
        assert_eq!(draft.scores.evidence_gap, 12);
        assert_eq!(draft.scores.subjectivity, 0);
        assert_eq!(draft.issues, vec!["a", "b", "c"]);
        assert_eq!(draft.ask.chars().count(), 255);
        assert_eq!(draft.model, "model-x");
    }

    #[test]
    fn test_unknown_status_falls_back() {
        let draft = normalize_note(json!({ "eligible": false, "status": "???" }), "m", "v1").unwrap();
        assert_eq!(draft.status, NoteStatus::NotApplicable);
    }

    #[test]
    fn test_backup_skips_targets_without_notes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let none = vec![NoteTarget {
            comment_id: "a".into(),
            body: "b".into(),
            dislikes: 1,
            existing: None,
        }];
        assert!(backup_notes(tmp.path(), &none).unwrap().is_none());

        let some = vec![NoteTarget {
            comment_id: "a".into(),
            body: "b".into(),
            dislikes: 1,
            existing: Some("{\"eligible\":true}".into()),
        }];
        let path = backup_notes(tmp.path(), &some).unwrap().unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written[0]["comment_id"], json!("a"));
    }
}
