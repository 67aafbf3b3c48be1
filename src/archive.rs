//! Comment archive discovery and parsing.
//!
//! An archive is one JSON file per session, named `<session_id>.json`, in
//! the layout written by the chat downloader:
//!
//! ```json
//! {
//!   "streamer": { "id": 123, "login": "alice", "name": "Alice" },
//!   "video":    { "id": "456", "title": "...", "created_at": "...", ... },
//!   "comments": [ { "_id": "...", "content_offset_seconds": 12, ... } ],
//!   "platform": "twitch"
//! }
//! ```
//!
//! Archive-level problems (unreadable JSON, missing `video`/`streamer`,
//! `video.id` not matching the filename) fail the whole archive. Problems
//! with a single comment only skip that comment and are reported as a
//! [`CommentRejection`].

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use comment_harness_core::models::{Comment, Session, Subject};

/// An archive file found on disk, not yet read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub filename: String,
    pub session_id: i64,
}

/// List `<session_id>.json` files directly under `dir`, in ascending
/// filename order. Anything else in the directory is ignored.
pub fn list_archives(dir: &Path) -> Result<Vec<ArchiveFile>> {
    if !dir.is_dir() {
        bail!("Archive directory does not exist: {}", dir.display());
    }

    let matcher = json_matcher()?;
    let mut files = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().to_string();
        if !matcher.is_match(&filename) {
            continue;
        }
        let Some(session_id) = session_id_from_filename(&filename) else {
            continue;
        };
        files.push(ArchiveFile {
            path: entry.path().to_path_buf(),
            filename,
            session_id,
        });
    }

    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}

fn json_matcher() -> Result<GlobMatcher> {
    Ok(Glob::new("*.json")?.compile_matcher())
}

/// `"12345.json"` → `Some(12345)`. Non-numeric stems give `None`.
pub fn session_id_from_filename(filename: &str) -> Option<i64> {
    let stem = filename.strip_suffix(".json")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// SHA-256 of the archive bytes, hex encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Why a single comment record was skipped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommentRejection {
    #[error("comment #{index}: missing or empty _id")]
    MissingId { index: usize },
    #[error("comment {id}: missing or non-numeric content_offset_seconds")]
    MissingOffset { id: String },
    #[error("comment {id}: negative content_offset_seconds {offset}")]
    NegativeOffset { id: String, offset: f64 },
    #[error("comment {id}: content_id {content_id} does not match session {session_id}")]
    SessionMismatch {
        id: String,
        content_id: i64,
        session_id: i64,
    },
    #[error("comment {id}: malformed record: {reason}")]
    Malformed { id: String, reason: String },
}

/// Result of parsing one archive.
#[derive(Debug, Clone)]
pub struct ParsedArchive {
    pub owner: Subject,
    pub session: Session,
    pub comments: Vec<Comment>,
    pub rejected: Vec<CommentRejection>,
}

impl ParsedArchive {
    /// Distinct commenter subjects, first occurrence wins.
    pub fn commenters(&self) -> Vec<&Subject> {
        let mut seen = std::collections::HashSet::new();
        self.comments
            .iter()
            .filter_map(|c| c.commenter.as_ref())
            .filter(|s| seen.insert(s.subject_id))
            .collect()
    }
}

/// Ids appear as either JSON numbers or numeric strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Num(i64),
    Str(String),
}

impl RawId {
    fn as_i64(&self) -> Option<i64> {
        match self {
            RawId::Num(n) => Some(*n),
            RawId::Str(s) => s.trim().parse().ok(),
        }
    }

    fn as_string(&self) -> String {
        match self {
            RawId::Num(n) => n.to_string(),
            RawId::Str(s) => s.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawArchive {
    streamer: Option<RawStreamer>,
    video: Option<RawVideo>,
    #[serde(default)]
    comments: Vec<serde_json::Value>,
    platform: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStreamer {
    id: RawId,
    login: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVideo {
    id: RawId,
    title: Option<String>,
    description: Option<String>,
    #[serde(rename = "created_at")]
    created_at: Option<String>,
    length: Option<f64>,
    start: Option<f64>,
    end: Option<f64>,
    view_count: Option<i64>,
    game: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    created_at: Option<String>,
    content_id: Option<RawId>,
    commenter: Option<RawCommenter>,
    message: Option<RawMessage>,
    likes: Option<i64>,
    dislikes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawCommenter {
    #[serde(rename = "_id")]
    id: Option<RawId>,
    name: Option<String>,
    display_name: Option<String>,
    logo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    body: Option<String>,
    user_color: Option<String>,
    bits_spent: Option<serde_json::Value>,
}

/// Parse archive bytes for the session named by the filename.
pub fn parse_archive(
    bytes: &[u8],
    expected_session_id: i64,
    default_platform: &str,
) -> Result<ParsedArchive> {
    let raw: RawArchive =
        serde_json::from_slice(bytes).with_context(|| "Archive is not valid JSON")?;

    let (Some(streamer), Some(video)) = (raw.streamer, raw.video) else {
        bail!("Archive has no video or streamer object");
    };

    let session_id = video
        .id
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("video.id is not numeric: {}", video.id.as_string()))?;
    if session_id != expected_session_id {
        bail!(
            "Filename session id ({}) does not match video.id ({})",
            expected_session_id,
            session_id
        );
    }

    let owner_id = streamer.id.as_i64().ok_or_else(|| {
        anyhow::anyhow!("streamer.id is not numeric: {}", streamer.id.as_string())
    })?;

    let platform = raw
        .platform
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| default_platform.to_string());

    let owner_login = streamer
        .login
        .clone()
        .filter(|l| !l.is_empty())
        .or_else(|| streamer.name.clone().filter(|n| !n.is_empty()))
        .unwrap_or_else(|| owner_id.to_string());

    let owner = Subject {
        subject_id: owner_id,
        login: owner_login.to_lowercase(),
        display_name: streamer.name,
        profile_image_url: None,
        platform: platform.clone(),
    };

    let session = Session {
        session_id,
        owner_subject_id: owner_id,
        title: video.title.unwrap_or_default(),
        description: video.description,
        created_at: video.created_at.as_deref().and_then(parse_timestamp),
        length_seconds: video.length.map(|v| v as i64),
        start_seconds: video.start.map(|v| v as i64),
        end_seconds: video.end.map(|v| v as i64),
        view_count: video.view_count,
        game_name: video.game,
        platform: platform.clone(),
        url: video.url,
    };

    // A repeated `_id` keeps its first position and its last content.
    let mut comments: Vec<Comment> = Vec::with_capacity(raw.comments.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut rejected = Vec::new();
    for (index, value) in raw.comments.into_iter().enumerate() {
        match parse_comment(index, value, session_id, &platform) {
            Ok(comment) => match positions.get(&comment.comment_id) {
                Some(&pos) => comments[pos] = comment,
                None => {
                    positions.insert(comment.comment_id.clone(), comments.len());
                    comments.push(comment);
                }
            },
            Err(rejection) => rejected.push(rejection),
        }
    }

    Ok(ParsedArchive {
        owner,
        session,
        comments,
        rejected,
    })
}

fn parse_comment(
    index: usize,
    value: serde_json::Value,
    session_id: i64,
    platform: &str,
) -> Result<Comment, CommentRejection> {
    let id = match value.get("_id") {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return Err(CommentRejection::MissingId { index }),
    };

    let offset = value
        .get("content_offset_seconds")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| CommentRejection::MissingOffset { id: id.clone() })?;
    if !offset.is_finite() || offset < 0.0 {
        return Err(CommentRejection::NegativeOffset {
            id: id.clone(),
            offset,
        });
    }

    let raw_json = value.to_string();
    let record: RawComment =
        serde_json::from_value(value).map_err(|e| CommentRejection::Malformed {
            id: id.clone(),
            reason: e.to_string(),
        })?;

    if let Some(content_id) = &record.content_id {
        match content_id.as_i64() {
            Some(cid) if cid == session_id => {}
            Some(cid) => {
                return Err(CommentRejection::SessionMismatch {
                    id,
                    content_id: cid,
                    session_id,
                })
            }
            None => {
                return Err(CommentRejection::Malformed {
                    id,
                    reason: format!("content_id is not numeric: {}", content_id.as_string()),
                })
            }
        }
    }

    let commenter = record.commenter.and_then(|c| {
        let subject_id = c.id.as_ref().and_then(RawId::as_i64)?;
        let login = c.name.filter(|n| !n.is_empty())?;
        Some(Subject {
            subject_id,
            login: login.to_lowercase(),
            display_name: c.display_name,
            profile_image_url: c.logo,
            platform: platform.to_string(),
        })
    });

    let message = record.message;
    let body = message
        .as_ref()
        .and_then(|m| m.body.clone())
        .unwrap_or_default();
    let user_color = message.as_ref().and_then(|m| m.user_color.clone());
    let bits_spent = message
        .as_ref()
        .and_then(|m| m.bits_spent.as_ref())
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())));

    Ok(Comment {
        comment_id: id,
        session_id,
        offset_seconds: offset.floor() as i64,
        created_at: record.created_at.as_deref().and_then(parse_timestamp),
        commenter,
        body,
        user_color,
        bits_spent,
        likes: record.likes.unwrap_or(0).max(0),
        dislikes: record.dislikes.unwrap_or(0).max(0),
        raw_json,
    })
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
