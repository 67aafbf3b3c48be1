//! Core data models shared by the ingestion, indexing and retrieval layers.
//!
//! These are plain data carriers. Persistence lives in the application
//! crate; the types here only describe what flows between the stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A content owner (or commenter) that comments are grouped under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub subject_id: i64,
    pub login: String,
    pub display_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub platform: String,
}

/// A recorded unit (a broadcast VOD) owned by exactly one [`Subject`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: i64,
    pub owner_subject_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub length_seconds: Option<i64>,
    pub start_seconds: Option<i64>,
    pub end_seconds: Option<i64>,
    pub view_count: Option<i64>,
    pub game_name: Option<String>,
    pub platform: String,
    pub url: Option<String>,
}

/// A single timestamped chat comment as produced by archive parsing.
///
/// `comment_id` is the external id and the sole upsert key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: String,
    pub session_id: i64,
    pub offset_seconds: i64,
    pub created_at: Option<DateTime<Utc>>,
    /// Commenter identity; `None` for anonymised or deleted accounts.
    pub commenter: Option<Subject>,
    pub body: String,
    pub user_color: Option<String>,
    pub bits_spent: Option<i64>,
    /// Initial reaction counters carried by the archive. Only used on
    /// first insert; existing counters are never overwritten.
    pub likes: i64,
    pub dislikes: i64,
    /// The original comment record, stored verbatim.
    pub raw_json: String,
}

/// The two independent reaction counters on a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    Like,
    Dislike,
}

impl Reaction {
    /// Column holding this counter in the `comments` table.
    pub fn column(self) -> &'static str {
        match self {
            Reaction::Like => "likes_count",
            Reaction::Dislike => "dislikes_count",
        }
    }
}

/// Ledger entry proving an archive was fully ingested for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestMarker {
    pub session_id: i64,
    pub source_filename: String,
    pub source_sha256: String,
    pub source_size: i64,
    pub comments_ingested: i64,
    pub completed_at: i64,
    pub updated_at: i64,
}

/// Closed set of verdicts a note can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    Supported,
    Insufficient,
    Inconsistent,
    NotApplicable,
}

impl NoteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NoteStatus::Supported => "supported",
            NoteStatus::Insufficient => "insufficient",
            NoteStatus::Inconsistent => "inconsistent",
            NoteStatus::NotApplicable => "not_applicable",
        }
    }
}

impl fmt::Display for NoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supported" => Ok(NoteStatus::Supported),
            "insufficient" => Ok(NoteStatus::Insufficient),
            "inconsistent" => Ok(NoteStatus::Inconsistent),
            "not_applicable" => Ok(NoteStatus::NotApplicable),
            other => Err(format!("unknown note status: {}", other)),
        }
    }
}

/// Bounded ordinal scores attached to a note. Every score is in `0..=100`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteScores {
    pub verifiability: u8,
    pub harm_risk: u8,
    pub exaggeration: u8,
    pub evidence_gap: u8,
    pub subjectivity: u8,
}

impl NoteScores {
    /// Mean of the four risk scores (verifiability excluded).
    pub fn danger(&self) -> f64 {
        (self.harm_risk as f64
            + self.exaggeration as f64
            + self.evidence_gap as f64
            + self.subjectivity as f64)
            / 4.0
    }
}

/// A note ready to be persisted against one comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteDraft {
    pub eligible: bool,
    pub status: NoteStatus,
    pub note: String,
    pub scores: NoteScores,
    pub issues: Vec<String>,
    pub ask: String,
    /// The full producer payload, kept for auditing.
    pub note_json: serde_json::Value,
    pub model: String,
    pub prompt_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_status_roundtrip_names() {
        for status in [
            NoteStatus::Supported,
            NoteStatus::Insufficient,
            NoteStatus::Inconsistent,
            NoteStatus::NotApplicable,
        ] {
            assert_eq!(status.as_str().parse::<NoteStatus>().unwrap(), status);
        }
        assert!("maybe".parse::<NoteStatus>().is_err());
    }

    #[test]
    fn test_danger_ignores_verifiability() {
        let scores = NoteScores {
            verifiability: 100,
            harm_risk: 40,
            exaggeration: 20,
            evidence_gap: 0,
            subjectivity: 20,
        };
        assert!((scores.danger() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_reaction_columns() {
        assert_eq!(Reaction::Like.column(), "likes_count");
        assert_eq!(Reaction::Dislike.column(), "dislikes_count");
    }
}
