//! Core domain model for the lead data-quality engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ldq-core";

/// Leads and users are keyed by the store's integer ids.
pub type LeadId = i64;
pub type UserId = i64;

/// Upper bound on the candidate set fed into one scored-list comparison.
pub const MAX_CANDIDATES: usize = 50;

/// Scores below this floor are dropped before a report reaches a caller.
pub const MIN_REPORTED_SCORE: u8 = 50;

/// A duplicate report never carries more than this many matches.
pub const MAX_REPORTED_MATCHES: usize = 5;

/// Confidence assigned to every match found by the degraded exact matcher.
pub const FALLBACK_MATCH_SCORE: u8 = 75;

/// A persisted lead row. Created and edited by the CRUD layer; this engine
/// only reads it and, in the batch pipelines, writes `owner_id` or
/// `deleted_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub id: LeadId,
    pub contact_name: String,
    pub company: Option<String>,
    pub platform: String,
    pub deal_value: f64,
    pub notes: Option<String>,
    pub owner_id: Option<UserId>,
    pub stage: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LeadRecord {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// An unpersisted lead as submitted for pre-creation duplicate checking.
/// Every field tolerates being absent; an all-empty draft is a valid
/// "nothing to check" input, not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeadDraft {
    pub contact_name: String,
    pub company: Option<String>,
    pub platform: Option<String>,
    pub deal_value: f64,
    pub notes: Option<String>,
}

/// Display fields of a matched candidate, denormalized into the report so
/// callers never need a second lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadSnapshot {
    pub contact_name: String,
    pub company: Option<String>,
    pub platform: String,
    pub deal_value: f64,
    pub created_at: DateTime<Utc>,
    pub notes: Option<String>,
}

impl LeadSnapshot {
    pub fn of(record: &LeadRecord) -> Self {
        Self {
            contact_name: record.contact_name.clone(),
            company: record.company.clone(),
            platform: record.platform.clone(),
            deal_value: record.deal_value,
            created_at: record.created_at,
            notes: record.notes.clone(),
        }
    }
}

/// One scored duplicate candidate. `score` is at least
/// [`MIN_REPORTED_SCORE`] and at most 100 by the time it reaches a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub candidate_id: LeadId,
    pub score: u8,
    pub rationale: String,
    #[serde(flatten)]
    pub snapshot: LeadSnapshot,
}

/// Decision object returned by the real-time duplicate check and rendered
/// verbatim as the JSON response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateReport {
    pub has_duplicates: bool,
    pub duplicates: Vec<MatchResult>,
    pub highest_score: u8,
}

impl DuplicateReport {
    /// The zero-result shape: no candidates, nothing to report.
    pub fn none() -> Self {
        Self::default()
    }

    /// Assemble a report from already-filtered matches, sorting by score
    /// descending with ties broken by candidate recency, capped at
    /// [`MAX_REPORTED_MATCHES`].
    pub fn from_matches(mut matches: Vec<MatchResult>) -> Self {
        matches.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(b.snapshot.created_at.cmp(&a.snapshot.created_at))
        });
        matches.truncate(MAX_REPORTED_MATCHES);
        Self {
            has_duplicates: !matches.is_empty(),
            highest_score: matches.first().map(|m| m.score).unwrap_or(0),
            duplicates: matches,
        }
    }
}

/// Append-only activity log row. Batch pipelines write one per successful
/// mutation; `user_id` is `None` for system actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub lead_id: LeadId,
    pub kind: String,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
    pub user_id: Option<UserId>,
}
