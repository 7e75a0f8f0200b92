// src/models/attempt.rs

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Submitted answers: question id -> selected (or typed) values.
pub type Answers = HashMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Completed,
    /// Superseded by a newer attempt before it was ever submitted.
    Abandoned,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(AttemptStatus::InProgress),
            "completed" => Some(AttemptStatus::Completed),
            "abandoned" => Some(AttemptStatus::Abandoned),
            _ => None,
        }
    }
}

/// One graded session. Kept forever as an audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    /// Id of the token that authorized this attempt.
    pub token_id: Uuid,
    pub evaluation_id: String,
    pub learner_id: String,
    pub started_at: DateTime<Utc>,
    pub answers: Answers,
    pub completed_at: Option<DateTime<Utc>>,
    pub score: Option<f64>,
    pub passed: Option<bool>,
    pub status: AttemptStatus,
    pub flagged_for_review: bool,
}

/// Claims carried by a signed attempt token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptTokenClaims {
    /// Token id, used to enforce single use.
    pub jti: Uuid,
    /// Learner id.
    pub sub: String,
    pub evaluation_id: String,
    /// Access record version the token was minted against.
    pub record_version: i64,
    /// Expiration time as Unix timestamp.
    pub exp: i64,
}

/// Persisted single-use bookkeeping for an issued token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub id: Uuid,
    pub evaluation_id: String,
    pub learner_id: String,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// DTO returned when a token is issued.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// DTO for recording the answer to one question.
#[derive(Debug, Deserialize, Validate)]
pub struct AnswerRequest {
    #[validate(length(max = 32))]
    pub values: Vec<String>,
}

/// Optional body of `begin`: a token previously obtained from the token endpoint.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct BeginRequest {
    #[serde(default)]
    #[validate(length(min = 1, max = 2048))]
    pub token: Option<String>,
}
