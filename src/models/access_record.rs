// src/models/access_record.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Anti-cheat signal categories reported by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    CopyAttempt,
    PasteAttempt,
    TabBlur,
    ScreenshotAttempt,
    DevToolsOpen,
    ContextMenu,
    Other,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::CopyAttempt => "copy_attempt",
            ActivityKind::PasteAttempt => "paste_attempt",
            ActivityKind::TabBlur => "tab_blur",
            ActivityKind::ScreenshotAttempt => "screenshot_attempt",
            ActivityKind::DevToolsOpen => "dev_tools_open",
            ActivityKind::ContextMenu => "context_menu",
            ActivityKind::Other => "other",
        }
    }
}

/// One entry of the append-only suspicious-activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousActivity {
    pub kind: ActivityKind,
    pub occurred_at: DateTime<Utc>,
    pub detail: String,
    /// Number of times this kind has been seen during the attempt, this one included.
    pub occurrence: u32,
    pub attempt_id: Option<Uuid>,
}

/// Per (evaluation, learner) attempt accounting. Owned by the access controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub evaluation_id: String,
    pub learner_id: String,
    pub attempts_allowed: u32,
    pub attempts_used: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub has_passed: bool,
    /// Attempt currently started but not yet completed.
    pub active_attempt: Option<Uuid>,
    pub activity: Vec<SuspiciousActivity>,
    /// Revision counter; bumped by every persisted mutation.
    pub version: i64,
}

impl AccessRecord {
    pub fn new(evaluation_id: &str, learner_id: &str, attempts_allowed: u32) -> Self {
        AccessRecord {
            evaluation_id: evaluation_id.to_string(),
            learner_id: learner_id.to_string(),
            attempts_allowed,
            attempts_used: 0,
            locked_until: None,
            has_passed: false,
            active_attempt: None,
            activity: Vec::new(),
            version: 0,
        }
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.attempts_allowed.saturating_sub(self.attempts_used)
    }

    /// Occurrences of `kind` already logged against `attempt_id`.
    pub fn activity_count(&self, kind: ActivityKind, attempt_id: Option<Uuid>) -> u32 {
        self.activity
            .iter()
            .filter(|a| a.kind == kind && a.attempt_id == attempt_id)
            .count() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    Eligible,
    Locked,
    NoAttempts,
}

/// Result of an access query, as exposed to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessStatus {
    pub status: AccessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    /// Display string for the unlock countdown, e.g. "47h 59m".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_until_unlock: Option<String>,
    pub has_passed: bool,
}

impl AccessStatus {
    pub fn is_eligible(&self) -> bool {
        self.status == AccessState::Eligible
    }
}

/// DTO for reporting a suspicious-activity signal.
#[derive(Debug, Deserialize, Validate)]
pub struct ActivityRequest {
    pub kind: ActivityKind,
    #[serde(default)]
    #[validate(length(max = 500))]
    pub detail: String,
}
