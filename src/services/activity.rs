// src/services/activity.rs

//! Append-only sink for anti-cheat signals raised during an attempt.
//!
//! The recorder never interprets severity. Whatever should happen because of
//! the accumulated log is decided by an injected [`ActivityPolicy`].

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::access_record::{AccessRecord, ActivityKind, SuspiciousActivity},
    services::access::AccessController,
    utils::html::clean_detail,
};

/// What the session should do after a signal has been logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Continue,
    /// Mark the attempt for a human reviewer; the learner carries on.
    FlagForReview,
    /// End the attempt now, scoring whatever was answered.
    ForceSubmit,
}

/// Product rule mapping the activity log to an action.
pub trait ActivityPolicy: Send + Sync {
    fn evaluate(&self, record: &AccessRecord, latest: &SuspiciousActivity) -> PolicyAction;
}

/// Default policy: log everything, act on nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordOnly;

impl ActivityPolicy for RecordOnly {
    fn evaluate(&self, _record: &AccessRecord, _latest: &SuspiciousActivity) -> PolicyAction {
        PolicyAction::Continue
    }
}

impl<F> ActivityPolicy for F
where
    F: Fn(&AccessRecord, &SuspiciousActivity) -> PolicyAction + Send + Sync,
{
    fn evaluate(&self, record: &AccessRecord, latest: &SuspiciousActivity) -> PolicyAction {
        self(record, latest)
    }
}

/// Outcome of recording one signal.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedActivity {
    pub entry: SuspiciousActivity,
    pub action: PolicyAction,
}

#[derive(Clone)]
pub struct ActivityRecorder {
    access: Arc<AccessController>,
    policy: Arc<dyn ActivityPolicy>,
}

impl ActivityRecorder {
    pub fn new(access: Arc<AccessController>, policy: Arc<dyn ActivityPolicy>) -> Self {
        Self { access, policy }
    }

    pub fn record_only(access: Arc<AccessController>) -> Self {
        Self::new(access, Arc::new(RecordOnly))
    }

    /// Logs a signal against the learner's access record and asks the policy what to do.
    pub async fn record(
        &self,
        evaluation_id: &str,
        learner_id: &str,
        attempt_id: Option<Uuid>,
        kind: ActivityKind,
        detail: &str,
    ) -> Result<RecordedActivity, AppError> {
        let entry = SuspiciousActivity {
            kind,
            occurred_at: self.access.now(),
            detail: clean_detail(detail),
            occurrence: 0,
            attempt_id,
        };

        let (record, entry) = self
            .access
            .record_suspicious_activity(evaluation_id, learner_id, entry)
            .await?;
        let action = self.policy.evaluate(&record, &entry);
        if action != PolicyAction::Continue {
            tracing::info!(
                evaluation_id,
                learner_id,
                kind = kind.as_str(),
                ?action,
                "activity policy requested action"
            );
        }

        Ok(RecordedActivity { entry, action })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::access::testing;

    #[tokio::test]
    async fn test_default_policy_only_records() {
        let (controller, _) = testing::controller();
        let recorder = ActivityRecorder::record_only(controller.clone());

        let recorded = recorder
            .record("eval-1", "learner-1", None, ActivityKind::CopyAttempt, "ctrl+c")
            .await
            .unwrap();

        assert_eq!(recorded.action, PolicyAction::Continue);
        let record = controller.record("eval-1", "learner-1").await.unwrap();
        assert_eq!(record.activity.len(), 1);
        assert_eq!(record.activity[0].detail, "ctrl+c");
    }

    #[tokio::test]
    async fn test_injected_policy_sees_whole_log() {
        let (controller, _) = testing::controller();
        let policy = |record: &AccessRecord, latest: &SuspiciousActivity| {
            if record.activity_count(latest.kind, latest.attempt_id) >= 2 {
                PolicyAction::FlagForReview
            } else {
                PolicyAction::Continue
            }
        };
        let recorder = ActivityRecorder::new(controller, Arc::new(policy));

        let first = recorder
            .record("eval-1", "learner-1", None, ActivityKind::TabBlur, "")
            .await
            .unwrap();
        let second = recorder
            .record("eval-1", "learner-1", None, ActivityKind::TabBlur, "")
            .await
            .unwrap();

        assert_eq!(first.action, PolicyAction::Continue);
        assert_eq!(second.action, PolicyAction::FlagForReview);
        assert_eq!(second.entry.occurrence, 2);
    }

    #[tokio::test]
    async fn test_detail_is_sanitized() {
        let (controller, _) = testing::controller();
        let recorder = ActivityRecorder::record_only(controller);
        let recorded = recorder
            .record(
                "eval-1",
                "learner-1",
                None,
                ActivityKind::Other,
                "<img src=x onerror=alert(1)>note",
            )
            .await
            .unwrap();
        assert!(!recorded.entry.detail.contains("onerror"));
    }
}
