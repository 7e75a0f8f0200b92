// src/services/access.rs

//! Single source of truth for "may this learner attempt this evaluation now".
//!
//! Only the access controller mints and consumes attempt tokens and mutates
//! access records. Every record mutation goes through the store's optimistic
//! version check; a conflicting write is retried once after re-reading the
//! record and re-validating eligibility.

use std::{future::Future, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        access_record::{AccessRecord, AccessState, AccessStatus, SuspiciousActivity},
        attempt::{Answers, Attempt, AttemptStatus, AttemptTokenClaims, IssuedToken, TokenRecord},
        evaluation::Evaluation,
    },
    store::{AccessStore, EvaluationCatalog},
    utils::{
        clock::{Clock, format_time_until_unlock},
        jwt::{decode_attempt_token, sign_attempt_token},
    },
};

/// Runs `op`, and runs it exactly once more if it lost an optimistic race.
async fn retry_once<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    match op().await {
        Err(AppError::RecordVersionMismatch) => {
            tracing::warn!("{}: access record changed concurrently, retrying once", op_name);
            op().await
        }
        other => other,
    }
}

pub struct AccessController {
    store: Arc<dyn AccessStore>,
    catalog: Arc<dyn EvaluationCatalog>,
    clock: Arc<dyn Clock>,
    token_secret: String,
    token_ttl_seconds: i64,
}

impl AccessController {
    pub fn new(
        store: Arc<dyn AccessStore>,
        catalog: Arc<dyn EvaluationCatalog>,
        clock: Arc<dyn Clock>,
        token_secret: impl Into<String>,
        token_ttl_seconds: i64,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
            token_secret: token_secret.into(),
            token_ttl_seconds,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Looks up an evaluation definition.
    pub fn evaluation(&self, evaluation_id: &str) -> Result<Arc<Evaluation>, AppError> {
        self.catalog
            .get(evaluation_id)
            .ok_or_else(|| AppError::EvaluationNotFound(evaluation_id.to_string()))
    }

    /// Reports whether the learner may start an attempt right now.
    ///
    /// An elapsed lockout is cleared (and the attempt budget reset) as a side
    /// effect before eligibility is decided.
    pub async fn evaluate_access(
        &self,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<AccessStatus, AppError> {
        let evaluation = self.evaluation(evaluation_id)?;
        let record = retry_once("evaluate_access", || self.refresh(&evaluation, learner_id)).await?;
        Ok(self.status_of(&record))
    }

    /// Mints a single-use attempt token bound to the current record version.
    ///
    /// Does not touch the attempt budget.
    pub async fn issue_token(
        &self,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<IssuedToken, AppError> {
        let evaluation = self.evaluation(evaluation_id)?;
        let record = retry_once("issue_token", || self.refresh(&evaluation, learner_id)).await?;
        ensure_eligible(&self.status_of(&record))?;

        let now = self.now();
        let expires_at = Duration::try_seconds(self.token_ttl_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| {
                AppError::InternalServerError(format!(
                    "token ttl of {}s is out of range",
                    self.token_ttl_seconds
                ))
            })?;
        let claims = AttemptTokenClaims {
            jti: Uuid::new_v4(),
            sub: learner_id.to_string(),
            evaluation_id: evaluation.id.clone(),
            record_version: record.version,
            exp: expires_at.timestamp(),
        };

        self.store
            .insert_token(&TokenRecord {
                id: claims.jti,
                evaluation_id: claims.evaluation_id.clone(),
                learner_id: claims.sub.clone(),
                expires_at,
                consumed_at: None,
            })
            .await?;
        let token = sign_attempt_token(&claims, &self.token_secret)?;

        tracing::info!(
            evaluation_id,
            learner_id,
            token_id = %claims.jti,
            record_version = record.version,
            "attempt token issued"
        );

        Ok(IssuedToken {
            token_id: claims.jti,
            token,
            expires_at,
        })
    }

    /// Consumes `token` and opens a new attempt.
    ///
    /// The attempt budget is only charged on completion, so an attempt that is
    /// never submitted costs nothing. Any unfinished earlier attempt is marked
    /// abandoned.
    pub async fn start_attempt(&self, token: &str) -> Result<Attempt, AppError> {
        let claims = decode_attempt_token(token, &self.token_secret)?;
        self.start_with_claims(claims).await
    }

    /// Like [`AccessController::start_attempt`], but rejects a token minted
    /// for another learner or evaluation.
    pub async fn start_attempt_as(
        &self,
        token: &str,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<Attempt, AppError> {
        let claims = decode_attempt_token(token, &self.token_secret)?;
        if claims.sub != learner_id || claims.evaluation_id != evaluation_id {
            return Err(AppError::AuthError(
                "Attempt token was not issued for this session".to_string(),
            ));
        }
        self.start_with_claims(claims).await
    }

    async fn start_with_claims(&self, claims: AttemptTokenClaims) -> Result<Attempt, AppError> {
        let evaluation = self.evaluation(&claims.evaluation_id)?;

        let attempt =
            retry_once("start_attempt", || self.try_start_attempt(&claims, &evaluation)).await?;

        tracing::info!(
            evaluation_id = %attempt.evaluation_id,
            learner_id = %attempt.learner_id,
            attempt_id = %attempt.id,
            "attempt started"
        );
        Ok(attempt)
    }

    async fn try_start_attempt(
        &self,
        claims: &AttemptTokenClaims,
        evaluation: &Evaluation,
    ) -> Result<Attempt, AppError> {
        let now = self.now();

        let token = self
            .store
            .load_token(claims.jti)
            .await?
            .ok_or_else(|| AppError::AuthError("Unknown attempt token".to_string()))?;
        if token.consumed_at.is_some() {
            return Err(AppError::TokenAlreadyUsed);
        }
        if now.timestamp() >= claims.exp || now >= token.expires_at {
            return Err(AppError::TokenExpired);
        }

        let mut record = self.refresh(evaluation, &claims.sub).await?;
        if record.version != claims.record_version {
            return Err(AppError::RecordVersionMismatch);
        }
        ensure_eligible(&self.status_of(&record))?;

        let superseded = record.active_attempt;
        let attempt = Attempt {
            id: Uuid::new_v4(),
            token_id: claims.jti,
            evaluation_id: evaluation.id.clone(),
            learner_id: claims.sub.clone(),
            started_at: now,
            answers: Answers::new(),
            completed_at: None,
            score: None,
            passed: None,
            status: AttemptStatus::InProgress,
            flagged_for_review: false,
        };

        // The attempt row exists before the record points at it.
        self.store.save_attempt(&attempt).await?;
        record.active_attempt = Some(attempt.id);
        if let Err(e) = self.store.save_record(&record).await {
            if let Err(cleanup) = self.abandon(attempt.id).await {
                tracing::error!(attempt_id = %attempt.id, "Failed to abandon orphan attempt: {:?}", cleanup);
            }
            return Err(e);
        }

        if !self.store.consume_token(claims.jti, now).await? {
            return Err(AppError::TokenAlreadyUsed);
        }

        if let Some(previous_id) = superseded {
            self.abandon(previous_id).await?;
        }

        Ok(attempt)
    }

    async fn abandon(&self, attempt_id: Uuid) -> Result<(), AppError> {
        if let Some(mut previous) = self.store.load_attempt(attempt_id).await? {
            if previous.status == AttemptStatus::InProgress {
                previous.status = AttemptStatus::Abandoned;
                self.store.save_attempt(&previous).await?;
                tracing::info!(attempt_id = %attempt_id, "unfinished attempt abandoned");
            }
        }
        Ok(())
    }

    /// Persists the answers recorded so far and the review flag of an open attempt.
    pub async fn save_progress(
        &self,
        attempt_id: Uuid,
        answers: &Answers,
        flagged_for_review: bool,
    ) -> Result<(), AppError> {
        let mut attempt = self.load_attempt(attempt_id).await?;
        if attempt.status != AttemptStatus::InProgress {
            return Ok(());
        }
        attempt.answers = answers.clone();
        attempt.flagged_for_review = flagged_for_review;
        self.store.save_attempt(&attempt).await
    }

    /// Records the outcome of an attempt and charges one attempt of the budget.
    ///
    /// Idempotent: completing an already completed attempt changes nothing.
    /// Exhausting the budget without a recorded pass opens the lockout window.
    pub async fn complete_attempt(
        &self,
        attempt_id: Uuid,
        score: f64,
        passed: bool,
    ) -> Result<AccessRecord, AppError> {
        retry_once("complete_attempt", || {
            self.try_complete_attempt(attempt_id, score, passed)
        })
        .await
    }

    async fn try_complete_attempt(
        &self,
        attempt_id: Uuid,
        score: f64,
        passed: bool,
    ) -> Result<AccessRecord, AppError> {
        let mut attempt = self.load_attempt(attempt_id).await?;
        match attempt.status {
            AttemptStatus::Completed => {
                tracing::debug!(attempt_id = %attempt_id, "duplicate completion ignored");
                return self.record(&attempt.evaluation_id, &attempt.learner_id).await;
            }
            AttemptStatus::Abandoned => {
                return Err(AppError::Conflict(format!(
                    "attempt {} was superseded by a newer attempt",
                    attempt_id
                )));
            }
            AttemptStatus::InProgress => {}
        }

        let evaluation = self.evaluation(&attempt.evaluation_id)?;
        let mut record = self.record(&attempt.evaluation_id, &attempt.learner_id).await?;
        if record.active_attempt != Some(attempt.id) {
            return Err(AppError::Conflict(format!(
                "attempt {} is no longer the active attempt",
                attempt_id
            )));
        }

        let now = self.now();
        record.active_attempt = None;
        record.attempts_used = (record.attempts_used + 1).min(record.attempts_allowed);
        if passed {
            record.has_passed = true;
        } else if record.attempts_used >= record.attempts_allowed && !record.has_passed {
            let until = Duration::try_hours(i64::from(evaluation.lockout_hours))
                .and_then(|window| now.checked_add_signed(window))
                .ok_or_else(|| {
                    AppError::InternalServerError(format!(
                        "lockout of {}h from {} is out of range",
                        evaluation.lockout_hours, now
                    ))
                })?;
            record.locked_until = Some(until);
        }
        let record = self.store.save_record(&record).await?;

        attempt.completed_at = Some(now);
        attempt.score = Some(score);
        attempt.passed = Some(passed);
        attempt.status = AttemptStatus::Completed;
        self.store.save_attempt(&attempt).await?;

        tracing::info!(
            evaluation_id = %record.evaluation_id,
            learner_id = %record.learner_id,
            attempt_id = %attempt_id,
            score,
            passed,
            attempts_used = record.attempts_used,
            "attempt completed"
        );
        if let Some(until) = record.locked_until {
            tracing::warn!(
                evaluation_id = %record.evaluation_id,
                learner_id = %record.learner_id,
                locked_until = %until,
                "attempts exhausted, lockout opened"
            );
        }

        Ok(record)
    }

    /// Appends a suspicious-activity entry to the learner's record.
    ///
    /// The entry's `occurrence` is assigned here from the existing log.
    /// Eligibility is never changed by this call.
    pub async fn record_suspicious_activity(
        &self,
        evaluation_id: &str,
        learner_id: &str,
        entry: SuspiciousActivity,
    ) -> Result<(AccessRecord, SuspiciousActivity), AppError> {
        let evaluation = self.evaluation(evaluation_id)?;
        retry_once("record_suspicious_activity", || {
            self.try_record_activity(&evaluation, learner_id, entry.clone())
        })
        .await
    }

    async fn try_record_activity(
        &self,
        evaluation: &Evaluation,
        learner_id: &str,
        mut entry: SuspiciousActivity,
    ) -> Result<(AccessRecord, SuspiciousActivity), AppError> {
        let mut record = self.load_or_create(evaluation, learner_id).await?;
        entry.occurrence = record.activity_count(entry.kind, entry.attempt_id) + 1;
        record.activity.push(entry.clone());
        let record = self.store.save_record(&record).await?;

        tracing::warn!(
            evaluation_id = %record.evaluation_id,
            learner_id = %record.learner_id,
            kind = entry.kind.as_str(),
            occurrence = entry.occurrence,
            "suspicious activity recorded"
        );
        Ok((record, entry))
    }

    /// Current access record, for audits.
    pub async fn record(
        &self,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<AccessRecord, AppError> {
        self.store
            .load_record(evaluation_id, learner_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "no access record for learner '{}' on '{}'",
                    learner_id, evaluation_id
                ))
            })
    }

    pub async fn load_attempt(&self, attempt_id: Uuid) -> Result<Attempt, AppError> {
        self.store
            .load_attempt(attempt_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("attempt {} not found", attempt_id)))
    }

    /// Attempt history of a learner, oldest first.
    pub async fn attempts(
        &self,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<Vec<Attempt>, AppError> {
        self.store.list_attempts(evaluation_id, learner_id).await
    }

    async fn load_or_create(
        &self,
        evaluation: &Evaluation,
        learner_id: &str,
    ) -> Result<AccessRecord, AppError> {
        match self.store.load_record(&evaluation.id, learner_id).await? {
            Some(record) => Ok(record),
            None => {
                let fresh = AccessRecord::new(&evaluation.id, learner_id, evaluation.max_attempts);
                tracing::debug!(evaluation_id = %evaluation.id, learner_id, "creating access record");
                self.store.save_record(&fresh).await
            }
        }
    }

    /// Loads the record and clears a lockout whose window has elapsed.
    async fn refresh(
        &self,
        evaluation: &Evaluation,
        learner_id: &str,
    ) -> Result<AccessRecord, AppError> {
        let mut record = self.load_or_create(evaluation, learner_id).await?;

        if let Some(until) = record.locked_until {
            if until <= self.now() {
                record.locked_until = None;
                record.attempts_used = 0;
                record = self.store.save_record(&record).await?;
                tracing::info!(
                    evaluation_id = %record.evaluation_id,
                    learner_id,
                    "lockout elapsed, attempt budget reset"
                );
            }
        }
        Ok(record)
    }

    fn status_of(&self, record: &AccessRecord) -> AccessStatus {
        let now = self.now();
        match record.locked_until {
            Some(until) if until > now => AccessStatus {
                status: AccessState::Locked,
                remaining_attempts: Some(0),
                locked_until: Some(until),
                time_until_unlock: Some(format_time_until_unlock(now, until)),
                has_passed: record.has_passed,
            },
            _ if record.attempts_used >= record.attempts_allowed => AccessStatus {
                status: AccessState::NoAttempts,
                remaining_attempts: Some(0),
                locked_until: None,
                time_until_unlock: None,
                has_passed: record.has_passed,
            },
            _ => AccessStatus {
                status: AccessState::Eligible,
                remaining_attempts: Some(record.remaining_attempts()),
                locked_until: None,
                time_until_unlock: None,
                has_passed: record.has_passed,
            },
        }
    }
}

fn ensure_eligible(status: &AccessStatus) -> Result<(), AppError> {
    match status.status {
        AccessState::Eligible => Ok(()),
        AccessState::Locked => Err(AppError::NotEligible(format!(
            "locked for another {}",
            status.time_until_unlock.as_deref().unwrap_or("while")
        ))),
        AccessState::NoAttempts => Err(AppError::NotEligible(
            "no attempts remaining".to_string(),
        )),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        models::evaluation::{Evaluation, QuestionType, fixtures},
        store::{AccessStore, InMemoryCatalog, MemoryStore},
        utils::clock::ManualClock,
    };

    pub const SECRET: &str = "unit-test-secret";

    /// Memory store whose record writes can be made to conflict or fail.
    #[derive(Debug, Default)]
    pub struct FlakyStore {
        inner: MemoryStore,
        conflicts: AtomicUsize,
        failing: AtomicBool,
    }

    impl FlakyStore {
        /// The next `n` record writes lose an optimistic race.
        pub fn inject_conflicts(&self, n: usize) {
            self.conflicts.store(n, Ordering::SeqCst);
        }

        /// Every record write fails with an internal error while set.
        pub fn fail_record_writes(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AccessStore for FlakyStore {
        async fn load_record(
            &self,
            evaluation_id: &str,
            learner_id: &str,
        ) -> Result<Option<AccessRecord>, AppError> {
            self.inner.load_record(evaluation_id, learner_id).await
        }

        async fn save_record(&self, record: &AccessRecord) -> Result<AccessRecord, AppError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AppError::InternalServerError("disk full".to_string()));
            }
            let pending = self.conflicts.load(Ordering::SeqCst);
            if pending > 0 {
                self.conflicts.store(pending - 1, Ordering::SeqCst);
                return Err(AppError::RecordVersionMismatch);
            }
            self.inner.save_record(record).await
        }

        async fn insert_token(&self, token: &TokenRecord) -> Result<(), AppError> {
            self.inner.insert_token(token).await
        }

        async fn load_token(&self, token_id: Uuid) -> Result<Option<TokenRecord>, AppError> {
            self.inner.load_token(token_id).await
        }

        async fn consume_token(&self, token_id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError> {
            self.inner.consume_token(token_id, at).await
        }

        async fn save_attempt(&self, attempt: &Attempt) -> Result<(), AppError> {
            self.inner.save_attempt(attempt).await
        }

        async fn load_attempt(&self, attempt_id: Uuid) -> Result<Option<Attempt>, AppError> {
            self.inner.load_attempt(attempt_id).await
        }

        async fn list_attempts(
            &self,
            evaluation_id: &str,
            learner_id: &str,
        ) -> Result<Vec<Attempt>, AppError> {
            self.inner.list_attempts(evaluation_id, learner_id).await
        }
    }

    pub fn flaky_controller() -> (Arc<AccessController>, Arc<FlakyStore>, ManualClock) {
        let store = Arc::new(FlakyStore::default());
        let clock = ManualClock::new(Utc::now());
        let catalog = InMemoryCatalog::new(vec![evaluation()]).unwrap();
        let controller = AccessController::new(
            store.clone(),
            Arc::new(catalog),
            Arc::new(clock.clone()),
            SECRET,
            300,
        );
        (Arc::new(controller), store, clock)
    }

    pub fn evaluation() -> Evaluation {
        fixtures::evaluation(vec![
            fixtures::choice("q1", QuestionType::SingleChoice, &["B"], 10),
            fixtures::choice("q2", QuestionType::MultiSelect, &["A", "C"], 10),
        ])
    }

    pub fn controller_for(evaluation: Evaluation) -> (Arc<AccessController>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let catalog = InMemoryCatalog::new(vec![evaluation]).unwrap();
        let controller = AccessController::new(
            Arc::new(MemoryStore::new()),
            Arc::new(catalog),
            Arc::new(clock.clone()),
            SECRET,
            300,
        );
        (Arc::new(controller), clock)
    }

    pub fn controller() -> (Arc<AccessController>, ManualClock) {
        controller_for(evaluation())
    }
}
