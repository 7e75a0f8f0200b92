// src/services/session.rs

//! Per-learner attempt session: `locked → ready → instructions → in_progress → results`.
//!
//! A session is a cooperative, single-attempt-at-a-time state machine. Every
//! operation runs under the session mutex. The countdown is the only thing
//! that acts on its own; it is a [`CountdownTimer`] owned by the session and
//! released on every path out of `in_progress`.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Weak},
};

use serde::Serialize;
use tokio::{
    sync::Mutex,
    time::{Duration, Instant},
};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        access_record::{AccessState, AccessStatus, ActivityKind},
        attempt::{Answers, Attempt, IssuedToken},
        evaluation::{Evaluation, PublicQuestion},
    },
    services::{
        access::AccessController,
        activity::{ActivityRecorder, PolicyAction, RecordedActivity},
        scoring::{self, ScoreReport},
        timer::{CountdownTimer, remaining_seconds},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Locked,
    Ready,
    Instructions,
    InProgress,
    Results,
}

/// What ended an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitTrigger {
    Manual,
    Timeout,
    Policy,
}

/// Receives the outcome of every finished attempt exactly once.
pub trait CompletionListener: Send + Sync {
    fn on_complete(&self, score: f64, passed: bool);
}

impl<F> CompletionListener for F
where
    F: Fn(f64, bool) + Send + Sync,
{
    fn on_complete(&self, score: f64, passed: bool) {
        self(score, passed)
    }
}

/// Collaborators shared by all sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub access: Arc<AccessController>,
    pub recorder: ActivityRecorder,
    pub listener: Option<Arc<dyn CompletionListener>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResult {
    pub attempt_id: Uuid,
    pub trigger: SubmitTrigger,
    /// Percentage, unrounded.
    pub score: f64,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ScoreReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoring_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessStatus>,
    pub flagged_for_review: bool,
}

/// Snapshot handed to the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub state: SessionState,
    pub evaluation_id: String,
    pub title: String,
    pub time_limit_minutes: u32,
    pub passing_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<PublicQuestion>>,
    pub current_question: usize,
    pub answers: Answers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SessionResult>,
    pub can_restart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct SessionCore {
    ctx: SessionContext,
    evaluation: Arc<Evaluation>,
    learner_id: String,
    state: SessionState,
    access_status: Option<AccessStatus>,
    token: Option<IssuedToken>,
    /// Token handed in by the caller for the next `begin`.
    supplied_token: Option<String>,
    attempt: Option<Attempt>,
    answers: Answers,
    cursor: usize,
    flagged_for_review: bool,
    deadline: Option<Instant>,
    timer: Option<CountdownTimer>,
    result: Option<SessionResult>,
    last_error: Option<String>,
}

/// Cheaply cloneable handle to one learner's session.
#[derive(Clone)]
pub struct Session {
    core: Arc<Mutex<SessionCore>>,
}

impl Session {
    pub fn new(ctx: SessionContext, evaluation_id: &str, learner_id: &str) -> Result<Self, AppError> {
        let evaluation = ctx.access.evaluation(evaluation_id)?;
        let core = SessionCore {
            ctx,
            evaluation,
            learner_id: learner_id.to_string(),
            state: SessionState::Locked,
            access_status: None,
            token: None,
            supplied_token: None,
            attempt: None,
            answers: Answers::new(),
            cursor: 0,
            flagged_for_review: false,
            deadline: None,
            timer: None,
            result: None,
            last_error: None,
        };
        Ok(Self {
            core: Arc::new(Mutex::new(core)),
        })
    }

    /// Asks the access controller for the learner's status and enters
    /// `locked` or `ready`. Re-invoking it is the only way out of `locked`,
    /// and it leaves finished results behind.
    pub async fn open(&self) -> Result<SessionView, AppError> {
        let mut core = self.core.lock().await;
        match core.state {
            SessionState::Locked | SessionState::Ready | SessionState::Results => {
                let status = core
                    .ctx
                    .access
                    .evaluate_access(&core.evaluation.id, &core.learner_id)
                    .await?;
                core.reset_attempt();
                core.state = if status.is_eligible() {
                    SessionState::Ready
                } else {
                    SessionState::Locked
                };
                core.access_status = Some(status);
                core.last_error = None;
            }
            _ => {}
        }
        Ok(core.view())
    }

    pub async fn show_instructions(&self) -> Result<SessionView, AppError> {
        let mut core = self.core.lock().await;
        match core.state {
            SessionState::Ready => core.state = SessionState::Instructions,
            SessionState::Instructions => {}
            other => return Err(illegal(other, "show instructions")),
        }
        Ok(core.view())
    }

    /// Obtains a token if none is held, starts the attempt and the countdown.
    ///
    /// On failure the session stays in `instructions` with the error recorded.
    pub async fn begin(&self) -> Result<SessionView, AppError> {
        self.begin_inner(None).await
    }

    /// Starts the attempt with a token the caller obtained from `issue_token`.
    pub async fn begin_with_token(&self, token: String) -> Result<SessionView, AppError> {
        self.begin_inner(Some(token)).await
    }

    async fn begin_inner(&self, token: Option<String>) -> Result<SessionView, AppError> {
        let mut core = self.core.lock().await;
        match core.state {
            SessionState::Instructions => {}
            SessionState::InProgress => return Ok(core.view()),
            other => return Err(illegal(other, "begin")),
        }
        if token.is_some() {
            core.token = None;
        }
        core.supplied_token = token;

        let attempt = match core.acquire_attempt().await {
            Ok(attempt) => attempt,
            Err(e) => {
                tracing::info!(
                    evaluation_id = %core.evaluation.id,
                    learner_id = %core.learner_id,
                    error = %e,
                    "attempt could not be started"
                );
                core.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let limit = Duration::from_secs(core.evaluation.time_limit_seconds());
        let deadline = Instant::now() + limit;
        let weak = Arc::downgrade(&self.core);

        core.attempt = Some(attempt);
        core.answers.clear();
        core.cursor = 0;
        core.flagged_for_review = false;
        core.result = None;
        core.last_error = None;
        core.deadline = Some(deadline);
        core.timer = Some(CountdownTimer::start(deadline, move || expire(weak)));
        core.state = SessionState::InProgress;

        Ok(core.view())
    }

    /// Records the answer to one question. An empty selection clears it.
    pub async fn record_answer(
        &self,
        question_id: &str,
        values: Vec<String>,
    ) -> Result<SessionView, AppError> {
        let mut core = self.core.lock().await;
        core.require_in_progress("answer")?;
        if core.deadline_passed() {
            core.finish(SubmitTrigger::Timeout).await;
            return Ok(core.view());
        }

        let question = core.evaluation.question(question_id).ok_or_else(|| {
            AppError::InvalidAnswerSubmission(format!("unknown question '{}'", question_id))
        })?;
        let selected: BTreeSet<String> = values.into_iter().collect();
        if question.question_type.is_choice() {
            if let Some(bad) = selected.iter().find(|v| !question.options.contains(v)) {
                return Err(AppError::InvalidAnswerSubmission(format!(
                    "'{}' is not an option of question '{}'",
                    bad, question_id
                )));
            }
        }

        let question_id = question.id.clone();
        if selected.is_empty() {
            core.answers.remove(&question_id);
        } else {
            core.answers.insert(question_id, selected);
        }
        core.persist_progress().await?;
        Ok(core.view())
    }

    pub async fn next_question(&self) -> Result<SessionView, AppError> {
        let mut core = self.core.lock().await;
        core.require_in_progress("navigate")?;
        let last = core.evaluation.questions.len().saturating_sub(1);
        core.cursor = (core.cursor + 1).min(last);
        Ok(core.view())
    }

    pub async fn previous_question(&self) -> Result<SessionView, AppError> {
        let mut core = self.core.lock().await;
        core.require_in_progress("navigate")?;
        core.cursor = core.cursor.saturating_sub(1);
        Ok(core.view())
    }

    /// Side channel for anti-cheat signals. Never touches the countdown and
    /// never blocks answering; only an explicit policy action changes the session.
    pub async fn record_activity(
        &self,
        kind: ActivityKind,
        detail: &str,
    ) -> Result<RecordedActivity, AppError> {
        let mut core = self.core.lock().await;
        core.require_in_progress("report activity")?;
        let attempt_id = core.attempt.as_ref().map(|a| a.id);

        let recorded = core
            .ctx
            .recorder
            .record(&core.evaluation.id, &core.learner_id, attempt_id, kind, detail)
            .await?;

        match recorded.action {
            PolicyAction::Continue => {}
            PolicyAction::FlagForReview => {
                core.flagged_for_review = true;
                if let Err(e) = core.persist_progress().await {
                    tracing::error!("Failed to persist review flag: {:?}", e);
                }
            }
            PolicyAction::ForceSubmit => core.finish(SubmitTrigger::Policy).await,
        }
        Ok(recorded)
    }

    /// Manual submit. A second call once results are shown is a no-op.
    pub async fn submit(&self) -> Result<SessionView, AppError> {
        let mut core = self.core.lock().await;
        match core.state {
            SessionState::InProgress => {
                let trigger = if core.deadline_passed() {
                    SubmitTrigger::Timeout
                } else {
                    SubmitTrigger::Manual
                };
                core.finish(trigger).await;
            }
            SessionState::Results => {}
            other => return Err(illegal(other, "submit")),
        }
        Ok(core.view())
    }

    /// After a failed attempt with attempts left, returns to `instructions`
    /// for a brand new token/attempt cycle.
    pub async fn restart(&self) -> Result<SessionView, AppError> {
        let mut core = self.core.lock().await;
        if core.state != SessionState::Results {
            return Err(illegal(core.state, "restart"));
        }
        if !core.can_restart() {
            return Err(AppError::NotEligible(
                "no retry available for this evaluation".to_string(),
            ));
        }

        core.reset_attempt();
        core.state = SessionState::Instructions;
        Ok(core.view())
    }

    /// Leaves the session. An unfinished attempt stays incomplete and is not charged.
    pub async fn close(&self) {
        let mut core = self.core.lock().await;
        if let Some(timer) = core.timer.take() {
            timer.cancel();
        }
        if core.state == SessionState::InProgress {
            tracing::info!(
                evaluation_id = %core.evaluation.id,
                learner_id = %core.learner_id,
                "session closed mid-attempt"
            );
        }
    }

    pub async fn view(&self) -> SessionView {
        self.core.lock().await.view()
    }

    pub async fn state(&self) -> SessionState {
        self.core.lock().await.state
    }

    /// True while an attempt is running or another caller holds the session.
    fn is_busy(&self) -> bool {
        match self.core.try_lock() {
            Ok(core) => core.state == SessionState::InProgress,
            Err(_) => true,
        }
    }
}

/// Countdown expiry: auto-submit with whatever has been answered.
async fn expire(core: Weak<Mutex<SessionCore>>) {
    let Some(core) = core.upgrade() else {
        return;
    };
    let mut core = core.lock().await;
    if core.state == SessionState::InProgress {
        // This task is the timer's own; aborting it would cut the submit short.
        if let Some(timer) = core.timer.take() {
            timer.disarm();
        }
        tracing::info!(
            evaluation_id = %core.evaluation.id,
            learner_id = %core.learner_id,
            "time limit reached, auto-submitting"
        );
        core.finish(SubmitTrigger::Timeout).await;
    }
}

fn illegal(state: SessionState, action: &str) -> AppError {
    AppError::BadRequest(format!("cannot {} while session is {:?}", action, state))
}

impl SessionCore {
    fn require_in_progress(&self, action: &str) -> Result<(), AppError> {
        if self.state == SessionState::InProgress {
            Ok(())
        } else {
            Err(illegal(self.state, action))
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    async fn acquire_attempt(&mut self) -> Result<Attempt, AppError> {
        match self.try_start().await {
            Err(AppError::RecordVersionMismatch) => {
                tracing::warn!(
                    evaluation_id = %self.evaluation.id,
                    learner_id = %self.learner_id,
                    "token went stale, re-validating and retrying once"
                );
                self.token = None;
                let status = self
                    .ctx
                    .access
                    .evaluate_access(&self.evaluation.id, &self.learner_id)
                    .await?;
                self.access_status = Some(status);
                self.try_start().await
            }
            other => other,
        }
    }

    async fn try_start(&mut self) -> Result<Attempt, AppError> {
        if let Some(supplied) = self.supplied_token.take() {
            return self
                .ctx
                .access
                .start_attempt_as(&supplied, &self.evaluation.id, &self.learner_id)
                .await;
        }

        let now = self.ctx.access.now();
        let token = match self.token.take() {
            Some(token) if token.expires_at > now => token,
            _ => {
                self.ctx
                    .access
                    .issue_token(&self.evaluation.id, &self.learner_id)
                    .await?
            }
        };

        match self
            .ctx
            .access
            .start_attempt_as(&token.token, &self.evaluation.id, &self.learner_id)
            .await
        {
            Ok(attempt) => Ok(attempt),
            Err(e) => {
                // An expired or used token is worthless; anything else may be retried with it.
                if !matches!(e, AppError::TokenExpired | AppError::TokenAlreadyUsed) {
                    self.token = Some(token);
                }
                Err(e)
            }
        }
    }

    async fn persist_progress(&self) -> Result<(), AppError> {
        match &self.attempt {
            Some(attempt) => {
                self.ctx
                    .access
                    .save_progress(attempt.id, &self.answers, self.flagged_for_review)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Scores and completes the attempt, then enters `results`.
    ///
    /// Never fails: scoring or persistence errors end up as a zero score and
    /// a `scoring_error` note so a timed-out session can't hang in progress.
    async fn finish(&mut self, trigger: SubmitTrigger) {
        if self.state != SessionState::InProgress {
            return;
        }
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.deadline = None;

        let Some(attempt_id) = self.attempt.as_ref().map(|a| a.id) else {
            self.state = SessionState::Results;
            return;
        };

        let mut errors = Vec::new();
        let (score, passed, report) = match scoring::score(&self.evaluation, &self.answers) {
            Ok(report) => (report.percentage, report.passed, Some(report)),
            Err(e) => {
                tracing::error!(attempt_id = %attempt_id, "Scoring failed: {:?}", e);
                errors.push(format!("scoring failed: {}", e));
                (0.0, false, None)
            }
        };

        if let Err(e) = self.persist_progress().await {
            tracing::error!(attempt_id = %attempt_id, "Failed to persist answers: {:?}", e);
            errors.push(format!("answers not saved: {}", e));
        }

        let mut access = None;
        let (mut score, mut passed) = (score, passed);
        match self.ctx.access.complete_attempt(attempt_id, score, passed).await {
            Ok(_) => {
                match self
                    .ctx
                    .access
                    .evaluate_access(&self.evaluation.id, &self.learner_id)
                    .await
                {
                    Ok(status) => access = Some(status),
                    Err(e) => tracing::error!("Failed to refresh access status: {:?}", e),
                }
                if let Some(listener) = &self.ctx.listener {
                    listener.on_complete(score, passed);
                }
            }
            Err(e) => {
                tracing::error!(attempt_id = %attempt_id, "Failed to complete attempt: {:?}", e);
                errors.push(format!("completion not recorded: {}", e));
                score = 0.0;
                passed = false;
            }
        }

        self.access_status = access.clone();
        self.result = Some(SessionResult {
            attempt_id,
            trigger,
            score,
            passed,
            report,
            scoring_error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
            access,
            flagged_for_review: self.flagged_for_review,
        });
        self.state = SessionState::Results;
    }

    /// Drops everything tied to the previous attempt.
    fn reset_attempt(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.token = None;
        self.supplied_token = None;
        self.attempt = None;
        self.answers.clear();
        self.cursor = 0;
        self.flagged_for_review = false;
        self.deadline = None;
        self.result = None;
        self.last_error = None;
    }

    fn can_restart(&self) -> bool {
        match (&self.result, &self.access_status) {
            (Some(result), Some(status)) => {
                !result.passed
                    && status.status == AccessState::Eligible
                    && status.remaining_attempts.unwrap_or(0) > 0
            }
            _ => false,
        }
    }

    fn view(&self) -> SessionView {
        let in_progress = self.state == SessionState::InProgress;
        SessionView {
            state: self.state,
            evaluation_id: self.evaluation.id.clone(),
            title: self.evaluation.title.clone(),
            time_limit_minutes: self.evaluation.time_limit_minutes,
            passing_score: self.evaluation.passing_score,
            access: self.access_status.clone(),
            attempt_id: self.attempt.as_ref().map(|a| a.id),
            questions: in_progress.then(|| self.evaluation.public_questions()),
            current_question: self.cursor,
            answers: self.answers.clone(),
            remaining_seconds: self.deadline.map(remaining_seconds),
            result: self.result.clone(),
            can_restart: self.state == SessionState::Results && self.can_restart(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Sessions left untouched this long are dropped, unless an attempt is running.
pub const DEFAULT_SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

struct RegistryEntry {
    session: Session,
    last_used: Instant,
}

/// Live sessions keyed by (evaluation, learner).
#[derive(Clone)]
pub struct SessionRegistry {
    ctx: SessionContext,
    idle_ttl: Duration,
    sessions: Arc<Mutex<HashMap<(String, String), RegistryEntry>>>,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        Self::with_idle_ttl(ctx, DEFAULT_SESSION_IDLE_TTL)
    }

    pub fn with_idle_ttl(ctx: SessionContext, idle_ttl: Duration) -> Self {
        Self {
            ctx,
            idle_ttl,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Returns the learner's session, creating it on first use.
    ///
    /// Idle sessions of every learner are swept here.
    pub async fn get_or_create(
        &self,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<Session, AppError> {
        let key = (evaluation_id.to_string(), learner_id.to_string());
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;

        let before = sessions.len();
        sessions.retain(|k, entry| {
            *k == key
                || now.duration_since(entry.last_used) < self.idle_ttl
                || entry.session.is_busy()
        });
        if sessions.len() < before {
            tracing::debug!(evicted = before - sessions.len(), "idle sessions dropped");
        }

        if let Some(entry) = sessions.get_mut(&key) {
            entry.last_used = now;
            return Ok(entry.session.clone());
        }
        let session = Session::new(self.ctx.clone(), evaluation_id, learner_id)?;
        sessions.insert(
            key,
            RegistryEntry {
                session: session.clone(),
                last_used: now,
            },
        );
        Ok(session)
    }

    pub async fn get(&self, evaluation_id: &str, learner_id: &str) -> Result<Session, AppError> {
        let key = (evaluation_id.to_string(), learner_id.to_string());
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(&key)
            .ok_or_else(|| AppError::NotFound("no open session for this evaluation".to_string()))?;
        entry.last_used = Instant::now();
        Ok(entry.session.clone())
    }

    /// Drops the learner's session, cancelling any running countdown.
    pub async fn remove(&self, evaluation_id: &str, learner_id: &str) {
        let key = (evaluation_id.to_string(), learner_id.to_string());
        let removed = self.sessions.lock().await.remove(&key);
        if let Some(entry) = removed {
            entry.session.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        models::{
            access_record::{AccessRecord, SuspiciousActivity},
            attempt::AttemptStatus,
        },
        services::access::testing,
    };

    fn context(access: Arc<AccessController>) -> SessionContext {
        SessionContext {
            recorder: ActivityRecorder::record_only(access.clone()),
            access,
            listener: None,
        }
    }

    async fn in_progress(session: &Session) {
        session.open().await.unwrap();
        session.show_instructions().await.unwrap();
        session.begin().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_reaches_results() {
        let (access, _) = testing::controller();
        let session = Session::new(context(access.clone()), "eval-1", "learner-1").unwrap();

        let view = session.open().await.unwrap();
        assert_eq!(view.state, SessionState::Ready);
        assert_eq!(view.access.unwrap().remaining_attempts, Some(2));

        session.show_instructions().await.unwrap();
        let view = session.begin().await.unwrap();
        assert_eq!(view.state, SessionState::InProgress);
        assert_eq!(view.remaining_seconds, Some(600));
        assert_eq!(view.questions.unwrap().len(), 2);

        session.record_answer("q1", vec!["B".into()]).await.unwrap();
        session
            .record_answer("q2", vec!["A".into(), "C".into()])
            .await
            .unwrap();

        let view = session.submit().await.unwrap();
        assert_eq!(view.state, SessionState::Results);
        let result = view.result.unwrap();
        assert_eq!(result.trigger, SubmitTrigger::Manual);
        assert_eq!(result.score, 100.0);
        assert!(result.passed);
        assert!(!view.can_restart);
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_transitions_rejected() {
        let (access, _) = testing::controller();
        let session = Session::new(context(access), "eval-1", "learner-1").unwrap();

        assert!(session.begin().await.is_err());
        assert!(session.submit().await.is_err());
        session.open().await.unwrap();
        assert!(session.record_answer("q1", vec!["B".into()]).await.is_err());
        assert_eq!(session.state().await, SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_keeps_answers() {
        let (access, _) = testing::controller();
        let session = Session::new(context(access), "eval-1", "learner-1").unwrap();
        in_progress(&session).await;

        session.record_answer("q1", vec!["A".into()]).await.unwrap();
        session.next_question().await.unwrap();
        session.next_question().await.unwrap();
        let view = session.previous_question().await.unwrap();

        assert_eq!(view.current_question, 0);
        assert!(view.answers.contains_key("q1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_answers_rejected() {
        let (access, _) = testing::controller();
        let session = Session::new(context(access), "eval-1", "learner-1").unwrap();
        in_progress(&session).await;

        assert!(matches!(
            session.record_answer("q9", vec!["A".into()]).await,
            Err(AppError::InvalidAnswerSubmission(_))
        ));
        assert!(matches!(
            session.record_answer("q1", vec!["Z".into()]).await,
            Err(AppError::InvalidAnswerSubmission(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_submit_is_noop() {
        let (access, _) = testing::controller();
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        let mut ctx = context(access.clone());
        ctx.listener = Some(Arc::new(move |_score: f64, _passed: bool| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let session = Session::new(ctx, "eval-1", "learner-1").unwrap();
        in_progress(&session).await;

        let first = session.submit().await.unwrap();
        let second = session.submit().await.unwrap();
        assert_eq!(
            first.result.unwrap().attempt_id,
            second.result.unwrap().attempt_id
        );
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        let record = access.record("eval-1", "learner-1").await.unwrap();
        assert_eq!(record.attempts_used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_auto_submits_once() {
        let (access, _) = testing::controller();
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        let mut ctx = context(access.clone());
        ctx.listener = Some(Arc::new(move |_score: f64, _passed: bool| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let session = Session::new(ctx, "eval-1", "learner-1").unwrap();
        in_progress(&session).await;
        session.record_answer("q1", vec!["B".into()]).await.unwrap();

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert_eq!(session.state().await, SessionState::InProgress);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let view = session.view().await;
        assert_eq!(view.state, SessionState::Results);
        let result = view.result.unwrap();
        assert_eq!(result.trigger, SubmitTrigger::Timeout);
        assert_eq!(result.score, 50.0);
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        // A late manual submit changes nothing.
        session.submit().await.unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        let attempt = access.load_attempt(result.attempt_id).await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Completed);
        assert_eq!(attempt.answers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_failure() {
        let (access, _) = testing::controller();
        let session = Session::new(context(access), "eval-1", "learner-1").unwrap();
        in_progress(&session).await;
        session.record_answer("q1", vec!["A".into()]).await.unwrap();

        let view = session.submit().await.unwrap();
        assert!(!view.result.unwrap().passed);
        assert!(view.can_restart);

        let view = session.restart().await.unwrap();
        assert_eq!(view.state, SessionState::Instructions);
        assert!(view.answers.is_empty());
        assert!(view.remaining_seconds.is_none());

        let view = session.begin().await.unwrap();
        assert_eq!(view.state, SessionState::InProgress);
        assert_eq!(view.remaining_seconds, Some(600));

        // Second failure exhausts the budget: no further restart.
        let view = session.submit().await.unwrap();
        assert!(!view.can_restart);
        assert_eq!(view.access.unwrap().status, AccessState::Locked);
        assert!(matches!(
            session.restart().await,
            Err(AppError::NotEligible(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_learner_stays_locked() {
        let (access, _) = testing::controller();
        let session = Session::new(context(access.clone()), "eval-1", "learner-1").unwrap();
        in_progress(&session).await;
        session.submit().await.unwrap();
        session.restart().await.unwrap();
        session.begin().await.unwrap();
        session.submit().await.unwrap();

        let fresh = Session::new(context(access), "eval-1", "learner-1").unwrap();
        let view = fresh.open().await.unwrap();
        assert_eq!(view.state, SessionState::Locked);
        let status = view.access.unwrap();
        assert!(status.locked_until.is_some());
        assert_eq!(status.time_until_unlock.as_deref(), Some("48h 0m"));
        assert!(fresh.show_instructions().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_submit_policy() {
        let (access, _) = testing::controller();
        let policy = |_: &AccessRecord, latest: &SuspiciousActivity| {
            if latest.kind == ActivityKind::DevToolsOpen {
                PolicyAction::ForceSubmit
            } else {
                PolicyAction::Continue
            }
        };
        let ctx = SessionContext {
            recorder: ActivityRecorder::new(access.clone(), Arc::new(policy)),
            access,
            listener: None,
        };
        let session = Session::new(ctx, "eval-1", "learner-1").unwrap();
        in_progress(&session).await;

        session.record_activity(ActivityKind::TabBlur, "").await.unwrap();
        assert_eq!(session.state().await, SessionState::InProgress);

        session
            .record_activity(ActivityKind::DevToolsOpen, "F12")
            .await
            .unwrap();
        let view = session.view().await;
        assert_eq!(view.state, SessionState::Results);
        assert_eq!(view.result.unwrap().trigger, SubmitTrigger::Policy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_mid_attempt_costs_nothing() {
        let (access, _) = testing::controller();
        let session = Session::new(context(access.clone()), "eval-1", "learner-1").unwrap();
        in_progress(&session).await;
        session.close().await;

        tokio::time::sleep(Duration::from_secs(700)).await;
        let status = access.evaluate_access("eval-1", "learner-1").await.unwrap();
        assert_eq!(status.remaining_attempts, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_reuses_sessions() {
        let (access, _) = testing::controller();
        let registry = SessionRegistry::new(context(access));

        let a = registry.get_or_create("eval-1", "learner-1").await.unwrap();
        a.open().await.unwrap();
        let b = registry.get("eval-1", "learner-1").await.unwrap();
        assert_eq!(b.state().await, SessionState::Ready);

        assert!(matches!(
            registry.get_or_create("missing", "learner-1").await,
            Err(AppError::EvaluationNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_at_deadline_cancels_old_countdown() {
        let (access, _) = testing::controller();
        let session = Session::new(context(access.clone()), "eval-1", "learner-1").unwrap();
        in_progress(&session).await;

        tokio::time::advance(Duration::from_secs(600)).await;
        let view = session.submit().await.unwrap();
        assert_eq!(view.state, SessionState::Results);

        session.restart().await.unwrap();
        session.begin().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(session.state().await, SessionState::InProgress);
        let record = access.record("eval-1", "learner-1").await.unwrap();
        assert_eq!(record.attempts_used, 1);
        assert_eq!(record.locked_until, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_after_lockout_elapsed() {
        let (access, clock) = testing::controller();
        let session = Session::new(context(access), "eval-1", "learner-1").unwrap();
        in_progress(&session).await;
        session.submit().await.unwrap();
        session.restart().await.unwrap();
        session.begin().await.unwrap();
        let view = session.submit().await.unwrap();
        assert_eq!(view.access.unwrap().status, AccessState::Locked);

        clock.advance(chrono::Duration::hours(49));
        let view = session.open().await.unwrap();
        assert_eq!(view.state, SessionState::Ready);
        assert!(view.result.is_none());
        assert_eq!(view.access.unwrap().remaining_attempts, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_with_issued_token() {
        let (access, _) = testing::controller();
        let session = Session::new(context(access.clone()), "eval-1", "learner-1").unwrap();
        let issued = access.issue_token("eval-1", "learner-1").await.unwrap();
        let foreign = access.issue_token("eval-1", "learner-2").await.unwrap();

        session.open().await.unwrap();
        session.show_instructions().await.unwrap();

        assert!(matches!(
            session.begin_with_token(foreign.token).await,
            Err(AppError::AuthError(_))
        ));
        assert_eq!(session.state().await, SessionState::Instructions);

        let view = session.begin_with_token(issued.token).await.unwrap();
        assert_eq!(view.state, SessionState::InProgress);
        let attempt = access.load_attempt(view.attempt_id.unwrap()).await.unwrap();
        assert_eq!(attempt.token_id, issued.token_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_is_replaced_on_begin() {
        let (access, _) = testing::controller();
        let session = Session::new(context(access.clone()), "eval-1", "learner-1").unwrap();
        let stale = access.issue_token("eval-1", "learner-1").await.unwrap();

        // Any record write moves the version past the one the token was bound to.
        ActivityRecorder::record_only(access.clone())
            .record("eval-1", "learner-1", None, ActivityKind::TabBlur, "")
            .await
            .unwrap();

        session.open().await.unwrap();
        session.show_instructions().await.unwrap();
        let view = session.begin_with_token(stale.token).await.unwrap();

        assert_eq!(view.state, SessionState::InProgress);
        let attempt = access.load_attempt(view.attempt_id.unwrap()).await.unwrap();
        assert_ne!(attempt.token_id, stale.token_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_completion_still_shows_results() {
        let (access, store, _) = testing::flaky_controller();
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        let mut ctx = context(access.clone());
        ctx.listener = Some(Arc::new(move |_score: f64, _passed: bool| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let session = Session::new(ctx, "eval-1", "learner-1").unwrap();
        in_progress(&session).await;
        session.record_answer("q1", vec!["B".into()]).await.unwrap();
        session
            .record_answer("q2", vec!["A".into(), "C".into()])
            .await
            .unwrap();

        store.fail_record_writes(true);
        let view = session.submit().await.unwrap();

        assert_eq!(view.state, SessionState::Results);
        let result = view.result.unwrap();
        assert_eq!(result.score, 0.0);
        assert!(!result.passed);
        assert!(
            result
                .scoring_error
                .unwrap()
                .contains("completion not recorded")
        );
        assert_eq!(completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_evicts_idle_sessions() {
        let (access, _) = testing::controller();
        let registry = SessionRegistry::with_idle_ttl(context(access), Duration::from_secs(60));

        let idle = registry.get_or_create("eval-1", "learner-1").await.unwrap();
        idle.open().await.unwrap();
        let running = registry.get_or_create("eval-1", "learner-3").await.unwrap();
        in_progress(&running).await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        registry.get_or_create("eval-1", "learner-2").await.unwrap();

        assert_eq!(registry.len().await, 2);
        assert!(registry.get("eval-1", "learner-1").await.is_err());
        assert!(registry.get("eval-1", "learner-3").await.is_ok());
    }
}
