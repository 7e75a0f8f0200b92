// src/store/postgres.rs

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, postgres::PgPoolOptions, types::Json};
use uuid::Uuid;

use super::AccessStore;
use crate::{
    error::AppError,
    models::{
        access_record::{AccessRecord, SuspiciousActivity},
        attempt::{Answers, Attempt, AttemptStatus, TokenRecord},
    },
};

/// Row shape of the 'access_records' table.
#[derive(FromRow)]
struct AccessRecordRow {
    evaluation_id: String,
    learner_id: String,
    attempts_allowed: i32,
    attempts_used: i32,
    locked_until: Option<DateTime<Utc>>,
    has_passed: bool,
    active_attempt: Option<Uuid>,
    activity: Json<Vec<SuspiciousActivity>>,
    version: i64,
}

impl From<AccessRecordRow> for AccessRecord {
    fn from(row: AccessRecordRow) -> Self {
        AccessRecord {
            evaluation_id: row.evaluation_id,
            learner_id: row.learner_id,
            attempts_allowed: row.attempts_allowed.max(0) as u32,
            attempts_used: row.attempts_used.max(0) as u32,
            locked_until: row.locked_until,
            has_passed: row.has_passed,
            active_attempt: row.active_attempt,
            activity: row.activity.0,
            version: row.version,
        }
    }
}

/// Row shape of the 'attempt_tokens' table.
#[derive(FromRow)]
struct TokenRow {
    id: Uuid,
    evaluation_id: String,
    learner_id: String,
    expires_at: DateTime<Utc>,
    consumed_at: Option<DateTime<Utc>>,
}

/// Row shape of the 'attempts' table.
#[derive(FromRow)]
struct AttemptRow {
    id: Uuid,
    token_id: Uuid,
    evaluation_id: String,
    learner_id: String,
    started_at: DateTime<Utc>,
    answers: Json<Answers>,
    completed_at: Option<DateTime<Utc>>,
    score: Option<f64>,
    passed: Option<bool>,
    status: String,
    flagged_for_review: bool,
}

impl TryFrom<AttemptRow> for Attempt {
    type Error = AppError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let status = AttemptStatus::parse(&row.status).ok_or_else(|| {
            AppError::InternalServerError(format!("unknown attempt status '{}'", row.status))
        })?;
        Ok(Attempt {
            id: row.id,
            token_id: row.token_id,
            evaluation_id: row.evaluation_id,
            learner_id: row.learner_id,
            started_at: row.started_at,
            answers: row.answers.0,
            completed_at: row.completed_at,
            score: row.score,
            passed: row.passed,
            status,
            flagged_for_review: row.flagged_for_review,
        })
    }
}

/// Postgres-backed store. Version checks happen inside the UPDATE statement.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects with retry and applies pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let mut retry_count = 0;
        let pool = loop {
            match PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(3))
                .connect(database_url)
                .await
            {
                Ok(pool) => break pool,
                Err(e) => {
                    retry_count += 1;
                    if retry_count > 5 {
                        return Err(AppError::InternalServerError(format!(
                            "Failed to connect to database after 5 retries: {}",
                            e
                        )));
                    }
                    tracing::warn!(
                        "Database not ready, retrying in 2s... (Attempt {})",
                        retry_count
                    );
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        };

        tracing::info!("Running migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::InternalServerError(e.to_string()))?;
        tracing::info!("Migrations applied successfully.");

        Ok(Self::new(pool))
    }
}

#[async_trait]
impl AccessStore for PgStore {
    async fn load_record(
        &self,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<Option<AccessRecord>, AppError> {
        let row = sqlx::query_as::<_, AccessRecordRow>(
            r#"
            SELECT evaluation_id, learner_id, attempts_allowed, attempts_used,
                   locked_until, has_passed, active_attempt, activity, version
            FROM access_records
            WHERE evaluation_id = $1 AND learner_id = $2
            "#,
        )
        .bind(evaluation_id)
        .bind(learner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to load access record: {:?}", e);
            AppError::from(e)
        })?;

        Ok(row.map(AccessRecord::from))
    }

    async fn save_record(&self, record: &AccessRecord) -> Result<AccessRecord, AppError> {
        let activity = Json(&record.activity);

        let result = if record.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO access_records (
                    evaluation_id, learner_id, attempts_allowed, attempts_used,
                    locked_until, has_passed, active_attempt, activity, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1)
                ON CONFLICT (evaluation_id, learner_id) DO NOTHING
                "#,
            )
            .bind(&record.evaluation_id)
            .bind(&record.learner_id)
            .bind(record.attempts_allowed as i32)
            .bind(record.attempts_used as i32)
            .bind(record.locked_until)
            .bind(record.has_passed)
            .bind(record.active_attempt)
            .bind(activity)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE access_records SET
                    attempts_allowed = $3,
                    attempts_used = $4,
                    locked_until = $5,
                    has_passed = $6,
                    active_attempt = $7,
                    activity = $8,
                    version = version + 1
                WHERE evaluation_id = $1 AND learner_id = $2 AND version = $9
                "#,
            )
            .bind(&record.evaluation_id)
            .bind(&record.learner_id)
            .bind(record.attempts_allowed as i32)
            .bind(record.attempts_used as i32)
            .bind(record.locked_until)
            .bind(record.has_passed)
            .bind(record.active_attempt)
            .bind(activity)
            .bind(record.version)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(AppError::RecordVersionMismatch);
        }

        let mut saved = record.clone();
        saved.version += 1;
        Ok(saved)
    }

    async fn insert_token(&self, token: &TokenRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO attempt_tokens (id, evaluation_id, learner_id, expires_at, consumed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(token.id)
        .bind(&token.evaluation_id)
        .bind(&token.learner_id)
        .bind(token.expires_at)
        .bind(token.consumed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_token(&self, token_id: Uuid) -> Result<Option<TokenRecord>, AppError> {
        let row = sqlx::query_as::<_, TokenRow>(
            "SELECT id, evaluation_id, learner_id, expires_at, consumed_at FROM attempt_tokens WHERE id = $1",
        )
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TokenRecord {
            id: r.id,
            evaluation_id: r.evaluation_id,
            learner_id: r.learner_id,
            expires_at: r.expires_at,
            consumed_at: r.consumed_at,
        }))
    }

    async fn consume_token(&self, token_id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE attempt_tokens SET consumed_at = $2 WHERE id = $1 AND consumed_at IS NULL",
        )
        .bind(token_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_attempt(&self, attempt: &Attempt) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO attempts (
                id, token_id, evaluation_id, learner_id, started_at, answers,
                completed_at, score, passed, status, flagged_for_review
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                answers = EXCLUDED.answers,
                completed_at = EXCLUDED.completed_at,
                score = EXCLUDED.score,
                passed = EXCLUDED.passed,
                status = EXCLUDED.status,
                flagged_for_review = EXCLUDED.flagged_for_review
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.token_id)
        .bind(&attempt.evaluation_id)
        .bind(&attempt.learner_id)
        .bind(attempt.started_at)
        .bind(Json(&attempt.answers))
        .bind(attempt.completed_at)
        .bind(attempt.score)
        .bind(attempt.passed)
        .bind(attempt.status.as_str())
        .bind(attempt.flagged_for_review)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to save attempt {}: {:?}", attempt.id, e);
            AppError::from(e)
        })?;
        Ok(())
    }

    async fn load_attempt(&self, attempt_id: Uuid) -> Result<Option<Attempt>, AppError> {
        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT id, token_id, evaluation_id, learner_id, started_at, answers,
                   completed_at, score, passed, status, flagged_for_review
            FROM attempts
            WHERE id = $1
            "#,
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Attempt::try_from).transpose()
    }

    async fn list_attempts(
        &self,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<Vec<Attempt>, AppError> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT id, token_id, evaluation_id, learner_id, started_at, answers,
                   completed_at, score, passed, status, flagged_for_review
            FROM attempts
            WHERE evaluation_id = $1 AND learner_id = $2
            ORDER BY started_at ASC
            "#,
        )
        .bind(evaluation_id)
        .bind(learner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Attempt::try_from).collect()
    }
}
