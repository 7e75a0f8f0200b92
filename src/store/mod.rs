// src/store/mod.rs

pub mod catalog;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        access_record::AccessRecord,
        attempt::{Attempt, TokenRecord},
    },
};

pub use catalog::{EvaluationCatalog, InMemoryCatalog};
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Persistence interface for access records, tokens and attempts.
///
/// `save_record` is an optimistic compare-and-swap: `record.version` must be
/// the version the caller read (0 for a record never persisted). On success
/// the stored copy is returned with its version bumped; on conflict the call
/// fails with `AppError::RecordVersionMismatch` and nothing is written.
#[async_trait]
pub trait AccessStore: Send + Sync {
    async fn load_record(
        &self,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<Option<AccessRecord>, AppError>;

    async fn save_record(&self, record: &AccessRecord) -> Result<AccessRecord, AppError>;

    async fn insert_token(&self, token: &TokenRecord) -> Result<(), AppError>;

    async fn load_token(&self, token_id: Uuid) -> Result<Option<TokenRecord>, AppError>;

    /// Marks the token consumed. Returns false if it already was.
    async fn consume_token(&self, token_id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError>;

    /// Inserts or replaces an attempt.
    async fn save_attempt(&self, attempt: &Attempt) -> Result<(), AppError>;

    async fn load_attempt(&self, attempt_id: Uuid) -> Result<Option<Attempt>, AppError>;

    /// All attempts of a learner for one evaluation, oldest first.
    async fn list_attempts(
        &self,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<Vec<Attempt>, AppError>;
}
