// src/store/memory.rs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::AccessStore;
use crate::{
    error::AppError,
    models::{
        access_record::AccessRecord,
        attempt::{Attempt, TokenRecord},
    },
};

type RecordKey = (String, String);

/// Process-local store. Used when no database is configured, and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<RecordKey, AccessRecord>>,
    tokens: RwLock<HashMap<Uuid, TokenRecord>>,
    attempts: RwLock<HashMap<Uuid, Attempt>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccessStore for MemoryStore {
    async fn load_record(
        &self,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<Option<AccessRecord>, AppError> {
        let records = self.records.read().await;
        Ok(records
            .get(&(evaluation_id.to_string(), learner_id.to_string()))
            .cloned())
    }

    async fn save_record(&self, record: &AccessRecord) -> Result<AccessRecord, AppError> {
        let mut records = self.records.write().await;
        let key = (record.evaluation_id.clone(), record.learner_id.clone());

        let stored_version = records.get(&key).map(|r| r.version).unwrap_or(0);
        if stored_version != record.version {
            return Err(AppError::RecordVersionMismatch);
        }

        let mut saved = record.clone();
        saved.version += 1;
        records.insert(key, saved.clone());
        Ok(saved)
    }

    async fn insert_token(&self, token: &TokenRecord) -> Result<(), AppError> {
        self.tokens.write().await.insert(token.id, token.clone());
        Ok(())
    }

    async fn load_token(&self, token_id: Uuid) -> Result<Option<TokenRecord>, AppError> {
        Ok(self.tokens.read().await.get(&token_id).cloned())
    }

    async fn consume_token(&self, token_id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError> {
        let mut tokens = self.tokens.write().await;
        match tokens.get_mut(&token_id) {
            Some(token) if token.consumed_at.is_none() => {
                token.consumed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_attempt(&self, attempt: &Attempt) -> Result<(), AppError> {
        self.attempts
            .write()
            .await
            .insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn load_attempt(&self, attempt_id: Uuid) -> Result<Option<Attempt>, AppError> {
        Ok(self.attempts.read().await.get(&attempt_id).cloned())
    }

    async fn list_attempts(
        &self,
        evaluation_id: &str,
        learner_id: &str,
    ) -> Result<Vec<Attempt>, AppError> {
        let attempts = self.attempts.read().await;
        let mut found: Vec<Attempt> = attempts
            .values()
            .filter(|a| a.evaluation_id == evaluation_id && a.learner_id == learner_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.started_at);
        Ok(found)
    }
}
