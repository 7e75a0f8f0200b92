// src/store/catalog.rs

use std::{collections::HashMap, path::Path, sync::Arc};

use crate::{error::AppError, models::evaluation::Evaluation};

/// Read-only lookup of evaluation definitions owned by content authoring.
pub trait EvaluationCatalog: Send + Sync {
    fn get(&self, evaluation_id: &str) -> Option<Arc<Evaluation>>;
}

/// Catalog held entirely in memory. Definitions are validated on insert.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalog {
    evaluations: HashMap<String, Arc<Evaluation>>,
}

impl InMemoryCatalog {
    pub fn new(evaluations: Vec<Evaluation>) -> Result<Self, AppError> {
        let mut catalog = Self::default();
        for evaluation in evaluations {
            catalog.insert(evaluation)?;
        }
        Ok(catalog)
    }

    /// Loads a JSON array of evaluation definitions.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::InternalServerError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let evaluations: Vec<Evaluation> = serde_json::from_str(&raw)?;
        Self::new(evaluations)
    }

    pub fn insert(&mut self, evaluation: Evaluation) -> Result<(), AppError> {
        evaluation.check()?;
        self.evaluations
            .insert(evaluation.id.clone(), Arc::new(evaluation));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.evaluations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluations.is_empty()
    }
}

impl EvaluationCatalog for InMemoryCatalog {
    fn get(&self, evaluation_id: &str) -> Option<Arc<Evaluation>> {
        self.evaluations.get(evaluation_id).cloned()
    }
}
