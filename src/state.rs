use std::sync::Arc;

use crate::config::Config;
use crate::services::access::AccessController;
use crate::services::activity::ActivityRecorder;
use crate::services::session::{SessionContext, SessionRegistry};
use crate::store::{AccessStore, EvaluationCatalog};
use crate::utils::clock::Clock;
use axum::extract::FromRef;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub access: Arc<AccessController>,
    pub sessions: SessionRegistry,
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl FromRef<AppState> for Arc<AccessController> {
    fn from_ref(state: &AppState) -> Self {
        state.access.clone()
    }
}

impl FromRef<AppState> for SessionRegistry {
    fn from_ref(state: &AppState) -> Self {
        state.sessions.clone()
    }
}

impl AppState {
    /// Wires the engine together with the record-only activity policy.
    pub fn new(
        config: Config,
        store: Arc<dyn AccessStore>,
        catalog: Arc<dyn EvaluationCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let access = Arc::new(AccessController::new(
            store,
            catalog,
            clock,
            config.jwt_secret.clone(),
            config.token_ttl_seconds,
        ));
        let ctx = SessionContext {
            recorder: ActivityRecorder::record_only(access.clone()),
            access: access.clone(),
            listener: Some(Arc::new(log_completion)),
        };

        Self {
            config,
            access,
            sessions: SessionRegistry::new(ctx),
        }
    }
}

/// Completion hook used until a progress-tracking service subscribes.
fn log_completion(score: f64, passed: bool) {
    tracing::info!(score = %format!("{:.2}", score), passed, "evaluation attempt finished");
}
