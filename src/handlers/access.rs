// src/handlers/access.rs

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::{error::AppError, services::access::AccessController, utils::jwt::Claims};

/// Reports whether the caller may attempt the evaluation right now.
///
/// A locked learner gets `locked` with the unlock time and a display
/// countdown, never an error.
pub async fn get_access(
    State(access): State<Arc<AccessController>>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let status = access.evaluate_access(&evaluation_id, &claims.sub).await?;
    Ok(Json(status))
}

/// Issues a single-use attempt token.
///
/// Returns 403 with code `not_eligible` when locked or out of attempts.
pub async fn issue_token(
    State(access): State<Arc<AccessController>>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let issued = access.issue_token(&evaluation_id, &claims.sub).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

/// Lists the caller's attempts for an evaluation, oldest first.
pub async fn list_attempts(
    State(access): State<Arc<AccessController>>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    access.evaluation(&evaluation_id)?;
    let attempts = access.attempts(&evaluation_id, &claims.sub).await?;
    Ok(Json(attempts))
}
