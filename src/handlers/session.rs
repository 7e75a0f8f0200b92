// src/handlers/session.rs

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use validator::Validate;

use crate::{
    error::AppError,
    models::{
        access_record::ActivityRequest,
        attempt::{AnswerRequest, BeginRequest},
    },
    services::session::SessionRegistry,
    utils::jwt::Claims,
};

/// Opens (or re-opens) the caller's session and evaluates access.
pub async fn open_session(
    State(sessions): State<SessionRegistry>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = sessions.get_or_create(&evaluation_id, &claims.sub).await?;
    Ok(Json(session.open().await?))
}

pub async fn get_session(
    State(sessions): State<SessionRegistry>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = sessions.get(&evaluation_id, &claims.sub).await?;
    Ok(Json(session.view().await))
}

/// Closes the caller's session. An unfinished attempt is left uncharged.
pub async fn close_session(
    State(sessions): State<SessionRegistry>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    sessions.remove(&evaluation_id, &claims.sub).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn show_instructions(
    State(sessions): State<SessionRegistry>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = sessions.get(&evaluation_id, &claims.sub).await?;
    Ok(Json(session.show_instructions().await?))
}

/// Starts the attempt and its countdown.
///
/// Uses the token from the body when one is sent (`{ "token": "..." }`),
/// otherwise mints one for the caller.
pub async fn begin(
    State(sessions): State<SessionRegistry>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
    payload: Option<Json<BeginRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let payload = payload.map(|Json(body)| body).unwrap_or_default();
    payload.validate()?;

    let session = sessions.get(&evaluation_id, &claims.sub).await?;
    let view = match payload.token {
        Some(token) => session.begin_with_token(token).await?,
        None => session.begin().await?,
    };
    Ok(Json(view))
}

pub async fn record_answer(
    State(sessions): State<SessionRegistry>,
    Extension(claims): Extension<Claims>,
    Path((evaluation_id, question_id)): Path<(String, String)>,
    Json(payload): Json<AnswerRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let session = sessions.get(&evaluation_id, &claims.sub).await?;
    Ok(Json(session.record_answer(&question_id, payload.values).await?))
}

pub async fn next_question(
    State(sessions): State<SessionRegistry>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = sessions.get(&evaluation_id, &claims.sub).await?;
    Ok(Json(session.next_question().await?))
}

pub async fn previous_question(
    State(sessions): State<SessionRegistry>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = sessions.get(&evaluation_id, &claims.sub).await?;
    Ok(Json(session.previous_question().await?))
}

/// Accepts an anti-cheat signal for the attempt in progress.
pub async fn record_activity(
    State(sessions): State<SessionRegistry>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
    Json(payload): Json<ActivityRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let session = sessions.get(&evaluation_id, &claims.sub).await?;
    let recorded = session.record_activity(payload.kind, &payload.detail).await?;
    Ok((StatusCode::ACCEPTED, Json(recorded)))
}

/// Manual submit. Submitting again just returns the same results.
pub async fn submit(
    State(sessions): State<SessionRegistry>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = sessions.get(&evaluation_id, &claims.sub).await?;
    Ok(Json(session.submit().await?))
}

pub async fn restart(
    State(sessions): State<SessionRegistry>,
    Extension(claims): Extension<Claims>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = sessions.get(&evaluation_id, &claims.sub).await?;
    Ok(Json(session.restart().await?))
}
