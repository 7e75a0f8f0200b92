// src/routes.rs

use axum::{
    Router,
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{access, session},
    state::AppState,
    utils::jwt::auth_middleware,
};

/// Assembles the main application router.
///
/// * Every evaluation route requires a learner bearer token.
/// * Applies global middleware (Trace, CORS).
/// * Injects global state (access controller, session registry, config).
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    let evaluation_routes = Router::new()
        .route("/access", get(access::get_access))
        .route("/token", post(access::issue_token))
        .route("/attempts", get(access::list_attempts))
        .route(
            "/session",
            get(session::get_session)
                .post(session::open_session)
                .delete(session::close_session),
        )
        .route("/session/instructions", post(session::show_instructions))
        .route("/session/begin", post(session::begin))
        .route("/session/answers/{question_id}", put(session::record_answer))
        .route("/session/next", post(session::next_question))
        .route("/session/previous", post(session::previous_question))
        .route("/session/activity", post(session::record_activity))
        .route("/session/submit", post(session::submit))
        .route("/session/restart", post(session::restart))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .nest("/api/evaluations/{evaluation_id}", evaluation_routes)
        // Global Middleware (applied from outside in)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
