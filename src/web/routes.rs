use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

/// REST surface for the excluded API collaborator. Everything else about the
/// system lives behind these three routes.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            .route("/question", post(handlers::answer_question))
            .route("/schema/invalidate", post(handlers::invalidate_schema))
            .route("/status", get(handlers::system_status)),
    )
}
