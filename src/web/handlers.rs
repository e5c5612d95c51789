use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::pipeline::{Answer, PipelineError};
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct QuestionRequest {
    pub question: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SchemaRefreshResponse {
    pub schema_version: u64,
    pub stale: bool,
    pub table_count: usize,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub schema_version: Option<u64>,
    pub schema_stale: Option<bool>,
    pub table_count: usize,
    pub cached_answers: usize,
}

fn error_response(e: &PipelineError) -> (StatusCode, Json<ErrorBody>) {
    let status = match e {
        PipelineError::SchemaUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::LlmUnavailable(_) => StatusCode::BAD_GATEWAY,
        PipelineError::LlmTimeout | PipelineError::QueryTimeout => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::GenerationRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::ExecutionError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: e.kind(),
            message: e.public_message().to_string(),
        }),
    )
}

/// Inbound interface for the API collaborator: one question in, a validated
/// tabular answer plus summary out.
pub async fn answer_question(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QuestionRequest>,
) -> Result<Json<Answer>, (StatusCode, Json<ErrorBody>)> {
    let question = payload.question.trim();
    if question.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "empty_question",
                message: "question must not be empty".to_string(),
            }),
        ));
    }

    info!(question, "answering analytics question");

    let answer = state
        .pipeline
        .answer_question(question, payload.session_id.as_deref())
        .await
        .map_err(|e| {
            // Full detail goes to the log; callers get the stable kind and a
            // message that leaks nothing about the schema or generated SQL.
            warn!("question failed: {}", e);
            error_response(&e)
        })?;

    Ok(Json(answer))
}

/// Invalidation hook for the ETL collaborator: reload the schema now and drop
/// cache entries from other schema versions.
pub async fn invalidate_schema(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SchemaRefreshResponse>, (StatusCode, Json<ErrorBody>)> {
    let schema = state.pipeline.refresh_schema().await.map_err(|e| {
        warn!("schema refresh failed: {}", e);
        error_response(&e)
    })?;

    info!(version = schema.version, "schema refreshed on request");

    Ok(Json(SchemaRefreshResponse {
        schema_version: schema.version,
        stale: schema.stale,
        table_count: schema.tables.len(),
    }))
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds();
    let snapshot = state.introspector.peek().await;

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        schema_version: snapshot.as_ref().map(|s| s.version),
        schema_stale: snapshot.as_ref().map(|s| s.stale),
        table_count: snapshot.map(|s| s.tables.len()).unwrap_or(0),
        cached_answers: state.pipeline.cached_answers(),
    })
}
