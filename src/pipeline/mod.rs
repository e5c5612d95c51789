pub mod cache;
pub mod execute;
pub mod prompt;
pub mod summarize;
pub mod validate;

use crate::config::{AppConfig, PipelineConfig};
use crate::db::db_pool::ReadOnlyDuckDbManager;
use crate::db::introspect::{SchemaIntrospector, SchemaMetadata};
use crate::llm::{CallSettings, LlmClient, LlmError};
use cache::{CachedAnswer, QueryCache};
use execute::{ExecuteError, QueryExecutor};
use r2d2::Pool;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use validate::ValidationVerdict;

/// Request-level error taxonomy. Every variant carries internal detail for
/// the log; what reaches the caller is `kind()` plus `public_message()`,
/// which never quote SQL or schema internals.
#[derive(Debug, Clone)]
pub enum PipelineError {
    SchemaUnavailable(String),
    LlmUnavailable(String),
    LlmTimeout,
    GenerationRejected(String),
    QueryTimeout,
    ExecutionError(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::SchemaUnavailable(detail) => {
                write!(f, "schema unavailable: {}", detail)
            }
            PipelineError::LlmUnavailable(detail) => write!(f, "LLM unavailable: {}", detail),
            PipelineError::LlmTimeout => write!(f, "LLM call timed out"),
            PipelineError::GenerationRejected(reason) => {
                write!(f, "generated SQL rejected: {}", reason)
            }
            PipelineError::QueryTimeout => write!(f, "query timed out"),
            PipelineError::ExecutionError(class) => {
                write!(f, "query execution failed ({})", class)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SchemaUnavailable(_) => "schema_unavailable",
            PipelineError::LlmUnavailable(_) => "llm_unavailable",
            PipelineError::LlmTimeout => "llm_timeout",
            PipelineError::GenerationRejected(_) => "generation_rejected",
            PipelineError::QueryTimeout => "query_timeout",
            PipelineError::ExecutionError(_) => "execution_error",
        }
    }

    pub fn public_message(&self) -> &'static str {
        match self {
            PipelineError::SchemaUnavailable(_) => "the analytics schema is currently unavailable",
            PipelineError::LlmUnavailable(_) => "the language model is currently unavailable",
            PipelineError::LlmTimeout => "the language model did not respond in time",
            PipelineError::GenerationRejected(_) => {
                "could not form a safe query for this question"
            }
            PipelineError::QueryTimeout | PipelineError::ExecutionError(_) => {
                "the query could not be completed"
            }
        }
    }
}

fn map_llm_error(e: LlmError) -> PipelineError {
    match e {
        LlmError::Timeout => PipelineError::LlmTimeout,
        other => PipelineError::LlmUnavailable(other.to_string()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Timings {
    pub generation_ms: u64,
    pub execution_ms: u64,
    pub summarization_ms: u64,
    pub total_ms: u64,
    pub cache_hit: bool,
}

/// What the API layer returns for an answered question.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub summary: String,
    pub timings: Timings,
}

/// The core: question -> prompt -> generate -> validate -> execute ->
/// summarize, with the cache short-circuiting repeated fingerprints.
pub struct QueryPipeline {
    introspector: Arc<SchemaIntrospector>,
    llm: Arc<LlmClient>,
    executor: QueryExecutor,
    cache: QueryCache,
    config: PipelineConfig,
    sql_settings: CallSettings,
    summary_settings: CallSettings,
}

impl QueryPipeline {
    pub fn new(
        introspector: Arc<SchemaIntrospector>,
        llm: Arc<LlmClient>,
        pool: Pool<ReadOnlyDuckDbManager>,
        config: &AppConfig,
    ) -> Self {
        let pipeline = config.pipeline.clone();
        Self {
            executor: QueryExecutor::new(
                pool,
                pipeline.row_cap,
                Duration::from_secs(pipeline.query_timeout_secs),
            ),
            cache: QueryCache::new(Duration::from_secs(pipeline.cache_ttl_secs)),
            sql_settings: CallSettings {
                max_tokens: config.llm.sql_max_tokens,
                temperature: config.llm.sql_temperature,
            },
            summary_settings: CallSettings {
                max_tokens: config.llm.summary_max_tokens,
                temperature: config.llm.summary_temperature,
            },
            introspector,
            llm,
            config: pipeline,
        }
    }

    pub async fn answer_question(
        &self,
        question: &str,
        session_id: Option<&str>,
    ) -> Result<Answer, PipelineError> {
        let total_start = Instant::now();
        if let Some(session) = session_id {
            debug!(session, "answering question");
        }

        let schema = self.introspector.get_schema().await.map_err(|e| {
            error!("cannot answer question without a schema: {}", e);
            PipelineError::SchemaUnavailable(e.to_string())
        })?;

        let fingerprint = cache::fingerprint(question, schema.version);
        let question_owned = question.to_string();
        let (outcome, cache_hit) = self
            .cache
            .get_or_compute(fingerprint, || self.compute(question_owned, schema.clone()))
            .await;
        let answer = outcome?;

        Ok(Answer {
            sql: answer.sql.clone(),
            columns: answer.result.columns.clone(),
            rows: answer.result.rows.clone(),
            row_count: answer.result.row_count,
            truncated: answer.result.truncated,
            summary: answer.summary.clone(),
            timings: Timings {
                generation_ms: answer.generation_ms,
                execution_ms: answer.execution_ms,
                summarization_ms: answer.summarization_ms,
                total_ms: elapsed_ms(total_start),
                cache_hit,
            },
        })
    }

    async fn compute(
        &self,
        question: String,
        schema: Arc<SchemaMetadata>,
    ) -> Result<Arc<CachedAnswer>, PipelineError> {
        let generation_start = Instant::now();
        let prompt = prompt::build(&question, &schema, &self.config);
        let raw = self
            .llm
            .complete(&prompt.messages(), self.sql_settings)
            .await
            .map_err(map_llm_error)?;
        let candidate = extract_sql(&raw);

        let canonical = match validate::validate(&candidate, &schema, self.config.row_cap) {
            ValidationVerdict::Accepted { canonical_sql } => canonical_sql,
            ValidationVerdict::Rejected { reason } => {
                // One bounded retry with the reason fed back into the prompt,
                // then give up. Nothing rejected is ever executed.
                warn!(%reason, "generated SQL rejected, retrying with feedback");
                let retry_prompt =
                    prompt::build_with_feedback(&question, &schema, &self.config, &reason.to_string());
                let raw = self
                    .llm
                    .complete(&retry_prompt.messages(), self.sql_settings)
                    .await
                    .map_err(map_llm_error)?;
                let candidate = extract_sql(&raw);
                match validate::validate(&candidate, &schema, self.config.row_cap) {
                    ValidationVerdict::Accepted { canonical_sql } => canonical_sql,
                    ValidationVerdict::Rejected { reason } => {
                        warn!(%reason, "regenerated SQL rejected, giving up");
                        return Err(PipelineError::GenerationRejected(reason.to_string()));
                    }
                }
            }
        };
        let generation_ms = elapsed_ms(generation_start);
        info!(sql = %canonical, "generated SQL accepted");

        let execution_start = Instant::now();
        let result = self.executor.execute(&canonical).await.map_err(|e| match e {
            ExecuteError::Timeout => PipelineError::QueryTimeout,
            ExecuteError::Execution(_) => {
                error!("query execution failed: {}", e);
                PipelineError::ExecutionError(e.class())
            }
        })?;
        let execution_ms = elapsed_ms(execution_start);

        let summarization_start = Instant::now();
        let summary = summarize::summarize(
            &self.llm,
            self.summary_settings,
            &question,
            &result,
            self.config.summary_sample_rows,
        )
        .await
        .map_err(map_llm_error)?;
        let summarization_ms = elapsed_ms(summarization_start);

        Ok(Arc::new(CachedAnswer {
            sql: canonical,
            result,
            summary,
            schema_version: schema.version,
            generation_ms,
            execution_ms,
            summarization_ms,
            created_at: Instant::now(),
        }))
    }

    /// Forces a schema reload and drops cache entries recorded against other
    /// versions. Wired to the ETL collaborator's invalidation hook.
    pub async fn refresh_schema(&self) -> Result<Arc<SchemaMetadata>, PipelineError> {
        let schema = self
            .introspector
            .force_refresh()
            .await
            .map_err(|e| PipelineError::SchemaUnavailable(e.to_string()))?;
        self.cache.purge_stale(schema.version);
        Ok(schema)
    }

    pub fn cached_answers(&self) -> usize {
        self.cache.len()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Models wrap SQL in markdown fences despite instructions; strip them
/// before validation. Never a substitute for validating.
fn extract_sql(content: &str) -> String {
    let trimmed = content.trim();

    if let Some(start) = trimmed.find("```sql") {
        if let Some(end) = trimmed.rfind("```") {
            if end > start + 6 {
                return trimmed[start + 6..end].trim().to_string();
            }
        }
    }

    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_suffix("```").unwrap_or(rest);
        return rest.trim().to_string();
    }

    trimmed.to_string()
}
