use crate::config::AppConfig;
use crate::db::introspect::SchemaIntrospector;
use crate::pipeline::QueryPipeline;
use std::sync::Arc;

/// Shared application state for the web server.
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: QueryPipeline,
    pub introspector: Arc<SchemaIntrospector>,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        pipeline: QueryPipeline,
        introspector: Arc<SchemaIntrospector>,
    ) -> Self {
        Self {
            config,
            pipeline,
            introspector,
            startup_time: chrono::Utc::now(),
        }
    }
}
