use crate::db::db_pool::ReadOnlyDuckDbManager;
use async_trait::async_trait;
use r2d2::Pool;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum IntrospectError {
    /// Introspection failed and no cached snapshot exists to fall back on.
    Unavailable(String),
}

impl fmt::Display for IntrospectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntrospectError::Unavailable(msg) => {
                write!(f, "schema introspection failed: {}", msg)
            }
        }
    }
}

impl Error for IntrospectError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

/// Immutable snapshot of the whitelisted analytics schema. The version only
/// moves when the table/column structure changes, so cache fingerprints can
/// key off it.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaMetadata {
    pub version: u64,
    /// Set when the store was unreachable and this is a last-known-good copy.
    pub stale: bool,
    pub tables: Vec<TableDescriptor>,
}

impl SchemaMetadata {
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }
}

/// Where table/column metadata comes from.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn load_tables(&self) -> Result<Vec<TableDescriptor>, Box<dyn Error + Send + Sync>>;
}

/// Reads `information_schema.columns` from the analytics store, restricted to
/// the configured whitelist. An empty whitelist admits every table in `main`.
pub struct DuckDbSchemaSource {
    pool: Pool<ReadOnlyDuckDbManager>,
    allowed_tables: Vec<String>,
}

impl DuckDbSchemaSource {
    pub fn new(pool: Pool<ReadOnlyDuckDbManager>, allowed_tables: Vec<String>) -> Self {
        Self {
            pool,
            allowed_tables,
        }
    }
}

#[async_trait]
impl SchemaSource for DuckDbSchemaSource {
    async fn load_tables(&self) -> Result<Vec<TableDescriptor>, Box<dyn Error + Send + Sync>> {
        let pool = self.pool.clone();
        let allowed = self.allowed_tables.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<TableDescriptor>, Box<dyn Error + Send + Sync>> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT table_name, column_name, data_type, is_nullable
                 FROM information_schema.columns
                 WHERE table_schema = 'main'
                 ORDER BY table_name, ordinal_position",
            )?;

            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut tables: Vec<TableDescriptor> = Vec::new();
            for row in rows {
                let (table, column, data_type, nullable) = row?;
                if !allowed.is_empty()
                    && !allowed.iter().any(|a| a.eq_ignore_ascii_case(&table))
                {
                    continue;
                }
                let column = ColumnDescriptor {
                    name: column,
                    data_type,
                    nullable: nullable.eq_ignore_ascii_case("yes"),
                };
                match tables.last_mut() {
                    Some(t) if t.name == table => t.columns.push(column),
                    _ => tables.push(TableDescriptor {
                        name: table,
                        columns: vec![column],
                    }),
                }
            }
            Ok(tables)
        })
        .await?
    }
}

struct CachedSnapshot {
    snapshot: Arc<SchemaMetadata>,
    fetched_at: Instant,
    invalidated: bool,
}

/// Caches schema metadata, refreshing on TTL expiry or explicit invalidation
/// (the ETL collaborator calls the latter after a load).
pub struct SchemaIntrospector {
    source: Box<dyn SchemaSource>,
    ttl: Duration,
    state: RwLock<Option<CachedSnapshot>>,
    // Collapses concurrent refresh attempts into one store round trip.
    refresh_lock: Mutex<()>,
}

impl SchemaIntrospector {
    pub fn new(source: Box<dyn SchemaSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            state: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn for_store(
        pool: Pool<ReadOnlyDuckDbManager>,
        allowed_tables: Vec<String>,
        ttl: Duration,
    ) -> Self {
        Self::new(Box::new(DuckDbSchemaSource::new(pool, allowed_tables)), ttl)
    }

    /// Returns the current snapshot, refreshing it first if the cached copy
    /// is past its TTL or has been invalidated.
    pub async fn get_schema(&self) -> Result<Arc<SchemaMetadata>, IntrospectError> {
        {
            let state = self.state.read().await;
            if let Some(cached) = state.as_ref() {
                if !cached.invalidated && cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.snapshot.clone());
                }
            }
        }
        self.refresh(false).await
    }

    /// Reloads from the store immediately, regardless of TTL.
    pub async fn force_refresh(&self) -> Result<Arc<SchemaMetadata>, IntrospectError> {
        self.refresh(true).await
    }

    /// Current snapshot without triggering a refresh, if one exists.
    pub async fn peek(&self) -> Option<Arc<SchemaMetadata>> {
        let state = self.state.read().await;
        state.as_ref().map(|cached| cached.snapshot.clone())
    }

    /// Marks the cached snapshot expired so the next `get_schema` reloads.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        if let Some(cached) = state.as_mut() {
            cached.invalidated = true;
        }
    }

    async fn refresh(&self, forced: bool) -> Result<Arc<SchemaMetadata>, IntrospectError> {
        let _guard = self.refresh_lock.lock().await;

        // Another caller may have finished a refresh while we waited.
        if !forced {
            let state = self.state.read().await;
            if let Some(cached) = state.as_ref() {
                if !cached.invalidated && cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.snapshot.clone());
                }
            }
        }

        match self.source.load_tables().await {
            Ok(tables) => {
                let mut state = self.state.write().await;
                let version = match state.as_ref() {
                    Some(cached) if cached.snapshot.tables == tables => cached.snapshot.version,
                    Some(cached) => {
                        info!(
                            old_version = cached.snapshot.version,
                            tables = tables.len(),
                            "schema structure changed, bumping version"
                        );
                        cached.snapshot.version + 1
                    }
                    None => 1,
                };
                let snapshot = Arc::new(SchemaMetadata {
                    version,
                    stale: false,
                    tables,
                });
                *state = Some(CachedSnapshot {
                    snapshot: snapshot.clone(),
                    fetched_at: Instant::now(),
                    invalidated: false,
                });
                debug!(version, "schema snapshot refreshed");
                Ok(snapshot)
            }
            Err(e) => {
                // Availability over freshness on this read path: serve the
                // last-known-good snapshot flagged stale instead of failing.
                warn!("schema refresh failed: {}", e);
                let state = self.state.read().await;
                match state.as_ref() {
                    Some(cached) => {
                        let mut stale = (*cached.snapshot).clone();
                        stale.stale = true;
                        Ok(Arc::new(stale))
                    }
                    None => Err(IntrospectError::Unavailable(e.to_string())),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    static DB_SEQ: AtomicU32 = AtomicU32::new(0);

    fn table(name: &str, columns: &[&str]) -> TableDescriptor {
        TableDescriptor {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|c| ColumnDescriptor {
                    name: c.to_string(),
                    data_type: "BIGINT".to_string(),
                    nullable: true,
                })
                .collect(),
        }
    }

    struct FakeSource {
        tables: std::sync::Mutex<Vec<TableDescriptor>>,
        fail: AtomicBool,
        loads: AtomicUsize,
        delay: Duration,
    }

    impl FakeSource {
        fn new(tables: Vec<TableDescriptor>) -> Self {
            Self {
                tables: std::sync::Mutex::new(tables),
                fail: AtomicBool::new(false),
                loads: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn set_tables(&self, tables: Vec<TableDescriptor>) {
            *self.tables.lock().unwrap() = tables;
        }
    }

    #[async_trait]
    impl SchemaSource for Arc<FakeSource> {
        async fn load_tables(
            &self,
        ) -> Result<Vec<TableDescriptor>, Box<dyn Error + Send + Sync>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err("store unreachable".into());
            }
            Ok(self.tables.lock().unwrap().clone())
        }
    }

    fn introspector(source: Arc<FakeSource>, ttl: Duration) -> SchemaIntrospector {
        SchemaIntrospector::new(Box::new(source), ttl)
    }

    #[tokio::test]
    async fn serves_cached_snapshot_within_ttl() {
        let source = Arc::new(FakeSource::new(vec![table("workflow_runs", &["id"])]));
        let intro = introspector(source.clone(), Duration::from_secs(60));

        let first = intro.get_schema().await.unwrap();
        let second = intro.get_schema().await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 1);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn version_bumps_only_on_structural_change() {
        let source = Arc::new(FakeSource::new(vec![table("workflow_runs", &["id"])]));
        let intro = introspector(source.clone(), Duration::from_secs(60));

        assert_eq!(intro.get_schema().await.unwrap().version, 1);

        // Unchanged structure: forced reload keeps the version.
        assert_eq!(intro.force_refresh().await.unwrap().version, 1);

        // New table: refresh after invalidation sees a new version.
        source.set_tables(vec![
            table("workflow_runs", &["id"]),
            table("workflow_steps", &["run_id"]),
        ]);
        intro.invalidate().await;
        let schema = intro.get_schema().await.unwrap();
        assert_eq!(schema.version, 2);
        assert!(schema.table("workflow_steps").is_some());
    }

    #[tokio::test]
    async fn stale_snapshot_served_when_store_unreachable() {
        let source = Arc::new(FakeSource::new(vec![table("workflow_runs", &["id"])]));
        let intro = introspector(source.clone(), Duration::from_secs(60));

        let fresh = intro.get_schema().await.unwrap();
        assert!(!fresh.stale);

        source.fail.store(true, Ordering::SeqCst);
        intro.invalidate().await;
        let stale = intro.get_schema().await.unwrap();
        assert!(stale.stale);
        assert_eq!(stale.version, fresh.version);
        assert!(stale.table("workflow_runs").is_some());
    }

    #[tokio::test]
    async fn unavailable_without_any_snapshot() {
        let source = Arc::new(FakeSource::new(vec![]));
        source.fail.store(true, Ordering::SeqCst);
        let intro = introspector(source, Duration::from_secs(60));
        assert!(intro.get_schema().await.is_err());
    }

    #[tokio::test]
    async fn concurrent_refreshes_collapse_into_one_load() {
        let mut fake = FakeSource::new(vec![table("workflow_runs", &["id"])]);
        fake.delay = Duration::from_millis(50);
        let source = Arc::new(fake);
        let intro = Arc::new(introspector(source.clone(), Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let intro = intro.clone();
            handles.push(tokio::spawn(async move { intro.get_schema().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duckdb_source_loads_whitelisted_tables() {
        let path = std::env::temp_dir().join(format!(
            "flowlens-introspect-{}-{}.duckdb",
            std::process::id(),
            DB_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        {
            let conn = duckdb::Connection::open(&path).expect("open store");
            conn.execute_batch(
                "CREATE TABLE workflow_runs (id BIGINT NOT NULL, status VARCHAR, finished_at TIMESTAMP);
                 CREATE TABLE internal_secrets (token VARCHAR);",
            )
            .expect("seed store");
        }

        let manager = ReadOnlyDuckDbManager::new(path.to_string_lossy().to_string());
        let pool = Pool::builder().max_size(2).build(manager).expect("pool");
        let intro = SchemaIntrospector::for_store(
            pool,
            vec!["workflow_runs".to_string()],
            Duration::from_secs(60),
        );

        let schema = intro.get_schema().await.expect("schema");
        assert!(schema.table("internal_secrets").is_none());
        let runs = schema.table("workflow_runs").expect("whitelisted table");
        let names: Vec<&str> = runs.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "status", "finished_at"]);
        assert!(!runs.columns[0].nullable);
        assert!(runs.columns[1].nullable);

        let _ = std::fs::remove_file(&path);
    }
}
