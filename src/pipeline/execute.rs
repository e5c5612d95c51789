use crate::db::db_pool::ReadOnlyDuckDbManager;
use duckdb::types::{TimeUnit, ValueRef};
use r2d2::Pool;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tracing::warn;

#[derive(Debug)]
pub enum ExecuteError {
    /// The time budget expired. The in-flight statement runs to completion on
    /// its blocking thread but the result is discarded.
    Timeout,
    /// Database-reported failure. Carries the engine's message for the log;
    /// callers must not echo it to end users.
    Execution(String),
}

impl fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteError::Timeout => write!(f, "query exceeded its time budget"),
            ExecuteError::Execution(msg) => write!(f, "query execution failed: {}", msg),
        }
    }
}

impl Error for ExecuteError {}

impl ExecuteError {
    /// The engine's error class ("Catalog Error", "Binder Error", ...) without
    /// the rest of the message, which may quote SQL text.
    pub fn class(&self) -> String {
        match self {
            ExecuteError::Timeout => "Timeout".to_string(),
            ExecuteError::Execution(msg) => msg
                .split(':')
                .next()
                .unwrap_or("Execution")
                .trim()
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub truncated: bool,
}

/// Runs validated SQL against the read-only pool under a row cap and a time
/// budget. The cap here is a second enforcement, independent of the LIMIT the
/// validator injected.
pub struct QueryExecutor {
    pool: Pool<ReadOnlyDuckDbManager>,
    row_cap: usize,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(pool: Pool<ReadOnlyDuckDbManager>, row_cap: usize, timeout: Duration) -> Self {
        Self {
            pool,
            row_cap,
            timeout,
        }
    }

    pub async fn execute(&self, sql: &str) -> Result<QueryResult, ExecuteError> {
        let pool = self.pool.clone();
        let sql = sql.to_string();
        let cap = self.row_cap;

        let task = tokio::task::spawn_blocking(move || run_query(&pool, &sql, cap));

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                warn!("query exceeded its time budget, abandoning result");
                Err(ExecuteError::Timeout)
            }
            Ok(Err(join_err)) => Err(ExecuteError::Execution(join_err.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

fn run_query(
    pool: &Pool<ReadOnlyDuckDbManager>,
    sql: &str,
    cap: usize,
) -> Result<QueryResult, ExecuteError> {
    let conn = pool
        .get()
        .map_err(|e| ExecuteError::Execution(e.to_string()))?;

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| ExecuteError::Execution(e.to_string()))?;

    let column_count = stmt.column_count();
    let mut columns = Vec::with_capacity(column_count);
    for i in 0..column_count {
        match stmt.column_name(i) {
            Ok(name) => columns.push(name.to_string()),
            Err(e) => return Err(ExecuteError::Execution(e.to_string())),
        }
    }

    let mut rows = stmt
        .query([])
        .map_err(|e| ExecuteError::Execution(e.to_string()))?;

    let mut collected: Vec<Vec<Value>> = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows
        .next()
        .map_err(|e| ExecuteError::Execution(e.to_string()))?
    {
        let mut record = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value = match row.get_ref(i) {
                Ok(value_ref) => value_to_json(value_ref),
                Err(_) => Value::Null,
            };
            record.push(value);
        }
        collected.push(record);

        if collected.len() >= cap {
            truncated = true;
            break;
        }
    }

    let row_count = collected.len();
    Ok(QueryResult {
        columns,
        rows: collected,
        row_count,
        truncated,
    })
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::from(b),
        ValueRef::TinyInt(i) => Value::from(i as i64),
        ValueRef::SmallInt(i) => Value::from(i as i64),
        ValueRef::Int(i) => Value::from(i as i64),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(n) => Value::from(n),
            Err(_) => Value::from(i.to_string()),
        },
        ValueRef::UTinyInt(u) => Value::from(u as u64),
        ValueRef::USmallInt(u) => Value::from(u as u64),
        ValueRef::UInt(u) => Value::from(u as u64),
        ValueRef::UBigInt(u) => Value::from(u),
        ValueRef::Float(f) => Value::from(f as f64),
        ValueRef::Double(f) => Value::from(f),
        ValueRef::Decimal(d) => Value::from(d.to_string()),
        ValueRef::Text(bytes) => Value::from(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Date32(days) => {
            match chrono::DateTime::from_timestamp(days as i64 * 86_400, 0) {
                Some(dt) => Value::from(dt.date_naive().to_string()),
                None => Value::Null,
            }
        }
        ValueRef::Timestamp(unit, raw) => {
            let (secs, nanos) = match unit {
                TimeUnit::Second => (raw, 0u32),
                TimeUnit::Millisecond => (
                    raw.div_euclid(1_000),
                    (raw.rem_euclid(1_000) * 1_000_000) as u32,
                ),
                TimeUnit::Microsecond => (
                    raw.div_euclid(1_000_000),
                    (raw.rem_euclid(1_000_000) * 1_000) as u32,
                ),
                TimeUnit::Nanosecond => {
                    (raw.div_euclid(1_000_000_000), raw.rem_euclid(1_000_000_000) as u32)
                }
            };
            match chrono::DateTime::from_timestamp(secs, nanos) {
                Some(dt) => Value::from(dt.to_rfc3339()),
                None => Value::Null,
            }
        }
        other => Value::from(format!("{:?}", other)),
    }
}
