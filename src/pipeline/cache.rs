use crate::pipeline::execute::QueryResult;
use crate::pipeline::PipelineError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::warn;

/// Lowercased, whitespace-collapsed question text. "How many  failed?" and
/// "how many failed?" share a fingerprint.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// FNV-1a over the normalized question and the schema version. Stable for
/// the process lifetime, which is as long as any entry can live.
pub fn fingerprint(question: &str, schema_version: u64) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut mix = |byte: u8| {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    };
    for byte in normalize_question(question).bytes() {
        mix(byte);
    }
    for byte in schema_version.to_le_bytes() {
        mix(byte);
    }
    hash
}

#[derive(Debug)]
pub struct CachedAnswer {
    pub sql: String,
    pub result: QueryResult,
    pub summary: String,
    pub schema_version: u64,
    pub generation_ms: u64,
    pub execution_ms: u64,
    pub summarization_ms: u64,
    pub created_at: Instant,
}

type Outcome = Result<Arc<CachedAnswer>, PipelineError>;

struct Flight {
    cell: OnceCell<Outcome>,
}

/// Answer cache with single-flight deduplication. One `OnceCell` per
/// fingerprint: the first caller computes, concurrent callers await the same
/// cell and share the outcome, success or failure. Failed flights are evicted
/// after completion so the next request recomputes.
///
/// The map lock is only ever held for map surgery, never across an await.
/// A poisoned lock degrades to always-compute; the cache is an optimization,
/// not a dependency.
pub struct QueryCache {
    ttl: Duration,
    entries: Mutex<HashMap<u64, Arc<Flight>>>,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached outcome for `fingerprint`, joining an in-flight
    /// computation if one exists, or running `compute` otherwise. The second
    /// element reports whether the answer came from the cache.
    pub async fn get_or_compute<F, Fut>(&self, fingerprint: u64, compute: F) -> (Outcome, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        // Map surgery happens under the lock and produces the flight to join.
        // A poisoned lock yields `None`; the await that falls back to computing
        // without the cache runs after the guard is dropped, so no lock value is
        // ever held across an await (keeps this future `Send`).
        let maybe_flight: Option<Arc<Flight>> = match self.entries.lock() {
            Err(_) => {
                warn!("query cache lock poisoned, computing without cache");
                None
            }
            Ok(mut entries) => {
                if let Some(existing) = entries.get(&fingerprint) {
                    if let Some(outcome) = existing.cell.get() {
                        match outcome {
                            Ok(answer) if answer.created_at.elapsed() < self.ttl => {
                                return (Ok(answer.clone()), true);
                            }
                            // Expired or failed: evict and recompute below.
                            _ => {
                                entries.remove(&fingerprint);
                            }
                        }
                    }
                }

                Some(
                    entries
                        .entry(fingerprint)
                        .or_insert_with(|| {
                            Arc::new(Flight {
                                cell: OnceCell::new(),
                            })
                        })
                        .clone(),
                )
            }
        };

        let flight = match maybe_flight {
            Some(flight) => flight,
            None => return (compute().await, false),
        };

        let mut computed = false;
        let outcome = flight
            .cell
            .get_or_init(|| {
                computed = true;
                compute()
            })
            .await
            .clone();

        if outcome.is_err() {
            // Do not cache failures past the flight that produced them.
            if let Ok(mut entries) = self.entries.lock() {
                if let Some(current) = entries.get(&fingerprint) {
                    if Arc::ptr_eq(current, &flight) {
                        entries.remove(&fingerprint);
                    }
                }
            }
        }

        (outcome, !computed)
    }

    /// Drops completed entries recorded against any other schema version.
    /// Called after a forced refresh so stale answers are never served.
    pub fn purge_stale(&self, current_version: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, flight| match flight.cell.get() {
                Some(Ok(answer)) => answer.schema_version == current_version,
                Some(Err(_)) => false,
                // In flight: keyed on a fingerprint that includes its version,
                // so it can never be served for the new one.
                None => true,
            });
        }
    }

    /// Number of completed entries, for the status endpoint.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .values()
                    .filter(|flight| flight.cell.get().is_some())
                    .count()
            })
            .unwrap_or(0)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn answer(schema_version: u64) -> Arc<CachedAnswer> {
        Arc::new(CachedAnswer {
            sql: "SELECT 1 LIMIT 500".to_string(),
            result: QueryResult {
                columns: vec!["n".to_string()],
                rows: vec![vec![serde_json::Value::from(1i64)]],
                row_count: 1,
                truncated: false,
            },
            summary: "one".to_string(),
            schema_version,
            generation_ms: 1,
            execution_ms: 1,
            summarization_ms: 1,
            created_at: Instant::now(),
        })
    }

    #[tokio::test]
    async fn concurrent_identical_requests_compute_once() {
        let cache = Arc::new(QueryCache::new(Duration::from_secs(60)));
        let computes = Arc::new(AtomicUsize::new(0));
        let fp = fingerprint("how many workflows failed last week", 1);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let computes = computes.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(fp, || async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(answer(1))
                    })
                    .await
            }));
        }

        let mut hits = 0;
        for handle in handles {
            let (outcome, cache_hit) = handle.await.unwrap();
            assert!(outcome.is_ok());
            if cache_hit {
                hits += 1;
            }
        }
        assert_eq!(computes.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 7);
    }

    #[tokio::test]
    async fn repeat_requests_are_served_from_cache() {
        let cache = QueryCache::new(Duration::from_secs(60));
        let fp = fingerprint("q", 1);

        let (first, hit) = cache.get_or_compute(fp, || async { Ok(answer(1)) }).await;
        assert!(!hit);
        let (second, hit) = cache
            .get_or_compute(fp, || async { panic!("must not recompute") })
            .await;
        assert!(hit);
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = QueryCache::new(Duration::from_millis(40));
        let computes = AtomicUsize::new(0);
        let fp = fingerprint("q", 1);

        let compute = || async {
            computes.fetch_add(1, Ordering::SeqCst);
            Ok(answer(1))
        };
        let _ = cache.get_or_compute(fp, compute).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let (_, hit) = cache
            .get_or_compute(fp, || async {
                computes.fetch_add(1, Ordering::SeqCst);
                Ok(answer(1))
            })
            .await;

        assert!(!hit);
        assert_eq!(computes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = QueryCache::new(Duration::from_secs(60));
        let fp = fingerprint("q", 1);

        let (first, _) = cache
            .get_or_compute(fp, || async {
                Err(PipelineError::QueryTimeout)
            })
            .await;
        assert!(first.is_err());

        let (second, hit) = cache.get_or_compute(fp, || async { Ok(answer(1)) }).await;
        assert!(second.is_ok());
        assert!(!hit);
    }

    #[tokio::test]
    async fn purge_drops_answers_from_other_schema_versions() {
        let cache = QueryCache::new(Duration::from_secs(60));
        let old = fingerprint("q", 1);
        let current = fingerprint("q", 2);

        let _ = cache.get_or_compute(old, || async { Ok(answer(1)) }).await;
        let _ = cache.get_or_compute(current, || async { Ok(answer(2)) }).await;
        assert_eq!(cache.len(), 2);

        cache.purge_stale(2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn fingerprint_normalizes_question_text() {
        assert_eq!(
            fingerprint("How many  workflows FAILED?", 3),
            fingerprint("how many workflows failed?", 3)
        );
    }

    #[test]
    fn fingerprint_depends_on_schema_version() {
        assert_ne!(fingerprint("q", 1), fingerprint("q", 2));
    }
}
