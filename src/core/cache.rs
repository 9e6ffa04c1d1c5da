//! Purpose: Memoize query results by signature with single-flight computation.
//! Exports: `QueryCache`, `RecordCache`, `CacheStats`.
//! Role: Sits in front of any fetch; callers supply the compute closure.
//! Invariants: At most one compute per signature is in flight; concurrent
//! callers for the same signature await it and share the resulting `Arc`.
//! Invariants: Failed computes are never stored; the next caller recomputes.
//! Invariants: Entries live until `invalidate`/`clear` (no eviction).
use crate::core::error::{Error, ErrorKind};
use crate::core::query::{Query, QuerySignature};
use crate::core::record::Record;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::OnceCell;

pub type RecordCache = QueryCache<Vec<Record>>;

type Slot<V> = Arc<OnceCell<Arc<V>>>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct QueryCache<V> {
    slots: Mutex<HashMap<QuerySignature, Slot<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> QueryCache<V>
where
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached value for `query`, running `compute` only when no
    /// value is stored and no other caller is already computing it.
    ///
    /// A compute failure surfaces as `ErrorKind::CacheCompute` with the
    /// original error as its source.
    pub async fn get_or_compute<F, Fut>(&self, query: &Query, compute: F) -> Result<Arc<V>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, Error>>,
    {
        let signature = query.signature();
        let slot = self.slot(&signature);

        let computed = AtomicBool::new(false);
        let ran = &computed;
        let misses = &self.misses;
        let key = &signature;
        let result = slot
            .get_or_try_init(|| async move {
                ran.store(true, Ordering::Relaxed);
                misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(signature = %key, "cache miss");
                compute().await.map(Arc::new)
            })
            .await;

        match result {
            Ok(value) => {
                if !computed.load(Ordering::Relaxed) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(signature = %signature, "cache hit");
                }
                Ok(value.clone())
            }
            Err(err) => {
                tracing::debug!(signature = %signature, error = %err, "cached computation failed");
                Err(Error::new(ErrorKind::CacheCompute)
                    .with_message("cached computation failed")
                    .with_query(query.text())
                    .with_source(err))
            }
        }
    }

    /// Stored value for `query`, if one has been computed.
    pub fn peek(&self, query: &Query) -> Option<Arc<V>> {
        let slots = self.lock();
        slots
            .get(&query.signature())
            .and_then(|slot| slot.get().cloned())
    }

    pub fn invalidate(&self, query: &Query) -> bool {
        self.lock().remove(&query.signature()).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored values; in-flight or failed computes are not counted.
    pub fn len(&self) -> usize {
        self.lock().values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn slot(&self, signature: &QuerySignature) -> Slot<V> {
        self.lock().entry(signature.clone()).or_default().clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QuerySignature, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> Default for QueryCache<V>
where
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl RecordCache {
    /// Process-wide record cache shared by every `RowSource` that does not
    /// bring its own.
    pub fn shared() -> Arc<RecordCache> {
        static SHARED: OnceLock<Arc<RecordCache>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(RecordCache::new())).clone()
    }
}
