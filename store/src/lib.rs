//! In-memory fetch layer.
//!
//! [`MemoryStore`] keeps records in insertion order and answers `fetch_one`,
//! `fetch_many` and `count_matching` through spawned tasks that sleep for a
//! configurable latency first, like a remote datastore would. Lookups read the
//! store when the simulated round trip completes, not when the request is made.
//!
//! Per-primitive call counters and an injectable failure set make it usable as a
//! test double for code built on `lazyjoin-core`.

#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use lazyjoin_core::{AsyncHandle, Count, Fetch, Source};
use lazyjoin_types::{DeferError, FetchError, Identify};

/// Predicate used by [`MemoryStore::count_matching`].
pub struct Filter<T> {
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T> Filter<T> {
    pub fn new(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Matches every record.
    #[must_use]
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    fn matches(&self, record: &T) -> bool {
        (self.predicate)(record)
    }
}

impl<T> Clone for Filter<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<T> fmt::Debug for Filter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Filter(..)")
    }
}

/// Snapshot of how many requests each primitive has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch_one: usize,
    pub fetch_many: usize,
    pub count: usize,
}

struct Table<T: Identify> {
    order: Vec<T::Key>,
    rows: HashMap<T::Key, T>,
}

struct Inner<T: Identify> {
    table: RwLock<Table<T>>,
    failing: RwLock<HashSet<T::Key>>,
    latency: Duration,
    fetch_one_calls: AtomicUsize,
    fetch_many_calls: AtomicUsize,
    count_calls: AtomicUsize,
}

/// Shared in-memory record store. Clones refer to the same records.
pub struct MemoryStore<T: Identify>
where
    T::Key: Hash,
{
    inner: Arc<Inner<T>>,
}

impl<T: Identify> Clone for MemoryStore<T>
where
    T::Key: Hash,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Identify> Default for MemoryStore<T>
where
    T::Key: Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Identify> MemoryStore<T>
where
    T::Key: Hash,
{
    #[must_use]
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// A store whose every request takes `latency` to complete.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: RwLock::new(Table {
                    order: Vec::new(),
                    rows: HashMap::new(),
                }),
                failing: RwLock::new(HashSet::new()),
                latency,
                fetch_one_calls: AtomicUsize::new(0),
                fetch_many_calls: AtomicUsize::new(0),
                count_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// This store as a type-erased fetch source.
    #[must_use]
    pub fn source(&self) -> Source<T> {
        Arc::new(self.clone())
    }

    #[must_use]
    pub fn latency(&self) -> Duration {
        self.inner.latency
    }

    /// Insert or replace a record under its own key.
    pub fn put(&self, record: T) -> Result<T::Key, DeferError> {
        let key = record.identify().ok_or(DeferError::MissingIdentifier)?;
        let mut table = self
            .inner
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if table.rows.insert(key.clone(), record).is_none() {
            table.order.push(key.clone());
        }
        tracing::debug!(key = ?key, "Stored record");
        Ok(key)
    }

    /// Remove a record; later fetches report it as missing.
    pub fn delete(&self, key: &T::Key) -> Option<T> {
        let mut table = self
            .inner
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = table.rows.remove(key);
        if removed.is_some() {
            table.order.retain(|k| k != key);
        }
        removed
    }

    /// Every record, in insertion order. Synchronous, like an already-run query.
    #[must_use]
    pub fn all(&self) -> Vec<T> {
        let table = self
            .inner
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        table
            .order
            .iter()
            .filter_map(|key| table.rows.get(key).cloned())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every request touching `key` fail with a backend error.
    pub fn fail_key(&self, key: T::Key) {
        self.inner
            .failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
    }

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            fetch_one: self.inner.fetch_one_calls.load(Ordering::SeqCst),
            fetch_many: self.inner.fetch_many_calls.load(Ordering::SeqCst),
            count: self.inner.count_calls.load(Ordering::SeqCst),
        }
    }
}

impl<T: Identify> Inner<T>
where
    T::Key: Hash,
{
    fn lookup(&self, key: &T::Key) -> Result<Option<T>, FetchError> {
        let failing = self.failing.read().unwrap_or_else(PoisonError::into_inner);
        if failing.contains(key) {
            return Err(FetchError::backend(format!("injected failure for {key:?}")));
        }
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        Ok(table.rows.get(key).cloned())
    }

    fn count(&self, filter: &Filter<T>) -> u64 {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.rows.values().filter(|row| filter.matches(row)).count() as u64
    }
}

impl<T: Identify> Fetch<T> for MemoryStore<T>
where
    T::Key: Hash,
{
    fn fetch_one(&self, key: &T::Key) -> AsyncHandle<T> {
        self.inner.fetch_one_calls.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        AsyncHandle::spawn(async move {
            tokio::time::sleep(inner.latency).await;
            inner
                .lookup(&key)?
                .ok_or_else(|| FetchError::not_found(&key))
        })
    }

    fn fetch_many(&self, keys: &[T::Key]) -> AsyncHandle<Vec<Option<T>>> {
        self.inner.fetch_many_calls.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let keys = keys.to_vec();
        AsyncHandle::spawn(async move {
            tokio::time::sleep(inner.latency).await;
            keys.iter().map(|key| inner.lookup(key)).collect()
        })
    }
}

impl<T: Identify> Count for MemoryStore<T>
where
    T::Key: Hash,
{
    type Filter = Filter<T>;

    fn count_matching(&self, filter: &Filter<T>) -> AsyncHandle<u64> {
        self.inner.count_calls.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let filter = filter.clone();
        AsyncHandle::spawn(async move {
            tokio::time::sleep(inner.latency).await;
            Ok(inner.count(&filter))
        })
    }
}
