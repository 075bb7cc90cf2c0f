//! The fetch-layer capability consumed by deferred values.
//!
//! Deferred values never look a fetch layer up from ambient state; whoever builds a
//! key-backed deferred passes the source in explicitly.

use std::sync::Arc;

use lazyjoin_types::Identify;

use crate::handle::AsyncHandle;

/// Key-based record lookup.
pub trait Fetch<T: Identify>: Send + Sync {
    /// Start fetching the record stored under `key`.
    ///
    /// A missing record fails the handle with `FetchError::NotFound`.
    fn fetch_one(&self, key: &T::Key) -> AsyncHandle<T>;

    /// Start fetching every record in `keys` as one request.
    ///
    /// The result is index-aligned with `keys`; missing records are `None`.
    /// The default issues one `fetch_one` per key; stores with a native batch
    /// primitive should override it.
    fn fetch_many(&self, keys: &[T::Key]) -> AsyncHandle<Vec<Option<T>>> {
        AsyncHandle::gather(keys.iter().map(|key| self.fetch_one(key)))
    }
}

/// Aggregate counting over a store.
pub trait Count: Send + Sync {
    type Filter;

    fn count_matching(&self, filter: &Self::Filter) -> AsyncHandle<u64>;
}

/// Shared, type-erased fetch capability.
pub type Source<T> = Arc<dyn Fetch<T>>;

impl<T: Identify, F: Fetch<T> + ?Sized> Fetch<T> for Arc<F> {
    fn fetch_one(&self, key: &T::Key) -> AsyncHandle<T> {
        (**self).fetch_one(key)
    }

    fn fetch_many(&self, keys: &[T::Key]) -> AsyncHandle<Vec<Option<T>>> {
        (**self).fetch_many(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazyjoin_types::FetchError;

    #[derive(Debug, Clone, PartialEq)]
    struct Row(u32);

    impl Identify for Row {
        type Key = u32;

        fn identify(&self) -> Option<u32> {
            Some(self.0)
        }
    }

    struct EvenOnly;

    impl Fetch<Row> for EvenOnly {
        fn fetch_one(&self, key: &u32) -> AsyncHandle<Row> {
            if key % 2 == 0 {
                AsyncHandle::ready(Row(*key))
            } else {
                AsyncHandle::failed(FetchError::not_found(key))
            }
        }
    }

    #[tokio::test]
    async fn default_fetch_many_aligns_missing_records() {
        let rows = EvenOnly.fetch_many(&[2, 3, 4]).await;
        assert_eq!(rows, Ok(vec![Some(Row(2)), None, Some(Row(4))]));
    }

    #[tokio::test]
    async fn arc_forwards_to_inner_source() {
        let source: Source<Row> = Arc::new(EvenOnly);
        assert_eq!(source.fetch_one(&8).await, Ok(Row(8)));
    }
}
