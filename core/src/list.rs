//! The list-mode deferred value.
//!
//! Keys, pending work and resolved values are all ordered sequences kept in
//! lockstep. A key list is fetched with one `fetch_many` call rather than one
//! request per key.

use std::fmt;

use lazyjoin_types::{DeferError, FetchError, Identify, ResolvableKind};

use crate::deferred::Resolvable;
use crate::fetch::Source;
use crate::handle::AsyncHandle;

#[derive(Clone)]
enum ListState<T> {
    Unset,
    Pending(AsyncHandle<Vec<Option<T>>>),
    Resolved(Vec<Option<T>>),
}

/// Ordered batch of deferred records.
///
/// Resolved entries are `None` where the fetch layer found no record for the key
/// at that position.
#[derive(Clone)]
pub struct DeferredList<T: Identify> {
    keys: Option<Vec<T::Key>>,
    state: ListState<T>,
    source: Option<Source<T>>,
}

impl<T: Identify> DeferredList<T> {
    pub fn from_keys(keys: Vec<T::Key>, source: Source<T>) -> Self {
        Self {
            keys: Some(keys),
            state: ListState::Unset,
            source: Some(source),
        }
    }

    /// One handle per element, joined into a single batch.
    pub fn from_handles(handles: Vec<AsyncHandle<T>>) -> Self {
        Self::from_batch(AsyncHandle::gather(handles))
    }

    /// A handle that already yields the whole batch, such as a `fetch_many` result.
    pub fn from_batch(handle: AsyncHandle<Vec<Option<T>>>) -> Self {
        Self {
            keys: None,
            state: ListState::Pending(handle),
            source: None,
        }
    }

    pub fn from_values(values: Vec<T>) -> Self {
        Self {
            keys: None,
            state: ListState::Resolved(values.into_iter().map(Some).collect()),
            source: None,
        }
    }

    /// Build from a list of resolvables that must all be the same kind.
    ///
    /// Fails with `TypeMismatch` before any fetch is started if kinds are mixed.
    /// An empty list resolves to an empty batch.
    pub fn from_items(
        items: Vec<Resolvable<T>>,
        source: Option<Source<T>>,
    ) -> Result<Self, DeferError> {
        let Some(expected) = items.first().map(Resolvable::kind) else {
            return Ok(Self {
                source,
                ..Self::from_values(Vec::new())
            });
        };
        if let Some((index, found)) = items
            .iter()
            .map(Resolvable::kind)
            .enumerate()
            .find(|(_, kind)| *kind != expected)
        {
            return Err(DeferError::TypeMismatch {
                expected,
                found,
                index,
            });
        }

        let list = match expected {
            ResolvableKind::Key => Self {
                keys: Some(
                    items
                        .into_iter()
                        .filter_map(|item| match item {
                            Resolvable::Key(key) => Some(key),
                            _ => None,
                        })
                        .collect(),
                ),
                state: ListState::Unset,
                source: None,
            },
            ResolvableKind::Handle => Self::from_handles(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Resolvable::Handle(handle) => Some(handle),
                        _ => None,
                    })
                    .collect(),
            ),
            ResolvableKind::Value => Self::from_values(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Resolvable::Value(value) => Some(value),
                        _ => None,
                    })
                    .collect(),
            ),
        };
        Ok(Self { source, ..list })
    }

    #[must_use]
    pub fn bind(mut self, source: Source<T>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self.state, ListState::Resolved(_))
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.state, ListState::Pending(_))
    }

    /// Number of entries, when known without waiting.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        match (&self.keys, &self.state) {
            (_, ListState::Resolved(values)) => Some(values.len()),
            (Some(keys), _) => Some(keys.len()),
            (None, _) => None,
        }
    }

    /// The key view, index-aligned with the values.
    ///
    /// Derived from resolved values when no keys are stored; a missing record
    /// or a record without identity fails with `MissingIdentifier`.
    pub fn keys(&mut self) -> Result<Option<&[T::Key]>, DeferError> {
        if self.keys.is_none() {
            self.promote_ready()?;
            if let ListState::Resolved(values) = &self.state {
                let keys = values
                    .iter()
                    .map(|value| {
                        value
                            .as_ref()
                            .and_then(Identify::identify)
                            .ok_or(DeferError::MissingIdentifier)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.keys = Some(keys);
            }
        }
        Ok(self.keys.as_deref())
    }

    pub fn stored_keys(&self) -> Result<Option<Vec<T::Key>>, DeferError> {
        if let Some(keys) = &self.keys {
            return Ok(Some(keys.clone()));
        }
        let values = match &self.state {
            ListState::Resolved(values) => values,
            ListState::Pending(handle) => match handle.peek() {
                Some(Ok(values)) => values,
                Some(Err(err)) => return Err(err.clone().into()),
                None => return Ok(None),
            },
            ListState::Unset => return Ok(None),
        };
        values
            .iter()
            .map(|value| {
                value
                    .as_ref()
                    .and_then(Identify::identify)
                    .ok_or(DeferError::MissingIdentifier)
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    pub fn set_keys(&mut self, keys: Vec<T::Key>) {
        self.keys = Some(keys);
        self.state = ListState::Unset;
    }

    /// The value view. Issues a single `fetch_many` for stored keys if needed.
    pub async fn values(&mut self) -> Result<&[Option<T>], DeferError> {
        if matches!(self.state, ListState::Unset) {
            self.start_fetch()?;
        }
        if let ListState::Pending(handle) = &self.state {
            let handle = handle.clone();
            let values = handle.await?;
            self.state = ListState::Resolved(values);
        }
        match &self.state {
            ListState::Resolved(values) => Ok(values.as_slice()),
            ListState::Unset | ListState::Pending(_) => Err(DeferError::EmptyDeferred),
        }
    }

    pub fn try_values(&mut self) -> Result<Option<&[Option<T>]>, DeferError> {
        self.promote_ready()?;
        match &self.state {
            ListState::Resolved(values) => Ok(Some(values.as_slice())),
            ListState::Unset | ListState::Pending(_) => Ok(None),
        }
    }

    pub fn set_values(&mut self, values: Vec<T>) {
        self.keys = None;
        self.state = ListState::Resolved(values.into_iter().map(Some).collect());
    }

    /// The batch handle, starting the `fetch_many` from stored keys if needed.
    pub fn handle(&mut self) -> Result<Option<AsyncHandle<Vec<Option<T>>>>, DeferError> {
        if matches!(self.state, ListState::Unset) {
            self.start_fetch()?;
        }
        match &self.state {
            ListState::Pending(handle) => Ok(Some(handle.clone())),
            ListState::Unset | ListState::Resolved(_) => Ok(None),
        }
    }

    fn start_fetch(&mut self) -> Result<(), DeferError> {
        let keys = self.keys.as_ref().ok_or(DeferError::EmptyDeferred)?;
        let source = self.source.as_ref().ok_or(DeferError::Unbound)?;
        tracing::debug!(keys = keys.len(), "Starting batch fetch for deferred keys");
        self.state = ListState::Pending(source.fetch_many(keys));
        Ok(())
    }

    fn promote_ready(&mut self) -> Result<(), FetchError> {
        if let ListState::Pending(handle) = &self.state
            && let Some(result) = handle.peek()
        {
            let values = result.clone()?;
            self.state = ListState::Resolved(values);
        }
        Ok(())
    }
}

impl<T: Identify> From<Vec<AsyncHandle<T>>> for DeferredList<T> {
    fn from(handles: Vec<AsyncHandle<T>>) -> Self {
        Self::from_handles(handles)
    }
}

impl<T: Identify> From<AsyncHandle<Vec<Option<T>>>> for DeferredList<T> {
    fn from(handle: AsyncHandle<Vec<Option<T>>>) -> Self {
        Self::from_batch(handle)
    }
}

impl<T: Identify + fmt::Debug> fmt::Debug for DeferredList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("DeferredList");
        out.field("keys", &self.keys);
        match &self.state {
            ListState::Unset => out.field("state", &"unset"),
            ListState::Pending(handle) => out.field("state", handle),
            ListState::Resolved(values) => out.field("values", values),
        };
        out.field("bound", &self.source.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::fetch::Fetch;

    #[derive(Debug, Clone, PartialEq)]
    struct Tag {
        id: u32,
    }

    impl Identify for Tag {
        type Key = u32;

        fn identify(&self) -> Option<u32> {
            Some(self.id)
        }
    }

    /// Serves ids below 100; counts single and batch requests separately.
    #[derive(Default)]
    struct Tags {
        single: AtomicUsize,
        batch: AtomicUsize,
    }

    impl Fetch<Tag> for Tags {
        fn fetch_one(&self, key: &u32) -> AsyncHandle<Tag> {
            self.single.fetch_add(1, Ordering::SeqCst);
            if *key < 100 {
                AsyncHandle::ready(Tag { id: *key })
            } else {
                AsyncHandle::failed(FetchError::not_found(key))
            }
        }

        fn fetch_many(&self, keys: &[u32]) -> AsyncHandle<Vec<Option<Tag>>> {
            self.batch.fetch_add(1, Ordering::SeqCst);
            let rows = keys
                .iter()
                .map(|&id| (id < 100).then_some(Tag { id }))
                .collect();
            AsyncHandle::ready(rows)
        }
    }

    #[tokio::test]
    async fn key_list_uses_one_batch_fetch() {
        let source = Arc::new(Tags::default());
        let mut list = DeferredList::<Tag>::from_keys(vec![1, 2, 3], source.clone());

        let values = list.values().await.unwrap();
        assert_eq!(
            values,
            &[Some(Tag { id: 1 }), Some(Tag { id: 2 }), Some(Tag { id: 3 })]
        );
        list.values().await.unwrap();
        assert_eq!(source.batch.load(Ordering::SeqCst), 1);
        assert_eq!(source.single.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn values_and_keys_stay_aligned() {
        let mut list = DeferredList::from_values(vec![Tag { id: 1 }, Tag { id: 2 }]);
        assert_eq!(list.keys().unwrap(), Some(&[1, 2][..]));
        assert_eq!(
            list.values().await.unwrap(),
            &[Some(Tag { id: 1 }), Some(Tag { id: 2 })]
        );
        assert_eq!(list.len(), Some(2));
    }

    #[tokio::test]
    async fn missing_records_keep_their_position() {
        let source = Arc::new(Tags::default());
        let mut list = DeferredList::<Tag>::from_keys(vec![5, 500, 6], source);
        let values = list.values().await.unwrap();
        assert_eq!(values, &[Some(Tag { id: 5 }), None, Some(Tag { id: 6 })]);
        assert_eq!(list.keys().unwrap(), Some(&[5, 500, 6][..]));
    }

    #[tokio::test]
    async fn handles_resolve_in_order() {
        let mut list = DeferredList::from(vec![
            AsyncHandle::ready(Tag { id: 8 }),
            AsyncHandle::ready(Tag { id: 9 }),
        ]);
        assert!(list.is_pending());
        assert_eq!(list.len(), None);
        list.values().await.unwrap();
        assert_eq!(list.keys().unwrap(), Some(&[8, 9][..]));
    }

    #[test]
    fn mixed_items_fail_before_fetching() {
        let source = Arc::new(Tags::default());
        let erased: Source<Tag> = source.clone();
        let items = vec![Resolvable::Key(1), Resolvable::Value(Tag { id: 2 })];
        let err = DeferredList::from_items(items, Some(erased)).unwrap_err();
        assert!(matches!(
            err,
            DeferError::TypeMismatch {
                expected: ResolvableKind::Key,
                found: ResolvableKind::Value,
                index: 1,
            }
        ));
        assert_eq!(source.batch.load(Ordering::SeqCst), 0);
        assert_eq!(source.single.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn homogeneous_items_build_each_mode() {
        let source: Source<Tag> = Arc::new(Tags::default());

        let mut keyed = DeferredList::from_items(
            vec![Resolvable::Key(1), Resolvable::Key(2)],
            Some(source.clone()),
        )
        .unwrap();
        assert_eq!(keyed.values().await.unwrap().len(), 2);

        let mut valued =
            DeferredList::from_items(vec![Resolvable::Value(Tag { id: 3 })], None).unwrap();
        assert!(valued.is_resolved());
        assert_eq!(valued.keys().unwrap(), Some(&[3][..]));

        let mut handled = DeferredList::from_items(
            vec![Resolvable::Handle(AsyncHandle::ready(Tag { id: 4 }))],
            None,
        )
        .unwrap();
        assert_eq!(handled.values().await.unwrap(), &[Some(Tag { id: 4 })]);

        let mut empty = DeferredList::<Tag>::from_items(Vec::new(), Some(source)).unwrap();
        assert!(empty.values().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_keys_refetches_and_set_values_clears_keys() {
        let source = Arc::new(Tags::default());
        let mut list = DeferredList::<Tag>::from_keys(vec![1], source.clone());
        list.values().await.unwrap();

        list.set_keys(vec![2, 3]);
        assert_eq!(list.values().await.unwrap().len(), 2);
        assert_eq!(source.batch.load(Ordering::SeqCst), 2);

        list.set_values(vec![Tag { id: 7 }]);
        assert_eq!(list.keys().unwrap(), Some(&[7][..]));
        assert!(list.handle().unwrap().is_none());
    }

    #[test]
    fn missing_identity_fails_key_derivation() {
        let mut list = DeferredList::<Tag>::from_batch(AsyncHandle::ready(vec![None]));
        // Unpolled handles are not promoted.
        assert_eq!(list.keys().unwrap(), None);
        list.state = ListState::Resolved(vec![None]);
        assert!(matches!(list.keys(), Err(DeferError::MissingIdentifier)));
    }
}
