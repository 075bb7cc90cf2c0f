//! Relationship fields for persisted records.
//!
//! A record that references other records stores a [`RelationField`] (or a
//! [`RelationListField`] for repeated references). Assignments of a key, a handle,
//! a resolved record or an existing deferred value are all normalized into a
//! deferred value bound to the field's source. Serialization writes the key view.

use std::fmt;

use serde::ser::{Error as _, Serialize, Serializer};

use lazyjoin_types::{DeferError, Identify};

use crate::deferred::{Deferred, Resolvable};
use crate::fetch::Source;
use crate::handle::AsyncHandle;
use crate::list::DeferredList;
use crate::trampoline::Scope;

/// Single relationship to another record.
#[derive(Clone)]
pub struct RelationField<T: Identify> {
    source: Source<T>,
    deferred: Option<Deferred<T>>,
}

impl<T: Identify> RelationField<T> {
    pub fn new(source: Source<T>) -> Self {
        Self {
            source,
            deferred: None,
        }
    }

    pub fn with_key(source: Source<T>, key: T::Key) -> Self {
        let deferred = Deferred::from_key(key, source.clone());
        Self {
            source,
            deferred: Some(deferred),
        }
    }

    /// Assign a handle or an existing deferred value.
    pub fn assign(&mut self, item: impl Into<Deferred<T>>) {
        let deferred = item.into();
        let deferred = if deferred.is_bound() {
            deferred
        } else {
            deferred.bind(self.source.clone())
        };
        self.deferred = Some(deferred);
    }

    pub fn assign_key(&mut self, key: T::Key) {
        self.deferred = Some(Deferred::from_key(key, self.source.clone()));
    }

    pub fn assign_value(&mut self, value: T) {
        self.assign(Deferred::from_value(value));
    }

    pub fn assign_handle(&mut self, handle: AsyncHandle<T>) {
        self.assign(handle);
    }

    pub fn assign_resolvable(&mut self, item: Resolvable<T>) {
        self.deferred = Some(Deferred::from_resolvable(item, Some(self.source.clone())));
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.deferred.is_some()
    }

    #[must_use]
    pub fn get(&self) -> Option<&Deferred<T>> {
        self.deferred.as_ref()
    }

    /// The deferred value, failing with `EmptyDeferred` when unassigned.
    pub fn deferred_mut(&mut self) -> Result<&mut Deferred<T>, DeferError> {
        self.deferred.as_mut().ok_or(DeferError::EmptyDeferred)
    }

    /// Hand this field to a running trampoline without replacing it.
    pub fn defer_in(&mut self, scope: &Scope) -> Result<(), DeferError> {
        scope.harvest(self.deferred_mut()?)
    }

    /// The key written to storage.
    pub fn stored_key(&self) -> Result<T::Key, DeferError> {
        self.deferred
            .as_ref()
            .ok_or(DeferError::EmptyDeferred)?
            .stored_key()?
            .ok_or(DeferError::EmptyDeferred)
    }

    /// Key to compare against in an equality filter on this field.
    pub fn filter_key(value: impl Into<Deferred<T>>) -> Result<T::Key, DeferError> {
        value
            .into()
            .stored_key()?
            .ok_or(DeferError::EmptyDeferred)
    }
}

impl<T: Identify + fmt::Debug> fmt::Debug for RelationField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RelationField").field(&self.deferred).finish()
    }
}

/// Repeated relationship to other records.
#[derive(Clone)]
pub struct RelationListField<T: Identify> {
    source: Source<T>,
    list: Option<DeferredList<T>>,
}

impl<T: Identify> RelationListField<T> {
    pub fn new(source: Source<T>) -> Self {
        Self { source, list: None }
    }

    pub fn with_keys(source: Source<T>, keys: Vec<T::Key>) -> Self {
        let list = DeferredList::from_keys(keys, source.clone());
        Self {
            source,
            list: Some(list),
        }
    }

    pub fn assign(&mut self, items: impl Into<DeferredList<T>>) {
        self.list = Some(items.into().bind(self.source.clone()));
    }

    pub fn assign_keys(&mut self, keys: Vec<T::Key>) {
        self.list = Some(DeferredList::from_keys(keys, self.source.clone()));
    }

    pub fn assign_values(&mut self, values: Vec<T>) {
        self.assign(DeferredList::from_values(values));
    }

    /// Assign resolvables of a single kind; mixed kinds are rejected.
    pub fn assign_items(&mut self, items: Vec<Resolvable<T>>) -> Result<(), DeferError> {
        self.list = Some(DeferredList::from_items(items, Some(self.source.clone()))?);
        Ok(())
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.list.is_some()
    }

    #[must_use]
    pub fn get(&self) -> Option<&DeferredList<T>> {
        self.list.as_ref()
    }

    pub fn list_mut(&mut self) -> Result<&mut DeferredList<T>, DeferError> {
        self.list.as_mut().ok_or(DeferError::EmptyDeferred)
    }

    pub fn defer_in(&mut self, scope: &Scope) -> Result<(), DeferError> {
        scope.harvest_list(self.list_mut()?)
    }

    /// Keys written to storage. An unassigned list stores no keys.
    pub fn stored_keys(&self) -> Result<Vec<T::Key>, DeferError> {
        match &self.list {
            None => Ok(Vec::new()),
            Some(list) => list.stored_keys()?.ok_or(DeferError::EmptyDeferred),
        }
    }
}

impl<T: Identify + fmt::Debug> fmt::Debug for RelationListField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RelationListField").field(&self.list).finish()
    }
}

// ============================================================================
// Serialization: the key view is what gets stored
// ============================================================================

impl<T> Serialize for Deferred<T>
where
    T: Identify,
    T::Key: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let key = self
            .stored_key()
            .and_then(|key| key.ok_or(DeferError::EmptyDeferred))
            .map_err(S::Error::custom)?;
        key.serialize(serializer)
    }
}

impl<T> Serialize for DeferredList<T>
where
    T: Identify,
    T::Key: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let keys = self
            .stored_keys()
            .and_then(|keys| keys.ok_or(DeferError::EmptyDeferred))
            .map_err(S::Error::custom)?;
        keys.serialize(serializer)
    }
}

impl<T> Serialize for RelationField<T>
where
    T: Identify,
    T::Key: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.stored_key()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<T> Serialize for RelationListField<T>
where
    T: Identify,
    T::Key: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.stored_keys()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}
