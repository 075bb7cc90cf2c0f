//! The single-record deferred value.
//!
//! A [`Deferred`] starts from whichever of key, handle or value the caller has at
//! hand and advances on demand:
//!
//! ```text
//! Key ──handle()──> Pending ──value().await──> Resolved
//!  ^                                               │
//!  └──────────────────── key() ────────────────────┘
//! ```
//!
//! Reads are idempotent: the fetch for a key is started at most once, and every
//! later read observes the same pending handle or cached value.

use std::fmt;

use lazyjoin_types::{DeferError, FetchError, Identify, ResolvableKind};

use crate::fetch::Source;
use crate::handle::AsyncHandle;

/// A single input that can become a deferred value.
pub enum Resolvable<T: Identify> {
    Key(T::Key),
    Handle(AsyncHandle<T>),
    Value(T),
}

impl<T: Identify> Resolvable<T> {
    #[must_use]
    pub const fn kind(&self) -> ResolvableKind {
        match self {
            Self::Key(_) => ResolvableKind::Key,
            Self::Handle(_) => ResolvableKind::Handle,
            Self::Value(_) => ResolvableKind::Value,
        }
    }
}

impl<T: Identify> From<AsyncHandle<T>> for Resolvable<T> {
    fn from(handle: AsyncHandle<T>) -> Self {
        Self::Handle(handle)
    }
}

impl<T: Identify + fmt::Debug> fmt::Debug for Resolvable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Self::Handle(handle) => f.debug_tuple("Handle").field(handle).finish(),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

#[derive(Clone)]
enum State<T> {
    Unset,
    Pending(AsyncHandle<T>),
    Resolved(T),
}

/// Lazy box over a key, a pending handle, or a resolved value.
///
/// The key is cached alongside the other states once known, so a key-built
/// deferred keeps reporting its key after it resolves.
#[derive(Clone)]
pub struct Deferred<T: Identify> {
    key: Option<T::Key>,
    state: State<T>,
    source: Option<Source<T>>,
}

impl<T: Identify> Deferred<T> {
    pub fn from_key(key: T::Key, source: Source<T>) -> Self {
        Self {
            key: Some(key),
            state: State::Unset,
            source: Some(source),
        }
    }

    pub fn from_handle(handle: AsyncHandle<T>) -> Self {
        Self {
            key: None,
            state: State::Pending(handle),
            source: None,
        }
    }

    pub fn from_value(value: T) -> Self {
        Self {
            key: None,
            state: State::Resolved(value),
            source: None,
        }
    }

    /// Build from any single resolvable. Keys need `source` to be fetched later.
    pub fn from_resolvable(item: Resolvable<T>, source: Option<Source<T>>) -> Self {
        let deferred = match item {
            Resolvable::Key(key) => Self {
                key: Some(key),
                state: State::Unset,
                source: None,
            },
            Resolvable::Handle(handle) => Self::from_handle(handle),
            Resolvable::Value(value) => Self::from_value(value),
        };
        Self { source, ..deferred }
    }

    /// Attach the fetch capability used to turn a key into a handle.
    #[must_use]
    pub fn bind(mut self, source: Source<T>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.source.is_some()
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self.state, State::Resolved(_))
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.state, State::Pending(_))
    }

    /// True when no key, handle or value is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key.is_none() && matches!(self.state, State::Unset)
    }

    /// The key view.
    ///
    /// Returns the stored key, or derives and caches it from the resolved value.
    /// A pending handle that has already completed is promoted first; nothing
    /// here waits. `Ok(None)` means no key is available yet.
    pub fn key(&mut self) -> Result<Option<&T::Key>, DeferError> {
        if self.key.is_none() {
            self.promote_ready()?;
            if let State::Resolved(value) = &self.state {
                let key = value.identify().ok_or(DeferError::MissingIdentifier)?;
                self.key = Some(key);
            }
        }
        Ok(self.key.as_ref())
    }

    /// The key view, failing with `EmptyDeferred` when none is available.
    pub fn require_key(&mut self) -> Result<&T::Key, DeferError> {
        self.key()?.ok_or(DeferError::EmptyDeferred)
    }

    /// Key derivable without mutation, for serialization and filtering.
    pub fn stored_key(&self) -> Result<Option<T::Key>, DeferError> {
        if let Some(key) = &self.key {
            return Ok(Some(key.clone()));
        }
        let value = match &self.state {
            State::Resolved(value) => value,
            State::Pending(handle) => match handle.peek() {
                Some(Ok(value)) => value,
                Some(Err(err)) => return Err(err.clone().into()),
                None => return Ok(None),
            },
            State::Unset => return Ok(None),
        };
        value
            .identify()
            .map(Some)
            .ok_or(DeferError::MissingIdentifier)
    }

    /// Replace the key. Any pending handle or resolved value is dropped.
    pub fn set_key(&mut self, key: T::Key) {
        self.key = Some(key);
        self.state = State::Unset;
    }

    /// The value view.
    ///
    /// Waits for the pending handle, starting the fetch from the key first if
    /// needed. Fetch failures are returned unchanged; a failed handle stays in
    /// place, so reading again reports the same failure without refetching.
    pub async fn value(&mut self) -> Result<&T, DeferError> {
        if matches!(self.state, State::Unset) {
            self.start_fetch()?;
        }
        if let State::Pending(handle) = &self.state {
            let handle = handle.clone();
            let value = handle.await?;
            self.state = State::Resolved(value);
        }
        match &self.state {
            State::Resolved(value) => Ok(value),
            State::Unset | State::Pending(_) => Err(DeferError::EmptyDeferred),
        }
    }

    /// The value if it is available without waiting.
    pub fn try_value(&mut self) -> Result<Option<&T>, DeferError> {
        self.promote_ready()?;
        match &self.state {
            State::Resolved(value) => Ok(Some(value)),
            State::Unset | State::Pending(_) => Ok(None),
        }
    }

    /// Replace the value. Any key or pending handle is dropped.
    pub fn set_value(&mut self, value: T) {
        self.key = None;
        self.state = State::Resolved(value);
    }

    /// The pending handle, starting the fetch from the key if needed.
    ///
    /// Returns `None` once resolved. Never waits.
    pub fn handle(&mut self) -> Result<Option<AsyncHandle<T>>, DeferError> {
        if matches!(self.state, State::Unset) {
            self.start_fetch()?;
        }
        match &self.state {
            State::Pending(handle) => Ok(Some(handle.clone())),
            State::Unset | State::Resolved(_) => Ok(None),
        }
    }

    fn start_fetch(&mut self) -> Result<(), DeferError> {
        let key = self.key.as_ref().ok_or(DeferError::EmptyDeferred)?;
        let source = self.source.as_ref().ok_or(DeferError::Unbound)?;
        tracing::debug!(key = ?key, "Starting fetch for deferred key");
        self.state = State::Pending(source.fetch_one(key));
        Ok(())
    }

    fn promote_ready(&mut self) -> Result<(), FetchError> {
        if let State::Pending(handle) = &self.state
            && let Some(result) = handle.peek()
        {
            let value = result.clone()?;
            self.state = State::Resolved(value);
        }
        Ok(())
    }
}

impl<T: Identify> From<AsyncHandle<T>> for Deferred<T> {
    fn from(handle: AsyncHandle<T>) -> Self {
        Self::from_handle(handle)
    }
}

impl<T: Identify + fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Deferred");
        out.field("key", &self.key);
        match &self.state {
            State::Unset => out.field("state", &"unset"),
            State::Pending(handle) => out.field("state", handle),
            State::Resolved(value) => out.field("value", value),
        };
        out.field("bound", &self.source.is_some()).finish()
    }
}
