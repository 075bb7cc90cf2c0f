use std::fmt;

use thiserror::Error;

/// Error surfaced by a fetch layer while producing or completing a handle.
///
/// Cloneable because a single failed handle may be observed by the trampoline's
/// combined wait and by every later `value` read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("no record found for key {key}")]
    NotFound { key: String },
    #[error("fetch backend error: {message}")]
    Backend { message: String },
    #[error("fetch task dropped before completing")]
    Dropped,
}

impl FetchError {
    pub fn not_found(key: &impl fmt::Debug) -> Self {
        Self::NotFound {
            key: format!("{key:?}"),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// The shape of a single resolvable input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvableKind {
    Key,
    Handle,
    Value,
}

impl ResolvableKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Handle => "handle",
            Self::Value => "value",
        }
    }
}

impl fmt::Display for ResolvableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by deferred values and the trampoline.
#[derive(Debug, Error)]
pub enum DeferError {
    /// A list mixed keys, handles and values.
    #[error("mixed resolvable list: expected {expected} at index {index}, found {found}")]
    TypeMismatch {
        expected: ResolvableKind,
        found: ResolvableKind,
        index: usize,
    },
    /// A resolved record has no identifier to derive a key from.
    #[error("resolved record has no identifier")]
    MissingIdentifier,
    /// No key, handle or value has been set.
    #[error("deferred value has no key, handle, or value")]
    EmptyDeferred,
    /// A key must be fetched but no fetch source was bound.
    #[error("deferred value holds a key but no fetch source is bound")]
    Unbound,
    /// A scope was used after its routine returned and its handles were joined.
    #[error("scope used after its routine returned")]
    ScopeClosed,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Every failure observed by a combined wait under `JoinPolicy::CollectAll`.
    #[error("{} harvested handles failed, first: {}", .0.len(), first_message(.0))]
    Joined(Vec<FetchError>),
    /// Terminal error signaled by a driven coroutine.
    #[error("coroutine failed: {0}")]
    Coroutine(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DeferError {
    pub fn coroutine(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Coroutine(err.into())
    }

    /// Fetch failures carried by this error, in observation order.
    #[must_use]
    pub fn fetch_failures(&self) -> &[FetchError] {
        match self {
            Self::Fetch(err) => std::slice::from_ref(err),
            Self::Joined(errs) => errs,
            _ => &[],
        }
    }
}

fn first_message(errs: &[FetchError]) -> String {
    errs.first().map(ToString::to_string).unwrap_or_default()
}
