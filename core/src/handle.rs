//! Eager, shareable async handles.
//!
//! An [`AsyncHandle`] is the unit of work produced by a fetch layer. It is started
//! on the tokio runtime as soon as it is created and can be cloned freely; every
//! clone observes the same single result, so awaiting a handle twice never repeats
//! the underlying work.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic;

use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture, Shared};

use lazyjoin_types::FetchError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

pub struct AsyncHandle<T> {
    inner: SharedResult<T>,
}

impl<T> Clone for AsyncHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> AsyncHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start `work` on the current tokio runtime and return a handle to its result.
    ///
    /// The work makes progress whether or not anyone awaits the handle. Must be
    /// called from within a runtime context.
    pub fn spawn<F>(work: F) -> Self
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let task = tokio::spawn(work);
        let joined = async move {
            match task.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
                Err(_) => Err(FetchError::Dropped),
            }
        };
        Self::from_future(joined)
    }

    /// A handle that has already completed with `value`.
    pub fn ready(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// A handle that has already failed with `err`.
    pub fn failed(err: FetchError) -> Self {
        Self::settled(Err(err))
    }

    /// Wait for every handle and collect the results in input order.
    ///
    /// `NotFound` failures become `None` at their position so the output stays
    /// index-aligned with `handles`. Any other failure fails the whole handle; the
    /// remaining inputs still run to completion.
    pub fn gather<I>(handles: I) -> AsyncHandle<Vec<Option<T>>>
    where
        I: IntoIterator<Item = AsyncHandle<T>>,
    {
        let waits: Vec<_> = handles.into_iter().map(|h| h.inner).collect();
        AsyncHandle::from_future(async move {
            let mut found = Vec::with_capacity(waits.len());
            let mut failure = None;
            for result in future::join_all(waits).await {
                match result {
                    Ok(value) => found.push(Some(value)),
                    Err(FetchError::NotFound { .. }) => found.push(None),
                    Err(err) => {
                        failure.get_or_insert(err);
                    }
                }
            }
            match failure {
                Some(err) => Err(err),
                None => Ok(found),
            }
        })
    }

    /// Whether the result is already available.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.peek().is_some()
    }

    /// The result, if the handle has completed and was observed by some poll.
    #[must_use]
    pub fn peek(&self) -> Option<&Result<T, FetchError>> {
        self.inner.peek()
    }

    /// Wait for completion, ignoring the value.
    ///
    /// Used by the trampoline to join handles of different value types together.
    pub(crate) fn completion(&self) -> BoxFuture<'static, Result<(), FetchError>> {
        self.inner.clone().map(|result| result.map(drop)).boxed()
    }

    /// Poll once so `peek` sees the result without an await.
    fn settled(result: Result<T, FetchError>) -> Self {
        let handle = Self::from_future(future::ready(result));
        let _ = handle.inner.clone().now_or_never();
        handle
    }

    fn from_future<F>(work: F) -> Self
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        Self {
            inner: work.boxed().shared(),
        }
    }
}

impl<T> IntoFuture for AsyncHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, FetchError>;
    type IntoFuture = SharedResult<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.inner
    }
}

impl<T> fmt::Debug for AsyncHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.peek() {
            None => "pending",
            Some(Ok(_)) => "ready",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("AsyncHandle").field("state", &state).finish()
    }
}
