//! The eager-fire / lazy-join trampoline.
//!
//! A routine wrapped with [`lazy`] (or [`Trampoline::wrap`]) receives a [`Scope`]
//! and is written as ordinary straight-line async code. Every [`Scope::defer`]
//! call is a suspension point: the item is wrapped as a deferred value, its
//! pending handle is harvested, and the deferred value goes straight back to the
//! routine without waiting. Work requested in one loop iteration is therefore in
//! flight while the next iteration is still issuing requests.
//!
//! ```text
//! call ─> spawn run ─> routine ──defer──> harvest handle ─┐
//!                        ^                                │
//!                        └──────── Deferred<T> ───────────┘
//!                      routine done ─> join all harvested ─> terminal result
//! ```
//!
//! Harvested handles are joined only after the routine finishes. The joined wait
//! drains every handle; under the default [`JoinPolicy`] only the first failure
//! observed is reported.

use std::future::Future;
use std::panic;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::future::{self, BoxFuture};
use futures_util::{FutureExt, StreamExt};
use futures_util::stream::FuturesUnordered;
use tokio::task::JoinHandle;
use tracing::Instrument;

use lazyjoin_types::{DeferError, FetchError, Identify, JoinPolicy};

use crate::config::LazyConfig;
use crate::deferred::{Deferred, Resolvable};
use crate::fetch::Source;
use crate::list::DeferredList;

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HarvestKind {
    Single,
    Batch,
}

impl HarvestKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Batch => "batch",
        }
    }
}

struct Harvested {
    index: usize,
    kind: HarvestKind,
    completion: BoxFuture<'static, Result<(), FetchError>>,
}

#[derive(Default)]
struct Pending {
    items: Vec<Harvested>,
    closed: bool,
}

/// Per-invocation run state shared by a scope and its task.
///
/// Closed once the routine has returned and its handles were taken for the
/// join; later pushes are rejected.
struct RunState {
    id: u64,
    pending: Mutex<Pending>,
    harvested: AtomicUsize,
}

impl RunState {
    fn new() -> Self {
        Self {
            id: NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed),
            pending: Mutex::new(Pending::default()),
            harvested: AtomicUsize::new(0),
        }
    }

    fn push(
        &self,
        kind: HarvestKind,
        completion: BoxFuture<'static, Result<(), FetchError>>,
    ) -> Result<(), DeferError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.closed {
            tracing::debug!(run = self.id, kind = kind.as_str(), "Rejected late harvest");
            return Err(DeferError::ScopeClosed);
        }
        let index = pending.items.len();
        tracing::debug!(run = self.id, index, kind = kind.as_str(), "Harvested handle");
        pending.items.push(Harvested {
            index,
            kind,
            completion,
        });
        self.harvested.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DeferError> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.closed {
            return Err(DeferError::ScopeClosed);
        }
        Ok(())
    }

    /// Take every harvested handle and refuse new ones.
    fn close(&self) -> Vec<Harvested> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.closed = true;
        std::mem::take(&mut pending.items)
    }
}

/// Handle a running routine uses to hand over resolvables.
///
/// Each invocation of a wrapped routine gets its own scope; scopes from separate
/// invocations never share harvested handles. A scope outliving its routine, such
/// as a clone moved into a detached task, fails with `ScopeClosed`.
#[derive(Clone)]
pub struct Scope {
    run: Arc<RunState>,
}

impl Scope {
    /// Wrap `item`, harvest its pending handle, and hand the placeholder back.
    ///
    /// Accepts an [`AsyncHandle`](crate::AsyncHandle) or an existing [`Deferred`], which is reused
    /// unchanged. Never waits for the handle.
    pub fn defer<T: Identify>(
        &self,
        item: impl Into<Deferred<T>>,
    ) -> Result<Deferred<T>, DeferError> {
        let mut deferred = item.into();
        self.harvest(&mut deferred)?;
        Ok(deferred)
    }

    /// Wrap a single resolvable. Keys are fetched through `source`.
    pub fn defer_item<T: Identify>(
        &self,
        item: Resolvable<T>,
        source: Option<Source<T>>,
    ) -> Result<Deferred<T>, DeferError> {
        self.defer(Deferred::from_resolvable(item, source))
    }

    /// List counterpart of [`Scope::defer`]. A keyed list costs one `fetch_many`.
    pub fn defer_list<T: Identify>(
        &self,
        items: impl Into<DeferredList<T>>,
    ) -> Result<DeferredList<T>, DeferError> {
        let mut list = items.into();
        self.harvest_list(&mut list)?;
        Ok(list)
    }

    /// Wrap an ordered list of resolvables of one kind.
    ///
    /// Mixed kinds fail with `TypeMismatch` before anything is fetched or harvested.
    pub fn defer_items<T: Identify>(
        &self,
        items: Vec<Resolvable<T>>,
        source: Option<Source<T>>,
    ) -> Result<DeferredList<T>, DeferError> {
        self.defer_list(DeferredList::from_items(items, source)?)
    }

    /// Harvest each of several existing deferred values, returned unchanged.
    ///
    /// Resolved elements need no wait; the pending ones are joined as a single
    /// batch entry. Handles started before a failing element are still joined.
    pub fn defer_each<T: Identify>(
        &self,
        mut items: Vec<Deferred<T>>,
    ) -> Result<Vec<Deferred<T>>, DeferError> {
        self.run.ensure_open()?;
        let mut completions = Vec::new();
        let mut failure = None;
        for item in &mut items {
            match item.handle() {
                Ok(Some(handle)) => completions.push(handle.completion()),
                Ok(None) => {}
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if !completions.is_empty() {
            let joined = future::join_all(completions)
                .map(|results| results.into_iter().collect::<Result<(), FetchError>>())
                .boxed();
            self.run.push(HarvestKind::Batch, joined)?;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(items),
        }
    }

    /// Harvest a deferred value in place, such as a field already on a record.
    pub fn harvest<T: Identify>(&self, deferred: &mut Deferred<T>) -> Result<(), DeferError> {
        self.run.ensure_open()?;
        if let Some(handle) = deferred.handle()? {
            self.run.push(HarvestKind::Single, handle.completion())?;
        }
        Ok(())
    }

    pub fn harvest_list<T: Identify>(
        &self,
        list: &mut DeferredList<T>,
    ) -> Result<(), DeferError> {
        self.run.ensure_open()?;
        if let Some(handle) = list.handle()? {
            self.run.push(HarvestKind::Batch, handle.completion())?;
        }
        Ok(())
    }

    /// Handles harvested so far in this run.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.run.harvested.load(Ordering::Relaxed)
    }
}

/// Combined handle for one run of a wrapped routine.
///
/// Resolves once the routine has finished and every harvested handle has
/// completed, yielding the routine's own result or error.
#[must_use = "the routine's result is only observable by awaiting the task"]
pub struct LazyTask<O, E> {
    task: JoinHandle<Result<O, E>>,
    run: Arc<RunState>,
}

impl<O, E> LazyTask<O, E> {
    /// Handles harvested by the routine so far.
    #[must_use]
    pub fn harvested(&self) -> usize {
        self.run.harvested.load(Ordering::Relaxed)
    }
}

impl<O, E> Future for LazyTask<O, E>
where
    E: From<DeferError>,
{
    type Output = Result<O, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(err)) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(DeferError::Fetch(FetchError::Dropped).into()))
            }
        }
    }
}

/// Drives routines and joins what they harvest.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trampoline {
    policy: JoinPolicy,
}

impl Trampoline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: &LazyConfig) -> Self {
        Self {
            policy: config.join.policy,
        }
    }

    #[must_use]
    pub const fn with_policy(policy: JoinPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn policy(&self) -> JoinPolicy {
        self.policy
    }

    /// Run `body` once with a fresh scope.
    ///
    /// `body` is invoked immediately; the future it returns is spawned on the
    /// current tokio runtime, so requests start before the task is awaited.
    pub fn run<F, Fut, O, E>(&self, body: F) -> LazyTask<O, E>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        O: Send + 'static,
        E: From<DeferError> + Send + 'static,
    {
        let run = Arc::new(RunState::new());
        let scope = Scope {
            run: Arc::clone(&run),
        };
        let routine = body(scope);
        let policy = self.policy;
        let state = Arc::clone(&run);
        let span = tracing::debug_span!("lazy_run", run = run.id);

        let task = tokio::spawn(
            async move {
                let outcome = routine.await;
                let harvested = state.close();
                tracing::debug!(
                    pending = harvested.len(),
                    ok = outcome.is_ok(),
                    "Routine finished, joining harvested handles"
                );
                join_harvested(harvested, policy).await?;
                outcome
            }
            .instrument(span),
        );

        LazyTask { task, run }
    }

    /// Turn `routine` into a callable that runs it through this trampoline.
    ///
    /// Each call gets its own scope and its own combined handle.
    pub fn wrap<A, F, Fut, O, E>(self, routine: F) -> impl Fn(A) -> LazyTask<O, E>
    where
        F: Fn(Scope, A) -> Fut,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        O: Send + 'static,
        E: From<DeferError> + Send + 'static,
    {
        move |args| self.run(|scope| routine(scope, args))
    }
}

/// Wrap `routine` with the default join policy.
pub fn lazy<A, F, Fut, O, E>(routine: F) -> impl Fn(A) -> LazyTask<O, E>
where
    F: Fn(Scope, A) -> Fut,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    O: Send + 'static,
    E: From<DeferError> + Send + 'static,
{
    Trampoline::default().wrap(routine)
}

/// Wait for every harvested handle, in whatever order they complete.
async fn join_harvested(harvested: Vec<Harvested>, policy: JoinPolicy) -> Result<(), DeferError> {
    if harvested.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    let total = harvested.len();
    let mut waits: FuturesUnordered<_> = harvested
        .into_iter()
        .map(|h| async move { (h.index, h.kind, h.completion.await) })
        .collect();

    let mut failures = Vec::new();
    while let Some((index, kind, result)) = waits.next().await {
        if let Err(err) = result {
            tracing::debug!(
                index,
                kind = kind.as_str(),
                error = %err,
                "Harvested handle failed"
            );
            failures.push(err);
        }
    }

    tracing::debug!(
        pending = total,
        failed = failures.len(),
        elapsed_ms = started.elapsed().as_millis(),
        "Joined harvested handles"
    );

    match policy {
        JoinPolicy::FirstError => match failures.into_iter().next() {
            Some(err) => Err(DeferError::Fetch(err)),
            None => Ok(()),
        },
        JoinPolicy::CollectAll => match failures.len() {
            0 => Ok(()),
            1 => Err(DeferError::Fetch(failures.remove(0))),
            _ => Err(DeferError::Joined(failures)),
        },
    }
}
