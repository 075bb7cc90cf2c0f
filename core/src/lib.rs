//! Deferred values and the eager-fire / lazy-join trampoline.
//!
//! # Architecture
//!
//! ```text
//! Fetch / Count (injected)            Trampoline
//!        │                                │ spawns one task per call
//!        v                                v
//!   AsyncHandle<T> <── handle() ── Deferred<T> / DeferredList<T> <── Scope::defer
//!        │                                                              │
//!        └──────────────── harvested, joined after the routine ─────────┘
//! ```
//!
//! - [`AsyncHandle`]: eager, cloneable result of a fetch.
//! - [`Deferred`] / [`DeferredList`]: key, handle or value, promoted on demand.
//! - [`lazy`] / [`Trampoline`]: run a routine, hand it placeholders instead of
//!   blocking, join everything it requested once it returns.
//! - [`RelationField`] / [`RelationListField`]: record fields that store deferred
//!   relationships and serialize their keys.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::len_without_is_empty)] // DeferredList::len is only known for some states

mod config;
mod deferred;
mod fetch;
mod field;
mod handle;
mod list;
mod trampoline;

pub use config::{ConfigError, JoinConfig, LazyConfig, load_toml};
pub use deferred::{Deferred, Resolvable};
pub use fetch::{Count, Fetch, Source};
pub use field::{RelationField, RelationListField};
pub use handle::AsyncHandle;
pub use list::DeferredList;
pub use trampoline::{LazyTask, Scope, Trampoline, lazy};

pub use lazyjoin_types::{DeferError, FetchError, Identify, JoinPolicy, ResolvableKind};
