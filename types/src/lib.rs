//! Core domain types for lazyjoin.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! The async machinery in `lazyjoin-core` and the fetch layers built on it share
//! these definitions.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod error;
mod policy;

pub use error::{DeferError, FetchError, ResolvableKind};
pub use policy::JoinPolicy;

use std::convert::Infallible;
use std::fmt::Debug;

// ============================================================================
// Record identity
// ============================================================================

/// A value that may carry an identifier usable as a fetch key.
///
/// Records loaded from a store return `Some(key)`. Aggregates such as counts
/// have no identity and return `None`, which surfaces as
/// [`DeferError::MissingIdentifier`] when a key view is requested.
pub trait Identify: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Debug + Send + Sync + 'static;

    fn identify(&self) -> Option<Self::Key>;
}

macro_rules! anonymous_identify {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Identify for $ty {
                type Key = Infallible;

                fn identify(&self) -> Option<Self::Key> {
                    None
                }
            }
        )*
    };
}

anonymous_identify!(u32, u64, usize, i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Named {
        id: Option<u32>,
    }

    impl Identify for Named {
        type Key = u32;

        fn identify(&self) -> Option<u32> {
            self.id
        }
    }

    #[test]
    fn counts_have_no_identity() {
        assert!(42_u64.identify().is_none());
        assert!(7_usize.identify().is_none());
    }

    #[test]
    fn records_report_their_key() {
        assert_eq!(Named { id: Some(3) }.identify(), Some(3));
        assert_eq!(Named { id: None }.identify(), None);
    }
}
