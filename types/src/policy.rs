use serde::Deserialize;

/// How a combined wait reports failed handles.
///
/// Every harvested handle is always driven to completion; the policy only
/// decides what the caller sees.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Report the first failure observed, in completion order.
    #[default]
    FirstError,
    /// Report every failure.
    CollectAll,
}

impl JoinPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FirstError => "first_error",
            Self::CollectAll => "collect_all",
        }
    }
}
