//! Error taxonomy for the sync engine.
//!
//! Guard errors belong to a single request and are returned to its caller.
//! Connection and breaker conditions describe ambient health and are surfaced
//! through status getters rather than propagated to arbitrary callers.

use std::time::Duration;

use thiserror::Error;

use crate::models::Table;

/// Outcome of a guarded operation that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError<E> {
    /// The operation exceeded its time budget.
    #[error("{message} (after {after:?})")]
    Timeout {
        key: Option<String>,
        after: Duration,
        message: String,
    },
    /// Cancelled explicitly or because the app was suspended.
    #[error("operation cancelled: {reason}")]
    Cancelled { key: Option<String>, reason: String },
    /// The wrapped operation failed; its error is passed through unchanged.
    #[error("{0}")]
    Upstream(E),
}

impl<E> GuardError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GuardError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GuardError::Cancelled { .. })
    }

    pub fn upstream(&self) -> Option<&E> {
        match self {
            GuardError::Upstream(e) => Some(e),
            _ => None,
        }
    }
}

/// Failures reported by a push-channel transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscribe to {table} failed: {reason}")]
    Subscribe { table: Table, reason: String },
    #[error("transport closed")]
    Closed,
}

/// Failures reported by the reactive query cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("fetch for {key} failed: {reason}")]
    Fetch { key: String, reason: String },
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Connection-, recovery- and stream-level conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("client recreation rate limited, retry in {retry_in:?}")]
    RecreateRateLimited { retry_in: Duration },
    #[error("circuit breaker open, retry in {retry_in:?}")]
    BreakerOpen { retry_in: Duration },
    #[error("subscription to {table} failed: {reason}")]
    SubscriptionFailed { table: Table, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("guarded operation failed: {0}")]
    Guard(String),
    #[error("invalidation map has no rules for: {}", .missing.join(", "))]
    IncompleteInvalidationMap { missing: Vec<String> },
}

impl<E: std::fmt::Display> From<GuardError<E>> for SyncError {
    fn from(err: GuardError<E>) -> Self {
        SyncError::Guard(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_displays_unchanged() {
        let err: GuardError<TransportError> = GuardError::Upstream(TransportError::Closed);
        assert_eq!(err.to_string(), "transport closed");
        assert_eq!(err.upstream(), Some(&TransportError::Closed));
    }

    #[test]
    fn test_incomplete_map_lists_missing_pairs() {
        let err = SyncError::IncompleteInvalidationMap {
            missing: vec!["posts:INSERT".into(), "likes:DELETE".into()],
        };
        assert_eq!(
            err.to_string(),
            "invalidation map has no rules for: posts:INSERT, likes:DELETE"
        );
    }
}
