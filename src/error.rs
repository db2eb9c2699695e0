//! Error types for metadata queries
//!
//! Errors fall into two families that callers must be able to tell apart:
//!
//! - **Client input**: malformed temporal literals, filter syntax, or range
//!   envelopes. These are returned before anything is dispatched.
//! - **Cluster health**: shard failures, deadlines and cancellation. These are
//!   carried by [`DispatchError`] inside an aggregate outcome.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Temporal text matched no literal rule
    #[error("Invalid instant literal: {0:?}")]
    InvalidInstantLiteral(String),

    /// Query tokens could not be parsed into a filter
    #[error("Invalid filter syntax{}: {message}", at_position(.position))]
    InvalidFilterSyntax {
        /// Parser message
        message: String,
        /// Byte offset into the space-joined query, when known
        position: Option<usize>,
    },

    /// Range filter envelope violated its invariants
    #[error("Invalid range filter: {0}")]
    InvalidRangeFilter(String),

    /// Cluster dispatch failed
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// A result of the wrong operation kind was produced
    #[error("Unexpected result: expected {expected}, got {actual}")]
    UnexpectedResult {
        /// Operation whose result was expected
        expected: &'static str,
        /// Operation whose result was received
        actual: &'static str,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a filter syntax error
    pub fn filter_syntax(message: impl Into<String>, position: Option<usize>) -> Self {
        Error::InvalidFilterSyntax {
            message: message.into(),
            position,
        }
    }

    /// True for errors caused by caller input rather than cluster health
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInstantLiteral(_)
                | Error::InvalidFilterSyntax { .. }
                | Error::InvalidRangeFilter(_)
        )
    }
}

fn at_position(position: &Option<usize>) -> String {
    position.map(|p| format!(" at {}", p)).unwrap_or_default()
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a single shard
///
/// Cloneable so that one failure can be delivered to every waiter attached
/// to a deduplicated request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// Shard could not be reached
    #[error("shard unavailable: {0}")]
    Unavailable(String),

    /// Shard refused the request
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Shard failed while serving the request
    #[error("internal shard error: {0}")]
    Internal(String),
}

/// Failure of an aggregated cluster dispatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A shard failed and the aggregate was not allowed to degrade
    #[error("shard {shard} failed: {source}")]
    ShardFailure {
        /// Identifier of the failing shard
        shard: String,
        /// Shard-level failure
        #[source]
        source: ShardError,
    },

    /// The aggregate did not settle before its deadline
    #[error("dispatch timed out after {deadline:?}")]
    Timeout {
        /// Deadline that was exceeded
        deadline: Duration,
    },

    /// The aggregate was cancelled by its caller
    #[error("dispatch cancelled")]
    Cancelled,

    /// The target group has no shards
    #[error("cluster group {0:?} has no shards")]
    EmptyGroup(String),

    /// No group with this name is configured
    #[error("unknown cluster group {0:?}")]
    UnknownGroup(String),
}
