//! # Error Handling for EventLine
//!
//! A single error enum ([`Error`]) covers every failure mode of the store, the
//! linearizer and the subscription fetch pipeline.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Conflict | `WrongExpectedVersion` | Reload the stream and retry |
//! | Decoding | `UnknownContract`, `Serialization`, `ConversionLoop` | Skip or halt the subscription |
//! | Deleted | `StreamDeleted` | Treat the position as consumed |
//! | Caller bug | `InvalidAppend`, `StreamNotLockable`, `PositionOutOfRange`, `SubscriptionNotFound` | Fix the caller |
//! | Internal | `Sqlite`, `Schema`, `Corruption` | Log and investigate |
//!
//! Conflicts are never retried by the store. Use [`Error::is_conflict`] to
//! build optimistic retry loops.

use thiserror::Error;

use crate::types::{ExpectedVersion, StreamRev};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in EventLine operations.
///
/// # Example
///
/// ```rust,ignore
/// loop {
///     let events = db.load("order-1", StreamRev::FIRST).await?;
///     let command = decide(&events)?;
///     match db.append(command).await {
///         Err(e) if e.is_conflict() => continue,
///         other => break other,
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conflict Errors (Client can retry with updated data)
    // =========================================================================

    /// The expected-version precondition did not hold when the write reached
    /// the store, or a concurrent writer claimed the same version first.
    ///
    /// # Recovery
    ///
    /// 1. Re-load the stream
    /// 2. Re-apply business logic
    /// 3. Retry with the new head as the expected version
    #[error(
        "wrong expected version on stream '{stream_id}' during {operation}: expected {expected}, found {actual}"
    )]
    WrongExpectedVersion {
        /// The stream where the conflict occurred.
        stream_id: String,
        /// Which operation was attempted ("append", "delete stream", ...).
        operation: &'static str,
        /// The precondition the caller supplied.
        expected: ExpectedVersion,
        /// The stream head observed when the conflict was detected.
        actual: StreamRev,
    },

    // =========================================================================
    // Decoding Errors (Per-event during fetch)
    // =========================================================================

    /// The contract registry has no type for this contract name.
    #[error("unknown contract '{contract_name}'")]
    UnknownContract {
        /// The unresolved contract name.
        contract_name: String,
    },

    /// A payload or metadata blob could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The up-converter chain revisited a contract or ran past its step bound.
    #[error("up-conversion of '{contract_name}' did not terminate after {steps} steps")]
    ConversionLoop {
        /// The contract name at which the loop was detected.
        contract_name: String,
        /// Number of conversions applied before giving up.
        steps: usize,
    },

    // =========================================================================
    // Caller Errors
    // =========================================================================

    /// The append command itself is malformed (empty, or versions not
    /// consecutive). Not a conflict: retrying cannot succeed.
    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// A locked load was requested on a stream created without the lockable
    /// flag.
    #[error("stream '{stream_id}' is not lockable")]
    StreamNotLockable {
        /// The stream that refused the lock.
        stream_id: String,
    },

    /// A checkpoint or position beyond what the store can address.
    #[error("position {0} is out of range")]
    PositionOutOfRange(u64),

    /// The fetched position belonged to a stream that has since been deleted.
    #[error("position {position} belonged to deleted stream '{stream_id}'")]
    StreamDeleted {
        /// The deleted stream.
        stream_id: String,
        /// The tombstoned position.
        position: u64,
    },

    /// No subscription with this id exists.
    #[error("subscription {0} not found")]
    SubscriptionNotFound(i64),

    // =========================================================================
    // Internal Errors (Investigate and fix)
    // =========================================================================

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema mismatch, or an internal actor/thread has gone away.
    #[error("schema error: {0}")]
    Schema(String),

    /// Stored data failed its integrity check.
    #[error("data corruption: {0}")]
    Corruption(String),
}

impl Error {
    /// Returns true for optimistic concurrency conflicts.
    ///
    /// Every other error is terminal for the operation that raised it.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::WrongExpectedVersion { .. })
    }

    /// Returns true for errors raised while turning a stored payload into an
    /// event. These only ever affect a single fetched row.
    pub fn is_decoding(&self) -> bool {
        matches!(
            self,
            Error::UnknownContract { .. } | Error::Serialization(_) | Error::ConversionLoop { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias for EventLine operations.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
