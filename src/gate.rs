//! # Concurrency Gate
//!
//! Pure decision logic for optimistic concurrency. The writer asks the gate
//! twice per write:
//!
//! 1. Before inserting: does the expected-version precondition hold against
//!    the head read inside the write transaction?
//! 2. After a failed insert: was the failure a uniqueness violation (someone
//!    else claimed the version) or an ordinary store error?
//!
//! ```text
//!   head ──► check_append ──► insert ──► Ok
//!                │               │
//!                ▼               ▼
//!         WrongExpectedVersion ◄─ classify (unique violation)
//!                                 │
//!                                 └──► Sqlite (anything else, unchanged)
//! ```
//!
//! The gate never retries. Retry policy belongs to the caller.

use std::fmt;

use rusqlite::ffi;

use crate::error::{Error, Result};
use crate::types::{ExpectedVersion, StreamId, StreamRev};

/// The write being gated. Carried into the conflict error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Append,
    DeleteStream,
    UpdateSnapshot,
}

impl Operation {
    /// Human-readable name used in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Append => "append",
            Operation::DeleteStream => "delete stream",
            Operation::UpdateSnapshot => "update snapshot",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the conflict error.
pub fn conflict(
    stream_id: &StreamId,
    operation: Operation,
    expected: ExpectedVersion,
    actual: StreamRev,
) -> Error {
    Error::WrongExpectedVersion {
        stream_id: stream_id.to_string(),
        operation: operation.as_str(),
        expected,
        actual,
    }
}

/// Returns true if `head` satisfies the precondition.
pub fn precondition_holds(expected: ExpectedVersion, head: StreamRev) -> bool {
    match expected {
        ExpectedVersion::NoStream => head.is_none(),
        ExpectedVersion::Any => true,
        ExpectedVersion::Exact(version) => head == version,
    }
}

/// Gates an append whose first event claims `first_version`.
///
/// Besides the precondition, the first version must extend the head by
/// exactly one. Under `Any` this is the only check: a writer that read a
/// stale head loses here rather than leaving a gap.
pub fn check_append(
    stream_id: &StreamId,
    expected: ExpectedVersion,
    head: StreamRev,
    first_version: StreamRev,
) -> Result<()> {
    if !precondition_holds(expected, head) || first_version != head.next() {
        return Err(conflict(stream_id, Operation::Append, expected, head));
    }
    Ok(())
}

/// Gates a stream deletion. `Any` deletes unconditionally.
pub fn check_delete(stream_id: &StreamId, expected: ExpectedVersion, head: StreamRev) -> Result<()> {
    if !precondition_holds(expected, head) {
        return Err(conflict(stream_id, Operation::DeleteStream, expected, head));
    }
    Ok(())
}

/// Gates a snapshot upsert.
///
/// A snapshot may not run ahead of the stream head, and must be strictly newer
/// than the snapshot it replaces.
pub fn check_snapshot(
    stream_id: &StreamId,
    version: StreamRev,
    head: StreamRev,
    existing: Option<StreamRev>,
) -> Result<()> {
    let stale = existing.is_some_and(|current| version <= current);
    if version.is_none() || version > head || stale {
        return Err(conflict(
            stream_id,
            Operation::UpdateSnapshot,
            ExpectedVersion::Exact(version),
            head,
        ));
    }
    Ok(())
}

/// Returns true if the store rejected a row because a unique or primary key
/// constraint was already taken.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ffi::ErrorCode::ConstraintViolation
                && (e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// Maps a failed insert to the error the caller sees.
///
/// `head` is read after the failed savepoint is rolled back, so it reflects
/// whichever writer won.
pub fn classify(
    err: Error,
    stream_id: &StreamId,
    operation: Operation,
    expected: ExpectedVersion,
    head: impl FnOnce() -> StreamRev,
) -> Error {
    match &err {
        Error::Sqlite(inner) if is_unique_violation(inner) => {
            conflict(stream_id, operation, expected, head())
        }
        _ => err,
    }
}

// =============================================================================
// Tests
// =============================================================================
