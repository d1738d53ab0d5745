//! # Domain Types for EventLine
//!
//! Newtypes for identifiers and positions, plus the command and record types
//! that flow through the store.
//!
//! ## Two Orders
//!
//! Every event lives in two orders at once:
//!
//! - [`StreamRev`]: position within a single stream. Assigned by the writer
//!   at append time, starts at 1, never has gaps.
//! - [`GlobalPos`]: position in the single total order across all streams.
//!   Assigned later by the linearizer, starts at 1, never reused.
//!
//! An event may exist for a while with a `StreamRev` but no `GlobalPos` yet.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::current_time_ms;

// =============================================================================
// Stream Identification
// =============================================================================

/// Identifier of an event stream (one aggregate instance).
///
/// # Example
///
/// ```rust
/// use eventline::types::StreamId;
///
/// let id = StreamId::new("order-42");
/// assert_eq!(id.as_str(), "order-42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a new StreamId.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the stream ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&StreamId> for StreamId {
    fn from(s: &StreamId) -> Self {
        s.clone()
    }
}

/// Identifier of a commit.
///
/// Unique across the whole store. A second commit reusing an id is rejected
/// as a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId(String);

impl CommitId {
    /// Creates a CommitId from a caller-chosen string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random commit id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the commit ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommitId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CommitId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Positions and Revisions
// =============================================================================

/// A position in the global, gap-free sequence.
///
/// `GlobalPos::START` (0) is the checkpoint that precedes every event; the
/// first sequenced event is at `GlobalPos::FIRST` (1).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GlobalPos(u64);

impl GlobalPos {
    /// Checkpoint before any event.
    pub const START: GlobalPos = GlobalPos(0);

    /// The first position ever assigned.
    pub const FIRST: GlobalPos = GlobalPos(1);

    /// Largest position SQLite can store.
    pub const MAX: GlobalPos = GlobalPos(i64::MAX as u64);

    /// Creates a GlobalPos from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next position, saturating at `u64::MAX`.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Adds an offset, saturating at `u64::MAX`.
    pub fn add(&self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }

    /// Adds an offset, or `None` past [`GlobalPos::MAX`].
    pub fn checked_add(&self, count: u64) -> Option<Self> {
        self.0
            .checked_add(count)
            .map(Self)
            .filter(|pos| *pos <= Self::MAX)
    }
}

impl fmt::Display for GlobalPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A version number within a stream.
///
/// - Starts at 1 for the first event
/// - No gaps (1, 2, 3, ... not 1, 2, 5)
/// - `StreamRev::NONE` (0) is the head of a stream with no events
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StreamRev(u64);

impl StreamRev {
    /// The first version in a stream (1).
    pub const FIRST: StreamRev = StreamRev(1);

    /// Head of a stream that has no events.
    pub const NONE: StreamRev = StreamRev(0);

    /// Largest version SQLite can store. Appends beyond it are rejected.
    pub const MAX: StreamRev = StreamRev(i64::MAX as u64);

    /// Creates a StreamRev from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next version, saturating at `u64::MAX`.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Adds an offset, saturating at `u64::MAX`.
    pub fn add(&self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }

    /// Adds an offset, or `None` past [`StreamRev::MAX`].
    pub fn checked_add(&self, count: u64) -> Option<Self> {
        self.0
            .checked_add(count)
            .map(Self)
            .filter(|rev| *rev <= Self::MAX)
    }

    /// Returns true if this represents "no events" (version 0).
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StreamRev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identifier of a named subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(i64);

impl SubscriptionId {
    /// Creates a SubscriptionId from a raw row id.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw row id.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Expected Version
// =============================================================================

/// Precondition a write places on the stream head.
///
/// | Mode | Holds when |
/// |------|------------|
/// | `NoStream` | the stream has no events |
/// | `Any` | always (contiguity is still enforced) |
/// | `Exact(n)` | the head equals `n` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The stream must not have any events yet.
    NoStream,
    /// No precondition on the head.
    Any,
    /// The head must equal this version.
    Exact(StreamRev),
}

impl ExpectedVersion {
    /// Shorthand for `Exact(StreamRev::from_raw(version))`.
    pub fn exact(version: u64) -> Self {
        ExpectedVersion::Exact(StreamRev::from_raw(version))
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::NoStream => write!(f, "no stream"),
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::Exact(rev) => write!(f, "{}", rev.as_raw()),
        }
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Commit metadata. Attached once per commit, never per event.
pub type Metadata = BTreeMap<String, String>;

// =============================================================================
// Write Side
// =============================================================================

/// One event to append: its version, schema tag and serialized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Version this event will occupy in its stream.
    pub version: StreamRev,
    /// Tag identifying the payload's schema.
    pub contract_name: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

impl EventRecord {
    /// Creates a new event record.
    pub fn new(version: StreamRev, contract_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            version,
            contract_name: contract_name.into(),
            payload,
        }
    }
}

/// A commit: one or more events appended atomically to one stream.
///
/// # Example
///
/// ```rust
/// use eventline::types::{AppendCommand, EventRecord, ExpectedVersion, StreamRev};
///
/// let cmd = AppendCommand::new(
///     "order-1",
///     ExpectedVersion::NoStream,
///     vec![EventRecord::new(StreamRev::FIRST, "OrderPlaced", b"{}".to_vec())],
/// )
/// .with_metadata("user", "alice")
/// .lockable();
/// assert!(cmd.is_lockable);
/// ```
#[derive(Debug, Clone)]
pub struct AppendCommand {
    /// Target stream.
    pub stream_id: StreamId,
    /// Commit identifier, unique across the store.
    pub commit_id: CommitId,
    /// Precondition on the stream head.
    pub expected: ExpectedVersion,
    /// Events in version order.
    pub events: Vec<EventRecord>,
    /// Commit-level metadata.
    pub metadata: Metadata,
    /// Whether loads of this stream may take the store's write lock.
    /// Only honored by the commit that creates the stream.
    pub is_lockable: bool,
}

impl AppendCommand {
    /// Creates an append command with a generated commit id, no metadata,
    /// and a non-lockable stream.
    pub fn new(
        stream_id: impl Into<StreamId>,
        expected: ExpectedVersion,
        events: Vec<EventRecord>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            commit_id: CommitId::generate(),
            expected,
            events,
            metadata: Metadata::new(),
            is_lockable: false,
        }
    }

    /// Replaces the generated commit id.
    pub fn with_commit_id(mut self, commit_id: impl Into<CommitId>) -> Self {
        self.commit_id = commit_id.into();
        self
    }

    /// Adds one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Marks the stream as lockable.
    pub fn lockable(mut self) -> Self {
        self.is_lockable = true;
        self
    }

    /// First version claimed by this commit.
    pub fn first_version(&self) -> Option<StreamRev> {
        self.events.first().map(|e| e.version)
    }

    /// Last version claimed by this commit.
    pub fn last_version(&self) -> Option<StreamRev> {
        self.events.last().map(|e| e.version)
    }
}

/// Outcome of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Insertion order of the commit. The linearizer sequences commits in
    /// this order.
    pub commit_seq: u64,
    /// First version written.
    pub first_version: StreamRev,
    /// Last version written (the new head).
    pub last_version: StreamRev,
}

/// A snapshot to upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub stream_id: StreamId,
    /// Stream version the snapshot represents.
    pub version: StreamRev,
    pub contract_name: String,
    pub generated_ms: u64,
    pub payload: Vec<u8>,
}

impl Snapshot {
    /// Creates a snapshot stamped with the current time.
    pub fn new(
        stream_id: impl Into<StreamId>,
        version: StreamRev,
        contract_name: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            version,
            contract_name: contract_name.into(),
            generated_ms: current_time_ms(),
            payload,
        }
    }
}

// =============================================================================
// Read Side
// =============================================================================

/// Whether a loaded row is an event or the stream's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Event,
    Snapshot,
}

/// A row returned by a stream load.
///
/// When a snapshot is present it comes first, and the events that follow
/// start right after the snapshot's version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: RecordKind,
    pub stream_id: StreamId,
    pub version: StreamRev,
    pub contract_name: String,
    pub payload: Vec<u8>,
    /// Commit time for events, generation time for snapshots.
    pub created_ms: u64,
}

impl RecordedEvent {
    /// Returns true if this row is a snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.kind == RecordKind::Snapshot
    }
}

/// Head state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHead {
    pub version: StreamRev,
    pub is_lockable: bool,
}

// =============================================================================
// Tests
// =============================================================================
