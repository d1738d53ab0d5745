//! # EventLine - Event Store with a Linearized Global Feed
//!
//! EventLine is an append-only event store built on SQLite. It provides:
//!
//! - **Event sourcing primitives**: streams, versions, snapshots
//! - **Optimistic and pessimistic concurrency**: per-stream expected versions
//! - **A gap-free global sequence**: assigned after commit by the linearizer
//! - **Schema evolution**: events are up-converted to their current contract
//!   before delivery
//! - **Subscriptions**: named contract filters with consumer-owned checkpoints
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │             (append, load, fetch, subscriptions)                │
//! └───────────────┬─────────────────────────────┬───────────────────┘
//!                 │                             │
//!                 ▼                             ▼
//! ┌───────────────────────────────┐   ┌─────────────────────────────┐
//! │         Batch Writer          │   │        Reader Pool          │
//! │  group commit, SAVEPOINTs,    │   │  stream loads, timeline     │
//! │  concurrency gate             │   │  reads, subscriptions       │
//! └───────────────┬───────────────┘   └──────────────┬──────────────┘
//!                 │ commits          wake            │
//!                 ▼          ┌──────────────┐        │
//! ┌──────────────────────────┤  Linearizer  ├────────┼──────────────┐
//! │         SQLite           │ commits ──►  │        │              │
//! │  commits, events,        │ global_seq   │  ◄─────┘              │
//! │  streams, snapshots      └──────────────┘   fetch → decode →    │
//! │                                             up-convert          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One winner per version**: two writers can never both claim the same
//!    stream version
//! 2. **Gap-free feed**: sequenced positions are exactly `1..K`, and a reader
//!    only ever sees a prefix of them
//! 3. **Stream order**: a stream's commits appear in the feed in version order
//! 4. **Checkpoints are the consumer's**: the store never moves one on its own
//!
//! ## Module Organization
//!
//! - [`error`]: error enum, conflicts distinguishable from everything else
//! - [`types`]: domain types (StreamId, StreamRev, GlobalPos, commands)
//! - [`schema`]: SQLite DDL, initialize and destroy
//! - [`codec`]: checksums, metadata blobs, the payload serializer
//! - [`gate`]: the concurrency gate
//! - [`writer`]: batch writer with group commit
//! - [`reader`]: stream and timeline reads on pooled connections
//! - [`linearizer`]: global sequencing
//! - [`contracts`]: contract names and the registry that resolves them
//! - [`upconvert`]: up-converter chains
//! - [`fetcher`]: timeline rows to typed envelopes
//! - [`subscription`]: named subscriptions and the pull-based poller
//! - [`api`]: async API (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for EventLine operations.
pub mod error;

/// Domain types for event sourcing.
///
/// Newtypes for identifiers and positions, expected versions, and the
/// command and record types exchanged with the store.
pub mod types;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Checksums, timestamps, metadata encoding and the payload serializer.
pub mod codec;

/// Optimistic concurrency checks for appends, deletes and snapshot updates.
pub mod gate;

/// Batch writer with group commit.
///
/// Requests are collected over a short window (default 10ms) and executed in
/// one transaction, each in its own SAVEPOINT, so a conflicting append never
/// affects its neighbours.
pub mod writer;

/// Read operations on a pool of read-only connections.
pub mod reader;

/// Background assignment of global positions.
pub mod linearizer;

/// Event contracts and the registry that maps names to types.
pub mod contracts;

/// Schema evolution by chained up-converters.
pub mod upconvert;

/// Turns sequenced rows into typed, up-converted envelopes.
pub mod fetcher;

/// Named subscriptions, checkpoints and the subscription poller.
pub mod subscription;

/// Async API for EventLine.
///
/// The main entry point is [`EventLine`](api::EventLine).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{EventLine, EventLineConfig};
pub use codec::{JsonSerializer, Serializer};
pub use contracts::{Contract, ContractRegistry, Event};
pub use error::{Error, Result};
pub use fetcher::{
    ContractFilter, DeletedEvent, EventDecoder, EventEnvelope, FailedEvent, FetchedEvent,
};
pub use linearizer::{LinearizerConfig, LinearizerProgress, PassReport};
pub use schema::Database;
pub use subscription::{EventHandler, FailurePolicy, Subscription, SubscriptionPoller};
pub use upconvert::UpConverterRegistry;
pub use writer::{StreamLock, WriterConfig};

pub use types::{
    AppendCommand, AppendResult, CommitId, EventRecord, ExpectedVersion, GlobalPos, Metadata,
    RecordKind, RecordedEvent, Snapshot, StreamHead, StreamId, StreamRev, SubscriptionId,
};
