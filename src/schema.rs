//! # SQLite Schema for EventLine
//!
//! This module defines the database schema and handles initialization and
//! teardown.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  commits                 events                    streams              │
//! │  ┌──────────────────┐    ┌──────────────────┐      ┌────────────────┐   │
//! │  │ commit_seq (PK)  │◄───│ commit_seq       │      │ stream_id (PK) │   │
//! │  │ commit_id UNIQUE │    │ stream_id   (PK) │─────►│ head_version   │   │
//! │  │ metadata BLOB    │    │ version     (PK) │      │ is_lockable    │   │
//! │  └──────────────────┘    └──────────────────┘      └────────────────┘   │
//! │           ▲                                                             │
//! │           │ sequenced by the linearizer                                 │
//! │  ┌──────────────────┐    ┌───────────────────┐     ┌────────────────┐   │
//! │  │ global_sequence  │    │ linearizer_state  │     │ snapshots      │   │
//! │  │ position (PK)    │    │ last_commit_seq   │     │ stream_id (PK) │   │
//! │  │ commit_seq       │    │ last_position     │     │ version        │   │
//! │  └──────────────────┘    └───────────────────┘     └────────────────┘   │
//! │                                                                         │
//! │  subscriptions           subscription_contracts                         │
//! │  ┌──────────────────┐    ┌──────────────────────┐                       │
//! │  │ subscription_id  │◄───│ subscription_id      │                       │
//! │  │ name UNIQUE      │    │ contract_name        │                       │
//! │  │ checkpoint       │    └──────────────────────┘                       │
//! │  └──────────────────┘                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Uniqueness as the concurrency primitive
//!
//! `events` is keyed by `(stream_id, version)`. Two writers claiming the same
//! version cannot both insert, whatever the expected-version mode.
//!
//! ### Why is `global_sequence` a separate table?
//!
//! Positions are assigned after commit by the linearizer, not by the writer.
//! Once assigned, a position is permanent. Deleting a stream removes its
//! events and commits but only marks its `global_sequence` rows as deleted,
//! so the sequence keeps every position from 1 to the last one assigned and
//! a reader replaying from the start sees a tombstone where the stream's
//! events used to be.

use std::time::Duration;

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 2;

/// Default time a connection waits for the write lock before failing.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// =============================================================================
// DDL Statements
// =============================================================================

/// One row per commit.
///
/// - `commit_seq`: insertion order; AUTOINCREMENT so values are never reused
///   after a stream is deleted
/// - `first_version`/`last_version`: the version range the commit claimed
/// - `metadata`: commit metadata, NULL when empty
/// - `is_lockable`: copied from the append command
const CREATE_COMMITS: &str = r#"
CREATE TABLE IF NOT EXISTS commits (
    commit_seq    INTEGER PRIMARY KEY AUTOINCREMENT,
    commit_id     TEXT NOT NULL UNIQUE,
    stream_id     TEXT NOT NULL,
    first_version INTEGER NOT NULL,
    last_version  INTEGER NOT NULL,
    created_ms    INTEGER NOT NULL,
    metadata      BLOB,
    is_lockable   INTEGER NOT NULL DEFAULT 0
)
"#;

const CREATE_COMMITS_STREAM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS commits_stream ON commits(stream_id)
"#;

/// One row per event.
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    stream_id     TEXT NOT NULL,
    version       INTEGER NOT NULL,
    commit_seq    INTEGER NOT NULL,
    contract_name TEXT NOT NULL,
    payload       BLOB NOT NULL,
    checksum      BLOB NOT NULL,
    PRIMARY KEY (stream_id, version)
)
"#;

/// Supports the commit-level contract filter used by fetch.
const CREATE_EVENTS_COMMIT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS events_commit ON events(commit_seq, contract_name)
"#;

/// Stream heads, maintained in the same transaction as the event inserts.
const CREATE_STREAMS: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    stream_id    TEXT PRIMARY KEY,
    head_version INTEGER NOT NULL,
    is_lockable  INTEGER NOT NULL DEFAULT 0,
    created_ms   INTEGER NOT NULL
)
"#;

/// At most one current snapshot per stream.
const CREATE_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    stream_id     TEXT PRIMARY KEY,
    version       INTEGER NOT NULL,
    contract_name TEXT NOT NULL,
    generated_ms  INTEGER NOT NULL,
    payload       BLOB NOT NULL,
    checksum      BLOB NOT NULL
)
"#;

/// Inserted only by the linearizer. `deleted` is set when the owning stream
/// is deleted; the row itself stays as a tombstone.
const CREATE_GLOBAL_SEQUENCE: &str = r#"
CREATE TABLE IF NOT EXISTS global_sequence (
    position   INTEGER PRIMARY KEY,
    commit_seq INTEGER NOT NULL,
    stream_id  TEXT NOT NULL,
    version    INTEGER NOT NULL,
    deleted    INTEGER NOT NULL DEFAULT 0
)
"#;

/// A live version is sequenced at most once. Tombstones are exempt so a
/// deleted stream can be recreated.
const CREATE_GLOBAL_SEQUENCE_LIVE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS global_sequence_live
    ON global_sequence(stream_id, version) WHERE deleted = 0
"#;

/// Single row holding the linearizer's durable progress marker.
///
/// `last_position` is never lowered, so positions are never reused even when
/// the stream that owned them is deleted.
const CREATE_LINEARIZER_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS linearizer_state (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    last_commit_seq INTEGER NOT NULL,
    last_position   INTEGER NOT NULL,
    updated_ms      INTEGER NOT NULL
)
"#;

const SEED_LINEARIZER_STATE: &str = r#"
INSERT OR IGNORE INTO linearizer_state (id, last_commit_seq, last_position, updated_ms)
VALUES (1, 0, 0, 0)
"#;

const CREATE_SUBSCRIPTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    subscription_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    checkpoint      INTEGER NOT NULL DEFAULT 0,
    created_ms      INTEGER NOT NULL
)
"#;

/// An empty filter set means the subscription receives every contract.
const CREATE_SUBSCRIPTION_CONTRACTS: &str = r#"
CREATE TABLE IF NOT EXISTS subscription_contracts (
    subscription_id INTEGER NOT NULL,
    contract_name   TEXT NOT NULL,
    UNIQUE (subscription_id, contract_name)
)
"#;

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS eventline_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Tables dropped by [`destroy`], in dependency order.
const ALL_TABLES: &[&str] = &[
    "subscription_contracts",
    "subscriptions",
    "global_sequence",
    "linearizer_state",
    "snapshots",
    "events",
    "streams",
    "commits",
    "eventline_metadata",
];

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the EventLine schema in place.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use eventline::Database;
    ///
    /// let db = Database::open("events.db")?;
    /// # Ok::<(), eventline::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure(&conn, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
        initialize(&conn)?;
        Ok(Self { conn })
    }

    /// Creates an in-memory database for testing.
    ///
    /// Only usable by a single connection, so the linearizer and reader pool
    /// need a file-backed database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
        initialize(&conn)?;
        Ok(Self { conn })
    }

    /// Returns a reference to the underlying SQLite connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the wrapper and returns the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Connection Setup
// =============================================================================

/// Applies pragmas every read-write connection needs.
///
/// WAL lets the reader pool see committed data while the writer and the
/// linearizer take turns holding the write lock; `busy_timeout` makes them
/// wait for each other instead of failing with `SQLITE_BUSY`.
pub fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

/// Creates all tables if they don't exist and verifies the schema version.
///
/// Idempotent: safe to call on an initialized database.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_METADATA)?;
    conn.execute_batch(CREATE_COMMITS)?;
    conn.execute_batch(CREATE_COMMITS_STREAM_INDEX)?;
    conn.execute_batch(CREATE_EVENTS)?;
    conn.execute_batch(CREATE_EVENTS_COMMIT_INDEX)?;
    conn.execute_batch(CREATE_STREAMS)?;
    conn.execute_batch(CREATE_SNAPSHOTS)?;
    conn.execute_batch(CREATE_GLOBAL_SEQUENCE)?;
    conn.execute_batch(CREATE_GLOBAL_SEQUENCE_LIVE_INDEX)?;
    conn.execute_batch(CREATE_LINEARIZER_STATE)?;
    conn.execute_batch(SEED_LINEARIZER_STATE)?;
    conn.execute_batch(CREATE_SUBSCRIPTIONS)?;
    conn.execute_batch(CREATE_SUBSCRIPTION_CONTRACTS)?;

    verify_or_set_version(conn)
}

/// Drops every EventLine table.
///
/// With `ignore_errors`, a table that fails to drop is logged and skipped;
/// otherwise the first failure is returned.
pub fn destroy(conn: &Connection, ignore_errors: bool) -> Result<()> {
    for table in ALL_TABLES {
        match conn.execute_batch(&format!("DROP TABLE IF EXISTS {table}")) {
            Ok(()) => {}
            Err(e) if ignore_errors => {
                tracing::warn!(table, error = %e, "ignoring failure to drop table");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Verifies the schema version, or sets it if this is a new database.
fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing: Option<String> = match conn.query_row(
        "SELECT value FROM eventline_metadata WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    ) {
        Ok(v) => Some(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return Err(e.into()),
    };

    match existing {
        None => {
            conn.execute(
                "INSERT INTO eventline_metadata (key, value) VALUES ('schema_version', ?)",
                [SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) if v.parse::<i32>().ok() == Some(SCHEMA_VERSION) => {}
        Some(v) => {
            return Err(Error::Schema(format!(
                "schema version mismatch: database has version {v}, but this EventLine version requires {SCHEMA_VERSION}"
            )));
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
