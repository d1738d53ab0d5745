//! # Batch Writer with Group Commit
//!
//! Every write to the store goes through one writer thread that owns the
//! read-write connection. Requests arriving within a short window are
//! executed together in one SQLite transaction, each in its own SAVEPOINT.
//!
//! ## Why Group Commit?
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ cmd1 → BEGIN → COMMIT    │     │ BEGIN IMMEDIATE          │
//! │ cmd2 → BEGIN → COMMIT    │     │   SAVEPOINT cmd_0        │
//! │ cmd3 → BEGIN → COMMIT    │     │   SAVEPOINT cmd_1        │
//! │ ...                      │     │   SAVEPOINT cmd_2        │
//! │ 100 fsyncs               │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 fsync                  │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## SAVEPOINT Semantics
//!
//! - A request that succeeds releases its SAVEPOINT (changes kept)
//! - A request that fails (conflict) rolls back to its SAVEPOINT
//! - Other requests in the batch are unaffected
//!
//! Responses are sent only after COMMIT. If COMMIT fails, every request in
//! the batch fails and nothing is visible.
//!
//! ## Concurrency Gate
//!
//! The head of a stream is read inside the batch transaction, so it already
//! reflects earlier requests of the same batch. The gate checks the caller's
//! expected version against it before inserting; the `(stream_id, version)`
//! and `commit_id` unique constraints catch anything the check could not.
//!
//! ## Cancellation
//!
//! A request whose caller stopped waiting before the writer reached it is
//! dropped without touching the database. Once a batch commits, its writes
//! stand even if the caller is gone.
//!
//! ## Stream Locks
//!
//! A locked load ([`WriterHandle::lock_stream`]) reads a lockable stream and
//! hands back a [`StreamLock`]. Until that lock ends, every other append,
//! delete, snapshot update or locked load of the stream is parked in the
//! writer and runs, in arrival order, once the lock is gone:
//!
//! ```text
//!   A: lock_stream("s") ──► head 3        A: lock.append(v4) ──► ok, unlocked
//!   B:          append("s", v4) ──► parked ─────────────────────► runs, conflict
//! ```
//!
//! A lock ends when its holder appends through it, when the guard is
//! dropped, or when it has been held longer than
//! [`WriterConfig::lock_timeout`]. Other streams are never delayed.
//!
//! ## Linearizer Signal
//!
//! After a COMMIT that contains at least one successful append, the writer
//! pokes the linearizer. The poke never blocks and never fails the append.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::codec::{compute_checksum, current_time_ms, encode_metadata};
use crate::error::{Error, Result};
use crate::gate::{self, Operation};
use crate::linearizer::LinearizerSignal;
use crate::reader;
use crate::schema;
use crate::subscription;
use crate::types::{
    AppendCommand, AppendResult, ExpectedVersion, GlobalPos, RecordedEvent, Snapshot, StreamId,
    StreamRev, SubscriptionId,
};

// =============================================================================
// Configuration
// =============================================================================

/// Default batch timeout in milliseconds.
///
/// Requests are collected for up to this duration before being executed.
/// Shorter = lower latency, longer = higher throughput.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10;

/// Maximum requests per batch.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 1000;

/// Size of the request channel.
const COMMAND_CHANNEL_SIZE: usize = 4096;

/// Default upper bound on how long a stream lock is honored.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

/// How long the loop waits when nothing is pending.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Configuration for the batch writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum time to wait for requests before executing a batch.
    pub batch_timeout: Duration,

    /// Maximum requests per batch.
    pub batch_max_size: usize,

    /// A stream lock held longer than this is released by the writer, and
    /// the requests parked behind it run.
    pub lock_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
        }
    }
}

// =============================================================================
// Lock Types
// =============================================================================

/// Identifies one lock session. Never reused within a writer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(u64);

/// What a locked load hands back through the request channel.
#[derive(Debug)]
pub struct LockGrant {
    pub id: LockId,
    pub head: StreamRev,
    pub events: Vec<RecordedEvent>,
}

/// Sent by a [`StreamLock`] dropped without appending.
#[derive(Debug)]
pub struct LockRelease {
    stream_id: StreamId,
    id: LockId,
}

struct HeldLock {
    id: LockId,
    acquired: Instant,
}

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the batch writer.
pub enum WriteRequest {
    /// `lock` is set when the append comes through a [`StreamLock`].
    Append {
        command: AppendCommand,
        lock: Option<LockId>,
        response: oneshot::Sender<Result<AppendResult>>,
    },

    DeleteStream {
        stream_id: StreamId,
        expected: ExpectedVersion,
        response: oneshot::Sender<Result<()>>,
    },

    UpdateSnapshot {
        snapshot: Snapshot,
        response: oneshot::Sender<Result<()>>,
    },

    /// Load executed inside the write transaction that also takes the
    /// stream's lock.
    LockStream {
        stream_id: StreamId,
        from_version: StreamRev,
        response: oneshot::Sender<Result<LockGrant>>,
    },

    CreateSubscription {
        name: String,
        contracts: Vec<String>,
        response: oneshot::Sender<Result<SubscriptionId>>,
    },

    DeleteSubscription {
        id: SubscriptionId,
        response: oneshot::Sender<Result<bool>>,
    },

    StoreCheckpoint {
        id: SubscriptionId,
        checkpoint: GlobalPos,
        response: oneshot::Sender<Result<()>>,
    },

    /// Create missing tables.
    Initialize {
        response: oneshot::Sender<Result<()>>,
    },

    /// Drop every table.
    Destroy {
        ignore_errors: bool,
        response: oneshot::Sender<Result<()>>,
    },

    /// Flush pending work and stop. `done` fires after the connection closes.
    Shutdown { done: oneshot::Sender<()> },
}

/// A request that takes part in group commit.
enum BatchItem {
    Append {
        command: AppendCommand,
        lock: Option<LockId>,
        response: oneshot::Sender<Result<AppendResult>>,
    },
    DeleteStream {
        stream_id: StreamId,
        expected: ExpectedVersion,
        response: oneshot::Sender<Result<()>>,
    },
    UpdateSnapshot {
        snapshot: Snapshot,
        response: oneshot::Sender<Result<()>>,
    },
    LockStream {
        stream_id: StreamId,
        from_version: StreamRev,
        response: oneshot::Sender<Result<LockGrant>>,
    },
}

impl BatchItem {
    /// True if the caller has stopped waiting.
    fn is_cancelled(&self) -> bool {
        match self {
            BatchItem::Append { response, .. } => response.is_closed(),
            BatchItem::DeleteStream { response, .. } => response.is_closed(),
            BatchItem::UpdateSnapshot { response, .. } => response.is_closed(),
            BatchItem::LockStream { response, .. } => response.is_closed(),
        }
    }

    fn stream_id(&self) -> &StreamId {
        match self {
            BatchItem::Append { command, .. } => &command.stream_id,
            BatchItem::DeleteStream { stream_id, .. } => stream_id,
            BatchItem::UpdateSnapshot { snapshot, .. } => &snapshot.stream_id,
            BatchItem::LockStream { stream_id, .. } => stream_id,
        }
    }

    /// The lock this request holds, if it comes from a lock holder.
    fn lock(&self) -> Option<LockId> {
        match self {
            BatchItem::Append { lock, .. } => *lock,
            _ => None,
        }
    }

    fn reject(self, message: &str) {
        let err = Error::Schema(message.to_string());
        match self {
            BatchItem::Append { response, .. } => {
                let _ = response.send(Err(err));
            }
            BatchItem::DeleteStream { response, .. } => {
                let _ = response.send(Err(err));
            }
            BatchItem::UpdateSnapshot { response, .. } => {
                let _ = response.send(Err(err));
            }
            BatchItem::LockStream { response, .. } => {
                let _ = response.send(Err(err));
            }
        }
    }
}

/// An executed batch item waiting for COMMIT before its response is sent.
enum Completed {
    Append(oneshot::Sender<Result<AppendResult>>, Result<AppendResult>),
    Unit(oneshot::Sender<Result<()>>, Result<()>),
    Lock(
        oneshot::Sender<Result<LockGrant>>,
        Result<LockGrant>,
        StreamId,
    ),
}

impl Completed {
    fn is_successful_append(&self) -> bool {
        matches!(self, Completed::Append(_, Ok(_)))
    }

    /// Sends the response. Returns a granted lock nobody received, which the
    /// writer must release.
    fn send(self) -> Option<(StreamId, LockId)> {
        match self {
            Completed::Append(response, result) => {
                let _ = response.send(result);
            }
            Completed::Unit(response, result) => {
                let _ = response.send(result);
            }
            Completed::Lock(response, result, stream_id) => {
                if let Err(Ok(grant)) = response.send(result) {
                    return Some((stream_id, grant.id));
                }
            }
        }
        None
    }

    /// Fails the request. Returns a lock granted earlier in the batch, which
    /// the writer must release.
    fn fail(self, message: &str) -> Option<(StreamId, LockId)> {
        let err = Error::Schema(message.to_string());
        match self {
            Completed::Append(response, _) => {
                let _ = response.send(Err(err));
            }
            Completed::Unit(response, _) => {
                let _ = response.send(Err(err));
            }
            Completed::Lock(response, result, stream_id) => {
                let _ = response.send(Err(err));
                if let Ok(grant) = result {
                    return Some((stream_id, grant.id));
                }
            }
        }
        None
    }
}

// =============================================================================
// Batch Writer
// =============================================================================

/// The batch writer. Runs on a dedicated thread; use [`WriterHandle`] to talk
/// to it from async code.
pub struct BatchWriter {
    /// SQLite connection (owned, single writer).
    conn: Connection,

    /// Wakes the linearizer after appends commit.
    signal: LinearizerSignal,

    /// Streams currently locked, by holder.
    locks: HashMap<StreamId, HeldLock>,

    /// Requests waiting for a stream lock to end, in arrival order.
    parked: VecDeque<BatchItem>,

    next_lock: u64,
}

impl BatchWriter {
    /// Creates a new batch writer. The schema must already be initialized.
    pub fn new(conn: Connection, signal: LinearizerSignal) -> Self {
        Self {
            conn,
            signal,
            locks: HashMap::new(),
            parked: VecDeque::new(),
            next_lock: 0,
        }
    }

    // =========================================================================
    // Batch Execution
    // =========================================================================

    /// Executes a batch, then any parked requests that a lock released
    /// during it has freed.
    fn execute_batch(&mut self, items: Vec<BatchItem>) {
        let mut items = items;
        loop {
            self.execute_unit(items);
            items = self.take_runnable();
            if items.is_empty() {
                return;
            }
        }
    }

    /// Executes one transaction:
    /// 1. Drop requests whose callers have gone away
    /// 2. BEGIN IMMEDIATE
    /// 3. Park requests on streams locked by someone else; run the rest,
    ///    each in its own SAVEPOINT
    /// 4. COMMIT
    /// 5. Signal the linearizer if anything was appended, then respond
    fn execute_unit(&mut self, items: Vec<BatchItem>) {
        let total = items.len();
        let mut live = Vec::with_capacity(total);
        for item in items {
            if !item.is_cancelled() {
                live.push(item);
            } else if let Some(id) = item.lock() {
                // The holder gave up on its append; its lock goes with it.
                self.unlock(item.stream_id(), id);
            }
        }
        if live.len() < total {
            debug!(cancelled = total - live.len(), "skipping cancelled write requests");
        }
        let items = live;
        if items.is_empty() {
            return;
        }

        if let Err(e) = self.conn.execute_batch("BEGIN IMMEDIATE") {
            let message = format!("failed to begin batch: {}", e);
            warn!(error = %e, requests = items.len(), "failed to begin write batch");
            for item in items {
                item.reject(&message);
            }
            return;
        }

        let mut completed = Vec::with_capacity(items.len());
        for (n, item) in items.into_iter().enumerate() {
            if self.must_park(&item) {
                debug!(stream_id = %item.stream_id(), "write parked behind stream lock");
                self.parked.push_back(item);
            } else {
                completed.push(self.execute_item(item, n));
            }
        }

        let mut orphaned = Vec::new();
        match self.conn.execute_batch("COMMIT") {
            Ok(()) => {
                if completed.iter().any(Completed::is_successful_append) {
                    self.signal.notify();
                }
                for done in completed {
                    orphaned.extend(done.send());
                }
            }
            Err(e) => {
                error!(error = %e, requests = completed.len(), "write batch commit failed");
                let _ = self.conn.execute_batch("ROLLBACK");
                let message = format!("batch commit failed: {}", e);
                for done in completed {
                    orphaned.extend(done.fail(&message));
                }
            }
        }
        for (stream_id, id) in orphaned {
            self.unlock(&stream_id, id);
        }
    }

    fn execute_item(&mut self, item: BatchItem, n: usize) -> Completed {
        match item {
            BatchItem::Append {
                command,
                lock,
                response,
            } => {
                let result = self.append(&command, n);
                if let Some(id) = lock {
                    self.unlock(&command.stream_id, id);
                }
                Completed::Append(response, result)
            }
            BatchItem::DeleteStream {
                stream_id,
                expected,
                response,
            } => Completed::Unit(response, self.delete_stream(&stream_id, expected, n)),
            BatchItem::UpdateSnapshot { snapshot, response } => {
                Completed::Unit(response, self.update_snapshot(&snapshot, n))
            }
            BatchItem::LockStream {
                stream_id,
                from_version,
                response,
            } => {
                let result = self.lock_stream(&stream_id, from_version);
                Completed::Lock(response, result, stream_id)
            }
        }
    }

    // =========================================================================
    // Stream Locks
    // =========================================================================

    /// True if the item's stream is locked by a different holder.
    fn is_blocked(&self, item: &BatchItem) -> bool {
        self.locks
            .get(item.stream_id())
            .is_some_and(|held| item.lock() != Some(held.id))
    }

    /// True if the item must wait: its stream is locked by someone else, or
    /// earlier requests for the stream are still parked.
    fn must_park(&self, item: &BatchItem) -> bool {
        if self.is_blocked(item) {
            return true;
        }
        item.lock().is_none()
            && self
                .parked
                .iter()
                .any(|parked| parked.stream_id() == item.stream_id())
    }

    /// Removes the lock if `id` still holds it. Parked requests run on the
    /// next [`BatchWriter::execute_batch`].
    fn unlock(&mut self, stream_id: &StreamId, id: LockId) -> bool {
        if self.locks.get(stream_id).is_some_and(|held| held.id == id) {
            self.locks.remove(stream_id);
            debug!(stream_id = %stream_id, "stream lock released");
            true
        } else {
            false
        }
    }

    /// Takes every parked request that is no longer blocked, keeping the
    /// rest in order.
    fn take_runnable(&mut self) -> Vec<BatchItem> {
        if self.parked.is_empty() {
            return Vec::new();
        }
        let (runnable, blocked): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|item| !self.is_blocked(item));
        self.parked = blocked.into();
        runnable
    }

    /// Handles a guard dropped without appending.
    fn release(&mut self, release: LockRelease) {
        if self.unlock(&release.stream_id, release.id) {
            self.execute_batch(Vec::new());
        }
    }

    /// Releases every lock held longer than `timeout`.
    fn expire_locks(&mut self, timeout: Duration) {
        let expired: Vec<(StreamId, LockId)> = self
            .locks
            .iter()
            .filter(|(_, held)| held.acquired.elapsed() >= timeout)
            .map(|(stream_id, held)| (stream_id.clone(), held.id))
            .collect();
        if expired.is_empty() {
            return;
        }
        for (stream_id, id) in expired {
            warn!(stream_id = %stream_id, timeout_ms = timeout.as_millis() as u64, "stream lock expired");
            self.unlock(&stream_id, id);
        }
        self.execute_batch(Vec::new());
    }

    /// Time until the oldest lock expires.
    fn next_expiry(&self, timeout: Duration) -> Option<Duration> {
        self.locks
            .values()
            .map(|held| timeout.saturating_sub(held.acquired.elapsed()))
            .min()
    }

    /// Fails every parked request. Used on shutdown.
    fn reject_parked(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        warn!(requests = self.parked.len(), "writer stopping with requests parked behind a stream lock");
        for item in std::mem::take(&mut self.parked) {
            item.reject("writer shut down while the stream was locked");
        }
    }

    /// Runs `f` inside SAVEPOINT `cmd_<n>`, rolling back to it on error.
    fn in_savepoint<T>(&self, n: usize, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let name = format!("cmd_{}", n);
        self.conn.execute_batch(&format!("SAVEPOINT {}", name))?;

        match f(&self.conn) {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {}", name))?;
                Ok(value)
            }
            Err(e) => {
                self.conn.execute_batch(&format!("ROLLBACK TO {}", name))?;
                self.conn.execute_batch(&format!("RELEASE {}", name))?;
                Err(e)
            }
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    fn append(&self, cmd: &AppendCommand, n: usize) -> Result<AppendResult> {
        let (first_version, last_version) = validate_append(cmd)?;

        let head = reader::stream_head(&self.conn, &cmd.stream_id)?;
        let head_version = head.map(|h| h.version).unwrap_or(StreamRev::NONE);
        gate::check_append(&cmd.stream_id, cmd.expected, head_version, first_version)?;

        self.in_savepoint(n, |conn| insert_commit(conn, cmd))
            .map(|commit_seq| AppendResult {
                commit_seq,
                first_version,
                last_version,
            })
            .map_err(|e| {
                gate::classify(e, &cmd.stream_id, Operation::Append, cmd.expected, || {
                    reader::head_version(&self.conn, &cmd.stream_id).unwrap_or(head_version)
                })
            })
    }

    fn delete_stream(&self, stream_id: &StreamId, expected: ExpectedVersion, n: usize) -> Result<()> {
        let head = reader::head_version(&self.conn, stream_id)?;
        gate::check_delete(stream_id, expected, head)?;

        self.in_savepoint(n, |conn| {
            for table in ["events", "commits", "snapshots", "streams"] {
                conn.execute(
                    &format!("DELETE FROM {table} WHERE stream_id = ?"),
                    [stream_id.as_str()],
                )?;
            }
            // Positions stay assigned; readers see tombstones in their place.
            conn.execute(
                "UPDATE global_sequence SET deleted = 1 WHERE stream_id = ? AND deleted = 0",
                [stream_id.as_str()],
            )?;
            Ok(())
        })?;

        debug!(stream_id = %stream_id, head = head.as_raw(), "stream deleted");
        Ok(())
    }

    fn update_snapshot(&self, snapshot: &Snapshot, n: usize) -> Result<()> {
        let stream_id = &snapshot.stream_id;
        let head = reader::head_version(&self.conn, stream_id)?;
        let existing = reader::snapshot_version(&self.conn, stream_id)?;
        gate::check_snapshot(stream_id, snapshot.version, head, existing)?;

        self.in_savepoint(n, |conn| {
            conn.execute(
                "INSERT INTO snapshots (stream_id, version, contract_name, generated_ms, payload, checksum)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(stream_id) DO UPDATE SET
                     version = excluded.version,
                     contract_name = excluded.contract_name,
                     generated_ms = excluded.generated_ms,
                     payload = excluded.payload,
                     checksum = excluded.checksum",
                params![
                    stream_id.as_str(),
                    snapshot.version.as_raw() as i64,
                    snapshot.contract_name,
                    snapshot.generated_ms as i64,
                    snapshot.payload,
                    compute_checksum(&snapshot.payload),
                ],
            )?;
            Ok(())
        })
        .map_err(|e| {
            gate::classify(
                e,
                stream_id,
                Operation::UpdateSnapshot,
                ExpectedVersion::Exact(snapshot.version),
                || head,
            )
        })
    }

    /// Loads a stream and locks it. A stream that does not exist yet can be
    /// locked; one created without the lockable flag cannot.
    fn lock_stream(&mut self, stream_id: &StreamId, from_version: StreamRev) -> Result<LockGrant> {
        let head = match reader::stream_head(&self.conn, stream_id)? {
            Some(head) if !head.is_lockable => {
                return Err(Error::StreamNotLockable {
                    stream_id: stream_id.to_string(),
                });
            }
            Some(head) => head.version,
            None => StreamRev::NONE,
        };
        let events = reader::load_stream(&self.conn, stream_id, from_version)?;

        self.next_lock += 1;
        let id = LockId(self.next_lock);
        self.locks.insert(
            stream_id.clone(),
            HeldLock {
                id,
                acquired: Instant::now(),
            },
        );
        debug!(stream_id = %stream_id, head = head.as_raw(), "stream locked");

        Ok(LockGrant { id, head, events })
    }

    // =========================================================================
    // Administrative Requests (run outside batches)
    // =========================================================================

    fn execute_admin(&mut self, request: WriteRequest) {
        match request {
            WriteRequest::CreateSubscription {
                name,
                contracts,
                response,
            } => {
                if !response.is_closed() {
                    let _ = response.send(subscription::create(&mut self.conn, &name, &contracts));
                }
            }
            WriteRequest::DeleteSubscription { id, response } => {
                if !response.is_closed() {
                    let _ = response.send(subscription::delete(&mut self.conn, id));
                }
            }
            WriteRequest::StoreCheckpoint {
                id,
                checkpoint,
                response,
            } => {
                if !response.is_closed() {
                    let _ = response.send(subscription::store_checkpoint(&self.conn, id, checkpoint));
                }
            }
            WriteRequest::Initialize { response } => {
                let _ = response.send(schema::initialize(&self.conn));
            }
            WriteRequest::Destroy {
                ignore_errors,
                response,
            } => {
                let result = schema::destroy(&self.conn, ignore_errors);
                if result.is_ok() {
                    warn!("all eventline tables dropped");
                }
                let _ = response.send(result);
            }
            WriteRequest::Append { .. }
            | WriteRequest::DeleteStream { .. }
            | WriteRequest::UpdateSnapshot { .. }
            | WriteRequest::LockStream { .. }
            | WriteRequest::Shutdown { .. } => {}
        }
    }
}

/// Checks the shape of an append and returns its version range.
fn validate_append(cmd: &AppendCommand) -> Result<(StreamRev, StreamRev)> {
    let (Some(first), Some(last)) = (cmd.first_version(), cmd.last_version()) else {
        return Err(Error::InvalidAppend(format!(
            "commit '{}' to '{}' has no events",
            cmd.commit_id, cmd.stream_id
        )));
    };
    if first.is_none() {
        return Err(Error::InvalidAppend(format!(
            "commit '{}' starts at version 0; versions start at 1",
            cmd.commit_id
        )));
    }
    for (offset, event) in cmd.events.iter().enumerate() {
        let Some(expected) = first.checked_add(offset as u64) else {
            return Err(Error::InvalidAppend(format!(
                "commit '{}' runs past the largest version {}",
                cmd.commit_id,
                StreamRev::MAX.as_raw()
            )));
        };
        if event.version != expected {
            return Err(Error::InvalidAppend(format!(
                "commit '{}' has non-consecutive versions at index {}",
                cmd.commit_id, offset
            )));
        }
    }
    Ok((first, last))
}

/// Inserts the commit row, its events and the new head. Returns the
/// commit sequence number.
fn insert_commit(conn: &Connection, cmd: &AppendCommand) -> Result<u64> {
    let now_ms = current_time_ms() as i64;
    let metadata = encode_metadata(&cmd.metadata)?;
    let first = cmd.events[0].version;
    let last = cmd.events[cmd.events.len() - 1].version;

    conn.prepare_cached(
        "INSERT INTO commits (commit_id, stream_id, first_version, last_version, created_ms, metadata, is_lockable)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )?
    .execute(params![
        cmd.commit_id.as_str(),
        cmd.stream_id.as_str(),
        first.as_raw() as i64,
        last.as_raw() as i64,
        now_ms,
        metadata,
        cmd.is_lockable,
    ])?;
    let commit_seq = conn.last_insert_rowid();

    {
        let mut insert = conn.prepare_cached(
            "INSERT INTO events (stream_id, version, commit_seq, contract_name, payload, checksum)
             VALUES (?, ?, ?, ?, ?, ?)",
        )?;
        for event in &cmd.events {
            insert.execute(params![
                cmd.stream_id.as_str(),
                event.version.as_raw() as i64,
                commit_seq,
                event.contract_name,
                event.payload,
                compute_checksum(&event.payload),
            ])?;
        }
    }

    conn.prepare_cached(
        "INSERT INTO streams (stream_id, head_version, is_lockable, created_ms)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(stream_id) DO UPDATE SET head_version = excluded.head_version",
    )?
    .execute(params![
        cmd.stream_id.as_str(),
        last.as_raw() as i64,
        cmd.is_lockable,
        now_ms,
    ])?;

    Ok(commit_seq as u64)
}

// =============================================================================
// Writer Handle
// =============================================================================

/// Async handle to the batch writer. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
    releases: mpsc::UnboundedSender<LockRelease>,
}

impl WriterHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::Schema("writer has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Schema("writer dropped response".to_string()))?
    }

    /// Appends a commit.
    pub async fn append(&self, command: AppendCommand) -> Result<AppendResult> {
        self.request(|response| WriteRequest::Append {
            command,
            lock: None,
            response,
        })
        .await
    }

    pub async fn delete_stream(&self, stream_id: StreamId, expected: ExpectedVersion) -> Result<()> {
        self.request(|response| WriteRequest::DeleteStream {
            stream_id,
            expected,
            response,
        })
        .await
    }

    pub async fn update_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.request(|response| WriteRequest::UpdateSnapshot { snapshot, response })
            .await
    }

    /// Loads a lockable stream and locks it until the returned guard appends
    /// or is dropped.
    pub async fn lock_stream(&self, stream_id: StreamId, from_version: StreamRev) -> Result<StreamLock> {
        let grant = self
            .request(|response| WriteRequest::LockStream {
                stream_id: stream_id.clone(),
                from_version,
                response,
            })
            .await?;

        Ok(StreamLock {
            writer: self.clone(),
            stream_id,
            id: grant.id,
            head: grant.head,
            events: grant.events,
            armed: true,
        })
    }

    pub async fn create_subscription(
        &self,
        name: String,
        contracts: Vec<String>,
    ) -> Result<SubscriptionId> {
        self.request(|response| WriteRequest::CreateSubscription {
            name,
            contracts,
            response,
        })
        .await
    }

    pub async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool> {
        self.request(|response| WriteRequest::DeleteSubscription { id, response })
            .await
    }

    pub async fn store_checkpoint(&self, id: SubscriptionId, checkpoint: GlobalPos) -> Result<()> {
        self.request(|response| WriteRequest::StoreCheckpoint {
            id,
            checkpoint,
            response,
        })
        .await
    }

    pub async fn initialize(&self) -> Result<()> {
        self.request(|response| WriteRequest::Initialize { response })
            .await
    }

    pub async fn destroy(&self, ignore_errors: bool) -> Result<()> {
        self.request(|response| WriteRequest::Destroy {
            ignore_errors,
            response,
        })
        .await
    }

    /// Flushes pending requests, stops the writer and waits until its
    /// connection is closed.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(WriteRequest::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

// =============================================================================
// Stream Lock
// =============================================================================

/// A locked stream. Other writes to the stream wait until this is consumed by
/// [`StreamLock::append`] or dropped.
pub struct StreamLock {
    writer: WriterHandle,
    stream_id: StreamId,
    id: LockId,
    head: StreamRev,
    events: Vec<RecordedEvent>,
    armed: bool,
}

impl StreamLock {
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Head version when the lock was taken. [`StreamRev::NONE`] if the
    /// stream did not exist.
    pub fn head(&self) -> StreamRev {
        self.head
    }

    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    /// Moves the loaded events out. The lock stays held.
    pub fn take_events(&mut self) -> Vec<RecordedEvent> {
        std::mem::take(&mut self.events)
    }

    /// Appends to the locked stream and releases the lock, whether or not
    /// the append succeeds. The usual precondition is
    /// `ExpectedVersion::Exact(lock.head())`.
    pub async fn append(mut self, command: AppendCommand) -> Result<AppendResult> {
        if command.stream_id != self.stream_id {
            return Err(Error::InvalidAppend(format!(
                "lock on '{}' cannot append to '{}'",
                self.stream_id, command.stream_id
            )));
        }

        let (response_tx, response_rx) = oneshot::channel();
        self.writer
            .tx
            .send(WriteRequest::Append {
                command,
                lock: Some(self.id),
                response: response_tx,
            })
            .await
            .map_err(|_| Error::Schema("writer has shut down".to_string()))?;
        // The writer releases the lock once it sees the request.
        self.armed = false;

        response_rx
            .await
            .map_err(|_| Error::Schema("writer dropped response".to_string()))?
    }
}

impl Drop for StreamLock {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.writer.releases.send(LockRelease {
                stream_id: self.stream_id.clone(),
                id: self.id,
            });
        }
    }
}

impl fmt::Debug for StreamLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLock")
            .field("stream_id", &self.stream_id)
            .field("id", &self.id)
            .field("head", &self.head)
            .field("events", &self.events.len())
            .finish()
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

enum Incoming {
    Release(LockRelease),
    Request(Option<WriteRequest>),
}

/// Runs the batch writer loop until shutdown or until every handle is gone.
pub async fn run_batch_writer(
    mut writer: BatchWriter,
    mut rx: mpsc::Receiver<WriteRequest>,
    mut releases: mpsc::UnboundedReceiver<LockRelease>,
    config: WriterConfig,
) {
    let mut batch: Vec<BatchItem> = Vec::new();
    let mut batch_start: Option<Instant> = None;

    let done = loop {
        writer.expire_locks(config.lock_timeout);

        let mut wait = match batch_start {
            Some(start) => config.batch_timeout.saturating_sub(start.elapsed()),
            None => IDLE_WAIT,
        };
        if let Some(expiry) = writer.next_expiry(config.lock_timeout) {
            wait = wait.min(expiry);
        }

        let incoming = timeout(wait, async {
            tokio::select! {
                biased;
                Some(release) = releases.recv() => Incoming::Release(release),
                request = rx.recv() => Incoming::Request(request),
            }
        })
        .await;

        let item = match incoming {
            Ok(Incoming::Release(release)) => {
                writer.release(release);
                continue;
            }
            Ok(Incoming::Request(request)) => request,
            Err(_) => {
                writer.execute_batch(std::mem::take(&mut batch));
                batch_start = None;
                continue;
            }
        };

        let item = match item {
            Some(WriteRequest::Append {
                command,
                lock,
                response,
            }) => BatchItem::Append {
                command,
                lock,
                response,
            },
            Some(WriteRequest::DeleteStream {
                stream_id,
                expected,
                response,
            }) => BatchItem::DeleteStream {
                stream_id,
                expected,
                response,
            },
            Some(WriteRequest::UpdateSnapshot { snapshot, response }) => {
                BatchItem::UpdateSnapshot { snapshot, response }
            }
            Some(WriteRequest::LockStream {
                stream_id,
                from_version,
                response,
            }) => BatchItem::LockStream {
                stream_id,
                from_version,
                response,
            },
            Some(WriteRequest::Shutdown { done }) => {
                writer.execute_batch(std::mem::take(&mut batch));
                break Some(done);
            }
            Some(admin) => {
                // Admin requests see every write queued before them.
                writer.execute_batch(std::mem::take(&mut batch));
                batch_start = None;
                writer.execute_admin(admin);
                continue;
            }
            None => {
                writer.execute_batch(std::mem::take(&mut batch));
                break None;
            }
        };

        if batch.is_empty() {
            batch_start = Some(Instant::now());
        }
        batch.push(item);

        if batch.len() >= config.batch_max_size {
            writer.execute_batch(std::mem::take(&mut batch));
            batch_start = None;
        }
    };

    writer.reject_parked();
    drop(writer);
    debug!("batch writer stopped");
    if let Some(done) = done {
        let _ = done.send(());
    }
}

/// Spawns the batch writer on a dedicated thread.
pub fn spawn_batch_writer(
    conn: Connection,
    config: WriterConfig,
    signal: LinearizerSignal,
) -> Result<WriterHandle> {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let (releases_tx, releases_rx) = mpsc::unbounded_channel();
    let writer = BatchWriter::new(conn, signal);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Schema(format!("failed to create writer runtime: {}", e)))?;

    std::thread::Builder::new()
        .name("eventline-batch-writer".to_string())
        .spawn(move || rt.block_on(run_batch_writer(writer, rx, releases_rx, config)))
        .map_err(|e| Error::Schema(format!("failed to spawn writer thread: {}", e)))?;

    Ok(WriterHandle {
        tx,
        releases: releases_tx,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linearizer::signal_channel;
    use crate::schema::Database;
    use crate::types::EventRecord;

    fn records(first: u64, count: u64) -> Vec<EventRecord> {
        (0..count)
            .map(|i| {
                EventRecord::new(
                    StreamRev::from_raw(first + i),
                    "Tested",
                    format!("{{\"i\":{}}}", first + i).into_bytes(),
                )
            })
            .collect()
    }

    fn spawn_test_writer() -> (WriterHandle, mpsc::Receiver<()>) {
        spawn_writer_with(WriterConfig::default())
    }

    fn spawn_writer_with(config: WriterConfig) -> (WriterHandle, mpsc::Receiver<()>) {
        let db = Database::open_in_memory().unwrap();
        let (signal, signals) = signal_channel();
        let handle = spawn_batch_writer(db.into_connection(), config, signal).unwrap();
        (handle, signals)
    }

    /// Reads a stream through the writer. The stream must be lockable or
    /// missing.
    async fn read_events(handle: &WriterHandle, stream: &str) -> Vec<RecordedEvent> {
        let mut lock = handle
            .lock_stream(StreamId::new(stream), StreamRev::FIRST)
            .await
            .unwrap();
        lock.take_events()
    }

    #[test]
    fn test_validate_append_shapes() {
        let empty = AppendCommand::new("s", ExpectedVersion::Any, vec![]);
        assert!(matches!(validate_append(&empty), Err(Error::InvalidAppend(_))));

        let zero = AppendCommand::new("s", ExpectedVersion::Any, records(0, 1));
        assert!(matches!(validate_append(&zero), Err(Error::InvalidAppend(_))));

        let mut gap = records(1, 3);
        gap[2].version = StreamRev::from_raw(5);
        let gap = AppendCommand::new("s", ExpectedVersion::Any, gap);
        assert!(matches!(validate_append(&gap), Err(Error::InvalidAppend(_))));

        let ok = AppendCommand::new("s", ExpectedVersion::Any, records(4, 2));
        assert_eq!(
            validate_append(&ok).unwrap(),
            (StreamRev::from_raw(4), StreamRev::from_raw(5))
        );
    }

    #[test]
    fn test_validate_append_rejects_versions_past_the_largest() {
        let wrapping = AppendCommand::new(
            "s",
            ExpectedVersion::Any,
            vec![
                EventRecord::new(StreamRev::from_raw(u64::MAX), "Tested", b"{}".to_vec()),
                EventRecord::new(StreamRev::from_raw(u64::MAX), "Tested", b"{}".to_vec()),
            ],
        );
        assert!(matches!(validate_append(&wrapping), Err(Error::InvalidAppend(_))));

        let single = AppendCommand::new(
            "s",
            ExpectedVersion::Any,
            vec![EventRecord::new(StreamRev::from_raw(u64::MAX), "Tested", b"{}".to_vec())],
        );
        assert!(matches!(validate_append(&single), Err(Error::InvalidAppend(_))));

        let crossing = AppendCommand::new("s", ExpectedVersion::Any, records(i64::MAX as u64, 2));
        assert!(matches!(validate_append(&crossing), Err(Error::InvalidAppend(_))));

        let last = AppendCommand::new("s", ExpectedVersion::Any, records(i64::MAX as u64, 1));
        assert_eq!(validate_append(&last).unwrap(), (StreamRev::MAX, StreamRev::MAX));
    }

    #[tokio::test]
    async fn test_overflowing_append_leaves_writer_running() {
        let (handle, _signals) = spawn_test_writer();

        let err = handle
            .append(AppendCommand::new(
                "x",
                ExpectedVersion::Any,
                vec![
                    EventRecord::new(StreamRev::from_raw(u64::MAX), "Tested", b"{}".to_vec()),
                    EventRecord::new(StreamRev::from_raw(u64::MAX), "Tested", b"{}".to_vec()),
                ],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAppend(_)));

        let result = handle
            .append(AppendCommand::new("y", ExpectedVersion::NoStream, records(1, 2)))
            .await
            .unwrap();
        assert_eq!(result.last_version.as_raw(), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_append_and_signal() {
        let (handle, mut signals) = spawn_test_writer();

        let result = handle
            .append(AppendCommand::new("s", ExpectedVersion::NoStream, records(1, 3)))
            .await
            .unwrap();
        assert_eq!(result.first_version, StreamRev::FIRST);
        assert_eq!(result.last_version.as_raw(), 3);
        assert_eq!(result.commit_seq, 1);

        assert!(signals.try_recv().is_ok());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_conflicts_are_isolated_within_a_batch() {
        let (handle, mut signals) = spawn_test_writer();

        let (a, b, c) = tokio::join!(
            handle.append(AppendCommand::new("s", ExpectedVersion::NoStream, records(1, 1)).lockable()),
            handle.append(AppendCommand::new("s", ExpectedVersion::NoStream, records(1, 1)).lockable()),
            handle.append(AppendCommand::new("other", ExpectedVersion::NoStream, records(1, 1))),
        );

        assert!(a.is_ok());
        assert!(b.unwrap_err().is_conflict());
        assert!(c.is_ok());

        let events = read_events(&handle, "s").await;
        assert_eq!(events.len(), 1);
        assert!(signals.try_recv().is_ok());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_commit_id_conflicts() {
        let (handle, _signals) = spawn_test_writer();

        handle
            .append(AppendCommand::new("a", ExpectedVersion::Any, records(1, 1)).with_commit_id("c-1"))
            .await
            .unwrap();
        let err = handle
            .append(AppendCommand::new("b", ExpectedVersion::Any, records(1, 1)).with_commit_id("c-1"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // The rejected commit left nothing behind.
        let events = read_events(&handle, "b").await;
        assert!(events.is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_snapshot_cannot_move_backwards() {
        let (handle, _signals) = spawn_test_writer();
        handle
            .append(AppendCommand::new("s", ExpectedVersion::NoStream, records(1, 5)))
            .await
            .unwrap();

        handle
            .update_snapshot(Snapshot::new("s", StreamRev::from_raw(4), "State", b"4".to_vec()))
            .await
            .unwrap();
        let err = handle
            .update_snapshot(Snapshot::new("s", StreamRev::from_raw(3), "State", b"3".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let err = handle
            .update_snapshot(Snapshot::new("s", StreamRev::from_raw(6), "State", b"6".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_request_has_no_effect() {
        let (handle, _signals) = spawn_test_writer();

        // Build the request by hand and drop the receiver before the writer
        // gets to it.
        let (response, receiver) = oneshot::channel();
        drop(receiver);
        handle
            .tx
            .send(WriteRequest::Append {
                command: AppendCommand::new("s", ExpectedVersion::NoStream, records(1, 1)),
                lock: None,
                response,
            })
            .await
            .unwrap();

        let events = read_events(&handle, "s").await;
        assert!(events.is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_locked_stream_parks_other_writers() {
        let (handle, _signals) = spawn_test_writer();
        handle
            .append(AppendCommand::new("s", ExpectedVersion::NoStream, records(1, 1)).lockable())
            .await
            .unwrap();

        let lock = handle
            .lock_stream(StreamId::new("s"), StreamRev::FIRST)
            .await
            .unwrap();
        assert_eq!(lock.head().as_raw(), 1);
        assert_eq!(lock.events().len(), 1);

        let other = handle.clone();
        let mut competing = tokio::spawn(async move {
            other
                .append(AppendCommand::new("s", ExpectedVersion::Any, records(2, 1)))
                .await
        });
        let elsewhere = handle
            .append(AppendCommand::new("t", ExpectedVersion::NoStream, records(1, 1)))
            .await;
        assert!(elsewhere.is_ok());
        assert!(tokio::time::timeout(Duration::from_millis(100), &mut competing)
            .await
            .is_err());

        let head = lock.head();
        lock.append(AppendCommand::new("s", ExpectedVersion::Exact(head), records(2, 1)))
            .await
            .unwrap();

        assert!(competing.await.unwrap().unwrap_err().is_conflict());
        assert_eq!(read_events(&handle, "s").await.len(), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_lock_releases_stream() {
        let (handle, _signals) = spawn_test_writer();

        let lock = handle
            .lock_stream(StreamId::new("fresh"), StreamRev::FIRST)
            .await
            .unwrap();
        assert!(lock.head().is_none());

        let other = handle.clone();
        let competing = tokio::spawn(async move {
            other
                .append(AppendCommand::new("fresh", ExpectedVersion::NoStream, records(1, 1)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!competing.is_finished());

        drop(lock);
        assert!(competing.await.unwrap().is_ok());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_lock_stops_blocking() {
        let (handle, _signals) = spawn_writer_with(WriterConfig {
            lock_timeout: Duration::from_millis(50),
            ..WriterConfig::default()
        });

        let lock = handle
            .lock_stream(StreamId::new("s"), StreamRev::FIRST)
            .await
            .unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            handle.append(AppendCommand::new("s", ExpectedVersion::NoStream, records(1, 1))),
        )
        .await
        .unwrap();
        assert!(result.is_ok());

        // The late holder runs as an ordinary append and loses the race.
        let err = lock
            .append(AppendCommand::new("s", ExpectedVersion::NoStream, records(1, 1)))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_lock_requires_lockable_stream() {
        let (handle, _signals) = spawn_test_writer();
        handle
            .append(AppendCommand::new("plain", ExpectedVersion::NoStream, records(1, 1)))
            .await
            .unwrap();

        let err = handle
            .lock_stream(StreamId::new("plain"), StreamRev::FIRST)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StreamNotLockable { .. }));

        // The failed lock left nothing held.
        handle
            .append(AppendCommand::new("plain", ExpectedVersion::Exact(StreamRev::FIRST), records(2, 1)))
            .await
            .unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_lock_cannot_append_elsewhere() {
        let (handle, _signals) = spawn_test_writer();
        let lock = handle
            .lock_stream(StreamId::new("a"), StreamRev::FIRST)
            .await
            .unwrap();

        let err = lock
            .append(AppendCommand::new("b", ExpectedVersion::NoStream, records(1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAppend(_)));

        // Rejecting the append dropped the lock.
        handle
            .append(AppendCommand::new("a", ExpectedVersion::NoStream, records(1, 1)))
            .await
            .unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_fail_after_shutdown() {
        let (handle, _signals) = spawn_test_writer();
        handle.shutdown().await;

        let err = handle
            .append(AppendCommand::new("s", ExpectedVersion::Any, records(1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
