//! # Async API for EventLine
//!
//! [`EventLine`] is the public entry point. It owns the three workers that
//! touch the database and routes every call to the right one:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            Async Tasks                              │
//! └───────┬─────────────────────────┬─────────────────────────┬─────────┘
//!         │ append, delete,         │ load, fetch,            │ run_linearizer*
//!         │ snapshot, locked load   │ subscriptions           │
//!         ▼                         ▼                         ▼
//! ┌───────────────┐      ┌─────────────────────┐     ┌─────────────────┐
//! │ Batch Writer  │      │     Reader Pool     │     │   Linearizer    │
//! │  (1 thread)   │─────────── wake signal ─────────►│  (tokio task)   │
//! │   R/W conn    │      │  read-only conns    │     │    R/W conn     │
//! └───────┬───────┘      └──────────┬──────────┘     └────────┬────────┘
//!         └─────────────────────────┼─────────────────────────┘
//!                                   ▼
//!                            ┌─────────────┐
//!                            │   SQLite    │
//!                            │   (WAL)     │
//!                            └─────────────┘
//! ```
//!
//! The writer and the linearizer each hold a read-write connection and take
//! turns on SQLite's write lock (`BEGIN IMMEDIATE` plus `busy_timeout`).
//! Readers never block either of them.
//!
//! ## Lifecycle
//!
//! - [`EventLine::initialize`] creates missing tables (also done by `open`)
//! - [`EventLine::destroy`] drops every table
//! - [`EventLine::run_linearizer`] starts the periodic schedule
//! - [`EventLine::run_linearizer_now`] requests a pass without waiting
//! - [`EventLine::run_linearizer_once`] runs one pass and waits for it

use std::path::{Path, PathBuf};
use std::thread::available_parallelism;
use std::time::Duration;

use rusqlite::Connection;
use tracing::info;

use crate::codec::Serializer;
use crate::contracts::{self, Contract};
use crate::error::{Error, Result};
use crate::fetcher::{ContractFilter, EventDecoder, FetchedEvent};
use crate::linearizer::{signal_channel, Linearizer, LinearizerConfig, LinearizerProgress, PassReport};
use crate::reader::ReaderPool;
use crate::schema::{self, DEFAULT_BUSY_TIMEOUT_MS};
use crate::subscription::Subscription;
use crate::types::{
    AppendCommand, AppendResult, EventRecord, ExpectedVersion, GlobalPos, RecordedEvent, Snapshot,
    StreamHead, StreamId, StreamRev, SubscriptionId,
};
use crate::writer::{spawn_batch_writer, StreamLock, WriterConfig, WriterHandle};

// =============================================================================
// Configuration
// =============================================================================

/// Minimum number of reader threads.
const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
const MAX_READ_THREADS: usize = 16;

/// Configuration for [`EventLine::open_with_config`].
#[derive(Debug, Clone)]
pub struct EventLineConfig {
    /// Group-commit settings.
    pub writer: WriterConfig,

    /// When set, the linearizer schedule starts as soon as the store opens.
    pub linearizer: Option<LinearizerConfig>,

    /// Reader threads. `None` uses the CPU count, clamped to 1..=16.
    pub reader_threads: Option<usize>,

    /// How long a connection waits for SQLite's write lock.
    pub busy_timeout: Duration,
}

impl Default for EventLineConfig {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            linearizer: None,
            reader_threads: None,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

fn default_reader_count() -> usize {
    available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_READ_THREADS)
        .clamp(MIN_READ_THREADS, MAX_READ_THREADS)
}

fn open_read_write(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    schema::configure(&conn, busy_timeout)?;
    Ok(conn)
}

// =============================================================================
// EventLine
// =============================================================================

/// The main async handle.
///
/// `EventLine` is `Clone`, `Send` and `Sync`; all clones share the same
/// workers.
///
/// # Example
///
/// ```rust,ignore
/// use eventline::{AppendCommand, ContractRegistry, EventDecoder, EventLine, ExpectedVersion};
///
/// let mut contracts = ContractRegistry::new();
/// contracts.register::<CartCreated>();
/// let db = EventLine::open("events.db", EventDecoder::new(contracts, Default::default())).await?;
///
/// let record = db.encode(StreamRev::FIRST, &CartCreated { cart_id: "c-1".into() })?;
/// db.append(AppendCommand::new("cart-1", ExpectedVersion::NoStream, vec![record])).await?;
///
/// db.run_linearizer_once().await?;
/// let batch = db.fetch(ContractFilter::All, GlobalPos::START, 100).await?;
/// ```
#[derive(Clone)]
pub struct EventLine {
    writer: WriterHandle,
    readers: ReaderPool,
    linearizer: Linearizer,
    decoder: EventDecoder,
    path: PathBuf,
}

impl EventLine {
    /// Opens or creates a store at `path` with default configuration.
    pub async fn open(path: impl AsRef<Path>, decoder: EventDecoder) -> Result<Self> {
        Self::open_with_config(path, decoder, EventLineConfig::default()).await
    }

    /// Opens or creates a store at `path`.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open_with_config(
        path: impl AsRef<Path>,
        decoder: EventDecoder,
        config: EventLineConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let writer_conn = open_read_write(&path, config.busy_timeout)?;
        schema::initialize(&writer_conn)?;
        let linearizer_conn = open_read_write(&path, config.busy_timeout)?;

        let (signal, signals) = signal_channel();
        let linearizer = Linearizer::new(linearizer_conn, signals)?;
        let writer = spawn_batch_writer(writer_conn, config.writer, signal)?;

        let reader_count = config.reader_threads.unwrap_or_else(default_reader_count);
        let readers = ReaderPool::spawn(&path, reader_count, config.busy_timeout)?;

        if let Some(linearizer_config) = config.linearizer {
            linearizer.start(linearizer_config);
        }

        info!(path = %path.display(), readers = readers.count(), "eventline opened");

        Ok(Self {
            writer,
            readers,
            linearizer,
            decoder,
            path,
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn decoder(&self) -> &EventDecoder {
        &self.decoder
    }

    /// Encodes a typed event as the record for `version`, using this store's
    /// serializer.
    pub fn encode<T: Contract>(&self, version: StreamRev, event: &T) -> Result<EventRecord> {
        contracts::encode(self.decoder.serializer(), version, event)
    }

    /// Returns the serializer used for payloads.
    pub fn serializer(&self) -> &dyn Serializer {
        self.decoder.serializer()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates any missing tables. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<()> {
        self.writer.initialize().await
    }

    /// Drops every table. With `ignore_errors`, tables that fail to drop are
    /// logged and skipped.
    ///
    /// The linearizer schedule is stopped first.
    pub async fn destroy(&self, ignore_errors: bool) -> Result<()> {
        self.linearizer.stop().await;
        self.writer.destroy(ignore_errors).await
    }

    /// Starts (or restarts) the periodic linearizer schedule.
    pub fn run_linearizer(&self, config: LinearizerConfig) {
        self.linearizer.start(config);
    }

    /// Stops the periodic schedule. A pass in progress completes.
    pub async fn stop_linearizer(&self) {
        self.linearizer.stop().await;
    }

    /// Requests a linearizer pass without waiting for it.
    pub fn run_linearizer_now(&self) {
        self.linearizer.trigger();
    }

    /// Runs one linearizer pass and waits for it to finish.
    pub async fn run_linearizer_once(&self) -> Result<PassReport> {
        self.linearizer.run_once().await
    }

    /// Durable linearizer progress.
    pub async fn progress(&self) -> Result<LinearizerProgress> {
        self.readers.progress().await
    }

    /// Stops the linearizer, flushes the writer and closes every connection.
    pub async fn shutdown(&self) {
        self.linearizer.stop().await;
        self.writer.shutdown().await;
        self.readers.shutdown().await;
        info!(path = %self.path.display(), "eventline closed");
    }

    // =========================================================================
    // Stream Store
    // =========================================================================

    /// Appends a commit.
    ///
    /// # Errors
    ///
    /// - `Error::WrongExpectedVersion` if the precondition fails, the first
    ///   version does not extend the head, or the commit id was already used
    /// - `Error::InvalidAppend` for an empty or non-consecutive commit
    pub async fn append(&self, command: AppendCommand) -> Result<AppendResult> {
        self.writer.append(command).await
    }

    /// Loads a stream from `from_version`.
    pub async fn load(
        &self,
        stream_id: impl Into<StreamId>,
        from_version: StreamRev,
    ) -> Result<Vec<RecordedEvent>> {
        self.readers.load_stream(stream_id.into(), from_version).await
    }

    /// Loads a stream and locks it for the caller.
    ///
    /// Until the returned [`StreamLock`] appends or is dropped, every other
    /// write to the stream waits in the writer. The stream must have been
    /// created lockable, or not exist yet.
    ///
    /// ```no_run
    /// # use eventline::{AppendCommand, EventLine, EventRecord, ExpectedVersion, StreamRev};
    /// # async fn example(db: &EventLine) -> eventline::Result<()> {
    /// let lock = db.load_for_update("account-7", StreamRev::FIRST).await?;
    /// let next = lock.head().next();
    /// let command = AppendCommand::new(
    ///     "account-7",
    ///     ExpectedVersion::Exact(lock.head()),
    ///     vec![EventRecord::new(next, "Debited", b"{}".to_vec())],
    /// );
    /// lock.append(command).await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// - `Error::StreamNotLockable` if the stream exists without the
    ///   lockable flag
    pub async fn load_for_update(
        &self,
        stream_id: impl Into<StreamId>,
        from_version: StreamRev,
    ) -> Result<StreamLock> {
        self.writer.lock_stream(stream_id.into(), from_version).await
    }

    /// Current head of a stream, or `None` if it does not exist.
    pub async fn stream_head(&self, stream_id: impl Into<StreamId>) -> Result<Option<StreamHead>> {
        self.readers.stream_head(stream_id.into()).await
    }

    /// Current head version. `StreamRev::NONE` if the stream does not exist.
    pub async fn head_version(&self, stream_id: impl Into<StreamId>) -> Result<StreamRev> {
        Ok(self
            .stream_head(stream_id)
            .await?
            .map(|head| head.version)
            .unwrap_or(StreamRev::NONE))
    }

    /// Deletes a stream with its events, commits, snapshot and sequence
    /// entries.
    pub async fn delete_stream(
        &self,
        stream_id: impl Into<StreamId>,
        expected: ExpectedVersion,
    ) -> Result<()> {
        self.writer.delete_stream(stream_id.into(), expected).await
    }

    /// Replaces the stream's snapshot.
    pub async fn update_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.writer.update_snapshot(snapshot).await
    }

    // =========================================================================
    // Fetch
    // =========================================================================

    /// Fetches up to `limit` sequenced events after position `after`. A limit
    /// of zero returns nothing.
    ///
    /// Rows that fail to decode come back as [`FetchedEvent::Failed`], and
    /// positions of deleted streams as [`FetchedEvent::Deleted`].
    pub async fn fetch(
        &self,
        filter: ContractFilter,
        after: GlobalPos,
        limit: usize,
    ) -> Result<Vec<FetchedEvent>> {
        let contracts = match filter {
            ContractFilter::All => None,
            ContractFilter::Contracts(set) if set.is_empty() => None,
            ContractFilter::Contracts(set) => Some(set.into_iter().collect()),
            ContractFilter::Subscription(id) => {
                let subscription = self
                    .readers
                    .get_subscription(id)
                    .await?
                    .ok_or(Error::SubscriptionNotFound(id.as_raw()))?;
                if subscription.contracts.is_empty() {
                    None
                } else {
                    Some(subscription.contracts)
                }
            }
        };

        let rows = self.readers.timeline(after, contracts, limit).await?;
        Ok(self.decoder.decode_rows(rows))
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Creates a subscription, or returns the id of the existing one with this
    /// name. An existing subscription keeps the filter it was created with.
    pub async fn create_subscription(&self, name: &str, contracts: &[&str]) -> Result<SubscriptionId> {
        let contracts = contracts.iter().map(|c| c.to_string()).collect();
        self.writer
            .create_subscription(name.to_string(), contracts)
            .await
    }

    pub async fn subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.readers.get_subscription(id).await
    }

    pub async fn subscription_by_name(&self, name: &str) -> Result<Option<Subscription>> {
        self.readers.find_subscription(name.to_string()).await
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.readers.list_subscriptions().await
    }

    /// Deletes a subscription. Returns false if it did not exist.
    pub async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool> {
        self.writer.delete_subscription(id).await
    }

    /// Stored checkpoint of a subscription.
    pub async fn checkpoint(&self, id: SubscriptionId) -> Result<GlobalPos> {
        self.subscription(id)
            .await?
            .map(|s| s.checkpoint)
            .ok_or(Error::SubscriptionNotFound(id.as_raw()))
    }

    /// Persists a subscription checkpoint. Moving it backwards is allowed.
    pub async fn store_checkpoint(&self, id: SubscriptionId, checkpoint: GlobalPos) -> Result<()> {
        self.writer.store_checkpoint(id, checkpoint).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ContractRegistry;
    use crate::upconvert::UpConverterRegistry;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Opened {
        account: String,
    }
    impl Contract for Opened {
        const NAME: &'static str = "Opened";
    }

    async fn open_temp() -> (EventLine, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut contracts = ContractRegistry::new();
        contracts.register::<Opened>();
        let config = EventLineConfig {
            reader_threads: Some(2),
            ..Default::default()
        };
        let db = EventLine::open_with_config(
            dir.path().join("api.db"),
            EventDecoder::new(contracts, UpConverterRegistry::new()),
            config,
        )
        .await
        .unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn test_append_load_fetch() {
        let (db, _dir) = open_temp().await;
        let record = db
            .encode(StreamRev::FIRST, &Opened { account: "a-1".into() })
            .unwrap();
        db.append(AppendCommand::new("account-1", ExpectedVersion::NoStream, vec![record]).lockable())
            .await
            .unwrap();

        let loaded = db.load("account-1", StreamRev::FIRST).await.unwrap();
        assert_eq!(loaded.len(), 1);
        let locked = db.load_for_update("account-1", StreamRev::FIRST).await.unwrap();
        assert_eq!(locked.events(), loaded.as_slice());
        drop(locked);

        // Not sequenced yet.
        assert!(db
            .fetch(ContractFilter::All, GlobalPos::START, 10)
            .await
            .unwrap()
            .is_empty());

        let report = db.run_linearizer_once().await.unwrap();
        assert_eq!(report.events, 1);

        let fetched = db.fetch(ContractFilter::All, GlobalPos::START, 10).await.unwrap();
        let envelope = fetched[0].envelope().unwrap();
        assert_eq!(envelope.global_position, GlobalPos::FIRST);
        assert_eq!(
            envelope.event.downcast_ref::<Opened>(),
            Some(&Opened { account: "a-1".into() })
        );
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_unknown_subscription() {
        let (db, _dir) = open_temp().await;
        let err = db
            .fetch(
                ContractFilter::Subscription(SubscriptionId::from_raw(99)),
                GlobalPos::START,
                10,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubscriptionNotFound(99)));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_bounds() {
        let (db, _dir) = open_temp().await;
        let record = db
            .encode(StreamRev::FIRST, &Opened { account: "a".into() })
            .unwrap();
        db.append(AppendCommand::new("s", ExpectedVersion::NoStream, vec![record]))
            .await
            .unwrap();
        db.run_linearizer_once().await.unwrap();

        let none = db.fetch(ContractFilter::All, GlobalPos::START, 0).await.unwrap();
        assert!(none.is_empty());

        let err = db
            .fetch(ContractFilter::All, GlobalPos::from_raw(u64::MAX), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PositionOutOfRange(u64::MAX)));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_head_version_of_missing_stream() {
        let (db, _dir) = open_temp().await;
        assert_eq!(db.head_version("nope").await.unwrap(), StreamRev::NONE);
        assert!(db.stream_head("nope").await.unwrap().is_none());
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_destroy_then_initialize() {
        let (db, _dir) = open_temp().await;
        let record = db
            .encode(StreamRev::FIRST, &Opened { account: "a".into() })
            .unwrap();
        db.append(AppendCommand::new("s", ExpectedVersion::NoStream, vec![record]))
            .await
            .unwrap();

        db.destroy(false).await.unwrap();
        db.destroy(true).await.unwrap();
        db.initialize().await.unwrap();

        assert_eq!(db.head_version("s").await.unwrap(), StreamRev::NONE);
        assert_eq!(db.progress().await.unwrap().last_position, GlobalPos::START);
        db.shutdown().await;
    }
}
