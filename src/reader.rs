//! # Event Reader
//!
//! Read operations for EventLine. Every function here takes a `&Connection`
//! and runs plain SQL, so the same code serves the pooled read-only
//! connections and the writer (for locked loads inside its transaction).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                                │
//! │                                                                  │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐            │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │            │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │            │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘            │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                          │                                       │
//! │                 Read-only SQLite connections                     │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            ▼
//!                     ┌─────────────┐
//!                     │   SQLite    │
//!                     │   (WAL)     │
//!                     └─────────────┘
//! ```
//!
//! ## Timeline Reads
//!
//! [`read_timeline`] joins the linearizer's `global_sequence` with the event
//! and commit rows. Only sequenced events are visible, and since the
//! linearizer commits each unit atomically the visible positions always form
//! a gap-free prefix. Positions whose stream was deleted come back as
//! tombstone rows rather than being skipped.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use tokio::sync::{mpsc, oneshot};

use crate::codec::verify_checksum;
use crate::error::{Error, Result};
use crate::linearizer::{self, LinearizerProgress};
use crate::subscription::{self, Subscription};
use crate::types::{
    GlobalPos, RecordKind, RecordedEvent, StreamHead, StreamId, StreamRev, SubscriptionId,
};

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

// =============================================================================
// Stream Reads
// =============================================================================

/// Loads a stream starting at `from_version`.
///
/// If the stream has a snapshot at or after `from_version`, the snapshot is
/// returned first and the events continue after its version. Otherwise every
/// event with version >= `from_version` is returned. An unknown stream yields
/// an empty vector.
pub fn load_stream(
    conn: &Connection,
    stream_id: &StreamId,
    from_version: StreamRev,
) -> Result<Vec<RecordedEvent>> {
    let from_version = from_version.max(StreamRev::FIRST);
    let mut records = Vec::new();

    let snapshot = conn
        .query_row(
            "SELECT version, contract_name, generated_ms, payload, checksum
             FROM snapshots WHERE stream_id = ?",
            [stream_id.as_str()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            },
        )
        .optional()?;

    let mut events_from = from_version;
    if let Some((version, contract_name, generated_ms, payload, checksum)) = snapshot {
        let version = StreamRev::from_raw(version as u64);
        if version >= from_version {
            verify_checksum(&payload, &checksum, || format!("snapshot of {stream_id}"))?;
            records.push(RecordedEvent {
                kind: RecordKind::Snapshot,
                stream_id: stream_id.clone(),
                version,
                contract_name,
                payload,
                created_ms: generated_ms as u64,
            });
            events_from = version.next();
        }
    }

    let mut stmt = conn.prepare_cached(
        "SELECT e.version, e.contract_name, e.payload, e.checksum, c.created_ms
         FROM events e
         JOIN commits c ON c.commit_seq = e.commit_seq
         WHERE e.stream_id = ? AND e.version >= ?
         ORDER BY e.version",
    )?;

    let events_from = i64::try_from(events_from.as_raw()).unwrap_or(i64::MAX);
    let rows = stmt.query_map(
        params![stream_id.as_str(), events_from],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        },
    )?;

    for row in rows {
        let (version, contract_name, payload, checksum, created_ms) = row?;
        verify_checksum(&payload, &checksum, || format!("{stream_id}@{version}"))?;
        records.push(RecordedEvent {
            kind: RecordKind::Event,
            stream_id: stream_id.clone(),
            version: StreamRev::from_raw(version as u64),
            contract_name,
            payload,
            created_ms: created_ms as u64,
        });
    }

    Ok(records)
}

/// Returns the head of a stream, or `None` if it has never been written
/// (or has been deleted).
pub fn stream_head(conn: &Connection, stream_id: &StreamId) -> Result<Option<StreamHead>> {
    let head = conn
        .query_row(
            "SELECT head_version, is_lockable FROM streams WHERE stream_id = ?",
            [stream_id.as_str()],
            |row| {
                Ok(StreamHead {
                    version: StreamRev::from_raw(row.get::<_, i64>(0)? as u64),
                    is_lockable: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(head)
}

/// Returns the head version, `StreamRev::NONE` for an unknown stream.
pub fn head_version(conn: &Connection, stream_id: &StreamId) -> Result<StreamRev> {
    Ok(stream_head(conn, stream_id)?
        .map(|h| h.version)
        .unwrap_or(StreamRev::NONE))
}

/// Returns the version of the stream's current snapshot.
pub fn snapshot_version(conn: &Connection, stream_id: &StreamId) -> Result<Option<StreamRev>> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM snapshots WHERE stream_id = ?",
            [stream_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(|v| StreamRev::from_raw(v as u64)))
}

// =============================================================================
// Timeline Reads
// =============================================================================

/// One sequenced event as stored, before decoding.
///
/// For a tombstone (`deleted`), only the position, stream, version and
/// commit sequence are meaningful; the remaining fields are empty.
#[derive(Debug, Clone)]
pub struct TimelineRow {
    pub position: GlobalPos,
    pub commit_seq: u64,
    pub stream_id: StreamId,
    pub version: StreamRev,
    pub deleted: bool,
    pub commit_id: String,
    pub created_ms: u64,
    /// Commit metadata. Only set on the commit's first event.
    pub metadata: Option<Vec<u8>>,
    pub contract_name: String,
    pub payload: Vec<u8>,
    pub checksum: Vec<u8>,
}

/// Reads up to `limit` sequenced positions after `after`.
///
/// With `contracts`, only commits containing at least one event of a listed
/// contract are returned (all of their events, not just the matching ones).
/// `None` or an empty list means no restriction. Tombstones of deleted
/// streams are returned whatever the filter, since their contracts are gone.
///
/// A `limit` of zero returns nothing. `after` must fit SQLite's signed
/// integer range.
pub fn read_timeline(
    conn: &Connection,
    after: GlobalPos,
    contracts: Option<&[String]>,
    limit: usize,
) -> Result<Vec<TimelineRow>> {
    let after = i64::try_from(after.as_raw())
        .map_err(|_| Error::PositionOutOfRange(after.as_raw()))?;
    if limit == 0 {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT g.position, g.commit_seq, g.stream_id, g.version, g.deleted,
                COALESCE(c.commit_id, ''), COALESCE(c.created_ms, 0),
                CASE WHEN g.version = c.first_version THEN c.metadata END,
                COALESCE(e.contract_name, ''), COALESCE(e.payload, x''), COALESCE(e.checksum, x'')
         FROM global_sequence g
         LEFT JOIN events e
             ON e.stream_id = g.stream_id AND e.version = g.version AND e.commit_seq = g.commit_seq
         LEFT JOIN commits c ON c.commit_seq = g.commit_seq
         WHERE g.position > ?",
    );
    let mut values: Vec<Value> = vec![Value::Integer(after)];

    if let Some(names) = contracts.filter(|names| !names.is_empty()) {
        let placeholders = vec!["?"; names.len()].join(", ");
        sql.push_str(&format!(
            " AND (g.deleted = 1 OR EXISTS (SELECT 1 FROM events f
                          WHERE f.commit_seq = g.commit_seq AND f.contract_name IN ({placeholders})))"
        ));
        values.extend(names.iter().map(|n| Value::Text(n.clone())));
    }

    sql.push_str(" ORDER BY g.position LIMIT ?");
    values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), |row| {
        Ok(TimelineRow {
            position: GlobalPos::from_raw(row.get::<_, i64>(0)? as u64),
            commit_seq: row.get::<_, i64>(1)? as u64,
            stream_id: StreamId::new(row.get::<_, String>(2)?),
            version: StreamRev::from_raw(row.get::<_, i64>(3)? as u64),
            deleted: row.get(4)?,
            commit_id: row.get(5)?,
            created_ms: row.get::<_, i64>(6)? as u64,
            metadata: row.get(7)?,
            contract_name: row.get(8)?,
            payload: row.get(9)?,
            checksum: row.get(10)?,
        })
    })?;

    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

// =============================================================================
// Reader Pool
// =============================================================================

/// A request handled by a pooled reader thread.
pub enum ReadRequest {
    LoadStream {
        stream_id: StreamId,
        from_version: StreamRev,
        response: oneshot::Sender<Result<Vec<RecordedEvent>>>,
    },
    StreamHead {
        stream_id: StreamId,
        response: oneshot::Sender<Result<Option<StreamHead>>>,
    },
    Timeline {
        after: GlobalPos,
        contracts: Option<Vec<String>>,
        limit: usize,
        response: oneshot::Sender<Result<Vec<TimelineRow>>>,
    },
    Progress {
        response: oneshot::Sender<Result<LinearizerProgress>>,
    },
    FindSubscription {
        name: String,
        response: oneshot::Sender<Result<Option<Subscription>>>,
    },
    GetSubscription {
        id: SubscriptionId,
        response: oneshot::Sender<Result<Option<Subscription>>>,
    },
    ListSubscriptions {
        response: oneshot::Sender<Result<Vec<Subscription>>>,
    },
    Shutdown,
}

/// Serves read requests until shutdown. Threads share the receiver and
/// compete for requests (simple load balancing).
fn run_reader_pooled(conn: Connection, rx: Arc<std::sync::Mutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = match rx.lock() {
            Ok(mut guard) => guard.blocking_recv(),
            Err(_) => {
                tracing::error!("reader receiver mutex poisoned");
                break;
            }
        };

        match request {
            Some(ReadRequest::LoadStream {
                stream_id,
                from_version,
                response,
            }) => {
                let _ = response.send(load_stream(&conn, &stream_id, from_version));
            }
            Some(ReadRequest::StreamHead {
                stream_id,
                response,
            }) => {
                let _ = response.send(stream_head(&conn, &stream_id));
            }
            Some(ReadRequest::Timeline {
                after,
                contracts,
                limit,
                response,
            }) => {
                let _ = response.send(read_timeline(&conn, after, contracts.as_deref(), limit));
            }
            Some(ReadRequest::Progress { response }) => {
                let _ = response.send(linearizer::read_progress(&conn));
            }
            Some(ReadRequest::FindSubscription { name, response }) => {
                let _ = response.send(subscription::find_by_name(&conn, &name));
            }
            Some(ReadRequest::GetSubscription { id, response }) => {
                let _ = response.send(subscription::find(&conn, id));
            }
            Some(ReadRequest::ListSubscriptions { response }) => {
                let _ = response.send(subscription::list(&conn));
            }
            Some(ReadRequest::Shutdown) | None => break,
        }
    }
}

/// A pool of reader threads, each owning a read-only connection.
#[derive(Clone)]
pub struct ReaderPool {
    tx: mpsc::Sender<ReadRequest>,
    handles: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
    count: usize,
}

impl ReaderPool {
    /// Opens `count` read-only connections to `path` and spawns one thread per
    /// connection.
    ///
    /// The database must already be initialized (opened read-write once).
    pub fn spawn(path: &Path, count: usize, busy_timeout: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let rx = Arc::new(std::sync::Mutex::new(rx));
        let count = count.max(1);
        let mut handles = Vec::with_capacity(count);

        for i in 0..count {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(busy_timeout)?;

            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("eventline-reader-{}", i))
                .spawn(move || run_reader_pooled(conn, rx))
                .map_err(|e| Error::Schema(format!("failed to spawn reader thread: {}", e)))?;
            handles.push(handle);
        }

        tracing::debug!(readers = count, "reader pool started");

        Ok(Self {
            tx,
            handles: Arc::new(std::sync::Mutex::new(handles)),
            count,
        })
    }

    /// Number of reader threads.
    pub fn count(&self) -> usize {
        self.count
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ReadRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::Schema("reader pool has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Schema("reader dropped response".to_string()))?
    }

    pub async fn load_stream(
        &self,
        stream_id: StreamId,
        from_version: StreamRev,
    ) -> Result<Vec<RecordedEvent>> {
        self.request(|response| ReadRequest::LoadStream {
            stream_id,
            from_version,
            response,
        })
        .await
    }

    pub async fn stream_head(&self, stream_id: StreamId) -> Result<Option<StreamHead>> {
        self.request(|response| ReadRequest::StreamHead {
            stream_id,
            response,
        })
        .await
    }

    pub async fn timeline(
        &self,
        after: GlobalPos,
        contracts: Option<Vec<String>>,
        limit: usize,
    ) -> Result<Vec<TimelineRow>> {
        self.request(|response| ReadRequest::Timeline {
            after,
            contracts,
            limit,
            response,
        })
        .await
    }

    pub async fn progress(&self) -> Result<LinearizerProgress> {
        self.request(|response| ReadRequest::Progress { response })
            .await
    }

    pub async fn find_subscription(&self, name: String) -> Result<Option<Subscription>> {
        self.request(|response| ReadRequest::FindSubscription { name, response })
            .await
    }

    pub async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.request(|response| ReadRequest::GetSubscription { id, response })
            .await
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.request(|response| ReadRequest::ListSubscriptions { response })
            .await
    }

    /// Stops every reader thread and waits for them to exit.
    pub async fn shutdown(&self) {
        for _ in 0..self.count {
            let _ = self.tx.send(ReadRequest::Shutdown).await;
        }

        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        let _ = tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await;
    }
}

// =============================================================================
// Tests
// =============================================================================
