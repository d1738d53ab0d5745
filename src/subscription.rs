//! # Subscriptions
//!
//! Named subscriptions, their contract filters and checkpoints, plus a
//! pull-based poller that drives a handler over the global sequence.
//!
//! ## Pull Model
//!
//! ```text
//! ┌────────────┐  fetch(after = checkpoint)  ┌──────────────────┐
//! │  Consumer  │ ───────────────────────────►│  global_sequence │
//! │ (projection)│◄─────────────────────────── │  (linearized)    │
//! └─────┬──────┘      ordered envelopes       └──────────────────┘
//!       │
//!       │ store_checkpoint(last handled position)
//!       ▼
//! ┌────────────────┐
//! │ subscriptions  │  checkpoint only moves when the consumer says so
//! └────────────────┘
//! ```
//!
//! The store never advances a checkpoint on its own. A consumer may also move
//! it backwards to replay.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use crate::api::EventLine;
use crate::codec::current_time_ms;
use crate::error::{Error, Result};
use crate::fetcher::{ContractFilter, EventEnvelope, FetchedEvent, DEFAULT_FETCH_LIMIT};
use crate::types::{GlobalPos, SubscriptionId};

// =============================================================================
// Subscription Records
// =============================================================================

/// A named subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub name: String,
    /// Contract filter. Empty means every contract.
    pub contracts: Vec<String>,
    /// Last position the consumer reported as handled.
    pub checkpoint: GlobalPos,
    pub created_ms: u64,
}

/// Creates a subscription, or returns the id of the existing one with the
/// same name.
///
/// The subscription row and its contract rows are written in one
/// transaction. An existing subscription keeps its original filter.
pub fn create(conn: &mut Connection, name: &str, contracts: &[String]) -> Result<SubscriptionId> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing: Option<i64> = tx
        .query_row(
            "SELECT subscription_id FROM subscriptions WHERE name = ?",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(SubscriptionId::from_raw(id));
    }

    tx.execute(
        "INSERT INTO subscriptions (name, checkpoint, created_ms) VALUES (?, 0, ?)",
        params![name, current_time_ms() as i64],
    )?;
    let id = tx.last_insert_rowid();

    {
        let mut insert = tx.prepare_cached(
            "INSERT OR IGNORE INTO subscription_contracts (subscription_id, contract_name)
             VALUES (?, ?)",
        )?;
        for contract in contracts {
            insert.execute(params![id, contract])?;
        }
    }

    tx.commit()?;
    debug!(subscription_id = id, name, "subscription created");
    Ok(SubscriptionId::from_raw(id))
}

/// Deletes a subscription and its filter. Returns false if it didn't exist.
pub fn delete(conn: &mut Connection, id: SubscriptionId) -> Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "DELETE FROM subscription_contracts WHERE subscription_id = ?",
        [id.as_raw()],
    )?;
    let removed = tx.execute(
        "DELETE FROM subscriptions WHERE subscription_id = ?",
        [id.as_raw()],
    )?;
    tx.commit()?;
    Ok(removed > 0)
}

/// Stores a checkpoint. Moving it backwards is allowed.
pub fn store_checkpoint(conn: &Connection, id: SubscriptionId, checkpoint: GlobalPos) -> Result<()> {
    let raw = i64::try_from(checkpoint.as_raw())
        .map_err(|_| Error::PositionOutOfRange(checkpoint.as_raw()))?;
    let updated = conn.execute(
        "UPDATE subscriptions SET checkpoint = ? WHERE subscription_id = ?",
        params![raw, id.as_raw()],
    )?;
    if updated == 0 {
        return Err(Error::SubscriptionNotFound(id.as_raw()));
    }
    Ok(())
}

fn contracts_of(conn: &Connection, id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT contract_name FROM subscription_contracts
         WHERE subscription_id = ?
         ORDER BY contract_name",
    )?;
    let names = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(names)
}

fn select_one(conn: &Connection, clause: &str, key: &dyn rusqlite::ToSql) -> Result<Option<Subscription>> {
    let sql = format!(
        "SELECT subscription_id, name, checkpoint, created_ms FROM subscriptions WHERE {clause}"
    );
    let row: Option<(i64, String, i64, i64)> = conn
        .query_row(&sql, [key], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .optional()?;

    row.map(|(id, name, checkpoint, created_ms)| {
        Ok(Subscription {
            id: SubscriptionId::from_raw(id),
            name,
            contracts: contracts_of(conn, id)?,
            checkpoint: GlobalPos::from_raw(checkpoint as u64),
            created_ms: created_ms as u64,
        })
    })
    .transpose()
}

/// Looks a subscription up by name.
pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Subscription>> {
    select_one(conn, "name = ?", &name)
}

/// Looks a subscription up by id.
pub fn find(conn: &Connection, id: SubscriptionId) -> Result<Option<Subscription>> {
    select_one(conn, "subscription_id = ?", &id.as_raw())
}

/// Lists all subscriptions ordered by id.
pub fn list(conn: &Connection) -> Result<Vec<Subscription>> {
    let mut stmt = conn.prepare(
        "SELECT subscription_id, name, checkpoint, created_ms FROM subscriptions ORDER BY subscription_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, name, checkpoint, created_ms)| {
            Ok(Subscription {
                id: SubscriptionId::from_raw(id),
                name,
                contracts: contracts_of(conn, id)?,
                checkpoint: GlobalPos::from_raw(checkpoint as u64),
                created_ms: created_ms as u64,
            })
        })
        .collect()
}

// =============================================================================
// Poller
// =============================================================================

/// Handles delivered envelopes for a subscription.
pub trait EventHandler: Send {
    fn handle(&mut self, envelope: &EventEnvelope) -> Result<()>;
}

impl<F> EventHandler for F
where
    F: FnMut(&EventEnvelope) -> Result<()> + Send,
{
    fn handle(&mut self, envelope: &EventEnvelope) -> Result<()> {
        self(envelope)
    }
}

/// What [`SubscriptionPoller::dispatch`] does with a row that failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log it and move past it.
    Skip,
    /// Stop before it and return its error. The checkpoint stays on the last
    /// handled row.
    #[default]
    Halt,
}

/// Pulls events for one subscription, starting from its stored checkpoint.
pub struct SubscriptionPoller {
    db: EventLine,
    subscription: Subscription,
    checkpoint: GlobalPos,
    policy: FailurePolicy,
    batch_size: usize,
}

impl SubscriptionPoller {
    /// Creates (or reuses) the subscription `name` and positions the poller
    /// at its checkpoint.
    pub async fn open(db: &EventLine, name: &str, contracts: &[&str]) -> Result<Self> {
        let id = db.create_subscription(name, contracts).await?;
        Self::resume(db, id).await
    }

    /// Positions a poller at an existing subscription's checkpoint.
    pub async fn resume(db: &EventLine, id: SubscriptionId) -> Result<Self> {
        let subscription = db
            .subscription(id)
            .await?
            .ok_or(Error::SubscriptionNotFound(id.as_raw()))?;
        Ok(Self {
            db: db.clone(),
            checkpoint: subscription.checkpoint,
            subscription,
            policy: FailurePolicy::default(),
            batch_size: DEFAULT_FETCH_LIMIT,
        })
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Last acknowledged position.
    pub fn checkpoint(&self) -> GlobalPos {
        self.checkpoint
    }

    /// Fetches the next batch after the current checkpoint without moving it.
    pub async fn poll(&self) -> Result<Vec<FetchedEvent>> {
        self.db
            .fetch(
                ContractFilter::Subscription(self.subscription.id),
                self.checkpoint,
                self.batch_size,
            )
            .await
    }

    /// Persists `position` as handled and moves the poller there.
    pub async fn acknowledge(&mut self, position: GlobalPos) -> Result<()> {
        self.db
            .store_checkpoint(self.subscription.id, position)
            .await?;
        self.checkpoint = position;
        Ok(())
    }

    /// Fetches one batch, hands each delivered envelope to `handler` in order,
    /// and acknowledges the last handled position.
    ///
    /// Returns the number of envelopes handled. Tombstones of deleted streams
    /// are acknowledged without reaching the handler. A handler error stops
    /// the batch; rows before it stay acknowledged.
    pub async fn dispatch<H: EventHandler>(&mut self, handler: &mut H) -> Result<usize> {
        let batch = self.poll().await?;
        let mut handled = 0;
        let mut last = self.checkpoint;
        let mut outcome = Ok(());

        for fetched in batch {
            match fetched {
                FetchedEvent::Delivered(envelope) => {
                    if let Err(e) = handler.handle(&envelope) {
                        outcome = Err(e);
                        break;
                    }
                    handled += 1;
                    last = envelope.global_position;
                }
                FetchedEvent::Deleted(deleted) => {
                    debug!(
                        subscription = %self.subscription.name,
                        position = deleted.global_position.as_raw(),
                        stream_id = %deleted.stream_id,
                        "passing over event of a deleted stream"
                    );
                    last = deleted.global_position;
                }
                FetchedEvent::Failed(failed) => match self.policy {
                    FailurePolicy::Skip => {
                        warn!(
                            subscription = %self.subscription.name,
                            position = failed.global_position.as_raw(),
                            error = %failed.error,
                            "skipping event that failed to decode"
                        );
                        last = failed.global_position;
                    }
                    FailurePolicy::Halt => {
                        outcome = Err(failed.error);
                        break;
                    }
                },
            }
        }

        if last != self.checkpoint {
            self.acknowledge(last).await?;
        }
        outcome.map(|_| handled)
    }
}

// =============================================================================
// Tests
// =============================================================================
