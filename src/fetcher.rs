//! # Subscription Fetcher
//!
//! Turns sequenced timeline rows into typed envelopes:
//!
//! ```text
//!   TimelineRow ──checksum──► registry.resolve ──► serializer ──► up-convert ──► EventEnvelope
//! ```
//!
//! A row that fails any step becomes a [`FetchedEvent::Failed`] at its
//! position. The rest of the batch is still delivered, so the consumer chooses
//! whether to skip the bad row or halt. A position whose stream was deleted
//! arrives as [`FetchedEvent::Deleted`], so positions stay contiguous.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::warn;

use crate::codec::{decode_metadata, verify_checksum, JsonSerializer, Serializer};
use crate::contracts::{ContractRegistry, Event};
use crate::error::{Error, Result};
use crate::reader::TimelineRow;
use crate::types::{CommitId, GlobalPos, Metadata, StreamId, StreamRev, SubscriptionId};
use crate::upconvert::UpConverterRegistry;

/// Default number of rows returned by one fetch.
pub const DEFAULT_FETCH_LIMIT: usize = 1000;

// =============================================================================
// Filter
// =============================================================================

/// Which commits a fetch returns.
///
/// Filtering is per commit: a commit matches if any of its events has a
/// listed contract, and then all of its events are returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractFilter {
    /// Every commit.
    All,
    /// Commits containing one of these contracts. An empty set means all.
    Contracts(BTreeSet<String>),
    /// The contract set stored for a subscription. No contracts means all.
    Subscription(SubscriptionId),
}

impl ContractFilter {
    /// Builds a filter from contract names.
    pub fn contracts<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ContractFilter::Contracts(names.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// Envelopes
// =============================================================================

/// A delivered event with its position and commit context.
#[derive(Debug)]
pub struct EventEnvelope {
    pub stream_id: StreamId,
    pub commit_id: CommitId,
    pub created_ms: u64,
    pub global_position: GlobalPos,
    pub version: StreamRev,
    /// The event, already up-converted to its current contract.
    pub event: Box<dyn Event>,
    /// Commit metadata on the commit's first event, empty on the others.
    pub metadata: Metadata,
}

/// A row that could not be turned into an envelope.
#[derive(Debug)]
pub struct FailedEvent {
    pub global_position: GlobalPos,
    pub stream_id: StreamId,
    pub version: StreamRev,
    pub contract_name: String,
    pub error: Error,
}

/// Placeholder for a position whose stream was deleted after sequencing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedEvent {
    pub global_position: GlobalPos,
    pub stream_id: StreamId,
    pub version: StreamRev,
}

/// One fetched row.
#[derive(Debug)]
pub enum FetchedEvent {
    Delivered(EventEnvelope),
    Failed(FailedEvent),
    Deleted(DeletedEvent),
}

impl FetchedEvent {
    /// Position of the row in the global sequence.
    pub fn position(&self) -> GlobalPos {
        match self {
            FetchedEvent::Delivered(envelope) => envelope.global_position,
            FetchedEvent::Failed(failed) => failed.global_position,
            FetchedEvent::Deleted(deleted) => deleted.global_position,
        }
    }

    pub fn envelope(&self) -> Option<&EventEnvelope> {
        match self {
            FetchedEvent::Delivered(envelope) => Some(envelope),
            FetchedEvent::Failed(_) | FetchedEvent::Deleted(_) => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, FetchedEvent::Deleted(_))
    }

    /// Converts into a plain result, for consumers that halt on anything but
    /// a delivered event. A tombstone becomes [`Error::StreamDeleted`].
    pub fn into_result(self) -> Result<EventEnvelope> {
        match self {
            FetchedEvent::Delivered(envelope) => Ok(envelope),
            FetchedEvent::Failed(failed) => Err(failed.error),
            FetchedEvent::Deleted(deleted) => Err(Error::StreamDeleted {
                stream_id: deleted.stream_id.to_string(),
                position: deleted.global_position.as_raw(),
            }),
        }
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// Decodes timeline rows with a contract registry, a serializer and an
/// up-converter chain.
#[derive(Clone)]
pub struct EventDecoder {
    contracts: Arc<ContractRegistry>,
    upconverters: Arc<UpConverterRegistry>,
    serializer: Arc<dyn Serializer>,
}

impl EventDecoder {
    pub fn new(contracts: ContractRegistry, upconverters: UpConverterRegistry) -> Self {
        Self::with_serializer(contracts, upconverters, Arc::new(JsonSerializer))
    }

    pub fn with_serializer(
        contracts: ContractRegistry,
        upconverters: UpConverterRegistry,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            contracts: Arc::new(contracts),
            upconverters: Arc::new(upconverters),
            serializer,
        }
    }

    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }

    /// Decodes rows in order. Never drops a row: each comes back delivered or
    /// failed.
    pub fn decode_rows(&self, rows: Vec<TimelineRow>) -> Vec<FetchedEvent> {
        rows.into_iter().map(|row| self.decode_row(row)).collect()
    }

    fn decode_row(&self, row: TimelineRow) -> FetchedEvent {
        if row.deleted {
            return FetchedEvent::Deleted(DeletedEvent {
                global_position: row.position,
                stream_id: row.stream_id,
                version: row.version,
            });
        }
        match self.decode_parts(&row) {
            Ok((event, metadata)) => FetchedEvent::Delivered(EventEnvelope {
                stream_id: row.stream_id,
                commit_id: CommitId::new(row.commit_id),
                created_ms: row.created_ms,
                global_position: row.position,
                version: row.version,
                event,
                metadata,
            }),
            Err(error) => {
                warn!(
                    position = row.position.as_raw(),
                    stream_id = %row.stream_id,
                    version = row.version.as_raw(),
                    contract = %row.contract_name,
                    error = %error,
                    "failed to decode fetched event"
                );
                FetchedEvent::Failed(FailedEvent {
                    global_position: row.position,
                    stream_id: row.stream_id,
                    version: row.version,
                    contract_name: row.contract_name,
                    error,
                })
            }
        }
    }

    fn decode_parts(&self, row: &TimelineRow) -> Result<(Box<dyn Event>, Metadata)> {
        verify_checksum(&row.payload, &row.checksum, || {
            format!("{}@{}", row.stream_id, row.version)
        })?;
        let event = self
            .contracts
            .decode(self.serializer.as_ref(), &row.contract_name, &row.payload)?;
        let event = self.upconverters.convert(event)?;
        let metadata = decode_metadata(row.metadata.as_deref())?;
        Ok((event, metadata))
    }
}

impl std::fmt::Debug for EventDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDecoder")
            .field("contracts", &self.contracts)
            .field("upconverters", &self.upconverters)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
