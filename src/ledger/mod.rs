//! Persistent event ledger
//!
//! The ledger is the source of truth for every observed event and for the
//! per-chain scan checkpoints. Record updates are compare-and-set on the
//! current state, so a worker that lost a race gets
//! [`RelayerError::StaleRecord`](crate::error::RelayerError::StaleRecord)
//! instead of silently overwriting progress.

use std::collections::BTreeMap;

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Result;
use tracing::{debug, info};

use crate::error::RelayerError;
use crate::types::{
    BridgeEvent, ChainSide, Checkpoint, EventKey, EventRecord, EventState, ValidatorSignatureSet,
};

mod memory;
pub mod models;
mod postgres;

pub use memory::InMemoryLedger;
pub use postgres::PgLedger;

/// Outcome of committing one scanned block range
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanCommit {
    /// Events recorded for the first time
    pub inserted: Vec<EventKey>,
    /// Events already present with identical content
    pub duplicates: Vec<EventKey>,
    /// Keys already present with a different source transaction
    pub conflicts: Vec<EventKey>,
}

/// How a transition treats the destination transaction hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestTxUpdate {
    #[default]
    Keep,
    Set(B256),
    Clear,
}

/// A compare-and-set update of one record
///
/// `retry_after` and `last_error` are replaced on every transition, so a
/// transition that does not set them clears them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: EventState,
    pub to: EventState,
    pub signatures: Option<ValidatorSignatureSet>,
    pub dest_tx: DestTxUpdate,
    pub count_attempt: bool,
    pub count_signature_cycle: bool,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Transition {
    pub fn new(from: EventState, to: EventState) -> Self {
        Self {
            from,
            to,
            signatures: None,
            dest_tx: DestTxUpdate::Keep,
            count_attempt: false,
            count_signature_cycle: false,
            retry_after: None,
            last_error: None,
        }
    }

    pub fn with_signatures(mut self, signatures: ValidatorSignatureSet) -> Self {
        self.signatures = Some(signatures);
        self
    }

    pub fn with_dest_tx(mut self, tx_hash: B256) -> Self {
        self.dest_tx = DestTxUpdate::Set(tx_hash);
        self
    }

    pub fn clear_dest_tx(mut self) -> Self {
        self.dest_tx = DestTxUpdate::Clear;
        self
    }

    /// Count a destination submission attempt
    pub fn count_attempt(mut self) -> Self {
        self.count_attempt = true;
        self
    }

    pub fn count_signature_cycle(mut self) -> Self {
        self.count_signature_cycle = true;
        self
    }

    pub fn retry_after(mut self, at: DateTime<Utc>) -> Self {
        self.retry_after = Some(at);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Reject edges that are not part of the record state machine
    pub fn check_legal(&self, key: EventKey) -> Result<(), RelayerError> {
        if self.from.can_transition_to(self.to) {
            Ok(())
        } else {
            Err(RelayerError::InvalidTransition {
                key,
                from: self.from,
                to: self.to,
            })
        }
    }

    /// Apply the update to an in-memory copy of the record
    pub fn apply_to(&self, record: &mut EventRecord, now: DateTime<Utc>) {
        record.state = self.to;
        if let Some(signatures) = &self.signatures {
            record.signatures = signatures.clone();
        }
        match self.dest_tx {
            DestTxUpdate::Keep => {}
            DestTxUpdate::Set(hash) => record.dest_tx_hash = Some(hash),
            DestTxUpdate::Clear => record.dest_tx_hash = None,
        }
        if self.count_attempt {
            record.attempts += 1;
        }
        if self.count_signature_cycle {
            record.signature_cycles += 1;
        }
        if self.count_attempt || self.count_signature_cycle {
            record.last_attempt_at = Some(now);
        }
        record.retry_after = self.retry_after;
        record.last_error = self.last_error.clone();
        record.updated_at = now;
    }
}

/// Filter for record queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub state: Option<EventState>,
    pub source_chain: Option<ChainSide>,
    /// Inclusive lower bound on observation time
    pub observed_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on observation time
    pub observed_to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self {
            state: None,
            source_chain: None,
            observed_from: None,
            observed_to: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl RecordFilter {
    pub fn matches(&self, record: &EventRecord) -> bool {
        self.state.map_or(true, |s| record.state == s)
            && self
                .source_chain
                .map_or(true, |c| record.event.source_chain == c)
            && self
                .observed_from
                .map_or(true, |from| record.event.observed_at >= from)
            && self
                .observed_to
                .map_or(true, |to| record.event.observed_at < to)
    }
}

/// Durable storage for event records and scan checkpoints
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Last committed checkpoint of a chain, if it was ever scanned
    async fn checkpoint(&self, chain: ChainSide) -> Result<Option<Checkpoint>>;

    /// Record the events of a scanned range and advance the checkpoint atomically
    ///
    /// Events whose key already exists are left untouched. The checkpoint never
    /// moves backwards.
    async fn commit_scan(
        &self,
        chain: ChainSide,
        events: &[BridgeEvent],
        checkpoint: Checkpoint,
    ) -> Result<ScanCommit>;

    async fn get(&self, key: &EventKey) -> Result<Option<EventRecord>>;

    /// Apply a transition if the record is still in `transition.from`
    async fn transition(&self, key: &EventKey, transition: Transition) -> Result<EventRecord>;

    /// Records in any of `states` that are due at `now`, oldest observation first
    async fn due_records(
        &self,
        states: &[EventState],
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRecord>>;

    /// Records waiting for a destination transaction, oldest observation first
    ///
    /// These are due `QuorumReached` records and due `Submitted` records whose
    /// previous transaction was cleared after a revert or drop.
    async fn unsent_records(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<EventRecord>>;

    /// `Submitted` records with a destination transaction, least recently attempted first
    async fn in_flight_records(&self, limit: i64) -> Result<Vec<EventRecord>>;

    /// Records matching a filter, newest observation first
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<EventRecord>>;

    async fn count_by_state(&self) -> Result<BTreeMap<EventState, i64>>;

    /// Non-terminal records not updated since `before`
    async fn stale_records(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<EventRecord>>;
}

/// Apply a transition and log the state change
pub async fn advance(
    ledger: &dyn Ledger,
    key: &EventKey,
    transition: Transition,
) -> Result<EventRecord> {
    let (from, to) = (transition.from, transition.to);
    let record = ledger.transition(key, transition).await?;
    if from == to {
        debug!(key = %key, state = %to, attempts = record.attempts, "Record updated");
    } else {
        info!(key = %key, from = %from, to = %to, "Record state changed");
    }
    Ok(record)
}
