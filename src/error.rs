//! Error kinds that change relayer control flow
//!
//! Most fallible paths return `eyre::Result` with context. The variants here
//! are the ones a caller has to recognise after the fact: fatal conditions
//! that stop the whole process, and ledger transition conflicts.

use alloy::primitives::B256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics;
use crate::types::{ChainSide, EventKey, EventState};

#[derive(Debug, Error)]
pub enum RelayerError {
    /// The durable ledger could not be read or written
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A block at or below the checkpoint changed hash after it was scanned
    #[error(
        "reorg detected on chain {chain} at height {height}: expected {expected}, found {found}"
    )]
    ReorgDetected {
        chain: ChainSide,
        height: u64,
        expected: B256,
        found: String,
    },

    /// The requested transition is not an edge of the record state machine
    #[error("illegal transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: EventKey,
        from: EventState,
        to: EventState,
    },

    /// The record was not in the state the caller expected (another writer won)
    #[error("record {key} is no longer {expected}")]
    StaleRecord { key: EventKey, expected: EventState },

    #[error("record {0} not found")]
    RecordNotFound(EventKey),

    /// A checkpoint write would move backwards
    #[error("checkpoint for chain {chain} cannot move from {current} back to {requested}")]
    CheckpointRegression {
        chain: ChainSide,
        current: u64,
        requested: u64,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayerError {
    /// Fatal errors halt ingestion and submission for the whole process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayerError::StorageUnavailable(_)
                | RelayerError::ReorgDetected { .. }
                | RelayerError::CheckpointRegression { .. }
        )
    }
}

/// Check whether a report carries a fatal [`RelayerError`] anywhere in its chain
pub fn is_fatal(report: &eyre::Report) -> bool {
    report
        .chain()
        .filter_map(|cause| cause.downcast_ref::<RelayerError>())
        .any(RelayerError::is_fatal)
        || report
            .downcast_ref::<RelayerError>()
            .is_some_and(RelayerError::is_fatal)
}

/// Check whether a report is a lost compare-and-set on a ledger record
pub fn is_stale(report: &eyre::Report) -> bool {
    report
        .downcast_ref::<RelayerError>()
        .is_some_and(|e| matches!(e, RelayerError::StaleRecord { .. }))
}

/// Absorb a per-record failure inside a worker batch
///
/// Fatal errors are handed back so the worker stops. A lost compare-and-set
/// means someone else advanced the record, which is not an error.
pub fn absorb_record_error(
    component: &str,
    key: EventKey,
    report: eyre::Report,
) -> eyre::Result<()> {
    if is_fatal(&report) {
        return Err(report);
    }
    if is_stale(&report) {
        debug!(component, key = %key, "Record advanced elsewhere, skipping");
        return Ok(());
    }
    warn!(component, key = %key, error = %report, "Record processing failed");
    metrics::record_error(component, "record");
    Ok(())
}
