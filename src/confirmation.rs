//! Destination transaction confirmation tracking
//!
//! Follows `Submitted` records until their transaction is buried under the
//! destination's confirmation depth. A reverted or dropped transaction sends
//! the record back to the submitter with its transaction cleared, unless the
//! attempt budget is spent.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use chrono::Utc;
use eyre::{Result, WrapErr};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainClient, ChainPair};
use crate::claims::KeyClaims;
use crate::config::{Config, SubmitterConfig};
use crate::digest::SigningDomain;
use crate::error::{absorb_record_error, is_fatal};
use crate::ledger::{advance, Ledger, Transition};
use crate::metrics;
use crate::retry::RetryConfig;
use crate::types::{ChainSide, EventRecord, EventState, TxStatus};

/// Blocks a relay transaction needs on each destination chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationDepths {
    pub a: u64,
    pub b: u64,
}

impl ConfirmationDepths {
    pub fn from_config(config: &Config) -> Self {
        Self {
            a: config.chain_a.confirmation_depth,
            b: config.chain_b.confirmation_depth,
        }
    }

    pub fn get(&self, side: ChainSide) -> u64 {
        match side {
            ChainSide::A => self.a,
            ChainSide::B => self.b,
        }
    }
}

/// Confirmations of a transaction included at `block` when the head is `head`
pub fn confirmations(block: u64, head: u64) -> u64 {
    if head < block {
        0
    } else {
        head - block + 1
    }
}

pub struct ConfirmationTracker {
    ledger: Arc<dyn Ledger>,
    chains: ChainPair,
    domain: SigningDomain,
    depths: ConfirmationDepths,
    config: SubmitterConfig,
    retry: RetryConfig,
    claims: KeyClaims,
}

impl ConfirmationTracker {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        chains: ChainPair,
        domain: SigningDomain,
        depths: ConfirmationDepths,
        config: SubmitterConfig,
        claims: KeyClaims,
    ) -> Self {
        let retry = config.retry_config();
        Self {
            ledger,
            chains,
            domain,
            depths,
            config,
            retry,
            claims,
        }
    }

    /// Track in-flight relays until shutdown or a fatal error
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        info!(
            depth_a = self.depths.a,
            depth_b = self.depths.b,
            submission_timeout_secs = self.config.submission_timeout_secs,
            "Confirmation tracker starting"
        );

        loop {
            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping confirmation tracker");
                return Ok(());
            }

            match self.process_due().await {
                Ok(_) => {}
                Err(e) if is_fatal(&e) => {
                    error!(error = ?e, "Confirmation tracker halted");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Confirmation cycle failed");
                    metrics::record_error("confirmation", "cycle");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Check every in-flight relay once; returns how many were loaded
    pub async fn process_due(&self) -> Result<usize> {
        let records = self
            .ledger
            .in_flight_records(self.config.batch_size)
            .await
            .wrap_err("Failed to load in-flight relays")?;
        let loaded = records.len();

        let results: Vec<_> = stream::iter(records)
            .map(|record| async move {
                let key = record.key();
                (key, self.process_record(record).await)
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        for (key, result) in results {
            if let Err(e) = result {
                absorb_record_error("confirmation", key, e)?;
            }
        }
        Ok(loaded)
    }

    async fn process_record(&self, record: EventRecord) -> Result<()> {
        let key = record.key();
        let Some(tx_hash) = record.dest_tx_hash else {
            return Ok(());
        };
        let Some(_claim) = self.claims.try_claim(key) else {
            return Ok(());
        };

        let destination_side = key.source_chain.opposite();
        let destination = self.chains.get(destination_side);
        let status = destination
            .transaction_status(tx_hash)
            .await
            .wrap_err_with(|| format!("Failed to read status of {}", tx_hash))?;

        match status {
            TxStatus::Included { block } => {
                let head = destination.head().await?;
                let depth = confirmations(block, head);
                let required = self.depths.get(destination_side);
                if depth < required {
                    debug!(
                        key = %key,
                        tx_hash = %tx_hash,
                        depth,
                        required,
                        "Awaiting confirmations"
                    );
                    return Ok(());
                }

                advance(
                    self.ledger.as_ref(),
                    &key,
                    Transition::new(EventState::Submitted, EventState::Confirmed),
                )
                .await?;
                let latency = (Utc::now() - record.event.observed_at)
                    .to_std()
                    .unwrap_or_default();
                metrics::record_relay_latency(
                    &format!("{}_to_{}", key.source_chain, destination_side),
                    latency.as_secs_f64(),
                );
                info!(
                    key = %key,
                    tx_hash = %tx_hash,
                    block,
                    confirmations = depth,
                    latency_secs = latency.as_secs(),
                    "Relay confirmed"
                );
            }
            TxStatus::Pending => {
                debug!(key = %key, tx_hash = %tx_hash, "Relay transaction pending");
            }
            TxStatus::Reverted { block } => {
                let reason = format!("relay transaction {} reverted in block {}", tx_hash, block);
                self.retry_or_fail(&record, destination.as_ref(), tx_hash, reason)
                    .await?;
            }
            TxStatus::NotFound => {
                let sent_at = record.last_attempt_at.unwrap_or(record.updated_at);
                let waited = Utc::now() - sent_at;
                let timeout = chrono::Duration::try_seconds(
                    i64::try_from(self.config.submission_timeout_secs).unwrap_or(i64::MAX),
                )
                .unwrap_or(chrono::Duration::MAX);
                if waited < timeout {
                    debug!(key = %key, tx_hash = %tx_hash, "Relay transaction not seen yet");
                    return Ok(());
                }
                let reason = format!(
                    "relay transaction {} not found {}s after submission",
                    tx_hash,
                    waited.num_seconds()
                );
                self.retry_or_fail(&record, destination.as_ref(), tx_hash, reason)
                    .await?;
            }
        }
        Ok(())
    }

    /// Handle a transaction that will never confirm
    async fn retry_or_fail(
        &self,
        record: &EventRecord,
        destination: &dyn ChainClient,
        tx_hash: B256,
        reason: String,
    ) -> Result<()> {
        let key = record.key();

        // Another transaction may have completed the relay in the meantime
        let source_chain_id = self.domain.chain_id(key.source_chain);
        let completed = match destination.find_completed(&key, source_chain_id).await {
            Ok(completed) => completed,
            Err(e) => {
                // The submitter repeats the lookup before any resubmission
                warn!(key = %key, error = %e, "Relay lookup failed, continuing");
                metrics::record_error("confirmation", "relay_lookup");
                None
            }
        };
        if let Some(completed) = completed {
            if completed != tx_hash {
                advance(
                    self.ledger.as_ref(),
                    &key,
                    Transition::new(EventState::Submitted, EventState::Submitted)
                        .with_dest_tx(completed),
                )
                .await?;
                info!(key = %key, tx_hash = %completed, "Relay completed by another transaction");
                return Ok(());
            }
        }

        metrics::record_relay_submitted(destination.name(), false);
        if !self.retry.should_retry(record.attempts) {
            advance(
                self.ledger.as_ref(),
                &key,
                Transition::new(EventState::Submitted, EventState::Failed)
                    .with_error(reason.clone()),
            )
            .await?;
            error!(
                key = %key,
                attempts = record.attempts,
                error = %reason,
                "Relay failed permanently, operator intervention required"
            );
            metrics::record_alert("relay_failed");
            return Ok(());
        }

        let retry_at = self.retry.next_retry_after(Utc::now(), record.attempts);
        advance(
            self.ledger.as_ref(),
            &key,
            Transition::new(EventState::Submitted, EventState::Submitted)
                .clear_dest_tx()
                .retry_after(retry_at)
                .with_error(reason.clone()),
        )
        .await?;
        warn!(
            key = %key,
            error = %reason,
            attempts = record.attempts,
            retry_at = %retry_at,
            "Relay transaction will not confirm, scheduling resubmission"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmations() {
        assert_eq!(confirmations(100, 100), 1);
        assert_eq!(confirmations(100, 111), 12);
        // Head from a lagging node
        assert_eq!(confirmations(100, 99), 0);
    }

    #[test]
    fn test_depth_per_destination() {
        let depths = ConfirmationDepths { a: 12, b: 3 };
        assert_eq!(depths.get(ChainSide::A), 12);
        assert_eq!(depths.get(ChainSide::B), 3);
    }
}
