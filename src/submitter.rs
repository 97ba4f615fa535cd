//! Relay action submitter
//!
//! Turns quorum-approved records into mint or release transactions on the
//! opposite chain. Before every broadcast the destination is checked for a
//! relay that already completed, so a crash between broadcast and the ledger
//! update is reconciled from chain state instead of producing a second
//! submission. The destination contract rejecting a used proof remains the
//! final guard.

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
use crate::config::SubmitterConfig;
use crate::digest::SigningDomain;
use crate::error::{absorb_record_error, is_fatal};
use crate::ledger::{advance, Ledger, Transition};
use crate::metrics;
use crate::retry::{classify_error, later_by, next_action, RetryAction, RetryConfig};
use crate::types::{EventRecord, EventState, RelayAction};
use crate::validators::ValidatorSet;

pub struct RelaySubmitter {
    ledger: Arc<dyn Ledger>,
    chains: ChainPair,
    validators: Arc<ValidatorSet>,
    domain: SigningDomain,
    config: SubmitterConfig,
    retry: RetryConfig,
    claims: KeyClaims,
}

impl RelaySubmitter {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        chains: ChainPair,
        validators: Arc<ValidatorSet>,
        domain: SigningDomain,
        config: SubmitterConfig,
        claims: KeyClaims,
    ) -> Self {
        let retry = config.retry_config();
        Self {
            ledger,
            chains,
            validators,
            domain,
            config,
            retry,
            claims,
        }
    }

    /// Submit approved relays until shutdown or a fatal error
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        info!(
            workers = self.config.workers,
            max_attempts = self.retry.max_attempts,
            "Relay submitter starting"
        );

        loop {
            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping relay submitter");
                return Ok(());
            }

            match self.process_due().await {
                Ok(0) => {}
                Ok(processed) => debug!(processed, "Submitter cycle complete"),
                Err(e) if is_fatal(&e) => {
                    error!(error = ?e, "Relay submitter halted");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Submitter cycle failed");
                    metrics::record_error("submitter", "cycle");
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

    /// Attempt every due unsent record once; returns how many were loaded
    pub async fn process_due(&self) -> Result<usize> {
        let records = self
            .ledger
            .unsent_records(Utc::now(), self.config.batch_size)
            .await
            .wrap_err("Failed to load records awaiting submission")?;
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
                absorb_record_error("submitter", key, e)?;
            }
        }
        Ok(loaded)
    }

    async fn process_record(&self, mut record: EventRecord) -> Result<()> {
        let key = record.key();
        let Some(_claim) = self.claims.try_claim(key) else {
            debug!(key = %key, "Record claimed by another worker");
            return Ok(());
        };

        let source_chain_id = self.domain.chain_id(key.source_chain);
        let destination = self.chains.get(key.source_chain.opposite());

        // Only signatures that still verify may be used as proof
        let digest = self.domain.digest(&record.event);
        let valid = self.validators.verified(digest, &record.signatures);
        if valid.len() < self.validators.threshold() {
            let message = format!(
                "only {} of {} required signatures verify",
                valid.len(),
                self.validators.threshold()
            );
            error!(key = %key, %message, "Refusing to submit relay without quorum");
            metrics::record_alert("quorum_missing");
            let retry_at = later_by(Utc::now(), self.retry.max_backoff);
            advance(
                self.ledger.as_ref(),
                &key,
                Transition::new(record.state, record.state)
                    .retry_after(retry_at)
                    .with_error(message),
            )
            .await?;
            return Ok(());
        }
        record.signatures = valid;

        // A failed lookup counts as a failed attempt so it backs off and stays bounded
        match destination.find_completed(&key, source_chain_id).await {
            Ok(Some(tx_hash)) => {
                self.record_completed(&record, tx_hash, false).await?;
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                metrics::record_error("submitter", "relay_lookup");
                let error = e.wrap_err(format!("Failed to look up relay for {}", key));
                return self
                    .handle_submit_error(&record, destination.as_ref(), source_chain_id, error)
                    .await;
            }
        }

        let action = match RelayAction::from_record(&record, source_chain_id) {
            Ok(action) => action,
            Err(e) => {
                return self.fail(&record, format!("{:#}", e), false).await;
            }
        };

        match destination.submit(&action).await {
            Ok(tx_hash) => {
                metrics::record_relay_submitted(destination.name(), true);
                advance(
                    self.ledger.as_ref(),
                    &key,
                    Transition::new(record.state, EventState::Submitted)
                        .with_dest_tx(tx_hash)
                        .count_attempt(),
                )
                .await?;
                info!(
                    key = %key,
                    kind = %action.kind,
                    destination = %destination.name(),
                    recipient = %action.recipient,
                    amount = %action.amount,
                    tx_hash = %tx_hash,
                    attempt = record.attempts + 1,
                    "Relay submitted"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_relay_submitted(destination.name(), false);
                self.handle_submit_error(&record, destination.as_ref(), source_chain_id, e)
                    .await
            }
        }
    }

    async fn handle_submit_error(
        &self,
        record: &EventRecord,
        destination: &dyn ChainClient,
        source_chain_id: u64,
        error: eyre::Report,
    ) -> Result<()> {
        let key = record.key();
        let attempts = record.attempts + 1;
        let message = format!("{:#}", error);
        let class = classify_error(&message);

        match next_action(&self.retry, attempts, &message, Utc::now()) {
            RetryAction::Reconcile => {
                info!(key = %key, "Destination reports relay already executed, reconciling");
                match destination.find_completed(&key, source_chain_id).await {
                    Ok(Some(tx_hash)) => self.record_completed(record, tx_hash, true).await,
                    Ok(None) => {
                        warn!(key = %key, "Relay reported as processed but not found yet");
                        self.retry_or_give_up(record, attempts, message).await
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Relay lookup failed during reconciliation");
                        metrics::record_error("submitter", "relay_lookup");
                        let message = format!("{}; relay lookup failed: {:#}", message, e);
                        self.retry_or_give_up(record, attempts, message).await
                    }
                }
            }
            RetryAction::RetryAt(retry_at) => {
                warn!(
                    key = %key,
                    error = %message,
                    error_class = class.as_str(),
                    attempt = attempts,
                    max_attempts = self.retry.max_attempts,
                    retry_at = %retry_at,
                    "Relay submission failed, will retry"
                );
                metrics::record_error("submitter", class.as_str());
                advance(
                    self.ledger.as_ref(),
                    &key,
                    Transition::new(record.state, record.state)
                        .count_attempt()
                        .retry_after(retry_at)
                        .with_error(message),
                )
                .await?;
                Ok(())
            }
            RetryAction::GiveUp => self.fail(record, message, true).await,
        }
    }

    /// Schedule another attempt, or fail the record once the budget is spent
    async fn retry_or_give_up(
        &self,
        record: &EventRecord,
        attempts: u32,
        message: String,
    ) -> Result<()> {
        if !self.retry.should_retry(attempts) {
            return self.fail(record, message, true).await;
        }
        let key = record.key();
        let retry_at = self.retry.next_retry_after(Utc::now(), attempts);
        debug!(
            key = %key,
            attempt = attempts,
            retry_at = %retry_at,
            "Reconciliation retry scheduled"
        );
        advance(
            self.ledger.as_ref(),
            &key,
            Transition::new(record.state, record.state)
                .count_attempt()
                .retry_after(retry_at)
                .with_error(message),
        )
        .await?;
        Ok(())
    }

    /// The relay already happened on the destination; track that transaction
    async fn record_completed(
        &self,
        record: &EventRecord,
        tx_hash: B256,
        count_attempt: bool,
    ) -> Result<()> {
        let key = record.key();
        let mut transition =
            Transition::new(record.state, EventState::Submitted).with_dest_tx(tx_hash);
        if count_attempt {
            transition = transition.count_attempt();
        }
        advance(self.ledger.as_ref(), &key, transition).await?;
        info!(key = %key, tx_hash = %tx_hash, "Found completed relay on destination");
        Ok(())
    }

    async fn fail(&self, record: &EventRecord, message: String, count_attempt: bool) -> Result<()> {
        let key = record.key();
        let mut transition =
            Transition::new(record.state, EventState::Failed).with_error(message.clone());
        if count_attempt {
            transition = transition.count_attempt();
        }
        advance(self.ledger.as_ref(), &key, transition).await?;
        error!(
            key = %key,
            attempts = record.attempts + u32::from(count_attempt),
            error = %message,
            "Relay failed permanently, operator intervention required"
        );
        metrics::record_alert("relay_failed");
        Ok(())
    }
}

