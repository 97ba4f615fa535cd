//! Validator signature coordinator
//!
//! Drives observed records to quorum. Each cycle loads the records that are
//! waiting for signatures, asks the validators that have not signed yet, and
//! persists whatever verified signatures came back. A record that keeps
//! falling short moves to `SignatureTimeout` and is retried on a slower
//! cadence; it is never dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::{Result, WrapErr};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::claims::KeyClaims;
use crate::config::CoordinatorConfig;
use crate::digest::SigningDomain;
use crate::error::{absorb_record_error, is_fatal};
use crate::ledger::{advance, Ledger, Transition};
use crate::metrics;
use crate::retry::later_by;
use crate::types::{EventRecord, EventState};
use crate::validators::ValidatorSet;

/// States the coordinator picks records up from
const COLLECTING: [EventState; 3] = [
    EventState::Observed,
    EventState::PendingSignatures,
    EventState::SignatureTimeout,
];

pub struct SignatureCoordinator {
    ledger: Arc<dyn Ledger>,
    validators: Arc<ValidatorSet>,
    domain: SigningDomain,
    config: CoordinatorConfig,
    claims: KeyClaims,
}

impl SignatureCoordinator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        validators: Arc<ValidatorSet>,
        domain: SigningDomain,
        config: CoordinatorConfig,
        claims: KeyClaims,
    ) -> Self {
        Self {
            ledger,
            validators,
            domain,
            config,
            claims,
        }
    }

    /// Poll for records awaiting signatures until shutdown or a fatal error
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        info!(
            validators = self.validators.len(),
            threshold = self.validators.threshold(),
            workers = self.config.workers,
            "Signature coordinator starting"
        );

        loop {
            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping signature coordinator");
                return Ok(());
            }

            match self.process_due().await {
                Ok(0) => {}
                Ok(processed) => debug!(processed, "Coordinator cycle complete"),
                Err(e) if is_fatal(&e) => {
                    error!(error = ?e, "Signature coordinator halted");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Coordinator cycle failed");
                    metrics::record_error("coordinator", "cycle");
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

    /// Run one collection round over every due record; returns how many were loaded
    pub async fn process_due(&self) -> Result<usize> {
        let records = self
            .ledger
            .due_records(&COLLECTING, Utc::now(), self.config.batch_size)
            .await
            .wrap_err("Failed to load records awaiting signatures")?;
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
                absorb_record_error("coordinator", key, e)?;
            }
        }
        Ok(loaded)
    }

    async fn process_record(&self, record: EventRecord) -> Result<()> {
        let key = record.key();
        let Some(_claim) = self.claims.try_claim(key) else {
            debug!(key = %key, "Record claimed by another worker");
            return Ok(());
        };

        let record = match record.state {
            EventState::Observed | EventState::SignatureTimeout => {
                if record.state == EventState::SignatureTimeout {
                    info!(
                        key = %key,
                        cycles = record.signature_cycles,
                        "Retrying signature collection after timeout"
                    );
                }
                advance(
                    self.ledger.as_ref(),
                    &key,
                    Transition::new(record.state, EventState::PendingSignatures)
                        .with_signatures(record.signatures.clone()),
                )
                .await?
            }
            _ => record,
        };

        let digest = self.domain.digest(&record.event);
        let outcome = self
            .validators
            .collect(digest, &record.event, &record.signatures)
            .await;
        let collected = outcome.signatures.len();
        let threshold = self.validators.threshold();

        debug!(
            key = %key,
            digest = %digest,
            collected,
            threshold,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected,
            unanswered = outcome.unanswered,
            "Signature round finished"
        );

        if collected >= threshold {
            advance(
                self.ledger.as_ref(),
                &key,
                Transition::new(EventState::PendingSignatures, EventState::QuorumReached)
                    .with_signatures(outcome.signatures)
                    .count_signature_cycle(),
            )
            .await?;
            info!(key = %key, signatures = collected, threshold, "Quorum reached");
            return Ok(());
        }

        let shortfall = format!(
            "{} of {} required signatures collected",
            collected, threshold
        );
        let cycles = record.signature_cycles + 1;

        if cycles >= self.config.max_signature_cycles {
            let retry_at = later_by(
                Utc::now(),
                Duration::from_millis(self.config.timeout_retry_ms),
            );
            advance(
                self.ledger.as_ref(),
                &key,
                Transition::new(EventState::PendingSignatures, EventState::SignatureTimeout)
                    .with_signatures(outcome.signatures)
                    .count_signature_cycle()
                    .retry_after(retry_at)
                    .with_error(shortfall.clone()),
            )
            .await?;
            warn!(
                key = %key,
                cycles,
                collected,
                threshold,
                retry_at = %retry_at,
                "Signature quorum not reached, record timed out"
            );
            metrics::record_alert("signature_timeout");
        } else {
            advance(
                self.ledger.as_ref(),
                &key,
                Transition::new(EventState::PendingSignatures, EventState::PendingSignatures)
                    .with_signatures(outcome.signatures)
                    .count_signature_cycle()
                    .with_error(shortfall),
            )
            .await?;
        }
        Ok(())
    }
}
