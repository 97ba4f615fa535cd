//! Chain watcher
//!
//! One watcher per chain scans finalized blocks for bridge events and commits
//! them to the ledger together with the new checkpoint. The checkpoint block
//! hash is re-read on every cycle so a reorganisation below the finality depth
//! halts the relayer instead of being silently rescanned.

use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chain::ChainClient;
use crate::config::ChainConfig;
use crate::error::{is_fatal, RelayerError};
use crate::ledger::Ledger;
use crate::metrics;
use crate::retry::RetryConfig;
use crate::status::StatusBoard;
use crate::types::{ChainSide, Checkpoint};

/// Result of one poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing final beyond the checkpoint yet
    Idle { head: u64 },
    /// A block range was scanned and committed
    Scanned {
        from: u64,
        to: u64,
        safe_head: u64,
        inserted: usize,
    },
}

/// Next block range to scan, if any block past the checkpoint is final
pub fn next_scan_range(
    checkpoint: Option<&Checkpoint>,
    start_block: u64,
    head: u64,
    finality_depth: u64,
    max_block_range: u64,
) -> Option<(u64, u64)> {
    let safe_head = head.checked_sub(finality_depth)?;
    let from = checkpoint.map_or(start_block, |cp| cp.height + 1);
    if from > safe_head {
        return None;
    }
    let to = safe_head.min(from.saturating_add(max_block_range.max(1) - 1));
    Some((from, to))
}

/// Watches one chain for finalized bridge events
pub struct ChainWatcher {
    chain: Arc<dyn ChainClient>,
    ledger: Arc<dyn Ledger>,
    finality_depth: u64,
    poll_interval: Duration,
    max_block_range: u64,
    start_block: u64,
    /// RPC failures back off with this policy; attempts are unbounded
    backoff: RetryConfig,
    status: StatusBoard,
}

impl ChainWatcher {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        ledger: Arc<dyn Ledger>,
        config: &ChainConfig,
        status: StatusBoard,
    ) -> Self {
        Self {
            chain,
            ledger,
            finality_depth: config.finality_depth,
            poll_interval: config.poll_interval(),
            max_block_range: config.max_block_range,
            start_block: config.start_block,
            backoff: RetryConfig {
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(60),
                ..RetryConfig::default()
            },
            status,
        }
    }

    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn side(&self) -> ChainSide {
        self.chain.side()
    }

    /// Resume from the checkpoint stored in the ledger and watch until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let checkpoint = self
            .ledger
            .checkpoint(self.side())
            .await
            .wrap_err_with(|| format!("Failed to load checkpoint for chain {}", self.side()))?;
        self.start(checkpoint, shutdown).await
    }

    /// Watch from `from_checkpoint + 1` until shutdown or a fatal error
    ///
    /// Shutdown is only observed between cycles, so a range that is being
    /// committed always finishes first.
    pub async fn start(
        &self,
        from_checkpoint: Option<Checkpoint>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let name = self.chain.name().to_string();
        self.status.register_chain(self.side(), &name).await;

        info!(
            chain = %name,
            checkpoint = ?from_checkpoint.map(|cp| cp.height),
            start_block = self.start_block,
            finality_depth = self.finality_depth,
            "Chain watcher starting"
        );

        let mut checkpoint = from_checkpoint;
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                info!(chain = %name, "Shutdown signal received, stopping watcher");
                return Ok(());
            }

            let delay = match self.poll_once(&mut checkpoint).await {
                Ok(PollOutcome::Scanned { to, safe_head, .. }) => {
                    failures = 0;
                    // Keep going without waiting while catching up
                    if to < safe_head {
                        Duration::ZERO
                    } else {
                        self.poll_interval
                    }
                }
                Ok(PollOutcome::Idle { .. }) => {
                    failures = 0;
                    self.poll_interval
                }
                Err(e) if is_fatal(&e) => {
                    error!(chain = %name, error = ?e, "Chain watcher halted");
                    return Err(e);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.status.record_poll_failure(self.side()).await;
                    metrics::record_error("watcher", "poll");
                    let backoff = self.backoff.jittered_backoff(failures - 1);
                    warn!(
                        chain = %name,
                        error = %e,
                        consecutive_failures = failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "Poll cycle failed, retrying"
                    );
                    backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Run one poll cycle, advancing `checkpoint` only after a successful commit
    pub async fn poll_once(&self, checkpoint: &mut Option<Checkpoint>) -> Result<PollOutcome> {
        let side = self.side();
        let name = self.chain.name();

        let head = self
            .chain
            .head()
            .await
            .wrap_err_with(|| format!("Failed to read head of chain {}", name))?;
        metrics::record_head(name, head);

        if let Some(cp) = checkpoint.as_ref() {
            self.verify_checkpoint(cp).await?;
        }

        let Some((from, to)) = next_scan_range(
            checkpoint.as_ref(),
            self.start_block,
            head,
            self.finality_depth,
            self.max_block_range,
        ) else {
            debug!(chain = %name, head, "No finalized blocks past checkpoint");
            self.status
                .record_poll(side, head, checkpoint.map(|cp| cp.height))
                .await;
            metrics::record_successful_poll(name);
            return Ok(PollOutcome::Idle { head });
        };
        let safe_head = head - self.finality_depth;

        let events = self
            .chain
            .bridge_events(from, to)
            .await
            .wrap_err_with(|| {
                format!(
                    "Failed to fetch bridge events {}..={} on {}",
                    from, to, name
                )
            })?;
        let block_hash = self
            .chain
            .block_hash(to)
            .await
            .wrap_err_with(|| format!("Failed to read hash of block {} on {}", to, name))?
            .ok_or_else(|| eyre!("Block {} on {} is not available yet", to, name))?;

        let events: Vec<_> = events
            .into_iter()
            .filter(|event| {
                let in_range = event.source_chain == side
                    && (from..=to).contains(&event.source_block_height);
                if !in_range {
                    warn!(
                        chain = %name,
                        key = %event.key(),
                        block = event.source_block_height,
                        "Dropping event outside the scanned range"
                    );
                }
                in_range
            })
            .collect();

        let new_checkpoint = Checkpoint {
            height: to,
            block_hash,
        };
        let commit = self
            .ledger
            .commit_scan(side, &events, new_checkpoint)
            .await
            .wrap_err_with(|| format!("Failed to commit blocks {}..={} of {}", from, to, name))?;

        for event in events.iter().filter(|e| commit.inserted.contains(&e.key())) {
            info!(
                chain = %name,
                key = %event.key(),
                event_type = %event.event_type,
                nonce = event.nonce,
                amount = %event.amount,
                block = event.source_block_height,
                tx_hash = %event.source_tx_hash,
                "Observed bridge event"
            );
            metrics::record_event_observed(name, event.event_type.as_str());
        }
        for key in &commit.conflicts {
            error!(
                chain = %name,
                key = %key,
                "Event key already recorded with different content"
            );
            metrics::record_alert("event_conflict");
        }
        if !commit.duplicates.is_empty() {
            debug!(
                chain = %name,
                duplicates = commit.duplicates.len(),
                "Skipped events already in the ledger"
            );
        }

        *checkpoint = Some(new_checkpoint);
        metrics::record_scan(name, to - from + 1, to);
        metrics::record_successful_poll(name);
        self.status.record_poll(side, head, Some(to)).await;

        debug!(
            chain = %name,
            from_block = from,
            to_block = to,
            head,
            inserted = commit.inserted.len(),
            "Committed scanned range"
        );

        Ok(PollOutcome::Scanned {
            from,
            to,
            safe_head,
            inserted: commit.inserted.len(),
        })
    }

    async fn verify_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let name = self.chain.name();
        let found = self
            .chain
            .block_hash(checkpoint.height)
            .await
            .wrap_err_with(|| {
                format!(
                    "Failed to read hash of checkpoint block {} on {}",
                    checkpoint.height, name
                )
            })?
            .ok_or_else(|| {
                eyre!(
                    "Checkpoint block {} on {} is not available from the node",
                    checkpoint.height,
                    name
                )
            })?;

        if found == checkpoint.block_hash {
            return Ok(());
        }

        error!(
            chain = %name,
            height = checkpoint.height,
            expected = %checkpoint.block_hash,
            found = %found,
            "Checkpoint block hash changed; reorg beyond finality depth"
        );
        metrics::record_alert("reorg");
        Err(RelayerError::ReorgDetected {
            chain: self.side(),
            height: checkpoint.height,
            expected: checkpoint.block_hash,
            found: found.to_string(),
        }
        .into())
    }
}

/// Runs one watcher per chain
pub struct WatcherManager {
    watchers: Vec<ChainWatcher>,
}

impl WatcherManager {
    pub fn new(watchers: Vec<ChainWatcher>) -> Self {
        Self { watchers }
    }

    /// Run all watchers until shutdown; the first failure is returned
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut join_set = JoinSet::new();
        for watcher in self.watchers {
            let shutdown = shutdown.clone();
            join_set.spawn(async move { watcher.run(shutdown).await });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = ?e, "A watcher stopped with error");
                    return Err(e);
                }
                Err(e) => {
                    error!(error = %e, "A watcher task panicked");
                    return Err(eyre!("watcher task panicked: {}", e));
                }
            }
        }
        info!("All watchers stopped");
        Ok(())
    }
}
