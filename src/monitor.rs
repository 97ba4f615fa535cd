//! Periodic health checks over the ledger
//!
//! Refreshes the per-state gauges and reports records that have not moved for
//! longer than the stuck threshold. Read-only: records are never changed here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::{Result, WrapErr};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::MonitorConfig;
use crate::error::is_fatal;
use crate::ledger::Ledger;
use crate::metrics;
use crate::retry::earlier_by;
use crate::status::StatusBoard;
use crate::types::EventState;

/// Most stuck records listed individually per check
const STUCK_REPORT_LIMIT: i64 = 50;

/// Summary of one monitor pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub in_progress: i64,
    pub failed: i64,
    pub stuck: usize,
}

pub struct Monitor {
    ledger: Arc<dyn Ledger>,
    config: MonitorConfig,
    status: StatusBoard,
}

impl Monitor {
    pub fn new(ledger: Arc<dyn Ledger>, config: MonitorConfig, status: StatusBoard) -> Self {
        Self {
            ledger,
            config,
            status,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let interval = Duration::from_millis(self.config.interval_ms);
        info!(
            interval_ms = self.config.interval_ms,
            stuck_threshold_secs = self.config.stuck_threshold_secs,
            "Monitor starting"
        );

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.check_once().await {
                Ok(report) => {
                    if report.stuck > 0 {
                        warn!(
                            stuck = report.stuck,
                            in_progress = report.in_progress,
                            failed = report.failed,
                            "Stuck records detected"
                        );
                    }
                }
                Err(e) if is_fatal(&e) => {
                    error!(error = ?e, "Monitor halted");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Monitor check failed");
                    metrics::record_error("monitor", "check");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Refresh gauges and count stuck records
    pub async fn check_once(&self) -> Result<MonitorReport> {
        let counts = self
            .ledger
            .count_by_state()
            .await
            .wrap_err("Failed to count records by state")?;
        let mut report = MonitorReport::default();
        for (state, count) in &counts {
            metrics::set_records_in_state(*state, *count);
            if !state.is_terminal() {
                report.in_progress += count;
            }
        }
        report.failed = counts
            .get(&EventState::Failed)
            .copied()
            .unwrap_or(0);

        let threshold = Duration::from_secs(self.config.stuck_threshold_secs);
        let stale = self
            .ledger
            .stale_records(earlier_by(Utc::now(), threshold), STUCK_REPORT_LIMIT)
            .await
            .wrap_err("Failed to load stale records")?;
        for record in &stale {
            warn!(
                key = %record.key(),
                state = %record.state,
                attempts = record.attempts,
                signature_cycles = record.signature_cycles,
                updated_at = %record.updated_at,
                last_error = record.last_error.as_deref().unwrap_or(""),
                "Record has not progressed"
            );
        }
        report.stuck = stale.len();
        metrics::set_stuck_records(report.stuck);
        self.status.set_stuck_records(report.stuck).await;

        Ok(report)
    }
}
