//! Prometheus metrics for the bridge relayer
//!
//! Exposed on /metrics for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

use crate::types::EventState;

lazy_static! {
    // Ingestion
    pub static ref BLOCKS_SCANNED: CounterVec = register_counter_vec!(
        "relayer_blocks_scanned_total",
        "Total number of finalized blocks scanned",
        &["chain"]
    ).unwrap();

    pub static ref CHECKPOINT_HEIGHT: GaugeVec = register_gauge_vec!(
        "relayer_checkpoint_height",
        "Last fully processed block height",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_HEAD: GaugeVec = register_gauge_vec!(
        "relayer_chain_head",
        "Latest head height reported by the chain",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_events_observed_total",
        "Total number of new bridge events recorded",
        &["chain", "event_type"]
    ).unwrap();

    // Signatures
    pub static ref SIGNATURE_RESPONSES: CounterVec = register_counter_vec!(
        "relayer_signature_responses_total",
        "Validator signature responses by outcome",
        &["outcome"]
    ).unwrap();

    // Submission
    pub static ref RELAYS_SUBMITTED: CounterVec = register_counter_vec!(
        "relayer_relays_submitted_total",
        "Destination relay submissions by outcome",
        &["chain", "status"]
    ).unwrap();

    pub static ref RELAY_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_relay_latency_seconds",
        "Time from observation to confirmed relay",
        &["direction"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    // Record states
    pub static ref RECORDS_BY_STATE: GaugeVec = register_gauge_vec!(
        "relayer_records",
        "Number of event records per state",
        &["state"]
    ).unwrap();

    pub static ref STUCK_RECORDS: Gauge = register_gauge!(
        "relayer_stuck_records",
        "Non-terminal records not updated within the stuck threshold"
    ).unwrap();

    // Errors and alerts
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Total number of errors",
        &["component", "type"]
    ).unwrap();

    pub static ref ALERTS: CounterVec = register_counter_vec!(
        "relayer_alerts_total",
        "Conditions that need operator attention",
        &["kind"]
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();

    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "relayer_last_successful_poll_timestamp",
        "Unix timestamp of last successful poll",
        &["chain"]
    ).unwrap();
}

/// Record a committed scan range
pub fn record_scan(chain: &str, blocks: u64, checkpoint: u64) {
    BLOCKS_SCANNED
        .with_label_values(&[chain])
        .inc_by(blocks as f64);
    CHECKPOINT_HEIGHT
        .with_label_values(&[chain])
        .set(checkpoint as f64);
}

pub fn record_head(chain: &str, head: u64) {
    CHAIN_HEAD.with_label_values(&[chain]).set(head as f64);
}

pub fn record_event_observed(chain: &str, event_type: &str) {
    EVENTS_OBSERVED
        .with_label_values(&[chain, event_type])
        .inc();
}

pub fn record_signature_response(outcome: &str) {
    SIGNATURE_RESPONSES.with_label_values(&[outcome]).inc();
}

/// Record a relay submission
pub fn record_relay_submitted(chain: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    RELAYS_SUBMITTED.with_label_values(&[chain, status]).inc();
}

pub fn record_relay_latency(direction: &str, seconds: f64) {
    RELAY_LATENCY
        .with_label_values(&[direction])
        .observe(seconds);
}

pub fn set_records_in_state(state: EventState, count: i64) {
    RECORDS_BY_STATE
        .with_label_values(&[state.as_str()])
        .set(count as f64);
}

pub fn set_stuck_records(count: usize) {
    STUCK_RECORDS.set(count as f64);
}

pub fn record_error(component: &str, error_type: &str) {
    ERRORS.with_label_values(&[component, error_type]).inc();
}

/// Raise an operator alert (reorg, terminal failure, quorum shortfall)
pub fn record_alert(kind: &str) {
    ALERTS.with_label_values(&[kind]).inc();
}

/// Record a successful poll
pub fn record_successful_poll(chain: &str) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    LAST_SUCCESSFUL_POLL.with_label_values(&[chain]).set(now);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_counter_increments() {
        let before = ALERTS.with_label_values(&["test_alert"]).get();
        record_alert("test_alert");
        assert_eq!(ALERTS.with_label_values(&["test_alert"]).get(), before + 1.0);
    }

    #[test]
    fn test_state_gauge() {
        set_records_in_state(EventState::QuorumReached, 3);
        assert_eq!(
            RECORDS_BY_STATE
                .with_label_values(&["quorum_reached"])
                .get(),
            3.0
        );
    }
}
