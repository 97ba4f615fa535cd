//! Retry and backoff policy
//!
//! Chain RPC reads retry forever with capped exponential backoff. Destination
//! submissions retry up to a bounded attempt count, with the next attempt time
//! persisted on the record so a restart honours it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::debug;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts allowed before a bounded operation gives up
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
    /// Fraction of the backoff added as random jitter (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed), without jitter
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Backoff for an attempt with random jitter added, still capped at max_backoff
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_for_attempt(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + extra).min(self.max_backoff.as_secs_f64()))
    }

    /// Check if another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Calculate the next retry time after `attempts` failed attempts
    pub fn next_retry_after(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        later_by(now, self.backoff_for_attempt(attempts.saturating_sub(1)))
    }
}

/// `now + delay`, saturating at the latest representable time
pub fn later_by(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - delay`, saturating at the earliest representable time
pub fn earlier_by(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_sub_signed(delay))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure (RPC timeout, network issues)
    Transient,
    /// Fee too low for the node to accept
    Underpriced,
    /// Sender nonce clashed with another pending transaction
    NonceConflict,
    /// The destination already executed this relay
    AlreadyProcessed,
    /// Deterministic failure such as a revert or bad parameters
    Permanent,
    /// Unknown error
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Underpriced => "underpriced",
            ErrorClass::NonceConflict => "nonce_conflict",
            ErrorClass::AlreadyProcessed => "already_processed",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    // Checked before reverts: contracts reject duplicates with a revert reason
    if error_lower.contains("already processed")
        || error_lower.contains("already been processed")
        || error_lower.contains("already relayed")
        || error_lower.contains("already executed")
    {
        return ErrorClass::AlreadyProcessed;
    }

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("underpriced")
        || error_lower.contains("gas price too low")
        || error_lower.contains("max fee per gas less than")
        || error_lower.contains("fee too low")
    {
        return ErrorClass::Underpriced;
    }

    if error_lower.contains("nonce too low")
        || error_lower.contains("nonce too high")
        || error_lower.contains("already known")
        || error_lower.contains("replacement transaction")
    {
        return ErrorClass::NonceConflict;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// What to do with a record after a failed submission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Try again no earlier than the given time
    RetryAt(DateTime<Utc>),
    /// Look the relay up on the destination instead of resubmitting
    ///
    /// Returned whatever the attempt count; the caller applies the budget if
    /// the relay cannot be found.
    Reconcile,
    /// Attempts exhausted; the record fails terminally
    GiveUp,
}

/// Decide the follow-up for a submission that failed with `error`
///
/// `attempts` counts every attempt made so far, including the one that failed.
pub fn next_action(
    config: &RetryConfig,
    attempts: u32,
    error: &str,
    now: DateTime<Utc>,
) -> RetryAction {
    let class = classify_error(error);
    if class == ErrorClass::AlreadyProcessed {
        return RetryAction::Reconcile;
    }
    if !config.should_retry(attempts) {
        return RetryAction::GiveUp;
    }

    let retry_at = match class {
        // A fresh fee estimate on the next attempt is usually enough
        ErrorClass::Underpriced => now + chrono::Duration::seconds(1),
        // Let pending transactions from this sender clear first
        ErrorClass::NonceConflict => later_by(now, config.max_backoff),
        _ => config.next_retry_after(now, attempts),
    };
    debug!(
        class = class.as_str(),
        attempts,
        retry_at = %retry_at,
        "Scheduling submission retry"
    );
    RetryAction::RetryAt(retry_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(16));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
        assert_eq!(config.backoff_for_attempt(500), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = RetryConfig::default();
        for attempt in 0..8 {
            let base = config.backoff_for_attempt(attempt);
            let jittered = config.jittered_backoff(attempt);
            assert!(jittered >= base);
            assert!(jittered <= config.max_backoff);
        }

        let no_jitter = RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(no_jitter.jittered_backoff(1), Duration::from_secs(4));
    }

    #[test]
    fn test_should_retry() {
        let config = RetryConfig::default();
        assert!(config.should_retry(0));
        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(
            classify_error("transaction underpriced"),
            ErrorClass::Underpriced
        );
        assert_eq!(classify_error("nonce too low"), ErrorClass::NonceConflict);
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(
            classify_error("execution reverted: already processed"),
            ErrorClass::AlreadyProcessed
        );
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }

    #[test]
    fn test_next_action() {
        let config = RetryConfig::default();
        let now = Utc::now();

        assert_eq!(
            next_action(&config, 1, "execution reverted", now),
            RetryAction::RetryAt(now + chrono::Duration::seconds(2))
        );
        assert_eq!(
            next_action(&config, 3, "connection reset", now),
            RetryAction::RetryAt(now + chrono::Duration::seconds(8))
        );
        assert_eq!(
            next_action(&config, 1, "nonce too low", now),
            RetryAction::RetryAt(now + chrono::Duration::seconds(60))
        );
        assert_eq!(
            next_action(&config, 5, "execution reverted", now),
            RetryAction::GiveUp
        );
        assert_eq!(
            next_action(&config, 5, "already processed", now),
            RetryAction::Reconcile
        );
    }

    #[test]
    fn test_time_offsets_saturate() {
        let now = Utc::now();
        assert_eq!(
            later_by(now, Duration::from_millis(1500)),
            now + chrono::Duration::milliseconds(1500)
        );
        assert_eq!(later_by(now, Duration::from_millis(u64::MAX)), DateTime::<Utc>::MAX_UTC);
        assert_eq!(earlier_by(now, Duration::from_secs(u64::MAX)), DateTime::<Utc>::MIN_UTC);
        assert_eq!(
            earlier_by(now, Duration::from_secs(60)),
            now - chrono::Duration::seconds(60)
        );
    }
}
