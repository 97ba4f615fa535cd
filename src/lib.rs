//! Bridge relayer
//!
//! Watches two chains for lock and burn events, collects an M-of-N validator
//! quorum over each event, and relays the matching mint or release to the
//! opposite chain. All progress lives in the ledger, so the process can stop
//! at any point and resume without losing or repeating a transfer.

pub mod api;
pub mod chain;
pub mod claims;
pub mod config;
pub mod confirmation;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod monitor;
pub mod retry;
pub mod status;
pub mod submitter;
pub mod types;
pub mod validators;
pub mod watcher;
