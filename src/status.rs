//! Relayer status shared between workers and the HTTP server

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::types::ChainSide;

/// Progress of one chain watcher
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainStatus {
    pub name: String,
    pub head: Option<u64>,
    pub checkpoint: Option<u64>,
    pub last_successful_poll: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Snapshot of relayer status
#[derive(Debug, Clone, Serialize)]
pub struct RelayerStatus {
    pub chains: BTreeMap<ChainSide, ChainStatus>,
    /// Set once a fatal condition has stopped the relayer
    pub fatal: Option<String>,
    pub stuck_records: usize,
    pub started_at: DateTime<Utc>,
}

impl Default for RelayerStatus {
    fn default() -> Self {
        Self {
            chains: BTreeMap::new(),
            fatal: None,
            stuck_records: 0,
            started_at: Utc::now(),
        }
    }
}

/// Cheaply cloneable handle to the shared status
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<RelayerStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_chain(&self, side: ChainSide, name: &str) {
        let mut status = self.inner.write().await;
        status.chains.entry(side).or_default().name = name.to_string();
    }

    /// Record a successful watcher cycle
    pub async fn record_poll(&self, side: ChainSide, head: u64, checkpoint: Option<u64>) {
        let mut status = self.inner.write().await;
        let chain = status.chains.entry(side).or_default();
        chain.head = Some(head);
        if checkpoint.is_some() {
            chain.checkpoint = checkpoint;
        }
        chain.last_successful_poll = Some(Utc::now());
        chain.consecutive_failures = 0;
    }

    pub async fn record_poll_failure(&self, side: ChainSide) -> u32 {
        let mut status = self.inner.write().await;
        let chain = status.chains.entry(side).or_default();
        chain.consecutive_failures += 1;
        chain.consecutive_failures
    }

    /// Mark the relayer as halted; the first reason wins
    pub async fn set_fatal(&self, reason: impl Into<String>) {
        let mut status = self.inner.write().await;
        if status.fatal.is_none() {
            status.fatal = Some(reason.into());
        }
    }

    pub async fn set_stuck_records(&self, count: usize) {
        self.inner.write().await.stuck_records = count;
    }

    pub async fn snapshot(&self) -> RelayerStatus {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_tracking() {
        let board = StatusBoard::new();
        board.register_chain(ChainSide::A, "ethereum").await;
        assert_eq!(board.record_poll_failure(ChainSide::A).await, 1);
        assert_eq!(board.record_poll_failure(ChainSide::A).await, 2);

        board.record_poll(ChainSide::A, 120, Some(108)).await;
        board.record_poll(ChainSide::A, 121, None).await;

        let snapshot = board.snapshot().await;
        let chain = &snapshot.chains[&ChainSide::A];
        assert_eq!(chain.name, "ethereum");
        assert_eq!(chain.head, Some(121));
        assert_eq!(chain.checkpoint, Some(108));
        assert_eq!(chain.consecutive_failures, 0);
        assert!(chain.last_successful_poll.is_some());
    }

    #[test]
    fn test_first_fatal_reason_wins() {
        let board = StatusBoard::new();
        tokio_test::block_on(async {
            board.set_fatal("reorg on chain a").await;
            board.set_fatal("storage unavailable").await;
        });
        let snapshot = tokio_test::block_on(board.snapshot());
        assert_eq!(snapshot.fatal.as_deref(), Some("reorg on chain a"));
    }
}
