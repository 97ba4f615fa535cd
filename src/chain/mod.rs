//! Chain access used by watchers, the submitter and confirmation tracking

use std::sync::Arc;

use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::Result;

use crate::types::{BridgeEvent, ChainSide, EventKey, RelayAction, TxStatus};

pub mod contract;
mod evm;
pub mod rpc;

pub use evm::EvmChain;

/// Read and write access to one bridged chain
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn side(&self) -> ChainSide;

    /// Human-readable chain name for logs and metrics
    fn name(&self) -> &str;

    /// Current head block height
    async fn head(&self) -> Result<u64>;

    /// Hash of the canonical block at `height`, if the chain has one
    async fn block_hash(&self, height: u64) -> Result<Option<B256>>;

    /// Lock and burn events emitted by the bridge in `from..=to`
    async fn bridge_events(&self, from: u64, to: u64) -> Result<Vec<BridgeEvent>>;

    /// Broadcast a relay transaction and return its hash without waiting for inclusion
    async fn submit(&self, action: &RelayAction) -> Result<B256>;

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus>;

    /// Transaction that already completed the relay for `key`, if any
    async fn find_completed(&self, key: &EventKey, source_chain_id: u64) -> Result<Option<B256>>;
}

/// Block ranges covering `start..=head`, newest first, each at most `max_range` wide
pub fn descending_ranges(
    start: u64,
    head: u64,
    max_range: u64,
) -> impl Iterator<Item = (u64, u64)> {
    let span = max_range.max(1);
    let mut next_to = (head >= start).then_some(head);
    std::iter::from_fn(move || {
        let to = next_to?;
        let from = to.saturating_sub(span - 1).max(start);
        next_to = if from > start { Some(from - 1) } else { None };
        Some((from, to))
    })
}

/// Clients for both bridged chains
#[derive(Clone)]
pub struct ChainPair {
    a: Arc<dyn ChainClient>,
    b: Arc<dyn ChainClient>,
}

impl ChainPair {
    pub fn new(a: Arc<dyn ChainClient>, b: Arc<dyn ChainClient>) -> Self {
        Self { a, b }
    }

    pub fn get(&self, side: ChainSide) -> &Arc<dyn ChainClient> {
        match side {
            ChainSide::A => &self.a,
            ChainSide::B => &self.b,
        }
    }
}
