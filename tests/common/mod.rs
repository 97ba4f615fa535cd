//! Shared fixtures for integration tests
//!
//! `MockChain` is a scripted chain: tests set the head, add bridge events,
//! inject RPC and submission failures and rewrite block hashes to simulate a
//! reorganisation. `MockValidator` signs with a real secp256k1 key.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use chrono::Utc;
use eyre::{eyre, Result};

use bridge_relayer::chain::{ChainClient, ChainPair};
use bridge_relayer::claims::KeyClaims;
use bridge_relayer::config::{ChainConfig, CoordinatorConfig, SubmitterConfig};
use bridge_relayer::confirmation::{ConfirmationDepths, ConfirmationTracker};
use bridge_relayer::coordinator::SignatureCoordinator;
use bridge_relayer::digest::SigningDomain;
use bridge_relayer::ledger::{InMemoryLedger, Ledger};
use bridge_relayer::retry::RetryConfig;
use bridge_relayer::status::StatusBoard;
use bridge_relayer::submitter::RelaySubmitter;
use bridge_relayer::types::{
    BridgeEvent, ChainSide, EventKey, EventType, RelayAction, TxStatus,
};
use bridge_relayer::validators::{
    SignatureRequest, SignatureResponse, ValidatorClient, ValidatorSet,
};
use bridge_relayer::watcher::ChainWatcher;

pub const CHAIN_A_ID: u64 = 1;
pub const CHAIN_B_ID: u64 = 56;
pub const FINALITY_DEPTH: u64 = 10;
pub const CONFIRMATION_DEPTH: u64 = 3;

// ============================================================================
// Mock chain
// ============================================================================

#[derive(Default)]
struct MockState {
    head: u64,
    events: Vec<BridgeEvent>,
    reorged: HashMap<u64, B256>,
    failing_calls: u32,
    submit_failures: VecDeque<String>,
    submissions: Vec<RelayAction>,
    tx_status: HashMap<B256, TxStatus>,
    completed: HashMap<EventKey, B256>,
    lookup_failures: u32,
    next_tx: u64,
}

/// Scripted in-process chain
pub struct MockChain {
    side: ChainSide,
    name: String,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(side: ChainSide) -> Arc<Self> {
        Arc::new(Self {
            side,
            name: format!("mock-{}", side),
            state: Mutex::new(MockState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    pub fn advance_head(&self, blocks: u64) {
        self.state().head += blocks;
    }

    pub fn head_now(&self) -> u64 {
        self.state().head
    }

    pub fn add_event(&self, event: BridgeEvent) {
        self.state().events.push(event);
    }

    /// Fail the next `count` head requests as if the node were unreachable
    pub fn fail_next_calls(&self, count: u32) {
        self.state().failing_calls = count;
    }

    /// Fail upcoming submissions with the given node error messages, in order
    pub fn fail_next_submits(&self, messages: &[&str]) {
        let mut state = self.state();
        for message in messages {
            state.submit_failures.push_back(message.to_string());
        }
    }

    /// Make the next `count` relay lookups fail
    pub fn fail_next_lookups(&self, count: u32) {
        self.state().lookup_failures = count;
    }

    /// Replace the hash of an already produced block
    pub fn reorg_block(&self, height: u64) {
        self.state()
            .reorged
            .insert(height, tagged_hash(0xee, height));
    }

    pub fn set_tx_status(&self, tx_hash: B256, status: TxStatus) {
        self.state().tx_status.insert(tx_hash, status);
    }

    /// Revert a submitted transaction; its relay no longer counts as completed
    pub fn revert_tx(&self, tx_hash: B256) {
        let mut state = self.state();
        let head = state.head;
        state
            .tx_status
            .insert(tx_hash, TxStatus::Reverted { block: head });
        state.completed.retain(|_, completed| *completed != tx_hash);
    }

    /// Record that `key` was already relayed by `tx_hash`
    pub fn mark_completed(&self, key: EventKey, tx_hash: B256) {
        let mut state = self.state();
        state.completed.insert(key, tx_hash);
        let head = state.head;
        state
            .tx_status
            .insert(tx_hash, TxStatus::Included { block: head });
    }

    pub fn submissions(&self) -> Vec<RelayAction> {
        self.state().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state().submissions.len()
    }
}

/// Hash with a one-byte tag in front of a big-endian value
pub fn tagged_hash(tag: u8, value: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    bytes[24..].copy_from_slice(&value.to_be_bytes());
    B256::from(bytes)
}

fn canonical_hash(side: ChainSide, height: u64) -> B256 {
    tagged_hash(side.as_str().as_bytes()[0], height)
}

#[async_trait]
impl ChainClient for MockChain {
    fn side(&self) -> ChainSide {
        self.side
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self) -> Result<u64> {
        let mut state = self.state();
        if state.failing_calls > 0 {
            state.failing_calls -= 1;
            return Err(eyre!("connection refused"));
        }
        Ok(state.head)
    }

    async fn block_hash(&self, height: u64) -> Result<Option<B256>> {
        let state = self.state();
        if height > state.head {
            return Ok(None);
        }
        Ok(Some(
            state
                .reorged
                .get(&height)
                .copied()
                .unwrap_or_else(|| canonical_hash(self.side, height)),
        ))
    }

    async fn bridge_events(&self, from: u64, to: u64) -> Result<Vec<BridgeEvent>> {
        Ok(self
            .state()
            .events
            .iter()
            .filter(|e| (from..=to).contains(&e.source_block_height))
            .cloned()
            .collect())
    }

    async fn submit(&self, action: &RelayAction) -> Result<B256> {
        let mut state = self.state();
        if let Some(message) = state.submit_failures.pop_front() {
            return Err(eyre!("{}", message));
        }
        state.next_tx += 1;
        let tx_hash = tagged_hash(0x70, state.next_tx);
        let head = state.head;
        state.submissions.push(action.clone());
        state
            .tx_status
            .insert(tx_hash, TxStatus::Included { block: head });
        // The destination contract records the proof as used
        state.completed.insert(action.key, tx_hash);
        Ok(tx_hash)
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus> {
        Ok(self
            .state()
            .tx_status
            .get(&tx_hash)
            .copied()
            .unwrap_or(TxStatus::NotFound))
    }

    async fn find_completed(&self, key: &EventKey, _source_chain_id: u64) -> Result<Option<B256>> {
        let mut state = self.state();
        if state.lookup_failures > 0 {
            state.lookup_failures -= 1;
            return Err(eyre!("connection refused"));
        }
        Ok(state.completed.get(key).copied())
    }
}

// ============================================================================
// Mock validators
// ============================================================================

#[derive(Clone)]
pub enum Behavior {
    Honest,
    /// Never answers within the request timeout
    Silent,
    /// Answers with another validator's identity and signature
    Replays(PrivateKeySigner),
}

pub struct MockValidator {
    signer: PrivateKeySigner,
    behavior: Behavior,
}

#[async_trait]
impl ValidatorClient for MockValidator {
    async fn request_signature(&self, request: &SignatureRequest) -> Result<SignatureResponse> {
        let signer = match &self.behavior {
            Behavior::Honest => &self.signer,
            Behavior::Silent => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                &self.signer
            }
            Behavior::Replays(other) => other,
        };
        let signature = signer.sign_hash_sync(&request.digest)?;
        Ok(SignatureResponse {
            validator: signer.address(),
            signature: Bytes::from(signature.as_bytes().to_vec()),
        })
    }
}

/// Build a validator set from signers and their behaviors
pub fn validator_set(members: Vec<(PrivateKeySigner, Behavior)>, threshold: usize) -> ValidatorSet {
    let mut clients: BTreeMap<Address, Arc<dyn ValidatorClient>> = BTreeMap::new();
    for (signer, behavior) in members {
        clients.insert(signer.address(), Arc::new(MockValidator { signer, behavior }));
    }
    ValidatorSet::new(clients, threshold, Duration::from_millis(200))
}

pub fn honest_validators(count: usize) -> Vec<(PrivateKeySigner, Behavior)> {
    (0..count)
        .map(|_| (PrivateKeySigner::random(), Behavior::Honest))
        .collect()
}

// ============================================================================
// Events and configuration
// ============================================================================

pub fn recipient() -> Address {
    Address::repeat_byte(0x42)
}

pub fn lock_event(nonce: u64, amount: u64, block: u64) -> BridgeEvent {
    BridgeEvent {
        source_chain: ChainSide::A,
        event_type: EventType::Lock,
        nonce,
        sender: B256::left_padding_from(Address::repeat_byte(0x11).as_slice()),
        recipient: B256::left_padding_from(recipient().as_slice()),
        amount: U256::from(amount),
        source_tx_hash: tagged_hash(0xa0, nonce),
        source_block_height: block,
        observed_at: Utc::now(),
    }
}

pub fn chain_config(side: ChainSide) -> ChainConfig {
    ChainConfig {
        side,
        name: format!("mock-{}", side),
        rpc_url: "http://localhost:8545".to_string(),
        rpc_fallback_urls: Vec::new(),
        chain_id: match side {
            ChainSide::A => CHAIN_A_ID,
            ChainSide::B => CHAIN_B_ID,
        },
        bridge_address: "0x0000000000000000000000000000000000000001".to_string(),
        private_key: "0x0000000000000000000000000000000000000000000000000000000000000001"
            .to_string(),
        finality_depth: FINALITY_DEPTH,
        confirmation_depth: CONFIRMATION_DEPTH,
        poll_interval_ms: 10,
        start_block: 0,
        max_block_range: 1000,
    }
}

pub fn coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        poll_interval_ms: 10,
        workers: 4,
        max_signature_cycles: 3,
        timeout_retry_ms: 0,
        batch_size: 100,
    }
}

/// Submission settings with no backoff so retries are due immediately
pub fn submitter_config() -> SubmitterConfig {
    SubmitterConfig {
        poll_interval_ms: 10,
        workers: 4,
        max_attempts: 5,
        initial_backoff_ms: 0,
        max_backoff_ms: 0,
        submission_timeout_secs: 600,
        batch_size: 100,
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Every component wired to one in-memory ledger and two mock chains
pub struct Harness {
    pub ledger: InMemoryLedger,
    pub chain_a: Arc<MockChain>,
    pub chain_b: Arc<MockChain>,
    pub validators: Arc<ValidatorSet>,
    pub domain: SigningDomain,
    pub claims: KeyClaims,
    pub status: StatusBoard,
}

impl Harness {
    pub fn new(validators: ValidatorSet) -> Self {
        Self {
            ledger: InMemoryLedger::new(),
            chain_a: MockChain::new(ChainSide::A),
            chain_b: MockChain::new(ChainSide::B),
            validators: Arc::new(validators),
            domain: SigningDomain::new(CHAIN_A_ID, CHAIN_B_ID),
            claims: KeyClaims::new(),
            status: StatusBoard::new(),
        }
    }

    /// Five honest validators, three required
    pub fn standard() -> Self {
        Self::new(validator_set(honest_validators(5), 3))
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::new(self.ledger.clone())
    }

    pub fn chains(&self) -> ChainPair {
        ChainPair::new(self.chain_a.clone(), self.chain_b.clone())
    }

    pub fn watcher(&self, side: ChainSide) -> ChainWatcher {
        let chain: Arc<dyn ChainClient> = match side {
            ChainSide::A => self.chain_a.clone(),
            ChainSide::B => self.chain_b.clone(),
        };
        ChainWatcher::new(chain, self.ledger(), &chain_config(side), self.status.clone())
            .with_backoff(RetryConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                jitter: 0.0,
                ..RetryConfig::default()
            })
    }

    pub fn coordinator(&self) -> SignatureCoordinator {
        SignatureCoordinator::new(
            self.ledger(),
            Arc::clone(&self.validators),
            self.domain,
            coordinator_config(),
            self.claims.clone(),
        )
    }

    pub fn submitter(&self) -> RelaySubmitter {
        self.submitter_with(submitter_config())
    }

    pub fn submitter_with(&self, config: SubmitterConfig) -> RelaySubmitter {
        RelaySubmitter::new(
            self.ledger(),
            self.chains(),
            Arc::clone(&self.validators),
            self.domain,
            config,
            self.claims.clone(),
        )
    }

    pub fn tracker(&self) -> ConfirmationTracker {
        self.tracker_with(submitter_config())
    }

    pub fn tracker_with(&self, config: SubmitterConfig) -> ConfirmationTracker {
        ConfirmationTracker::new(
            self.ledger(),
            self.chains(),
            self.domain,
            ConfirmationDepths {
                a: CONFIRMATION_DEPTH,
                b: CONFIRMATION_DEPTH,
            },
            config,
            self.claims.clone(),
        )
    }
}
