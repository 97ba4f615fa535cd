//! Shared types for the relayer

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the two chains the bridge connects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSide {
    A,
    B,
}

impl ChainSide {
    pub const ALL: [ChainSide; 2] = [ChainSide::A, ChainSide::B];

    /// The chain a relay for an event on this chain is submitted to
    pub fn opposite(self) -> ChainSide {
        match self {
            ChainSide::A => ChainSide::B,
            ChainSide::B => ChainSide::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainSide::A => "a",
            ChainSide::B => "b",
        }
    }
}

impl fmt::Display for ChainSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChainSide {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(ChainSide::A),
            "b" => Ok(ChainSide::B),
            other => Err(eyre::eyre!("unknown chain: {}", other)),
        }
    }
}

/// Kind of bridge event emitted on a source chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Tokens escrowed on the source chain, minted on the destination
    Lock,
    /// Wrapped tokens destroyed on the source chain, released on the destination
    Burn,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Lock => "lock",
            EventType::Burn => "burn",
        }
    }

    /// Encoding used in the signing digest and on-chain calls
    pub fn as_u8(&self) -> u8 {
        match self {
            EventType::Lock => 0,
            EventType::Burn => 1,
        }
    }

    pub fn relay_kind(&self) -> RelayKind {
        match self {
            EventType::Lock => RelayKind::Mint,
            EventType::Burn => RelayKind::Release,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventType {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lock" => Ok(EventType::Lock),
            "burn" => Ok(EventType::Burn),
            other => Err(eyre::eyre!("unknown event type: {}", other)),
        }
    }
}

/// Destination-side action that completes a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    Mint,
    Release,
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayKind::Mint => write!(f, "mint"),
            RelayKind::Release => write!(f, "release"),
        }
    }
}

/// Natural identity of a bridge event
///
/// The source contract assigns nonces per event type, so two events with the
/// same key are the same transfer no matter how often they are observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub source_chain: ChainSide,
    pub event_type: EventType,
    pub nonce: u64,
}

impl EventKey {
    pub fn new(source_chain: ChainSide, event_type: EventType, nonce: u64) -> Self {
        Self {
            source_chain,
            event_type,
            nonce,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.source_chain, self.event_type, self.nonce)
    }
}

/// A finalized lock or burn observed on a source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub source_chain: ChainSide,
    pub event_type: EventType,
    pub nonce: u64,
    /// Sender as a left-padded 32-byte universal address
    pub sender: B256,
    /// Recipient on the destination chain as a left-padded 32-byte address
    pub recipient: B256,
    pub amount: U256,
    pub source_tx_hash: B256,
    pub source_block_height: u64,
    pub observed_at: DateTime<Utc>,
}

impl BridgeEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.source_chain, self.event_type, self.nonce)
    }

    /// Recipient as a 20-byte EVM address, if the universal address is one
    pub fn recipient_address(&self) -> Option<Address> {
        let bytes = self.recipient.as_slice();
        if bytes[..12].iter().any(|b| *b != 0) {
            return None;
        }
        Some(Address::from_slice(&bytes[12..]))
    }
}

/// Lifecycle of an event record
///
/// ```text
/// Observed -> PendingSignatures -> QuorumReached -> Submitted -> Confirmed
///                 |      ^              |              |
///                 v      |              v              v
///             SignatureTimeout        Failed         Failed
/// ```
///
/// `QuorumReached -> Failed` covers records that can never be sent: the
/// relay action cannot be built (for example a recipient that is not a
/// 20-byte address on the destination) or the submission budget ran out
/// before any transaction was accepted by the node. Such a record carries
/// the reason in `last_error` and has no destination transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Observed,
    PendingSignatures,
    SignatureTimeout,
    QuorumReached,
    Submitted,
    Confirmed,
    Failed,
}

impl EventState {
    pub const ALL: [EventState; 7] = [
        EventState::Observed,
        EventState::PendingSignatures,
        EventState::SignatureTimeout,
        EventState::QuorumReached,
        EventState::Submitted,
        EventState::Confirmed,
        EventState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Observed => "observed",
            EventState::PendingSignatures => "pending_signatures",
            EventState::SignatureTimeout => "signature_timeout",
            EventState::QuorumReached => "quorum_reached",
            EventState::Submitted => "submitted",
            EventState::Confirmed => "confirmed",
            EventState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventState::Confirmed | EventState::Failed)
    }

    /// Whether `next` is a legal successor of this state
    ///
    /// Staying in the same state is allowed for the working states so that
    /// counters, signatures and backoff can be persisted between cycles.
    pub fn can_transition_to(&self, next: EventState) -> bool {
        use EventState::*;
        matches!(
            (self, next),
            (Observed, PendingSignatures)
                | (PendingSignatures, PendingSignatures)
                | (PendingSignatures, SignatureTimeout)
                | (PendingSignatures, QuorumReached)
                | (SignatureTimeout, PendingSignatures)
                | (QuorumReached, QuorumReached)
                | (QuorumReached, Submitted)
                | (QuorumReached, Failed)
                | (Submitted, Submitted)
                | (Submitted, Confirmed)
                | (Submitted, Failed)
        )
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventState {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| eyre::eyre!("unknown event state: {}", s))
    }
}

/// Verified validator signatures keyed by validator identity
///
/// Keying by identity means a validator that answers twice still counts once
/// toward quorum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidatorSignatureSet {
    signatures: BTreeMap<Address, Bytes>,
}

impl ValidatorSignatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a signature; returns false if this validator already signed
    pub fn insert(&mut self, validator: Address, signature: Bytes) -> bool {
        if self.signatures.contains_key(&validator) {
            return false;
        }
        self.signatures.insert(validator, signature);
        true
    }

    pub fn contains(&self, validator: &Address) -> bool {
        self.signatures.contains_key(validator)
    }

    pub fn remove(&mut self, validator: &Address) -> Option<Bytes> {
        self.signatures.remove(validator)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Bytes)> {
        self.signatures.iter()
    }

    pub fn validators(&self) -> impl Iterator<Item = &Address> {
        self.signatures.keys()
    }

    /// Signatures ordered by ascending validator address, as contracts expect
    pub fn ordered_signatures(&self) -> Vec<Bytes> {
        self.signatures.values().cloned().collect()
    }

    /// Union with another set, keeping existing entries on conflict
    pub fn merge(&mut self, other: &ValidatorSignatureSet) {
        for (validator, signature) in other.iter() {
            self.insert(*validator, signature.clone());
        }
    }
}

/// Durable record of an event's progress through the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: BridgeEvent,
    pub state: EventState,
    pub signatures: ValidatorSignatureSet,
    pub dest_tx_hash: Option<B256>,
    /// Destination submission attempts made so far
    pub attempts: u32,
    /// Signature collection cycles run so far
    pub signature_cycles: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time a worker may act on the record again
    pub retry_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Checkpoint height of the scan that first observed the event
    pub checkpoint_block: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    /// Fresh record for a newly observed event
    pub fn observed(event: BridgeEvent, checkpoint_block: u64, now: DateTime<Utc>) -> Self {
        Self {
            event,
            state: EventState::Observed,
            signatures: ValidatorSignatureSet::new(),
            dest_tx_hash: None,
            attempts: 0,
            signature_cycles: 0,
            last_attempt_at: None,
            retry_after: None,
            last_error: None,
            checkpoint_block,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> EventKey {
        self.event.key()
    }

    /// Whether a worker may pick the record up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.map_or(true, |at| at <= now)
    }
}

/// Last fully processed block of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub block_hash: B256,
}

/// Destination call that completes a transfer
///
/// Carries every input of the relay digest, so the destination contract can
/// rebuild the digest and check the proof against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAction {
    pub key: EventKey,
    pub kind: RelayKind,
    pub destination: ChainSide,
    pub source_chain_id: u64,
    pub sender: B256,
    pub recipient: Address,
    pub amount: U256,
    pub source_tx_hash: B256,
    /// Validator signatures ordered by validator address
    pub proof: Vec<Bytes>,
}

impl RelayAction {
    pub fn from_record(record: &EventRecord, source_chain_id: u64) -> eyre::Result<Self> {
        let recipient = record.event.recipient_address().ok_or_else(|| {
            eyre::eyre!(
                "recipient {} is not a valid destination address",
                record.event.recipient
            )
        })?;

        Ok(Self {
            key: record.key(),
            kind: record.event.event_type.relay_kind(),
            destination: record.event.source_chain.opposite(),
            source_chain_id,
            sender: record.event.sender,
            recipient,
            amount: record.event.amount,
            source_tx_hash: record.event.source_tx_hash,
            proof: record.signatures.ordered_signatures(),
        })
    }
}

/// Status of a destination transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Unknown to the node (never broadcast or dropped from the mempool)
    NotFound,
    /// Known but not yet in a block
    Pending,
    Included { block: u64 },
    Reverted { block: u64 },
}
