//! Signing digest for relay authorizations
//!
//! Validators sign, and destination contracts verify, the digest
//!
//! ```text
//! keccak256(abi.encode(
//!     "BRIDGE_RELAY_V1", uint64 srcChainId, uint8 eventType, uint64 nonce,
//!     bytes32 sender, bytes32 recipient, uint256 amount, bytes32 sourceTxHash))
//! ```
//!
//! Every value is encoded as a 32-byte big-endian word. The domain tag is a
//! dynamic string, so word 0 holds its offset and the tag follows the head.

use alloy::primitives::{Address, PrimitiveSignature, B256, U256};
use tiny_keccak::{Hasher, Keccak};

use crate::types::{BridgeEvent, ChainSide, EventType, RelayAction};

pub const DOMAIN_TAG: &str = "BRIDGE_RELAY_V1";

const HEAD_WORDS: usize = 8;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Numeric chain ids that bind a digest to one bridge deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningDomain {
    pub chain_a_id: u64,
    pub chain_b_id: u64,
}

impl SigningDomain {
    pub fn new(chain_a_id: u64, chain_b_id: u64) -> Self {
        Self {
            chain_a_id,
            chain_b_id,
        }
    }

    pub fn chain_id(&self, side: ChainSide) -> u64 {
        match side {
            ChainSide::A => self.chain_a_id,
            ChainSide::B => self.chain_b_id,
        }
    }

    pub fn digest(&self, event: &BridgeEvent) -> B256 {
        relay_digest(self.chain_id(event.source_chain), event)
    }
}

/// Compute the relay digest for an event emitted on `source_chain_id`
pub fn relay_digest(source_chain_id: u64, event: &BridgeEvent) -> B256 {
    encode_digest(
        source_chain_id,
        event.event_type,
        event.nonce,
        event.sender,
        event.recipient,
        event.amount,
        event.source_tx_hash,
    )
}

/// Rebuild the digest from the arguments of a destination call
///
/// This is the computation the destination contract performs before checking
/// the proof, so it must agree with [`relay_digest`] for the originating event.
pub fn action_digest(action: &RelayAction) -> B256 {
    encode_digest(
        action.source_chain_id,
        action.key.event_type,
        action.key.nonce,
        action.sender,
        B256::left_padding_from(action.recipient.as_slice()),
        action.amount,
        action.source_tx_hash,
    )
}

fn encode_digest(
    source_chain_id: u64,
    event_type: EventType,
    nonce: u64,
    sender: B256,
    recipient: B256,
    amount: U256,
    source_tx_hash: B256,
) -> B256 {
    let tag = DOMAIN_TAG.as_bytes();
    let tag_words = tag.len().div_ceil(32);
    let mut data = vec![0u8; (HEAD_WORDS + 1 + tag_words) * 32];

    // Word 0: offset to the tag
    put_u64(&mut data, 0, (HEAD_WORDS * 32) as u64);
    put_u64(&mut data, 1, source_chain_id);
    put_u64(&mut data, 2, event_type.as_u8() as u64);
    put_u64(&mut data, 3, nonce);
    put_word(&mut data, 4, sender.as_slice());
    put_word(&mut data, 5, recipient.as_slice());
    put_word(&mut data, 6, &amount.to_be_bytes::<32>());
    put_word(&mut data, 7, source_tx_hash.as_slice());

    // Tail: tag length, then tag bytes right-padded
    put_u64(&mut data, HEAD_WORDS, tag.len() as u64);
    let start = (HEAD_WORDS + 1) * 32;
    data[start..start + tag.len()].copy_from_slice(tag);

    B256::from(keccak256(&data))
}

fn put_word(data: &mut [u8], index: usize, word: &[u8]) {
    data[index * 32..(index + 1) * 32].copy_from_slice(word);
}

fn put_u64(data: &mut [u8], index: usize, value: u64) {
    let end = (index + 1) * 32;
    data[end - 8..end].copy_from_slice(&value.to_be_bytes());
}

/// Recover the signer of a 65-byte `r || s || v` signature over `digest`
pub fn recover_signer(digest: B256, signature: &[u8]) -> eyre::Result<Address> {
    let signature = PrimitiveSignature::try_from(signature)
        .map_err(|e| eyre::eyre!("malformed signature: {}", e))?;
    signature
        .recover_address_from_prehash(&digest)
        .map_err(|e| eyre::eyre!("signature recovery failed: {}", e))
}

/// Check that `signature` over `digest` was produced by `expected`
pub fn verify_signature(digest: B256, signature: &[u8], expected: Address) -> bool {
    matches!(recover_signer(digest, signature), Ok(signer) if signer == expected)
}
