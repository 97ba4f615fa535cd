use alloy::primitives::{B256, U256};
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use sqlx::FromRow;

use crate::types::{BridgeEvent, Checkpoint, EventRecord, ValidatorSignatureSet};

// Amounts are stored as NUMERIC(78,0). Inserts cast text with $n::NUMERIC and
// reads select amount::TEXT, so no big-decimal type is needed on the Rust side.

/// Columns selected for every event record query
pub const RECORD_COLUMNS: &str = r#"source_chain, event_type, nonce, sender, recipient,
    amount::TEXT AS amount, source_tx_hash, source_block_height, observed_at,
    checkpoint_block, state, signatures, dest_tx_hash, attempts, signature_cycles,
    last_attempt_at, retry_after, last_error, created_at, updated_at"#;

/// Row of the event_records table
#[derive(Debug, Clone, FromRow)]
pub struct EventRecordRow {
    pub source_chain: String,
    pub event_type: String,
    pub nonce: i64,
    pub sender: Vec<u8>,
    pub recipient: Vec<u8>,
    pub amount: String,
    pub source_tx_hash: Vec<u8>,
    pub source_block_height: i64,
    pub observed_at: DateTime<Utc>,
    pub checkpoint_block: i64,
    pub state: String,
    /// JSON object of validator address to signature hex
    pub signatures: String,
    pub dest_tx_hash: Option<Vec<u8>>,
    pub attempts: i32,
    pub signature_cycles: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row of the chain_checkpoints table
#[derive(Debug, Clone, FromRow)]
pub struct CheckpointRow {
    pub chain: String,
    pub block_height: i64,
    pub block_hash: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

fn word(bytes: &[u8], column: &str) -> Result<B256> {
    if bytes.len() != 32 {
        return Err(eyre!("{} must be 32 bytes, got {}", column, bytes.len()));
    }
    Ok(B256::from_slice(bytes))
}

fn unsigned(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| eyre!("{} is negative: {}", column, value))
}

/// Convert a u64 into the signed column type Postgres offers
pub fn to_db_int(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| eyre!("{} {} exceeds the BIGINT range", column, value))
}

pub fn encode_signatures(signatures: &ValidatorSignatureSet) -> Result<String> {
    serde_json::to_string(signatures).wrap_err("Failed to encode signatures")
}

impl TryFrom<EventRecordRow> for EventRecord {
    type Error = eyre::Report;

    fn try_from(row: EventRecordRow) -> Result<Self> {
        let event = BridgeEvent {
            source_chain: row.source_chain.parse()?,
            event_type: row.event_type.parse()?,
            nonce: unsigned(row.nonce, "nonce")?,
            sender: word(&row.sender, "sender")?,
            recipient: word(&row.recipient, "recipient")?,
            amount: U256::from_str_radix(&row.amount, 10)
                .map_err(|e| eyre!("invalid amount {}: {}", row.amount, e))?,
            source_tx_hash: word(&row.source_tx_hash, "source_tx_hash")?,
            source_block_height: unsigned(row.source_block_height, "source_block_height")?,
            observed_at: row.observed_at,
        };

        let signatures: ValidatorSignatureSet = serde_json::from_str(&row.signatures)
            .wrap_err_with(|| format!("Invalid signatures for {}", event.key()))?;

        Ok(EventRecord {
            event,
            state: row.state.parse()?,
            signatures,
            dest_tx_hash: row
                .dest_tx_hash
                .as_deref()
                .map(|h| word(h, "dest_tx_hash"))
                .transpose()?,
            attempts: row.attempts.max(0) as u32,
            signature_cycles: row.signature_cycles.max(0) as u32,
            last_attempt_at: row.last_attempt_at,
            retry_after: row.retry_after,
            last_error: row.last_error,
            checkpoint_block: unsigned(row.checkpoint_block, "checkpoint_block")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = eyre::Report;

    fn try_from(row: CheckpointRow) -> Result<Self> {
        Ok(Checkpoint {
            height: unsigned(row.block_height, "block_height")?,
            block_hash: word(&row.block_hash, "block_hash")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainSide, EventState, EventType};
    use alloy::primitives::{Address, Bytes};

    fn row() -> EventRecordRow {
        let mut sigs = ValidatorSignatureSet::new();
        sigs.insert(Address::repeat_byte(0x0a), Bytes::from(vec![7u8; 65]));
        EventRecordRow {
            source_chain: "b".into(),
            event_type: "burn".into(),
            nonce: 12,
            sender: vec![0u8; 32],
            recipient: B256::left_padding_from(&[0x22; 20]).to_vec(),
            amount: "1000000000000000000000".into(),
            source_tx_hash: vec![0xab; 32],
            source_block_height: 500,
            observed_at: Utc::now(),
            checkpoint_block: 510,
            state: "quorum_reached".into(),
            signatures: encode_signatures(&sigs).unwrap(),
            dest_tx_hash: None,
            attempts: 2,
            signature_cycles: 1,
            last_attempt_at: None,
            retry_after: None,
            last_error: Some("nonce too low".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_to_record() {
        let record = EventRecord::try_from(row()).unwrap();
        assert_eq!(record.event.source_chain, ChainSide::B);
        assert_eq!(record.event.event_type, EventType::Burn);
        assert_eq!(record.state, EventState::QuorumReached);
        assert_eq!(
            record.event.amount,
            U256::from(1_000_000_000_000_000_000_000u128)
        );
        assert_eq!(record.signatures.len(), 1);
        assert!(record.signatures.contains(&Address::repeat_byte(0x0a)));
        assert_eq!(record.attempts, 2);
    }

    #[test]
    fn test_row_rejects_bad_columns() {
        let mut bad = row();
        bad.source_tx_hash = vec![1, 2, 3];
        assert!(EventRecord::try_from(bad).is_err());

        let mut bad = row();
        bad.state = "unknown".into();
        assert!(EventRecord::try_from(bad).is_err());

        let mut bad = row();
        bad.nonce = -1;
        assert!(EventRecord::try_from(bad).is_err());
    }

    #[test]
    fn test_to_db_int() {
        assert_eq!(to_db_int(5, "nonce").unwrap(), 5);
        assert!(to_db_int(u64::MAX, "nonce").is_err());
    }
}
