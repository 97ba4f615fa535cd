//! Postgres ledger tests
//!
//! Run with: cargo test --test postgres_ledger -- --ignored --nocapture
//!
//! Prerequisites:
//! - DATABASE_URL pointing at a disposable database (tables are truncated)

mod common;

use alloy::primitives::{Address, Bytes, B256};
use chrono::Utc;

use bridge_relayer::error::{is_fatal, is_stale, RelayerError};
use bridge_relayer::ledger::{Ledger, PgLedger, RecordFilter, Transition};
use bridge_relayer::types::{
    ChainSide, Checkpoint, EventKey, EventState, EventType, ValidatorSignatureSet,
};

use common::{lock_event, tagged_hash};

async fn connect() -> Option<PgLedger> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping: DATABASE_URL not set");
            return None;
        }
    };
    let ledger = PgLedger::connect(&url, 2).await.expect("connect and migrate");
    sqlx::query("TRUNCATE event_records, chain_checkpoints")
        .execute(ledger.pool())
        .await
        .expect("truncate");
    Some(ledger)
}

fn checkpoint(height: u64) -> Checkpoint {
    Checkpoint {
        height,
        block_hash: tagged_hash(0xcc, height),
    }
}

#[tokio::test]
#[ignore]
async fn test_postgres_ledger_lifecycle() {
    let Some(ledger) = connect().await else {
        return;
    };
    let key = EventKey::new(ChainSide::A, EventType::Lock, 1);

    // Scans are idempotent and checkpoints only move forward
    let events = vec![lock_event(1, 100, 10), lock_event(2, 200, 11)];
    let commit = ledger
        .commit_scan(ChainSide::A, &events, checkpoint(20))
        .await
        .unwrap();
    assert_eq!(commit.inserted.len(), 2);

    let commit = ledger
        .commit_scan(ChainSide::A, &events, checkpoint(20))
        .await
        .unwrap();
    assert!(commit.inserted.is_empty());
    assert_eq!(commit.duplicates.len(), 2);

    let mut conflicting = lock_event(1, 100, 10);
    conflicting.source_tx_hash = B256::repeat_byte(0x55);
    let commit = ledger
        .commit_scan(ChainSide::A, &[conflicting], checkpoint(21))
        .await
        .unwrap();
    assert_eq!(commit.conflicts, vec![key]);

    let err = ledger
        .commit_scan(ChainSide::A, &[], checkpoint(5))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RelayerError>(),
        Some(RelayerError::CheckpointRegression { .. })
    ));
    assert_eq!(
        ledger.checkpoint(ChainSide::A).await.unwrap(),
        Some(checkpoint(21))
    );

    // Records round-trip with full precision
    let record = ledger.get(&key).await.unwrap().unwrap();
    assert_eq!(record.event.amount, events[0].amount);
    assert_eq!(record.event.recipient, events[0].recipient);
    assert_eq!(record.state, EventState::Observed);
    assert_eq!(record.checkpoint_block, 20);

    // Compare-and-set transitions
    let mut signatures = ValidatorSignatureSet::new();
    signatures.insert(Address::repeat_byte(1), Bytes::from(vec![7u8; 65]));
    ledger
        .transition(
            &key,
            Transition::new(EventState::Observed, EventState::PendingSignatures),
        )
        .await
        .unwrap();
    let err = ledger
        .transition(
            &key,
            Transition::new(EventState::Observed, EventState::PendingSignatures),
        )
        .await
        .unwrap_err();
    assert!(is_stale(&err));
    assert!(!is_fatal(&err));

    let updated = ledger
        .transition(
            &key,
            Transition::new(EventState::PendingSignatures, EventState::QuorumReached)
                .with_signatures(signatures.clone())
                .count_signature_cycle(),
        )
        .await
        .unwrap();
    assert_eq!(updated.signatures, signatures);
    assert_eq!(updated.signature_cycles, 1);

    let unsent = ledger.unsent_records(Utc::now(), 10).await.unwrap();
    assert_eq!(unsent.len(), 1);
    assert_eq!(unsent[0].key(), key);

    let tx = tagged_hash(0x70, 1);
    ledger
        .transition(
            &key,
            Transition::new(EventState::QuorumReached, EventState::Submitted)
                .with_dest_tx(tx)
                .count_attempt(),
        )
        .await
        .unwrap();
    assert!(ledger.unsent_records(Utc::now(), 10).await.unwrap().is_empty());
    let in_flight = ledger.in_flight_records(10).await.unwrap();
    assert_eq!(in_flight.len(), 1);
    assert_eq!(in_flight[0].dest_tx_hash, Some(tx));
    assert_eq!(in_flight[0].attempts, 1);

    // Illegal edges never reach the database
    let err = ledger
        .transition(
            &key,
            Transition::new(EventState::Submitted, EventState::QuorumReached),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RelayerError>(),
        Some(RelayerError::InvalidTransition { .. })
    ));

    ledger
        .transition(
            &key,
            Transition::new(EventState::Submitted, EventState::Confirmed),
        )
        .await
        .unwrap();

    let counts = ledger.count_by_state().await.unwrap();
    assert_eq!(counts[&EventState::Confirmed], 1);
    assert_eq!(counts[&EventState::Observed], 1);

    let confirmed = ledger
        .query(&RecordFilter {
            state: Some(EventState::Confirmed),
            ..RecordFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(confirmed.len(), 1);

    let stale = ledger
        .stale_records(Utc::now() + chrono::Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].event.nonce, 2);
}
