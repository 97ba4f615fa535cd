use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Result;

use super::{Ledger, RecordFilter, ScanCommit, Transition};
use crate::error::RelayerError;
use crate::types::{BridgeEvent, ChainSide, Checkpoint, EventKey, EventRecord, EventState};

/// Ledger kept in process memory
///
/// Used by tests and local dry runs. Nothing survives a restart unless the
/// same instance is shared, which is how tests simulate a crash and resume.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    records: Arc<RwLock<HashMap<EventKey, EventRecord>>>,
    checkpoints: Arc<RwLock<HashMap<ChainSide, Checkpoint>>>,
    unavailable: Arc<AtomicBool>,
}

impl std::fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLedger").finish()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the backing store went away
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every record, ordered by key
    pub fn all_records(&self) -> Vec<EventRecord> {
        let guard = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<_> = guard.values().cloned().collect();
        records.sort_by_key(|r| r.key());
        records
    }

    fn ensure_available(&self) -> Result<(), RelayerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RelayerError::StorageUnavailable(
                "in-memory ledger marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn sort_oldest_first(records: &mut [EventRecord]) {
    records.sort_by(|a, b| {
        a.event
            .observed_at
            .cmp(&b.event.observed_at)
            .then_with(|| a.key().cmp(&b.key()))
    });
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn checkpoint(&self, chain: ChainSide) -> Result<Option<Checkpoint>> {
        self.ensure_available()?;
        let guard = self.checkpoints.read().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(&chain).copied())
    }

    async fn commit_scan(
        &self,
        chain: ChainSide,
        events: &[BridgeEvent],
        checkpoint: Checkpoint,
    ) -> Result<ScanCommit> {
        self.ensure_available()?;

        // Lock order: checkpoints, then records
        let mut checkpoints = self.checkpoints.write().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = checkpoints.get(&chain) {
            if checkpoint.height < current.height {
                return Err(RelayerError::CheckpointRegression {
                    chain,
                    current: current.height,
                    requested: checkpoint.height,
                }
                .into());
            }
        }

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut commit = ScanCommit::default();
        for event in events {
            let key = event.key();
            match records.get(&key) {
                Some(existing) if existing.event.source_tx_hash == event.source_tx_hash => {
                    commit.duplicates.push(key)
                }
                Some(_) => commit.conflicts.push(key),
                None => {
                    records.insert(
                        key,
                        EventRecord::observed(event.clone(), checkpoint.height, now),
                    );
                    commit.inserted.push(key);
                }
            }
        }
        checkpoints.insert(chain, checkpoint);
        Ok(commit)
    }

    async fn get(&self, key: &EventKey) -> Result<Option<EventRecord>> {
        self.ensure_available()?;
        let guard = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(key).cloned())
    }

    async fn transition(&self, key: &EventKey, transition: Transition) -> Result<EventRecord> {
        self.ensure_available()?;
        transition.check_legal(*key)?;

        let mut guard = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = guard
            .get_mut(key)
            .ok_or(RelayerError::RecordNotFound(*key))?;
        if record.state != transition.from {
            return Err(RelayerError::StaleRecord {
                key: *key,
                expected: transition.from,
            }
            .into());
        }
        transition.apply_to(record, Utc::now());
        Ok(record.clone())
    }

    async fn due_records(
        &self,
        states: &[EventState],
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRecord>> {
        self.ensure_available()?;
        let guard = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<_> = guard
            .values()
            .filter(|r| states.contains(&r.state) && r.is_due(now))
            .cloned()
            .collect();
        sort_oldest_first(&mut records);
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn unsent_records(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<EventRecord>> {
        self.ensure_available()?;
        let guard = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<_> = guard
            .values()
            .filter(|r| {
                let unsent = r.state == EventState::QuorumReached
                    || (r.state == EventState::Submitted && r.dest_tx_hash.is_none());
                unsent && r.is_due(now)
            })
            .cloned()
            .collect();
        sort_oldest_first(&mut records);
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn in_flight_records(&self, limit: i64) -> Result<Vec<EventRecord>> {
        self.ensure_available()?;
        let guard = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<_> = guard
            .values()
            .filter(|r| r.state == EventState::Submitted && r.dest_tx_hash.is_some())
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.last_attempt_at
                .cmp(&b.last_attempt_at)
                .then_with(|| a.key().cmp(&b.key()))
        });
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<EventRecord>> {
        self.ensure_available()?;
        let guard = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<_> = guard.values().filter(|r| filter.matches(r)).cloned().collect();
        sort_oldest_first(&mut records);
        records.reverse();
        Ok(records
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn count_by_state(&self) -> Result<BTreeMap<EventState, i64>> {
        self.ensure_available()?;
        let guard = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut counts: BTreeMap<EventState, i64> =
            EventState::ALL.iter().map(|s| (*s, 0)).collect();
        for record in guard.values() {
            *counts.entry(record.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn stale_records(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<EventRecord>> {
        self.ensure_available()?;
        let guard = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<_> = guard
            .values()
            .filter(|r| !r.state.is_terminal() && r.updated_at < before)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.updated_at);
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }
}
