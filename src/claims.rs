//! In-process exclusive claims on event keys
//!
//! A worker must hold the claim for a key while it drives that record, so two
//! workers in this process never act on the same record at once. The ledger's
//! compare-and-set transitions cover writers in other processes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::types::EventKey;

#[derive(Debug, Clone, Default)]
pub struct KeyClaims {
    held: Arc<Mutex<HashSet<EventKey>>>,
}

impl KeyClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a key, or return `None` if another worker holds it
    pub fn try_claim(&self, key: EventKey) -> Option<ClaimGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key) {
            return None;
        }
        Some(ClaimGuard {
            key,
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_claimed(&self, key: &EventKey) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    pub fn len(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the claim when dropped
#[derive(Debug)]
pub struct ClaimGuard {
    key: EventKey,
    held: Arc<Mutex<HashSet<EventKey>>>,
}

impl ClaimGuard {
    pub fn key(&self) -> EventKey {
        self.key
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainSide, EventType};

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let claims = KeyClaims::new();
        let key = EventKey::new(ChainSide::A, EventType::Lock, 1);

        let guard = claims.try_claim(key).expect("first claim succeeds");
        assert!(claims.try_claim(key).is_none());
        assert!(claims.is_claimed(&key));

        // Other keys are unaffected
        let other = EventKey::new(ChainSide::A, EventType::Lock, 2);
        assert!(claims.try_claim(other).is_some());

        drop(guard);
        assert!(!claims.is_claimed(&key));
        assert!(claims.try_claim(key).is_some());
    }

    #[test]
    fn test_clones_share_claims() {
        let claims = KeyClaims::new();
        let shared = claims.clone();
        let key = EventKey::new(ChainSide::B, EventType::Burn, 9);

        let _guard = claims.try_claim(key).unwrap();
        assert!(shared.try_claim(key).is_none());
        assert_eq!(shared.len(), 1);
    }
}
