//! Validator set and signature collection
//!
//! Signature requests fan out to every validator that has not signed yet and
//! are reduced as they arrive. Collection stops as soon as quorum is reached
//! or every request has answered or timed out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use eyre::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::digest::verify_signature;
use crate::metrics;
use crate::types::{BridgeEvent, ValidatorSignatureSet};

mod http;

pub use http::HttpValidatorClient;

/// Body of a signature request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub digest: B256,
    pub event: BridgeEvent,
}

/// A validator's answer to a signature request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureResponse {
    /// Identity the validator claims to sign as
    pub validator: Address,
    /// 65-byte `r || s || v` signature over the digest
    pub signature: Bytes,
}

/// Transport to one validator
#[async_trait]
pub trait ValidatorClient: Send + Sync {
    async fn request_signature(&self, request: &SignatureRequest) -> Result<SignatureResponse>;
}

/// What one collection round produced
#[derive(Debug, Clone, Default)]
pub struct CollectOutcome {
    /// Every valid signature known after the round, previous ones included
    pub signatures: ValidatorSignatureSet,
    /// Validators whose new signature was accepted this round
    pub accepted: Vec<Address>,
    /// Responses rejected as invalid, unknown or mismatched
    pub rejected: usize,
    /// Requests that errored or timed out
    pub unanswered: usize,
}

/// The configured validator set and quorum threshold
pub struct ValidatorSet {
    members: BTreeMap<Address, Arc<dyn ValidatorClient>>,
    threshold: usize,
    request_timeout: Duration,
}

impl ValidatorSet {
    pub fn new(
        members: BTreeMap<Address, Arc<dyn ValidatorClient>>,
        threshold: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            members,
            threshold,
            request_timeout,
        }
    }

    /// Number of validators (N)
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Signatures required for quorum (M)
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn contains(&self, validator: &Address) -> bool {
        self.members.contains_key(validator)
    }

    /// Whether the set can ever reach quorum
    pub fn is_sufficient(&self) -> bool {
        self.threshold >= 1 && self.members.len() >= self.threshold
    }

    /// Keep only signatures from current members that verify against `digest`
    pub fn verified(
        &self,
        digest: B256,
        signatures: &ValidatorSignatureSet,
    ) -> ValidatorSignatureSet {
        let mut valid = ValidatorSignatureSet::new();
        for (validator, signature) in signatures.iter() {
            if self.contains(validator) && verify_signature(digest, signature, *validator) {
                valid.insert(*validator, signature.clone());
            }
        }
        valid
    }

    pub fn has_quorum(&self, digest: B256, signatures: &ValidatorSignatureSet) -> bool {
        self.verified(digest, signatures).len() >= self.threshold
    }

    /// Request signatures from validators missing from `existing` until quorum
    ///
    /// Every response is verified before it counts: the signature must recover
    /// to the identity the response claims, and that identity must belong to
    /// the set. A validator answering twice is counted once.
    pub async fn collect(
        &self,
        digest: B256,
        event: &BridgeEvent,
        existing: &ValidatorSignatureSet,
    ) -> CollectOutcome {
        let mut outcome = CollectOutcome {
            signatures: self.verified(digest, existing),
            ..CollectOutcome::default()
        };
        if outcome.signatures.len() >= self.threshold {
            return outcome;
        }

        let request = SignatureRequest {
            digest,
            event: event.clone(),
        };
        let request = &request;
        let timeout = self.request_timeout;

        let mut responses: FuturesUnordered<_> = self
            .members
            .iter()
            .filter(|(address, _)| !outcome.signatures.contains(address))
            .map(|(address, client)| {
                let address = *address;
                let client = Arc::clone(client);
                async move {
                    let result =
                        tokio::time::timeout(timeout, client.request_signature(request)).await;
                    (address, result)
                }
            })
            .collect();

        while let Some((asked, result)) = responses.next().await {
            let response = match result {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    debug!(validator = %asked, error = %e, "Signature request failed");
                    metrics::record_signature_response("error");
                    outcome.unanswered += 1;
                    continue;
                }
                Err(_) => {
                    debug!(validator = %asked, ?timeout, "Signature request timed out");
                    metrics::record_signature_response("timeout");
                    outcome.unanswered += 1;
                    continue;
                }
            };

            if !self.contains(&response.validator) {
                warn!(
                    validator = %asked,
                    claimed = %response.validator,
                    "Signature from unknown validator rejected"
                );
                metrics::record_signature_response("unknown_validator");
                outcome.rejected += 1;
                continue;
            }
            if !verify_signature(digest, &response.signature, response.validator) {
                warn!(
                    validator = %asked,
                    claimed = %response.validator,
                    "Signature does not verify against the relay digest"
                );
                metrics::record_signature_response("invalid");
                outcome.rejected += 1;
                continue;
            }

            if outcome
                .signatures
                .insert(response.validator, response.signature)
            {
                metrics::record_signature_response("accepted");
                outcome.accepted.push(response.validator);
            } else {
                metrics::record_signature_response("duplicate");
            }

            if outcome.signatures.len() >= self.threshold {
                break;
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::relay_digest;
    use crate::types::{ChainSide, EventType};
    use alloy::primitives::U256;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;
    use chrono::Utc;

    enum Behavior {
        Honest,
        Silent,
        SignsAs(Address),
        WrongDigest,
    }

    struct TestValidator {
        signer: PrivateKeySigner,
        behavior: Behavior,
    }

    #[async_trait]
    impl ValidatorClient for TestValidator {
        async fn request_signature(&self, request: &SignatureRequest) -> Result<SignatureResponse> {
            let digest = match self.behavior {
                Behavior::WrongDigest => B256::repeat_byte(0xee),
                _ => request.digest,
            };
            let signature = self.signer.sign_hash_sync(&digest)?;
            let validator = match self.behavior {
                Behavior::Silent => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    self.signer.address()
                }
                Behavior::SignsAs(other) => other,
                _ => self.signer.address(),
            };
            Ok(SignatureResponse {
                validator,
                signature: Bytes::from(signature.as_bytes().to_vec()),
            })
        }
    }

    fn event() -> BridgeEvent {
        BridgeEvent {
            source_chain: ChainSide::A,
            event_type: EventType::Lock,
            nonce: 3,
            sender: B256::ZERO,
            recipient: B256::left_padding_from(&[0x22; 20]),
            amount: U256::from(10u64),
            source_tx_hash: B256::repeat_byte(3),
            source_block_height: 7,
            observed_at: Utc::now(),
        }
    }

    fn set_of(behaviors: Vec<Behavior>, threshold: usize) -> (ValidatorSet, Vec<Address>) {
        let mut members: BTreeMap<Address, Arc<dyn ValidatorClient>> = BTreeMap::new();
        let mut addresses = Vec::new();
        for behavior in behaviors {
            let signer = PrivateKeySigner::random();
            addresses.push(signer.address());
            members.insert(signer.address(), Arc::new(TestValidator { signer, behavior }));
        }
        (
            ValidatorSet::new(members, threshold, Duration::from_millis(200)),
            addresses,
        )
    }

    #[tokio::test]
    async fn test_collect_reaches_quorum() {
        let (set, _) = set_of(
            vec![Behavior::Honest, Behavior::Honest, Behavior::Honest],
            2,
        );
        let ev = event();
        let digest = relay_digest(1, &ev);

        let outcome = set.collect(digest, &ev, &ValidatorSignatureSet::new()).await;
        assert!(outcome.signatures.len() >= 2);
        assert!(set.has_quorum(digest, &outcome.signatures));
    }

    #[tokio::test]
    async fn test_collect_skips_silent_validator() {
        let (set, _) = set_of(
            vec![Behavior::Honest, Behavior::Silent, Behavior::Honest],
            3,
        );
        let ev = event();
        let digest = relay_digest(1, &ev);

        let outcome = set.collect(digest, &ev, &ValidatorSignatureSet::new()).await;
        assert_eq!(outcome.signatures.len(), 2);
        assert_eq!(outcome.unanswered, 1);
        assert!(!set.has_quorum(digest, &outcome.signatures));
    }

    #[tokio::test]
    async fn test_collect_rejects_bad_signatures() {
        let outsider = PrivateKeySigner::random().address();
        let (set, _) = set_of(
            vec![
                Behavior::Honest,
                Behavior::WrongDigest,
                Behavior::SignsAs(outsider),
            ],
            1,
        );
        let ev = event();
        let digest = relay_digest(1, &ev);

        let outcome = set.collect(digest, &ev, &ValidatorSignatureSet::new()).await;
        assert_eq!(outcome.signatures.len(), 1);
        for validator in outcome.signatures.validators() {
            assert!(set.contains(validator));
        }
    }

    #[tokio::test]
    async fn test_collect_keeps_existing_and_only_asks_missing() {
        let (set, addresses) = set_of(vec![Behavior::Honest, Behavior::Honest], 2);
        let ev = event();
        let digest = relay_digest(1, &ev);

        let first = set.collect(digest, &ev, &ValidatorSignatureSet::new()).await;
        assert_eq!(first.signatures.len(), 2);

        let second = set.collect(digest, &ev, &first.signatures).await;
        assert!(second.accepted.is_empty());
        assert_eq!(second.signatures, first.signatures);
        assert!(second.signatures.contains(&addresses[0]));
    }

    #[test]
    fn test_verified_drops_non_members() {
        let (set, _) = set_of(vec![Behavior::Honest], 1);
        let stranger = PrivateKeySigner::random();
        let ev = event();
        let digest = relay_digest(1, &ev);
        let sig = stranger.sign_hash_sync(&digest).unwrap();

        let mut signatures = ValidatorSignatureSet::new();
        signatures.insert(stranger.address(), Bytes::from(sig.as_bytes().to_vec()));
        assert!(set.verified(digest, &signatures).is_empty());
        assert!(set.is_sufficient());
    }
}
