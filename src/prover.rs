//! Proof system boundary
//!
//! Circuits live outside this crate. [`ProofSystem`] takes owned requests and
//! returns opaque proofs plus their public signals. Reputation proof signals
//! always start with the `max_reputation_budget` reputation nullifiers, unused
//! slots encoded as `"0"`.
//!
//! [`DigestProofSystem`] is a deterministic stand-in for local ledgers: it
//! computes the real public outputs (epoch keys, nullifiers, state leaves) and
//! replaces the proof with a Poseidon digest of the inputs. It proves nothing
//! and must never be pointed at a production verifier.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::epoch_key::{derive_epoch_key, epoch_key_nullifier, reputation_nullifier};
use crate::error::{Error, Result};
use crate::hash::{bytes_to_fields, field, poseidon};
use crate::identity::Identity;
use crate::types::{AttesterId, Bytes32, Epoch, EpochKey, Reputation};

/// Nonce-list entry meaning "no nullifier in this slot".
pub const UNUSED_NONCE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofOutput {
    pub proof: Vec<String>,
    pub public_signals: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReputationProofRequest {
    pub identity: Identity,
    pub epoch: Epoch,
    pub epoch_key_nonce: u64,
    pub epoch_tree_depth: u8,
    pub attester_id: AttesterId,
    pub min_rep: u64,
    /// Reputation held at `attester_id` going into the proof
    pub reputation: Reputation,
    /// `max_reputation_budget` entries, [`UNUSED_NONCE`] for empty slots
    pub nonce_list: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct SignUpProofRequest {
    pub identity: Identity,
    pub epoch: Epoch,
    pub epoch_tree_depth: u8,
    pub attester_id: AttesterId,
    pub reputation: Reputation,
}

#[derive(Debug, Clone)]
pub struct TransitionProofRequest {
    pub identity: Identity,
    pub from_epoch: Epoch,
    pub to_epoch: Epoch,
    pub num_epoch_key_nonce_per_epoch: u64,
    pub attester_id: AttesterId,
    /// Reputation after folding every epoch in `[from_epoch, to_epoch)`
    pub reputation: Reputation,
}

/// The proofs of one user state transition and their public outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionProofs {
    pub from_epoch: Epoch,
    pub to_epoch: Epoch,
    pub state_leaf: Bytes32,
    pub epoch_key_nullifiers: Vec<Bytes32>,
    pub start_transition: ProofOutput,
    pub process_attestations: Vec<ProofOutput>,
    pub final_transition: ProofOutput,
}

#[async_trait]
pub trait ProofSystem: Send + Sync {
    async fn gen_reputation_proof(&self, request: ReputationProofRequest) -> Result<ProofOutput>;

    async fn gen_user_state_transition_proofs(
        &self,
        request: TransitionProofRequest,
    ) -> Result<TransitionProofs>;

    async fn gen_user_sign_up_proof(&self, request: SignUpProofRequest) -> Result<ProofOutput>;
}

/// Global state tree leaf of an identity holding `reputation` in `epoch`.
pub fn user_state_leaf(
    identity_commitment: &Bytes32,
    attester_id: AttesterId,
    reputation: &Reputation,
    epoch: Epoch,
) -> Bytes32 {
    let mut inputs = bytes_to_fields(identity_commitment).to_vec();
    inputs.extend([field(attester_id), field(reputation.pos_rep), field(reputation.neg_rep), field(epoch)]);
    inputs.extend(bytes_to_fields(&reputation.graffiti));
    poseidon(&inputs)
}

fn word_signal(word: &Bytes32) -> String { format!("0x{}", hex::encode(word)) }

/// Reputation nullifiers at the head of a reputation proof's public signals.
pub fn reputation_nullifiers(public_signals: &[String], max_reputation_budget: u64) -> Result<Vec<Bytes32>> {
    let budget = max_reputation_budget as usize;
    if public_signals.len() < budget {
        return Err(Error::Decode(format!(
            "expected at least {budget} public signals, got {}",
            public_signals.len()
        )));
    }
    let mut nullifiers = Vec::new();
    for signal in &public_signals[..budget] {
        if signal == "0" {
            continue;
        }
        let raw = hex::decode(signal.trim_start_matches("0x"))
            .map_err(|e| Error::Decode(format!("bad nullifier signal {signal:?}: {e}")))?;
        let word: Bytes32 = raw
            .try_into()
            .map_err(|_| Error::Decode(format!("nullifier signal {signal:?} is not 32 bytes")))?;
        nullifiers.push(word);
    }
    Ok(nullifiers)
}

/// Epoch key signal of a reputation or sign-up proof.
pub fn epoch_key_signal(public_signals: &[String], offset: usize) -> Result<EpochKey> {
    public_signals
        .get(offset)
        .ok_or_else(|| Error::Decode(format!("missing public signal {offset}")))?
        .parse()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DigestProofSystem;

impl DigestProofSystem {
    fn digest(parts: &[Bytes32], numbers: &[u64]) -> Vec<String> {
        let mut inputs = Vec::new();
        for part in parts {
            inputs.extend(bytes_to_fields(part));
        }
        inputs.extend(numbers.iter().map(|n| field(*n)));
        vec![word_signal(&poseidon(&inputs))]
    }
}

#[async_trait]
impl ProofSystem for DigestProofSystem {
    async fn gen_reputation_proof(&self, request: ReputationProofRequest) -> Result<ProofOutput> {
        let nullifier = *request.identity.nullifier();
        let used: Vec<u64> =
            request.nonce_list.iter().filter(|n| **n != UNUSED_NONCE).map(|n| *n as u64).collect();
        let available = request.reputation.balance().max(0) as u64;
        if let Some(max) = used.iter().max() {
            if *max >= available {
                return Err(Error::Proof(format!("nullifier index {max} exceeds balance {available}")));
            }
        }
        // The first listed index is the spent counter before this proof.
        let spent_before = used.iter().min().copied().unwrap_or(0);
        if available.saturating_sub(spent_before) < request.min_rep {
            return Err(Error::Proof(format!("cannot prove minimum reputation {}", request.min_rep)));
        }

        let mut public_signals: Vec<String> = request
            .nonce_list
            .iter()
            .map(|n| {
                if *n == UNUSED_NONCE {
                    "0".to_string()
                } else {
                    word_signal(&reputation_nullifier(&nullifier, request.attester_id, request.epoch, *n as u64))
                }
            })
            .collect();
        let epoch_key =
            derive_epoch_key(&nullifier, request.epoch, request.epoch_key_nonce, request.epoch_tree_depth);
        public_signals.extend([
            request.epoch.to_string(),
            epoch_key.to_string(),
            request.attester_id.to_string(),
            request.min_rep.to_string(),
        ]);
        let proof = Self::digest(
            &[request.identity.commitment()],
            &[request.epoch, request.epoch_key_nonce, request.attester_id, request.min_rep, used.len() as u64],
        );
        Ok(ProofOutput { proof, public_signals })
    }

    async fn gen_user_state_transition_proofs(
        &self,
        request: TransitionProofRequest,
    ) -> Result<TransitionProofs> {
        if request.to_epoch <= request.from_epoch {
            return Err(Error::Proof(format!(
                "nothing to transition from epoch {} to {}",
                request.from_epoch, request.to_epoch
            )));
        }
        let nullifier = *request.identity.nullifier();
        let commitment = request.identity.commitment();
        let epoch_key_nullifiers: Vec<Bytes32> = (request.from_epoch..request.to_epoch)
            .flat_map(|epoch| {
                (0..request.num_epoch_key_nonce_per_epoch).map(move |nonce| epoch_key_nullifier(&nullifier, epoch, nonce))
            })
            .collect();
        let state_leaf = user_state_leaf(&commitment, request.attester_id, &request.reputation, request.to_epoch);

        let start_transition = ProofOutput {
            proof: Self::digest(&[commitment], &[request.from_epoch]),
            public_signals: vec![request.from_epoch.to_string()],
        };
        let process_attestations = (request.from_epoch..request.to_epoch)
            .map(|epoch| ProofOutput {
                proof: Self::digest(&[commitment], &[epoch, request.attester_id]),
                public_signals: vec![epoch.to_string()],
            })
            .collect();
        let mut final_signals = vec![word_signal(&state_leaf)];
        final_signals.extend(epoch_key_nullifiers.iter().map(word_signal));
        final_signals.push(request.to_epoch.to_string());
        let final_transition = ProofOutput {
            proof: Self::digest(&[commitment, state_leaf], &[request.to_epoch]),
            public_signals: final_signals,
        };

        Ok(TransitionProofs {
            from_epoch: request.from_epoch,
            to_epoch: request.to_epoch,
            state_leaf,
            epoch_key_nullifiers,
            start_transition,
            process_attestations,
            final_transition,
        })
    }

    async fn gen_user_sign_up_proof(&self, request: SignUpProofRequest) -> Result<ProofOutput> {
        if !request.reputation.sign_up {
            return Err(Error::Proof("identity has no sign-up record at this attester".into()));
        }
        let epoch_key =
            derive_epoch_key(request.identity.nullifier(), request.epoch, 0, request.epoch_tree_depth);
        Ok(ProofOutput {
            proof: Self::digest(&[request.identity.commitment()], &[request.epoch, request.attester_id]),
            public_signals: vec![
                request.epoch.to_string(),
                epoch_key.to_string(),
                request.attester_id.to_string(),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity { Identity::from_parts([3u8; 32], [4u8; 32]) }

    fn rep(pos: u64) -> Reputation { Reputation { pos_rep: pos, sign_up: true, ..Default::default() } }

    fn request(nonce_list: Vec<i64>, min_rep: u64, balance: u64) -> ReputationProofRequest {
        ReputationProofRequest {
            identity: identity(),
            epoch: 2,
            epoch_key_nonce: 1,
            epoch_tree_depth: 32,
            attester_id: 1,
            min_rep,
            reputation: rep(balance),
            nonce_list,
        }
    }

    #[tokio::test]
    async fn test_reputation_signals_carry_nullifiers() {
        let out = DigestProofSystem.gen_reputation_proof(request(vec![0, 1, -1, -1], 0, 30)).await.unwrap();
        let nullifiers = reputation_nullifiers(&out.public_signals, 4).unwrap();
        assert_eq!(nullifiers.len(), 2);
        assert_eq!(nullifiers[1], reputation_nullifier(identity().nullifier(), 1, 2, 1));
        let epk = epoch_key_signal(&out.public_signals, 5).unwrap();
        assert_eq!(epk, derive_epoch_key(identity().nullifier(), 2, 1, 32));
    }

    #[tokio::test]
    async fn test_reputation_proof_is_deterministic() {
        let a = DigestProofSystem.gen_reputation_proof(request(vec![0, -1], 0, 10)).await.unwrap();
        let b = DigestProofSystem.gen_reputation_proof(request(vec![0, -1], 0, 10)).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_reputation_proof_rejects_overspend() {
        let err = DigestProofSystem.gen_reputation_proof(request(vec![5, -1], 0, 5)).await.unwrap_err();
        assert!(matches!(err, Error::Proof(_)));
        let err = DigestProofSystem.gen_reputation_proof(request(vec![0, -1], 6, 5)).await.unwrap_err();
        assert!(matches!(err, Error::Proof(_)));
    }

    #[tokio::test]
    async fn test_min_rep_is_checked_before_the_spend() {
        // 30 - 10 already spent leaves 20, enough to show 11 while spending 11.
        let ok = DigestProofSystem.gen_reputation_proof(request(vec![10, 11, 12, -1], 11, 30)).await;
        assert!(ok.is_ok());
        let err = DigestProofSystem.gen_reputation_proof(request(vec![3, -1], 3, 5)).await.unwrap_err();
        assert!(matches!(err, Error::Proof(_)));
    }

    #[tokio::test]
    async fn test_transition_outputs() {
        let proofs = DigestProofSystem
            .gen_user_state_transition_proofs(TransitionProofRequest {
                identity: identity(),
                from_epoch: 1,
                to_epoch: 3,
                num_epoch_key_nonce_per_epoch: 3,
                attester_id: 1,
                reputation: rep(30),
            })
            .await
            .unwrap();
        assert_eq!(proofs.epoch_key_nullifiers.len(), 6);
        assert_eq!(proofs.process_attestations.len(), 2);
        assert_eq!(proofs.state_leaf, user_state_leaf(&identity().commitment(), 1, &rep(30), 3));
    }

    #[tokio::test]
    async fn test_sign_up_proof_requires_sign_up() {
        let req = SignUpProofRequest {
            identity: identity(),
            epoch: 1,
            epoch_tree_depth: 32,
            attester_id: 1,
            reputation: Reputation::default(),
        };
        assert!(DigestProofSystem.gen_user_sign_up_proof(req).await.is_err());
    }

    #[test]
    fn test_reputation_nullifiers_rejects_short_signals() {
        assert!(matches!(reputation_nullifiers(&["0".to_string()], 3), Err(Error::Decode(_))));
    }
}
