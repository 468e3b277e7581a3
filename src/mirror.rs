//! Local mirror of the ledger contract state
//!
//! The mirror only changes by replaying [`LedgerLog`]s in chain order. Each log
//! moves the cursor forward; a log at or before the cursor is skipped, which is
//! what makes re-syncing over a restored snapshot safe.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chain::{LedgerEvent, LedgerLog, LogPosition};
use crate::hash::{bytes_to_fields, field, poseidon, sha256};
use crate::tree::StateTree;
use crate::types::{AttesterId, BlockNumber, Bytes32, Epoch, EpochKey, Reputation};

/// Leaf inserted into the global state tree when an identity signs up.
pub fn sign_up_leaf(identity_commitment: &Bytes32, attester_id: AttesterId, airdrop: u64) -> Bytes32 {
    let mut inputs = bytes_to_fields(identity_commitment).to_vec();
    inputs.push(field(attester_id));
    inputs.push(field(airdrop));
    poseidon(&inputs)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpRecord {
    pub epoch: Epoch,
    pub attester_id: AttesterId,
    pub airdrop: u64,
    pub leaf_index: usize,
}

/// Attestations received by epoch keys during one epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochTree {
    /// epoch key -> attester -> accumulated reputation
    attestations: BTreeMap<u64, BTreeMap<AttesterId, Reputation>>,
    sealed_root: Option<Bytes32>,
}

impl EpochTree {
    pub fn reputation(&self, epoch_key: EpochKey, attester_id: AttesterId) -> Reputation {
        self.attestations
            .get(&epoch_key.as_u64())
            .and_then(|by_attester| by_attester.get(&attester_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn attesters_of(&self, epoch_key: EpochKey) -> impl Iterator<Item = (&AttesterId, &Reputation)> {
        self.attestations.get(&epoch_key.as_u64()).into_iter().flat_map(|m| m.iter())
    }

    pub fn is_sealed(&self) -> bool { self.sealed_root.is_some() }

    pub fn sealed_root(&self) -> Option<Bytes32> { self.sealed_root }

    /// Root over every (epoch key, attester) entry in key order.
    pub fn compute_root(&self) -> Bytes32 {
        let leaves = self.attestations.iter().flat_map(|(epk, by_attester)| {
            by_attester.iter().map(move |(attester, rep)| {
                sha256(&[
                    &EpochKey(*epk).to_word(),
                    &attester.to_be_bytes(),
                    &rep.pos_rep.to_be_bytes(),
                    &rep.neg_rep.to_be_bytes(),
                    &rep.graffiti,
                ])
            })
        });
        StateTree::from_leaves(leaves).root()
    }

    fn absorb(&mut self, epoch_key: EpochKey, attester_id: AttesterId, pos: u64, neg: u64, graffiti: Bytes32) {
        self.attestations
            .entry(epoch_key.as_u64())
            .or_default()
            .entry(attester_id)
            .or_default()
            .absorb(pos, neg, graffiti);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalLedgerMirror {
    current_epoch: Epoch,
    start_block: BlockNumber,
    last_processed_block: BlockNumber,
    cursor: Option<LogPosition>,
    state_trees: BTreeMap<Epoch, StateTree>,
    epoch_trees: BTreeMap<Epoch, EpochTree>,
    /// commitment hex -> record
    sign_ups: BTreeMap<String, SignUpRecord>,
    reputation_nullifiers: BTreeSet<Bytes32>,
    epoch_key_nullifiers: BTreeSet<Bytes32>,
}

impl GlobalLedgerMirror {
    /// Empty mirror; logs are read from the block after `start_block`.
    pub fn new(start_block: BlockNumber) -> Self {
        Self {
            current_epoch: 1,
            start_block,
            last_processed_block: start_block,
            cursor: None,
            state_trees: BTreeMap::new(),
            epoch_trees: BTreeMap::new(),
            sign_ups: BTreeMap::new(),
            reputation_nullifiers: BTreeSet::new(),
            epoch_key_nullifiers: BTreeSet::new(),
        }
    }

    /// Rebuilds derived tree levels after loading from a snapshot.
    pub fn restore(&mut self) {
        for tree in self.state_trees.values_mut() {
            tree.restore();
        }
    }

    pub fn current_epoch(&self) -> Epoch { self.current_epoch }

    pub fn start_block(&self) -> BlockNumber { self.start_block }

    pub fn last_processed_block(&self) -> BlockNumber { self.last_processed_block }

    pub fn cursor(&self) -> Option<LogPosition> { self.cursor }

    /// Records that every log up to `block` has been applied.
    pub fn mark_processed(&mut self, block: BlockNumber) {
        self.last_processed_block = self.last_processed_block.max(block);
    }

    /// Applies one log. Returns `false` when the log was already applied.
    pub fn apply(&mut self, log: &LedgerLog) -> bool {
        let position = log.position();
        if self.cursor.is_some_and(|cursor| position <= cursor) {
            debug!(block = log.block_number, index = log.log_index, "skipping applied log");
            return false;
        }
        self.apply_event(&log.event, log);
        self.cursor = Some(position);
        self.mark_processed(log.block_number);
        true
    }

    fn apply_event(&mut self, event: &LedgerEvent, log: &LedgerLog) {
        match event {
            LedgerEvent::UserSignedUp { epoch, identity_commitment, attester_id, airdrop } => {
                let key = hex::encode(identity_commitment);
                if self.sign_ups.contains_key(&key) {
                    warn!(commitment = %key, tx = %log.transaction_id, "duplicate sign-up ignored");
                    return;
                }
                let leaf = sign_up_leaf(identity_commitment, *attester_id, *airdrop);
                let leaf_index = self.state_trees.entry(*epoch).or_default().insert(leaf);
                self.sign_ups.insert(
                    key,
                    SignUpRecord { epoch: *epoch, attester_id: *attester_id, airdrop: *airdrop, leaf_index },
                );
            }
            LedgerEvent::AttestationSubmitted {
                epoch,
                epoch_key,
                attester_id,
                pos_rep,
                neg_rep,
                graffiti,
                spent_nullifiers,
            } => {
                if let Some(dup) = spent_nullifiers.iter().find(|n| self.reputation_nullifiers.contains(*n)) {
                    warn!(
                        nullifier = %hex::encode(dup),
                        tx = %log.transaction_id,
                        "attestation reuses a spent nullifier, ignored"
                    );
                    return;
                }
                let tree = self.epoch_trees.entry(*epoch).or_default();
                if tree.is_sealed() {
                    warn!(epoch, "attestation for a sealed epoch");
                }
                tree.absorb(*epoch_key, *attester_id, *pos_rep, *neg_rep, *graffiti);
                self.reputation_nullifiers.extend(spent_nullifiers.iter().copied());
            }
            LedgerEvent::EpochEnded { epoch } => {
                let tree = self.epoch_trees.entry(*epoch).or_default();
                tree.sealed_root = Some(tree.compute_root());
                self.current_epoch = epoch + 1;
            }
            LedgerEvent::UserStateTransitioned { to_epoch, state_leaf, epoch_key_nullifiers } => {
                if let Some(dup) =
                    epoch_key_nullifiers.iter().find(|n| self.epoch_key_nullifiers.contains(*n))
                {
                    warn!(nullifier = %hex::encode(dup), "transition reuses an epoch key nullifier, ignored");
                    return;
                }
                self.state_trees.entry(*to_epoch).or_default().insert(*state_leaf);
                self.epoch_key_nullifiers.extend(epoch_key_nullifiers.iter().copied());
            }
        }
    }

    pub fn state_tree(&self, epoch: Epoch) -> Option<&StateTree> { self.state_trees.get(&epoch) }

    pub fn state_root(&self, epoch: Epoch) -> Bytes32 {
        self.state_trees.get(&epoch).map(StateTree::root).unwrap_or([0u8; 32])
    }

    pub fn epoch_tree(&self, epoch: Epoch) -> Option<&EpochTree> { self.epoch_trees.get(&epoch) }

    /// Reputation received by `epoch_key` from `attester_id` during `epoch`.
    pub fn reputation_of(&self, epoch: Epoch, epoch_key: EpochKey, attester_id: AttesterId) -> Reputation {
        self.epoch_trees
            .get(&epoch)
            .map(|tree| tree.reputation(epoch_key, attester_id))
            .unwrap_or_default()
    }

    pub fn sign_up(&self, identity_commitment: &Bytes32) -> Option<&SignUpRecord> {
        self.sign_ups.get(&hex::encode(identity_commitment))
    }

    pub fn is_reputation_nullifier_spent(&self, nullifier: &Bytes32) -> bool {
        self.reputation_nullifiers.contains(nullifier)
    }

    pub fn is_epoch_key_nullifier_spent(&self, nullifier: &Bytes32) -> bool {
        self.epoch_key_nullifiers.contains(nullifier)
    }

    pub fn spent_reputation_nullifiers(&self) -> usize { self.reputation_nullifiers.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(block: u64, index: u64, event: LedgerEvent) -> LedgerLog {
        LedgerLog { block_number: block, log_index: index, transaction_id: format!("0x{block:x}"), event }
    }

    fn attestation(epoch: Epoch, epk: u64, pos: u64, nullifiers: Vec<Bytes32>) -> LedgerEvent {
        LedgerEvent::AttestationSubmitted {
            epoch,
            epoch_key: EpochKey(epk),
            attester_id: 1,
            pos_rep: pos,
            neg_rep: 0,
            graffiti: [0u8; 32],
            spent_nullifiers: nullifiers,
        }
    }

    #[test]
    fn test_new_mirror() {
        let mirror = GlobalLedgerMirror::new(100);
        assert_eq!(mirror.current_epoch(), 1);
        assert_eq!(mirror.last_processed_block(), 100);
        assert!(mirror.cursor().is_none());
    }

    #[test]
    fn test_sign_up_inserts_leaf() {
        let mut mirror = GlobalLedgerMirror::new(0);
        let commitment = [5u8; 32];
        mirror.apply(&log(1, 0, LedgerEvent::UserSignedUp {
            epoch: 1,
            identity_commitment: commitment,
            attester_id: 1,
            airdrop: 30,
        }));
        let record = mirror.sign_up(&commitment).unwrap();
        assert_eq!(record.leaf_index, 0);
        assert_eq!(mirror.state_root(1), sign_up_leaf(&commitment, 1, 30));
    }

    #[test]
    fn test_attestations_accumulate() {
        let mut mirror = GlobalLedgerMirror::new(0);
        mirror.apply(&log(1, 0, attestation(1, 9, 30, vec![])));
        mirror.apply(&log(1, 1, attestation(1, 9, 5, vec![[1u8; 32]])));
        assert_eq!(mirror.reputation_of(1, EpochKey(9), 1).pos_rep, 35);
        assert!(mirror.is_reputation_nullifier_spent(&[1u8; 32]));
        assert_eq!(mirror.reputation_of(2, EpochKey(9), 1), Reputation::default());
    }

    #[test]
    fn test_duplicate_nullifier_is_not_double_counted() {
        let mut mirror = GlobalLedgerMirror::new(0);
        mirror.apply(&log(1, 0, attestation(1, 9, 5, vec![[1u8; 32]])));
        assert!(mirror.apply(&log(2, 0, attestation(1, 9, 5, vec![[1u8; 32]]))));
        assert_eq!(mirror.reputation_of(1, EpochKey(9), 1).pos_rep, 5);
        assert_eq!(mirror.spent_reputation_nullifiers(), 1);
    }

    #[test]
    fn test_replayed_log_is_skipped() {
        let mut mirror = GlobalLedgerMirror::new(0);
        let entry = log(3, 0, attestation(1, 9, 5, vec![]));
        assert!(mirror.apply(&entry));
        assert!(!mirror.apply(&entry));
        assert!(!mirror.apply(&log(2, 7, attestation(1, 9, 5, vec![]))));
        assert_eq!(mirror.reputation_of(1, EpochKey(9), 1).pos_rep, 5);
    }

    #[test]
    fn test_epoch_ended_seals_and_advances() {
        let mut mirror = GlobalLedgerMirror::new(0);
        mirror.apply(&log(1, 0, attestation(1, 9, 5, vec![])));
        mirror.apply(&log(2, 0, LedgerEvent::EpochEnded { epoch: 1 }));
        assert_eq!(mirror.current_epoch(), 2);
        let tree = mirror.epoch_tree(1).unwrap();
        assert!(tree.is_sealed());
        assert_eq!(tree.sealed_root(), Some(tree.compute_root()));
    }

    #[test]
    fn test_state_transition_records_nullifiers() {
        let mut mirror = GlobalLedgerMirror::new(0);
        mirror.apply(&log(1, 0, LedgerEvent::UserStateTransitioned {
            to_epoch: 2,
            state_leaf: [4u8; 32],
            epoch_key_nullifiers: vec![[6u8; 32]],
        }));
        assert_eq!(mirror.state_tree(2).unwrap().len(), 1);
        assert!(mirror.is_epoch_key_nullifier_spent(&[6u8; 32]));
    }

    #[test]
    fn test_snapshot_round_trip_restores_trees() {
        let mut mirror = GlobalLedgerMirror::new(0);
        for i in 0..3u8 {
            mirror.apply(&log(1, i as u64, LedgerEvent::UserSignedUp {
                epoch: 1,
                identity_commitment: [i; 32],
                attester_id: 1,
                airdrop: 30,
            }));
        }
        let json = serde_json::to_string(&mirror).unwrap();
        let mut restored: GlobalLedgerMirror = serde_json::from_str(&json).unwrap();
        restored.restore();
        assert_eq!(restored, mirror);
    }
}
