//! Epoch key and nullifier derivation
//!
//! Every derivation is a Poseidon hash over Goldilocks with its own domain tag
//! as the last input, so an epoch key can never collide with a nullifier built
//! from the same numbers. The layout must stay bit-for-bit stable: the prover
//! and the on-chain verifier recompute the same values.

use crate::hash::{bytes_to_fields, field, first_limb, poseidon};
use crate::types::{AttesterId, Bytes32, Epoch, EpochKey};

const EPOCH_KEY_DOMAIN: u64 = 0x6570_6b;
const REPUTATION_NULLIFIER_DOMAIN: u64 = 0x7265_706e;
const EPOCH_KEY_NULLIFIER_DOMAIN: u64 = 0x6570_6e;

/// Largest epoch tree depth an epoch key can be truncated to.
pub const MAX_EPOCH_TREE_DEPTH: u8 = 64;

/// Derives the pseudonym for `(epoch, nonce)`, truncated to `tree_depth` bits.
pub fn derive_epoch_key(
    identity_nullifier: &Bytes32,
    epoch: Epoch,
    nonce: u64,
    tree_depth: u8,
) -> EpochKey {
    let mut inputs = bytes_to_fields(identity_nullifier).to_vec();
    inputs.push(field(epoch));
    inputs.push(field(nonce));
    inputs.push(field(EPOCH_KEY_DOMAIN));
    let raw = first_limb(&poseidon(&inputs));
    EpochKey(truncate(raw, tree_depth))
}

/// All `count` epoch keys of one epoch, in nonce order.
pub fn derive_all_epoch_keys(
    identity_nullifier: &Bytes32,
    epoch: Epoch,
    count: u64,
    tree_depth: u8,
) -> Vec<EpochKey> {
    (0..count).map(|nonce| derive_epoch_key(identity_nullifier, epoch, nonce, tree_depth)).collect()
}

/// Single-use token published when reputation unit `index` is spent at `attester_id`.
pub fn reputation_nullifier(
    identity_nullifier: &Bytes32,
    attester_id: AttesterId,
    epoch: Epoch,
    index: u64,
) -> Bytes32 {
    let mut inputs = bytes_to_fields(identity_nullifier).to_vec();
    inputs.push(field(attester_id));
    inputs.push(field(epoch));
    inputs.push(field(index));
    inputs.push(field(REPUTATION_NULLIFIER_DOMAIN));
    poseidon(&inputs)
}

/// Token published when an epoch key is retired by a user state transition.
pub fn epoch_key_nullifier(identity_nullifier: &Bytes32, epoch: Epoch, nonce: u64) -> Bytes32 {
    let mut inputs = bytes_to_fields(identity_nullifier).to_vec();
    inputs.push(field(epoch));
    inputs.push(field(nonce));
    inputs.push(field(EPOCH_KEY_NULLIFIER_DOMAIN));
    poseidon(&inputs)
}

fn truncate(raw: u64, tree_depth: u8) -> u64 {
    if tree_depth >= MAX_EPOCH_TREE_DEPTH {
        raw
    } else {
        raw & ((1u64 << tree_depth) - 1)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const NULLIFIER: Bytes32 = [42u8; 32];

    #[test]
    fn test_derive_epoch_key_is_pure() {
        let a = derive_epoch_key(&NULLIFIER, 3, 1, 32);
        let b = derive_epoch_key(&NULLIFIER, 3, 1, 32);
        assert_eq!(a, b);
    }

    #[test]
    fn test_nonces_give_distinct_keys() {
        let keys = derive_all_epoch_keys(&NULLIFIER, 7, 3, 64);
        assert_eq!(keys.len(), 3);
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(keys[2], derive_epoch_key(&NULLIFIER, 7, 2, 64));
    }

    #[test]
    fn test_epochs_and_identities_give_distinct_keys() {
        assert_ne!(derive_epoch_key(&NULLIFIER, 1, 0, 64), derive_epoch_key(&NULLIFIER, 2, 0, 64));
        assert_ne!(derive_epoch_key(&NULLIFIER, 1, 0, 64), derive_epoch_key(&[1u8; 32], 1, 0, 64));
    }

    #[test]
    fn test_truncation_to_tree_depth() {
        for depth in [1u8, 8, 17, 32, 63] {
            let key = derive_epoch_key(&NULLIFIER, 5, 0, depth);
            assert!(key.as_u64() < (1u64 << depth), "depth {depth}");
        }
        let full = derive_epoch_key(&NULLIFIER, 5, 0, 64);
        let low = derive_epoch_key(&NULLIFIER, 5, 0, 16);
        assert_eq!(full.as_u64() & 0xffff, low.as_u64());
    }

    #[test]
    fn test_nullifiers_are_domain_separated() {
        let rep = reputation_nullifier(&NULLIFIER, 1, 2, 0);
        let epk = epoch_key_nullifier(&NULLIFIER, 2, 0);
        assert_ne!(rep, epk);
        assert_ne!(rep, reputation_nullifier(&NULLIFIER, 1, 2, 1));
        assert_ne!(rep, reputation_nullifier(&NULLIFIER, 2, 2, 0));
    }
}
