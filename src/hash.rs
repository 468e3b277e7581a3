// src/hash.rs

use plonky2::hash::poseidon::PoseidonHash;
use plonky2::plonk::config::Hasher;
use plonky2_field::goldilocks_field::GoldilocksField;
use plonky2_field::types::{Field, PrimeField64};
use sha2::{Digest, Sha256};

use crate::types::Bytes32;

/// Splits 32 bytes into four little-endian Goldilocks elements.
pub fn bytes_to_fields(bytes: &Bytes32) -> [GoldilocksField; 4] {
    let mut out = [GoldilocksField::ZERO; 4];
    for (i, chunk) in bytes.chunks(8).enumerate() {
        let mut limb = [0u8; 8];
        limb.copy_from_slice(chunk);
        out[i] = GoldilocksField::from_noncanonical_u64(u64::from_le_bytes(limb));
    }
    out
}

pub fn field(value: u64) -> GoldilocksField { GoldilocksField::from_noncanonical_u64(value) }

/// Poseidon over Goldilocks, serialized as four little-endian u64 limbs.
pub fn poseidon(inputs: &[GoldilocksField]) -> Bytes32 {
    let hash_out = PoseidonHash::hash_no_pad(inputs);
    let mut bytes = [0u8; 32];
    for (i, &element) in hash_out.elements.iter().enumerate() {
        bytes[i * 8..(i + 1) * 8].copy_from_slice(&element.to_canonical_u64().to_le_bytes());
    }
    bytes
}

/// First limb of a Poseidon digest as a u64.
pub fn first_limb(digest: &Bytes32) -> u64 {
    let mut limb = [0u8; 8];
    limb.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(limb)
}

/// Hashes two bytes32 together to form parent node.
pub fn hash_pair(left: Bytes32, right: Bytes32) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut parent = [0u8; 32];
    parent.copy_from_slice(&hasher.finalize());
    parent
}

pub fn sha256(parts: &[&[u8]]) -> Bytes32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poseidon_determinism() {
        let inputs = [field(1), field(2), field(3)];
        assert_eq!(poseidon(&inputs), poseidon(&inputs));
        assert_ne!(poseidon(&inputs), poseidon(&[field(1), field(2), field(4)]));
    }

    #[test]
    fn test_bytes_to_fields_reads_little_endian_limbs() {
        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        bytes[8] = 2;
        let fields = bytes_to_fields(&bytes);
        assert_eq!(fields[0].to_canonical_u64(), 1);
        assert_eq!(fields[1].to_canonical_u64(), 2);
        assert_eq!(fields[3].to_canonical_u64(), 0);
    }

    #[test]
    fn test_hash_pair_inequality() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_ne!(hash_pair(a, b), hash_pair(b, a));
    }
}
