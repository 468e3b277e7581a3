//! Secret identity of a pseudonymous user
//!
//! The identity never leaves the client. Only its commitment is published,
//! at signup; everything else is derived from the nullifier half.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::hash::{bytes_to_fields, poseidon};
use crate::types::Bytes32;

#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    nullifier: Bytes32,
    trapdoor: Bytes32,
}

impl Identity {
    /// Draws a fresh identity from the OS random source.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let mut nullifier = [0u8; 32];
        let mut trapdoor = [0u8; 32];
        rng.fill_bytes(&mut nullifier);
        rng.fill_bytes(&mut trapdoor);
        Self { nullifier, trapdoor }
    }

    pub fn from_parts(nullifier: Bytes32, trapdoor: Bytes32) -> Self { Self { nullifier, trapdoor } }

    pub fn nullifier(&self) -> &Bytes32 { &self.nullifier }

    pub fn trapdoor(&self) -> &Bytes32 { &self.trapdoor }

    /// Hash of both secret halves.
    pub fn secret_hash(&self) -> Bytes32 {
        let mut inputs = bytes_to_fields(&self.nullifier).to_vec();
        inputs.extend_from_slice(&bytes_to_fields(&self.trapdoor));
        poseidon(&inputs)
    }

    /// Public commitment published on signup.
    pub fn commitment(&self) -> Bytes32 { poseidon(&bytes_to_fields(&self.secret_hash())) }

    pub fn commitment_hex(&self) -> String { hex::encode(self.commitment()) }

    /// Encodes the secret as the string the user must keep safe.
    pub fn serialize(&self) -> String {
        let mut raw = Vec::with_capacity(64);
        raw.extend_from_slice(&self.nullifier);
        raw.extend_from_slice(&self.trapdoor);
        STANDARD.encode(raw)
    }

    pub fn deserialize(encoded: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidIdentity(e.to_string()))?;
        if raw.len() != 64 {
            return Err(Error::InvalidIdentity(format!("expected 64 bytes, got {}", raw.len())));
        }
        let mut nullifier = [0u8; 32];
        let mut trapdoor = [0u8; 32];
        nullifier.copy_from_slice(&raw[..32]);
        trapdoor.copy_from_slice(&raw[32..]);
        Ok(Self { nullifier, trapdoor })
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("commitment", &self.commitment_hex()).finish_non_exhaustive()
    }
}

/// Either an already parsed identity or its serialized form.
#[derive(Debug, Clone)]
pub enum IdentityInput {
    Serialized(String),
    Parsed(Identity),
}

impl IdentityInput {
    pub fn into_identity(self) -> Result<Identity> {
        match self {
            IdentityInput::Serialized(s) => Identity::deserialize(&s),
            IdentityInput::Parsed(id) => Ok(id),
        }
    }
}

impl From<Identity> for IdentityInput {
    fn from(id: Identity) -> Self { IdentityInput::Parsed(id) }
}

impl From<&str> for IdentityInput {
    fn from(s: &str) -> Self { IdentityInput::Serialized(s.to_string()) }
}

impl From<String> for IdentityInput {
    fn from(s: String) -> Self { IdentityInput::Serialized(s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_round_trip() {
        let id = Identity::generate();
        let restored = Identity::deserialize(&id.serialize()).unwrap();
        assert_eq!(id, restored);
        assert_eq!(id.commitment(), restored.commitment());
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(matches!(Identity::deserialize("%%%"), Err(Error::InvalidIdentity(_))));
        let short = STANDARD.encode([1u8; 10]);
        assert!(matches!(Identity::deserialize(&short), Err(Error::InvalidIdentity(_))));
    }

    #[test]
    fn test_commitment_depends_on_both_halves() {
        let a = Identity::from_parts([1u8; 32], [2u8; 32]);
        let b = Identity::from_parts([1u8; 32], [3u8; 32]);
        assert_ne!(a.commitment(), b.commitment());
        assert_ne!(a.commitment(), a.secret_hash());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let id = Identity::from_parts([9u8; 32], [8u8; 32]);
        let printed = format!("{id:?}");
        assert!(!printed.contains(&hex::encode([9u8; 32])));
        assert!(printed.contains(&id.commitment_hex()));
    }
}
