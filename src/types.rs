//! Core type definitions shared across the client
//!
//! This module defines fundamental types used across multiple modules,
//! providing a centralized location for shared type definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Type alias for 32-byte arrays used across cryptographic operations
pub type Bytes32 = [u8; 32];

/// Epoch counter as tracked by the ledger contract.
pub type Epoch = u64;

/// Block height on the underlying chain.
pub type BlockNumber = u64;

/// Identifier of an attester registered with the ledger.
pub type AttesterId = u64;

/// A per-epoch pseudonym, already truncated to the epoch tree depth.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EpochKey(pub u64);

impl EpochKey {
    pub fn as_u64(&self) -> u64 { self.0 }

    /// Big-endian 32-byte word, the layout used by the ledger contract.
    pub fn to_word(&self) -> Bytes32 {
        let mut word = [0u8; 32];
        word[24..].copy_from_slice(&self.0.to_be_bytes());
        word
    }
}

impl fmt::Display for EpochKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:x}", self.0) }
}

impl FromStr for EpochKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim_start_matches("0x");
        u64::from_str_radix(digits, 16)
            .map(EpochKey)
            .map_err(|e| Error::Decode(format!("invalid epoch key {s:?}: {e}")))
    }
}

/// Reputation held by one epoch key or one user at one attester.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Reputation {
    pub pos_rep: u64,
    pub neg_rep: u64,
    pub graffiti: Bytes32,
    pub sign_up: bool,
}

impl Reputation {
    pub fn balance(&self) -> i64 { self.pos_rep as i64 - self.neg_rep as i64 }

    /// Adds an attestation on top of the reputation already held.
    pub fn absorb(&mut self, pos_rep: u64, neg_rep: u64, graffiti: Bytes32) {
        self.pos_rep = self.pos_rep.saturating_add(pos_rep);
        self.neg_rep = self.neg_rep.saturating_add(neg_rep);
        if graffiti != [0u8; 32] {
            self.graffiti = graffiti;
        }
    }

    pub fn merge(&mut self, other: &Reputation) {
        self.absorb(other.pos_rep, other.neg_rep, other.graffiti);
        self.sign_up |= other.sign_up;
    }
}
