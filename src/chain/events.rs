//! Decoded ledger contract events

use serde::{Deserialize, Serialize};

use crate::types::{AttesterId, BlockNumber, Bytes32, Epoch, EpochKey};

/// Event emitted by the ledger contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    UserSignedUp {
        epoch: Epoch,
        identity_commitment: Bytes32,
        attester_id: AttesterId,
        airdrop: u64,
    },
    AttestationSubmitted {
        epoch: Epoch,
        epoch_key: EpochKey,
        attester_id: AttesterId,
        pos_rep: u64,
        neg_rep: u64,
        graffiti: Bytes32,
        /// Reputation nullifiers consumed by the proof behind this attestation
        spent_nullifiers: Vec<Bytes32>,
    },
    EpochEnded {
        epoch: Epoch,
    },
    UserStateTransitioned {
        to_epoch: Epoch,
        state_leaf: Bytes32,
        epoch_key_nullifiers: Vec<Bytes32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    UserSignedUp,
    AttestationSubmitted,
    EpochEnded,
    UserStateTransitioned,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::UserSignedUp,
        EventKind::AttestationSubmitted,
        EventKind::EpochEnded,
        EventKind::UserStateTransitioned,
    ];
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LedgerEvent::UserSignedUp { .. } => EventKind::UserSignedUp,
            LedgerEvent::AttestationSubmitted { .. } => EventKind::AttestationSubmitted,
            LedgerEvent::EpochEnded { .. } => EventKind::EpochEnded,
            LedgerEvent::UserStateTransitioned { .. } => EventKind::UserStateTransitioned,
        }
    }
}

/// Position of a log in the chain's total order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub block_number: BlockNumber,
    pub log_index: u64,
}

/// An event together with where it was emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLog {
    pub block_number: BlockNumber,
    pub log_index: u64,
    pub transaction_id: String,
    pub event: LedgerEvent,
}

impl LedgerLog {
    pub fn position(&self) -> LogPosition {
        LogPosition { block_number: self.block_number, log_index: self.log_index }
    }
}

/// Selects which event kinds a subscriber receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    kinds: Option<Vec<EventKind>>,
}

impl LogFilter {
    pub fn all() -> Self { Self { kinds: None } }

    pub fn only(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self { kinds: Some(kinds.into_iter().collect()) }
    }

    pub fn matches(&self, log: &LedgerLog) -> bool {
        match &self.kinds {
            None => true,
            Some(kinds) => kinds.contains(&log.event.kind()),
        }
    }
}
