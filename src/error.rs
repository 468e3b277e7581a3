//! Error types for the reputation ledger client
//!
//! Budget and range violations are raised before any proof or network work
//! starts, so callers can rely on an `Err` from those checks meaning nothing
//! was proven or submitted.

use thiserror::Error;

use crate::types::Epoch;

/// The main error type for the library
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Required external state (ledger mirror, identity, parameters) is not loaded
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Illegal state-machine transition, e.g. rebinding an identity
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Requested epoch key nonce is outside the per-epoch range
    #[error("Epoch key nonce {nonce} out of range (max {max})")]
    EpochKeyRange { nonce: u64, max: u64 },

    /// Spending would exceed the available reputation
    #[error("Not enough reputation: spent {spent} + requested {requested} > balance {balance}")]
    InsufficientReputation { spent: u64, requested: u64, balance: i64 },

    /// A single proof cannot reference more nullifiers than the budget allows
    #[error("Requested {requested} nullifiers but a proof holds at most {max}")]
    ReputationBudgetExceeded { requested: u64, max: u64 },

    /// Every reputation nullifier for this epoch has been consumed
    #[error("All nullifiers are spent for epoch {0}")]
    NullifierExhausted(Epoch),

    /// `wait_for_sync` did not reach its target in time
    #[error("Timed out waiting for sync to block {target} (at {reached})")]
    SyncTimeout { target: u64, reached: u64 },

    /// The submission backend answered with an error payload
    #[error("Submission rejected: {0}")]
    Submission(String),

    /// RPC or HTTP transport failure
    #[error("Network error: {0}")]
    TransientNetwork(String),

    /// Serialized identity could not be parsed
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// The proof system failed to produce a proof
    #[error("Proof generation failed: {0}")]
    Proof(String),

    /// Malformed data returned by the chain
    #[error("Decode error: {0}")]
    Decode(String),

    /// Local snapshot store failure
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Snapshot (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self { Error::TransientNetwork(err.to_string()) }
}

impl Error {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientNetwork(_) | Error::SyncTimeout { .. })
    }
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_errors_are_not_transient() {
        let err = Error::InsufficientReputation { spent: 5, requested: 26, balance: 30 };
        assert!(!err.is_transient());
        assert!(Error::TransientNetwork("reset".into()).is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::EpochKeyRange { nonce: 3, max: 3 };
        assert_eq!(err.to_string(), "Epoch key nonce 3 out of range (max 3)");
        assert_eq!(
            Error::NullifierExhausted(4).to_string(),
            "All nullifiers are spent for epoch 4"
        );
    }
}
