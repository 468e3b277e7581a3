// src/chain/mod.rs
//! Chain access
//!
//! [`ChainProvider`] is the only way the client reads the ledger: ordered event
//! logs for the synchronizer plus a handful of view calls. [`rpc`] talks to an
//! Ethereum JSON-RPC node, [`memory`] is a local ledger for development and tests.

pub mod events;
pub mod memory;
pub mod rpc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use events::{EventKind, LedgerEvent, LedgerLog, LogFilter, LogPosition};

use crate::error::Result;
use crate::types::{BlockNumber, Bytes32, Epoch, EpochKey};

/// Inclusion record of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub transaction_id: String,
    pub block_number: BlockNumber,
    pub success: bool,
}

#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Latest block whose logs may be consumed.
    async fn get_block_number(&self) -> Result<BlockNumber>;

    /// Ledger logs emitted in `[from, to]`, inclusive.
    async fn get_logs(&self, from: BlockNumber, to: BlockNumber) -> Result<Vec<LedgerLog>>;

    /// Suspends until the transaction is included.
    async fn wait_for_transaction(&self, transaction_id: &str) -> Result<TxReceipt>;

    async fn current_epoch(&self) -> Result<Epoch>;

    /// Epoch length in seconds.
    async fn epoch_length(&self) -> Result<u64>;

    /// Unix timestamp (seconds) of the last epoch transition.
    async fn latest_epoch_transition_time(&self) -> Result<u64>;

    async fn has_user_signed_up(&self, identity_commitment: &Bytes32) -> Result<bool>;

    async fn is_epoch_key_airdropped(&self, epoch_key: EpochKey) -> Result<bool>;
}
