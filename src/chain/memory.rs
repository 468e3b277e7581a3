//! In-process ledger
//!
//! Every call to [`InMemoryChain::mine`] produces one block holding the given
//! events. Contract views (current epoch, sign-ups, airdrops) follow the mined
//! events the way the deployed contract would.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{ChainProvider, LedgerEvent, LedgerLog, TxReceipt};
use crate::error::{Error, Result};
use crate::types::{BlockNumber, Bytes32, Epoch, EpochKey};

#[derive(Debug)]
struct ChainInner {
    block_number: BlockNumber,
    logs: Vec<LedgerLog>,
    receipts: HashMap<String, TxReceipt>,
    current_epoch: Epoch,
    epoch_length: u64,
    latest_transition_time: u64,
    signed_up: HashSet<Bytes32>,
    airdropped: HashSet<EpochKey>,
    failures_pending: u32,
    next_tx: u64,
}

#[derive(Debug)]
pub struct InMemoryChain {
    inner: Mutex<ChainInner>,
}

impl Default for InMemoryChain {
    fn default() -> Self { Self::new() }
}

impl InMemoryChain {
    /// Empty chain at block 0, epoch 1, started now.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ChainInner {
                block_number: 0,
                logs: Vec::new(),
                receipts: HashMap::new(),
                current_epoch: 1,
                epoch_length: 15 * 60,
                latest_transition_time: chrono::Utc::now().timestamp().max(0) as u64,
                signed_up: HashSet::new(),
                airdropped: HashSet::new(),
                failures_pending: 0,
                next_tx: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainInner> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mines one block carrying `events` in one transaction and returns its receipt.
    pub fn mine(&self, events: Vec<LedgerEvent>) -> TxReceipt {
        let mut inner = self.lock();
        inner.block_number += 1;
        inner.next_tx += 1;
        let block_number = inner.block_number;
        let transaction_id = format!("0x{:064x}", inner.next_tx);
        for (log_index, event) in events.into_iter().enumerate() {
            match &event {
                LedgerEvent::UserSignedUp { identity_commitment, .. } => {
                    inner.signed_up.insert(*identity_commitment);
                }
                LedgerEvent::EpochEnded { epoch } => {
                    inner.current_epoch = epoch + 1;
                    inner.latest_transition_time += inner.epoch_length;
                }
                _ => {}
            }
            inner.logs.push(LedgerLog {
                block_number,
                log_index: log_index as u64,
                transaction_id: transaction_id.clone(),
                event,
            });
        }
        let receipt = TxReceipt { transaction_id: transaction_id.clone(), block_number, success: true };
        inner.receipts.insert(transaction_id, receipt.clone());
        debug!(block_number, "mined block");
        receipt
    }

    /// Mines `count` empty blocks.
    pub fn mine_empty(&self, count: u64) {
        for _ in 0..count {
            self.mine(Vec::new());
        }
    }

    /// Ends the current epoch in a new block.
    pub fn end_epoch(&self) -> TxReceipt {
        let epoch = self.lock().current_epoch;
        self.mine(vec![LedgerEvent::EpochEnded { epoch }])
    }

    /// Makes the next `count` provider calls fail with a network error.
    pub fn fail_next_calls(&self, count: u32) { self.lock().failures_pending = count; }

    pub fn mark_airdropped(&self, epoch_key: EpochKey) { self.lock().airdropped.insert(epoch_key); }

    pub fn set_epoch_timing(&self, latest_transition_time: u64, epoch_length: u64) {
        let mut inner = self.lock();
        inner.latest_transition_time = latest_transition_time;
        inner.epoch_length = epoch_length;
    }

    pub fn block_number(&self) -> BlockNumber { self.lock().block_number }

    pub fn logs(&self) -> Vec<LedgerLog> { self.lock().logs.clone() }

    fn check_failure(inner: &mut ChainInner, call: &str) -> Result<()> {
        if inner.failures_pending > 0 {
            inner.failures_pending -= 1;
            return Err(Error::TransientNetwork(format!("{call}: connection refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainProvider for InMemoryChain {
    async fn get_block_number(&self) -> Result<BlockNumber> {
        let mut inner = self.lock();
        Self::check_failure(&mut inner, "eth_blockNumber")?;
        Ok(inner.block_number)
    }

    async fn get_logs(&self, from: BlockNumber, to: BlockNumber) -> Result<Vec<LedgerLog>> {
        let mut inner = self.lock();
        Self::check_failure(&mut inner, "eth_getLogs")?;
        Ok(inner
            .logs
            .iter()
            .filter(|log| log.block_number >= from && log.block_number <= to)
            .cloned()
            .collect())
    }

    async fn wait_for_transaction(&self, transaction_id: &str) -> Result<TxReceipt> {
        let mut inner = self.lock();
        Self::check_failure(&mut inner, "eth_getTransactionReceipt")?;
        inner
            .receipts
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| Error::Submission(format!("unknown transaction {transaction_id}")))
    }

    async fn current_epoch(&self) -> Result<Epoch> {
        let mut inner = self.lock();
        Self::check_failure(&mut inner, "currentEpoch")?;
        Ok(inner.current_epoch)
    }

    async fn epoch_length(&self) -> Result<u64> { Ok(self.lock().epoch_length) }

    async fn latest_epoch_transition_time(&self) -> Result<u64> {
        Ok(self.lock().latest_transition_time)
    }

    async fn has_user_signed_up(&self, identity_commitment: &Bytes32) -> Result<bool> {
        Ok(self.lock().signed_up.contains(identity_commitment))
    }

    async fn is_epoch_key_airdropped(&self, epoch_key: EpochKey) -> Result<bool> {
        Ok(self.lock().airdropped.contains(&epoch_key))
    }
}
