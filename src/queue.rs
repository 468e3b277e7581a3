// src/queue.rs
//! Single-flight operation queue
//!
//! Chain-mutating work runs one operation at a time in submission order. Each
//! operation reports progress through a [`StatusReporter`] and ends as
//! `Succeeded` or `Failed`; terminal records stay visible until dismissed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chain::ChainProvider;
use crate::error::{Error, Result};
use crate::sync::ChainStateSynchronizer;
use crate::types::BlockNumber;

pub type OperationId = Uuid;

type Job = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;
type Work = Box<dyn FnOnce(StatusReporter) -> Job + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool { matches!(self, OperationState::Succeeded | OperationState::Failed) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub title: String,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub state: OperationState,
    pub status: StatusUpdate,
    pub success_message: Option<String>,
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    pub title: String,
    pub success_message: Option<String>,
}

impl OperationOptions {
    pub fn new(title: impl Into<String>) -> Self { Self { title: title.into(), success_message: None } }

    pub fn with_success_message(mut self, message: impl Into<String>) -> Self {
        self.success_message = Some(message.into());
        self
    }
}

/// Coarse state for a loading widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadingState {
    None,
    Loading,
    Success,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Visible operations in submission order
    pub operations: Vec<OperationRecord>,
}

impl QueueSnapshot {
    pub fn get(&self, id: OperationId) -> Option<&OperationRecord> { self.operations.iter().find(|op| op.id == id) }

    fn get_mut(&mut self, id: OperationId) -> Option<&mut OperationRecord> {
        self.operations.iter_mut().find(|op| op.id == id)
    }

    pub fn running(&self) -> Option<&OperationRecord> {
        self.operations.iter().find(|op| op.state == OperationState::Running)
    }

    pub fn loading_state(&self) -> LoadingState {
        match self.operations.last().map(|op| op.state) {
            None => LoadingState::None,
            Some(OperationState::Queued | OperationState::Running) => LoadingState::Loading,
            Some(OperationState::Succeeded) => LoadingState::Success,
            Some(OperationState::Failed) => LoadingState::Failed,
        }
    }
}

/// Publishes progress of one running operation.
#[derive(Clone)]
pub struct StatusReporter {
    id: OperationId,
    snapshot: Arc<watch::Sender<QueueSnapshot>>,
}

impl StatusReporter {
    pub fn id(&self) -> OperationId { self.id }

    pub fn update(&self, title: impl Into<String>, details: impl Into<String>) {
        let status = StatusUpdate { title: title.into(), details: details.into() };
        debug!(operation = %self.id, title = %status.title, "operation status");
        self.snapshot.send_if_modified(|s| match s.get_mut(self.id) {
            Some(op) => {
                op.status = status;
                true
            }
            None => false,
        });
    }
}

struct Queued {
    id: OperationId,
    work: Work,
}

pub struct OperationQueue {
    sender: mpsc::UnboundedSender<Queued>,
    snapshot: Arc<watch::Sender<QueueSnapshot>>,
    worker: JoinHandle<()>,
}

impl OperationQueue {
    /// Starts the worker; must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(QueueSnapshot::default());
        let snapshot = Arc::new(snapshot);
        let worker = tokio::spawn(run_worker(receiver, Arc::clone(&snapshot)));
        Self { sender, snapshot, worker }
    }

    fn enqueue(&self, options: OperationOptions, work: Work) -> OperationId {
        let id = Uuid::new_v4();
        let record = OperationRecord {
            id,
            state: OperationState::Queued,
            status: StatusUpdate { title: options.title, details: String::new() },
            success_message: options.success_message,
            error: None,
            queued_at: Utc::now(),
            finished_at: None,
        };
        self.snapshot.send_modify(|s| s.operations.push(record));
        if self.sender.send(Queued { id, work }).is_err() {
            finish(&self.snapshot, id, Err("operation queue has stopped".into()));
        }
        id
    }

    /// Enqueues `work`; it runs after every operation added before it.
    pub fn add_op<F, Fut>(&self, options: OperationOptions, work: F) -> OperationId
    where
        F: FnOnce(StatusReporter) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.enqueue(
            options,
            Box::new(move |status| Box::pin(async move { work(status).await.map_err(|e| e.to_string()) })),
        )
    }

    /// Enqueues `work` and waits for its result.
    pub async fn run<T, F, Fut>(&self, options: OperationOptions, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(StatusReporter) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.enqueue(
            options,
            Box::new(move |status| {
                Box::pin(async move {
                    let result = work(status).await;
                    let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
                    let _ = tx.send(result);
                    outcome
                })
            }),
        );
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                let record = self.wait_for(id).await?;
                Err(Error::InvalidState(record.error.unwrap_or_else(|| "operation aborted".into())))
            }
        }
    }

    /// Waits until operation `id` is terminal and returns its record.
    pub async fn wait_for(&self, id: OperationId) -> Result<OperationRecord> {
        let mut rx = self.snapshot.subscribe();
        let snapshot = rx
            .wait_for(|s| s.get(id).map_or(true, |op| op.state.is_terminal()))
            .await
            .map_err(|_| Error::InvalidState("operation queue has stopped".into()))?;
        snapshot.get(id).cloned().ok_or_else(|| Error::InvalidState(format!("unknown operation {id}")))
    }

    /// Removes a terminal operation. Returns false if `id` is not visible.
    pub fn dismiss(&self, id: OperationId) -> Result<bool> {
        let mut outcome = Ok(false);
        self.snapshot.send_if_modified(|s| {
            let Some(index) = s.operations.iter().position(|op| op.id == id) else {
                return false;
            };
            if !s.operations[index].state.is_terminal() {
                outcome = Err(Error::InvalidState(format!("operation {id} has not finished")));
                return false;
            }
            s.operations.remove(index);
            outcome = Ok(true);
            true
        });
        outcome
    }

    /// Dismisses every terminal operation.
    pub fn reset_loading(&self) {
        self.snapshot.send_if_modified(|s| {
            let before = s.operations.len();
            s.operations.retain(|op| !op.state.is_terminal());
            s.operations.len() != before
        });
    }

    pub fn snapshot(&self) -> QueueSnapshot { self.snapshot.borrow().clone() }

    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> { self.snapshot.subscribe() }

    pub fn loading_state(&self) -> LoadingState { self.snapshot.borrow().loading_state() }
}

impl Default for OperationQueue {
    fn default() -> Self { Self::new() }
}

impl Drop for OperationQueue {
    fn drop(&mut self) { self.worker.abort(); }
}

fn finish(snapshot: &watch::Sender<QueueSnapshot>, id: OperationId, outcome: std::result::Result<(), String>) {
    snapshot.send_modify(|s| {
        if let Some(op) = s.get_mut(id) {
            op.finished_at = Some(Utc::now());
            match outcome {
                Ok(()) => op.state = OperationState::Succeeded,
                Err(message) => {
                    op.state = OperationState::Failed;
                    op.error = Some(message);
                }
            }
        }
    });
}

async fn run_worker(mut receiver: mpsc::UnboundedReceiver<Queued>, snapshot: Arc<watch::Sender<QueueSnapshot>>) {
    while let Some(Queued { id, work }) = receiver.recv().await {
        snapshot.send_modify(|s| {
            if let Some(op) = s.get_mut(id) {
                op.state = OperationState::Running;
            }
        });
        let reporter = StatusReporter { id, snapshot: Arc::clone(&snapshot) };
        // A panic inside the operation surfaces as a join error here.
        let outcome = match tokio::spawn(work(reporter)).await {
            Ok(outcome) => outcome,
            Err(e) => Err(format!("operation aborted: {e}")),
        };
        match &outcome {
            Ok(()) => info!(operation = %id, "operation succeeded"),
            Err(message) => warn!(operation = %id, error = %message, "operation failed"),
        }
        finish(&snapshot, id, outcome);
    }
}

/// Waits for a submitted transaction and for the mirror to include its block.
#[derive(Clone)]
pub struct TxWaiter {
    provider: Arc<dyn ChainProvider>,
    synchronizer: Arc<ChainStateSynchronizer>,
}

impl TxWaiter {
    pub fn new(synchronizer: Arc<ChainStateSynchronizer>) -> Self {
        Self { provider: synchronizer.provider(), synchronizer }
    }

    pub async fn after_tx(&self, transaction_id: &str) -> Result<BlockNumber> {
        let receipt = self.provider.wait_for_transaction(transaction_id).await?;
        if !receipt.success {
            return Err(Error::Submission(format!("transaction {transaction_id} reverted")));
        }
        self.synchronizer.wait_for_sync(Some(receipt.block_number)).await?;
        debug!(tx = transaction_id, block = receipt.block_number, "transaction synced");
        Ok(receipt.block_number)
    }
}
