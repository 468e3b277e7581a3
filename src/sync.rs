//! Chain state synchronizer
//!
//! Keeps the [`GlobalLedgerMirror`] in step with the chain. Logs are fetched
//! in bounded block pages, sorted into `(block, log_index)` order and applied
//! one page at a time under the mirror's write lock, so readers only ever see
//! whole pages. A failed RPC call leaves the mirror at the last committed page.
//!
//! Observers get a [`SyncProgress`] watch channel plus explicit
//! [`Subscription`] handles carrying every committed log that matches a filter.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainProvider, LedgerLog, LogFilter};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::mirror::GlobalLedgerMirror;
use crate::storage::{load_json, save_json, SnapshotStore, LEDGER_MIRROR_KEY};
use crate::types::{BlockNumber, Epoch};

/// Snapshot of how far the mirror has caught up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub start_block: BlockNumber,
    pub last_processed_block: BlockNumber,
    pub latest_block: BlockNumber,
    pub loaded: bool,
}

impl SyncProgress {
    /// Fraction of the block range processed, in `[0, 1]`.
    pub fn percent(&self) -> f64 {
        if self.latest_block <= self.start_block {
            return 1.0;
        }
        let done = self.last_processed_block.saturating_sub(self.start_block) as f64;
        let total = (self.latest_block - self.start_block) as f64;
        (done / total).clamp(0.0, 1.0)
    }
}

pub type SubscriptionId = u64;

/// Receiving end of a log subscription. Closed after `unsubscribe`.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<LedgerLog>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId { self.id }

    pub async fn recv(&mut self) -> Option<LedgerLog> { self.receiver.recv().await }

    pub fn try_recv(&mut self) -> Option<LedgerLog> { self.receiver.try_recv().ok() }
}

struct Subscriber {
    id: SubscriptionId,
    filter: LogFilter,
    sender: mpsc::UnboundedSender<LedgerLog>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ChainStateSynchronizer {
    provider: Arc<dyn ChainProvider>,
    store: Arc<dyn SnapshotStore>,
    config: SyncConfig,
    genesis_block: BlockNumber,
    mirror: RwLock<GlobalLedgerMirror>,
    progress: watch::Sender<SyncProgress>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicU64,
    /// Serializes ticks between the daemon and direct `poll_once` callers
    tick: tokio::sync::Mutex<()>,
    consecutive_failures: AtomicU32,
    daemon: Mutex<Option<JoinHandle<()>>>,
}

impl ChainStateSynchronizer {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        store: Arc<dyn SnapshotStore>,
        config: SyncConfig,
        genesis_block: BlockNumber,
    ) -> Arc<Self> {
        let (progress, _) = watch::channel(SyncProgress {
            start_block: genesis_block,
            last_processed_block: genesis_block,
            ..Default::default()
        });
        Arc::new(Self {
            provider,
            store,
            config,
            genesis_block,
            mirror: RwLock::new(GlobalLedgerMirror::new(genesis_block)),
            progress,
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            tick: tokio::sync::Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
            daemon: Mutex::new(None),
        })
    }

    pub fn provider(&self) -> Arc<dyn ChainProvider> { Arc::clone(&self.provider) }

    pub fn store(&self) -> Arc<dyn SnapshotStore> { Arc::clone(&self.store) }

    /// Restores the mirror from the snapshot store, or starts empty at genesis.
    pub async fn load(&self) -> Result<()> {
        let restored: Option<GlobalLedgerMirror> = load_json(self.store.as_ref(), LEDGER_MIRROR_KEY)?;
        let mirror = match restored {
            Some(mut mirror) => {
                mirror.restore();
                info!(
                    block = mirror.last_processed_block(),
                    epoch = mirror.current_epoch(),
                    "restored ledger mirror"
                );
                mirror
            }
            None => {
                info!(genesis = self.genesis_block, "starting ledger mirror from genesis");
                GlobalLedgerMirror::new(self.genesis_block)
            }
        };
        let (start, last) = (mirror.start_block(), mirror.last_processed_block());
        *self.mirror.write().await = mirror;
        self.progress.send_modify(|p| {
            p.start_block = start;
            p.last_processed_block = last;
            p.latest_block = p.latest_block.max(last);
            p.loaded = true;
        });
        Ok(())
    }

    pub fn is_loaded(&self) -> bool { self.progress.borrow().loaded }

    /// Suspends until `load` has completed.
    pub async fn wait_until_loaded(&self) {
        let mut rx = self.progress.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|p| p.loaded).await;
    }

    pub async fn save(&self) -> Result<()> {
        let mirror = self.mirror.read().await;
        save_json(self.store.as_ref(), LEDGER_MIRROR_KEY, &*mirror)?;
        debug!(block = mirror.last_processed_block(), "saved ledger mirror");
        Ok(())
    }

    /// Runs one tick: fetches and applies every log up to the chain tip.
    /// Returns the number of logs applied.
    pub async fn poll_once(&self) -> Result<usize> {
        if !self.is_loaded() {
            return Err(Error::Configuration("synchronizer is not loaded".into()));
        }
        let _tick = self.tick.lock().await;
        let before = self.mirror.read().await.last_processed_block();
        let result = self.poll_pages().await;
        if self.mirror.read().await.last_processed_block() > before {
            self.save().await?;
        }
        result
    }

    async fn poll_pages(&self) -> Result<usize> {
        let latest = self.provider.get_block_number().await?;
        self.progress.send_modify(|p| p.latest_block = latest);

        let mut from = self.mirror.read().await.last_processed_block() + 1;
        let mut applied = 0;
        while from <= latest {
            let to = latest.min(from.saturating_add(self.config.max_block_range.saturating_sub(1)));
            let mut logs = self.provider.get_logs(from, to).await?;
            logs.retain(|log| log.block_number >= from && log.block_number <= to);
            logs.sort_by_key(LedgerLog::position);

            let committed: Vec<LedgerLog> = {
                let mut mirror = self.mirror.write().await;
                let committed = logs.into_iter().filter(|log| mirror.apply(log)).collect();
                mirror.mark_processed(to);
                committed
            };
            debug!(from, to, applied = committed.len(), "committed log page");
            applied += committed.len();
            self.progress.send_modify(|p| p.last_processed_block = p.last_processed_block.max(to));
            self.dispatch(&committed);
            from = to + 1;
        }
        Ok(applied)
    }

    fn dispatch(&self, logs: &[LedgerLog]) {
        if logs.is_empty() {
            return;
        }
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|sub| {
            logs.iter()
                .filter(|log| sub.filter.matches(log))
                .all(|log| sub.sender.send(log.clone()).is_ok())
        });
    }

    pub fn subscribe(&self, filter: LogFilter) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(Subscriber { id, filter, sender });
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.subscribers).retain(|sub| sub.id != id);
    }

    pub fn start_daemon(self: &Arc<Self>) {
        let mut daemon = lock(&self.daemon);
        if daemon.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *daemon = Some(tokio::spawn(async move { this.run_daemon().await }));
        info!(interval_ms = self.config.poll_interval_millis, "sync daemon started");
    }

    pub fn stop_daemon(&self) {
        if let Some(handle) = lock(&self.daemon).take() {
            handle.abort();
            info!("sync daemon stopped");
        }
    }

    pub fn daemon_running(&self) -> bool {
        lock(&self.daemon).as_ref().is_some_and(|handle| !handle.is_finished())
    }

    async fn run_daemon(&self) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.poll_once().await {
                Ok(applied) => {
                    if self.consecutive_failures.swap(0, Ordering::Relaxed) > 0 {
                        info!("sync recovered");
                    }
                    if applied > 0 {
                        debug!(applied, "sync tick");
                    }
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if failures >= self.config.persistent_failure_threshold {
                        error!(failures, error = %e, "sync is persistently failing");
                    } else {
                        warn!(failures, error = %e, "sync tick failed, retrying");
                    }
                }
            }
        }
    }

    /// Suspends until the mirror has processed `target` (default: the current tip).
    ///
    /// Drives `poll_once` itself when no daemon is running.
    pub async fn wait_for_sync(&self, target: Option<BlockNumber>) -> Result<()> {
        let target = match target {
            Some(block) => block,
            None => self.provider.get_block_number().await?,
        };
        let reach = async {
            let mut rx = self.progress.subscribe();
            loop {
                let reached = rx.borrow_and_update().last_processed_block;
                if reached >= target {
                    return;
                }
                if self.daemon_running() {
                    if rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                if let Err(e) = self.poll_once().await {
                    warn!(error = %e, "sync poll failed while waiting");
                }
                if self.progress.borrow().last_processed_block < target {
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        };
        match tokio::time::timeout(self.config.sync_timeout(), reach).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::SyncTimeout { target, reached: self.progress.borrow().last_processed_block }),
        }
    }

    pub fn progress(&self) -> SyncProgress { *self.progress.borrow() }

    pub fn watch_progress(&self) -> watch::Receiver<SyncProgress> { self.progress.subscribe() }

    pub fn sync_percent(&self) -> f64 { self.progress().percent() }

    /// Read guard over the mirror; hold it only briefly.
    pub async fn mirror(&self) -> RwLockReadGuard<'_, GlobalLedgerMirror> { self.mirror.read().await }

    pub async fn current_epoch(&self) -> Epoch { self.mirror.read().await.current_epoch() }

    pub async fn last_processed_block(&self) -> BlockNumber {
        self.mirror.read().await.last_processed_block()
    }
}

impl Drop for ChainStateSynchronizer {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.daemon).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::chain::memory::InMemoryChain;
    use crate::chain::{EventKind, LedgerEvent};
    use crate::storage::SledSnapshotStore;
    use crate::types::EpochKey;

    fn config() -> SyncConfig {
        SyncConfig {
            poll_interval_millis: 10,
            max_block_range: 2,
            sync_timeout_secs: 2,
            persistent_failure_threshold: 3,
            epoch_tick_secs: 1,
        }
    }

    fn attestation(pos: u64) -> LedgerEvent {
        LedgerEvent::AttestationSubmitted {
            epoch: 1,
            epoch_key: EpochKey(1),
            attester_id: 1,
            pos_rep: pos,
            neg_rep: 0,
            graffiti: [0u8; 32],
            spent_nullifiers: vec![],
        }
    }

    async fn setup() -> (Arc<InMemoryChain>, Arc<SledSnapshotStore>, Arc<ChainStateSynchronizer>) {
        let chain = Arc::new(InMemoryChain::new());
        let store = Arc::new(SledSnapshotStore::temporary().unwrap());
        let sync = ChainStateSynchronizer::new(chain.clone(), store.clone(), config(), 0);
        sync.load().await.unwrap();
        (chain, store, sync)
    }

    #[test]
    fn test_sync_percent() {
        let mut p = SyncProgress { start_block: 10, last_processed_block: 15, latest_block: 20, loaded: true };
        assert_eq!(p.percent(), 0.5);
        p.latest_block = 10;
        assert_eq!(p.percent(), 1.0);
        p.latest_block = 12;
        assert_eq!(p.percent(), 1.0);
    }

    #[tokio::test]
    async fn test_poll_pages_through_range() {
        let (chain, _store, sync) = setup().await;
        chain.mine(vec![attestation(1)]);
        chain.mine_empty(3);
        chain.mine(vec![attestation(2), attestation(3)]);
        assert_eq!(sync.poll_once().await.unwrap(), 3);
        assert_eq!(sync.last_processed_block().await, 5);
        assert_eq!(sync.mirror().await.reputation_of(1, EpochKey(1), 1).pos_rep, 6);
        assert_eq!(sync.sync_percent(), 1.0);
    }

    #[tokio::test]
    async fn test_failed_page_keeps_committed_progress() {
        let (chain, _store, sync) = setup().await;
        chain.mine_empty(5);
        sync.poll_once().await.unwrap();
        chain.mine(vec![attestation(1)]);
        chain.fail_next_calls(1);
        assert!(sync.poll_once().await.is_err());
        assert_eq!(sync.last_processed_block().await, 5);
        assert_eq!(sync.poll_once().await.unwrap(), 1);
        assert_eq!(sync.last_processed_block().await, 6);
    }

    #[tokio::test]
    async fn test_subscription_receives_matching_logs() {
        let (chain, _store, sync) = setup().await;
        let mut sub = sync.subscribe(LogFilter::only([EventKind::EpochEnded]));
        chain.mine(vec![attestation(1)]);
        chain.end_epoch();
        sync.poll_once().await.unwrap();
        let log = sub.try_recv().unwrap();
        assert_eq!(log.event, LedgerEvent::EpochEnded { epoch: 1 });
        assert!(sub.try_recv().is_none());

        sync.unsubscribe(sub.id());
        chain.end_epoch();
        sync.poll_once().await.unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reload_from_snapshot_then_resync() {
        let (chain, store, sync) = setup().await;
        chain.mine(vec![attestation(4)]);
        sync.poll_once().await.unwrap();
        chain.mine(vec![attestation(5)]);
        chain.end_epoch();

        let reloaded = ChainStateSynchronizer::new(chain.clone(), store.clone(), config(), 0);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.last_processed_block().await, 1);
        reloaded.poll_once().await.unwrap();
        sync.poll_once().await.unwrap();
        assert_eq!(*reloaded.mirror().await, *sync.mirror().await);
    }

    #[tokio::test]
    async fn test_wait_for_sync_drives_polling() {
        let (chain, _store, sync) = setup().await;
        chain.mine_empty(4);
        sync.wait_for_sync(None).await.unwrap();
        assert!(sync.last_processed_block().await >= 4);
    }

    #[tokio::test]
    async fn test_wait_for_sync_times_out() {
        let (_chain, _store, sync) = setup().await;
        let err = sync.wait_for_sync(Some(50)).await.unwrap_err();
        assert!(matches!(err, Error::SyncTimeout { target: 50, reached: 0 }));
    }

    #[tokio::test]
    async fn test_daemon_follows_chain() {
        let (chain, _store, sync) = setup().await;
        sync.start_daemon();
        assert!(sync.daemon_running());
        chain.mine(vec![attestation(7)]);
        let target = chain.block_number();
        sync.wait_for_sync(Some(target)).await.unwrap();
        assert!(sync.last_processed_block().await >= target);
        sync.stop_daemon();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sync.daemon_running());
    }

    #[tokio::test]
    async fn test_poll_requires_load() {
        let chain = Arc::new(InMemoryChain::new());
        let store = Arc::new(SledSnapshotStore::temporary().unwrap());
        let sync = ChainStateSynchronizer::new(chain, store, config(), 0);
        assert!(matches!(sync.poll_once().await, Err(Error::Configuration(_))));
    }
}
