//! Epoch tracking
//!
//! The authoritative epoch number always comes from the ledger contract. The
//! local clock only drives the countdown and the `ready_to_transition` flag
//! between chain queries.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::chain::{ChainProvider, EventKind, LogFilter};
use crate::error::{Error, Result};
use crate::sync::{ChainStateSynchronizer, SubscriptionId};
use crate::types::Epoch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EpochSchedule {
    pub current_epoch: Epoch,
    pub next_transition: DateTime<Utc>,
    pub ready_to_transition: bool,
}

struct Watcher {
    handle: JoinHandle<()>,
    synchronizer: Arc<ChainStateSynchronizer>,
    subscription: SubscriptionId,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct EpochManager {
    provider: Arc<dyn ChainProvider>,
    schedule: watch::Sender<EpochSchedule>,
    watcher: Mutex<Option<Watcher>>,
}

impl EpochManager {
    pub fn new(provider: Arc<dyn ChainProvider>) -> Arc<Self> {
        let (schedule, _) = watch::channel(EpochSchedule::default());
        Arc::new(Self { provider, schedule, watcher: Mutex::new(None) })
    }

    pub fn schedule(&self) -> EpochSchedule { *self.schedule.borrow() }

    pub fn subscribe(&self) -> watch::Receiver<EpochSchedule> { self.schedule.subscribe() }

    pub async fn load_current_epoch(&self) -> Result<Epoch> {
        let epoch = self.provider.current_epoch().await?;
        self.schedule.send_if_modified(|s| {
            let changed = s.current_epoch != epoch;
            s.current_epoch = epoch;
            changed
        });
        Ok(epoch)
    }

    pub async fn update_watch(&self) -> Result<EpochSchedule> { self.update_watch_at(Utc::now()).await }

    /// Recomputes the next transition from the contract's timing at `now`.
    pub async fn update_watch_at(&self, now: DateTime<Utc>) -> Result<EpochSchedule> {
        let latest = self.provider.latest_epoch_transition_time().await?;
        let length = self.provider.epoch_length().await?;
        let seconds = latest
            .checked_add(length)
            .and_then(|s| i64::try_from(s).ok())
            .ok_or_else(|| Error::Decode(format!("transition time {latest} + {length} overflows")))?;
        let next_transition = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| Error::Decode(format!("invalid transition timestamp {seconds}")))?;
        self.schedule.send_modify(|s| {
            s.next_transition = next_transition;
            s.ready_to_transition = now >= next_transition;
        });
        Ok(self.schedule())
    }

    /// Local-clock refresh of the ready flag; no chain access.
    pub fn refresh_at(&self, now: DateTime<Utc>) {
        self.schedule.send_if_modified(|s| {
            let ready = now >= s.next_transition;
            let changed = ready != s.ready_to_transition;
            s.ready_to_transition = ready;
            changed
        });
    }

    pub fn countdown_text(&self, now: DateTime<Utc>) -> String {
        let schedule = self.schedule();
        countdown_text(schedule.next_transition - now)
    }

    /// Follows `EpochEnded` logs from the synchronizer and ticks the local clock.
    pub fn start(self: &Arc<Self>, synchronizer: &Arc<ChainStateSynchronizer>, tick: Duration) {
        self.stop();
        let mut subscription = synchronizer.subscribe(LogFilter::only([EventKind::EpochEnded]));
        let subscription_id = subscription.id();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    log = subscription.recv() => {
                        let Some(log) = log else { break };
                        info!(block = log.block_number, "epoch ended");
                        if let Err(e) = this.reload().await {
                            warn!(error = %e, "failed to reload epoch after transition");
                        }
                    }
                    _ = interval.tick() => this.refresh_at(Utc::now()),
                }
            }
        });
        *lock(&self.watcher) =
            Some(Watcher { handle, synchronizer: Arc::clone(synchronizer), subscription: subscription_id });
    }

    async fn reload(&self) -> Result<()> {
        self.load_current_epoch().await?;
        self.update_watch().await?;
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.handle.abort();
            watcher.synchronizer.unsubscribe(watcher.subscription);
        }
    }
}

/// Coarsest whole unit left until the transition.
pub fn countdown_text(remaining: chrono::Duration) -> String {
    let seconds = remaining.num_seconds();
    if remaining < chrono::Duration::zero() {
        return "Awaiting Epoch Change...".to_string();
    }
    let days = seconds / (24 * 60 * 60);
    if days > 0 {
        return format!("{days} days");
    }
    let hours = seconds / (60 * 60);
    if hours > 0 {
        return format!("{hours} hours");
    }
    let minutes = seconds / 60;
    if minutes > 0 {
        return format!("{minutes} minutes");
    }
    format!("{seconds} seconds")
}
