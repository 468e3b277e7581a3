// src/user.rs
//! Per-user view of the ledger
//!
//! [`UserStateManager`] binds a secret [`Identity`] to the synchronized
//! mirror. It owns the user's folded reputation, the epoch keys of every epoch
//! so far, and the `spent` counter of the nullifier-budget protocol: each
//! successful reputation proof consumes the next `amount` nullifier indices of
//! the current epoch, and indices are never reused until the epoch changes or
//! a user state transition completes.
//!
//! The manager is shared as [`SharedUserState`]; operations take the lock for
//! their whole duration, which serializes proof construction.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::{EventKind, LedgerEvent, LedgerLog, LogFilter};
use crate::config::LedgerConfig;
use crate::epoch_key::{derive_all_epoch_keys, derive_epoch_key, epoch_key_nullifier, reputation_nullifier};
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityInput};
use crate::mirror::SignUpRecord;
use crate::prover::{
    ProofSystem, ReputationProofRequest, SignUpProofRequest, TransitionProofRequest, UNUSED_NONCE,
};
use crate::queue::TxWaiter;
use crate::storage::{load_json, save_json, SnapshotStore, USER_SESSION_KEY};
use crate::submission::{Endpoint, SubmissionBackend, SubmissionReceipt};
use crate::sync::{ChainStateSynchronizer, SubscriptionId};
use crate::types::{AttesterId, Epoch, EpochKey, Reputation};

pub type SharedUserState = Arc<Mutex<UserStateManager>>;

/// Reputation nullifiers consumed in the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NullifierUsage {
    Spent(u64),
    /// Every nullifier the balance allows has been used
    Exhausted,
}

impl Default for NullifierUsage {
    fn default() -> Self { NullifierUsage::Spent(0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Uninitialized,
    Loaded,
    IdentityBound,
    DaemonRunning,
}

/// What observers see of the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserLedgerView {
    pub phase: Phase,
    pub commitment: Option<String>,
    pub current_epoch: Epoch,
    pub latest_transitioned_epoch: Epoch,
    pub pos_rep: u64,
    pub neg_rep: u64,
    pub balance: i64,
    pub spent: NullifierUsage,
    pub current_epoch_keys: Vec<EpochKey>,
    pub needs_ust: bool,
    pub sync_percent: f64,
}

impl Default for UserLedgerView {
    fn default() -> Self {
        Self {
            phase: Phase::Uninitialized,
            commitment: None,
            current_epoch: 0,
            latest_transitioned_epoch: 0,
            pos_rep: 0,
            neg_rep: 0,
            balance: 0,
            spent: NullifierUsage::default(),
            current_epoch_keys: Vec::new(),
            needs_ust: false,
            sync_percent: 0.0,
        }
    }
}

/// A reputation proof built by [`UserStateManager::gen_rep_proof`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationProof {
    pub epoch_key: EpochKey,
    pub epoch: Epoch,
    pub proof: Vec<String>,
    pub public_signals: Vec<String>,
    /// Nullifier indices used: `first_nonce..first_nonce + amount`
    pub first_nonce: u64,
    pub amount: u64,
    pub nonce_list: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionSnapshot {
    identity: String,
    reputation: BTreeMap<AttesterId, Reputation>,
    latest_transitioned_epoch: Epoch,
    current_epoch: Epoch,
    spent: NullifierUsage,
}

struct UserDaemon {
    handle: JoinHandle<()>,
    subscription: SubscriptionId,
}

pub struct UserStateManager {
    config: LedgerConfig,
    synchronizer: Arc<ChainStateSynchronizer>,
    prover: Arc<dyn ProofSystem>,
    store: Arc<dyn SnapshotStore>,
    phase: Phase,
    identity: Option<Identity>,
    reputation: BTreeMap<AttesterId, Reputation>,
    latest_transitioned_epoch: Epoch,
    current_epoch: Epoch,
    spent: NullifierUsage,
    all_epks: Vec<EpochKey>,
    view: watch::Sender<UserLedgerView>,
    daemon: Option<UserDaemon>,
}

impl UserStateManager {
    pub fn new(
        config: LedgerConfig,
        synchronizer: Arc<ChainStateSynchronizer>,
        prover: Arc<dyn ProofSystem>,
    ) -> Self {
        let store = synchronizer.store();
        let (view, _) = watch::channel(UserLedgerView::default());
        Self {
            config,
            synchronizer,
            prover,
            store,
            phase: Phase::Uninitialized,
            identity: None,
            reputation: BTreeMap::new(),
            latest_transitioned_epoch: 0,
            current_epoch: 0,
            spent: NullifierUsage::default(),
            all_epks: Vec::new(),
            view,
            daemon: None,
        }
    }

    pub fn into_shared(self) -> SharedUserState { Arc::new(Mutex::new(self)) }

    pub fn phase(&self) -> Phase { self.phase }

    pub fn config(&self) -> &LedgerConfig { &self.config }

    pub fn synchronizer(&self) -> &Arc<ChainStateSynchronizer> { &self.synchronizer }

    pub fn identity(&self) -> Option<&Identity> { self.identity.as_ref() }

    pub fn serialized_identity(&self) -> Option<String> { self.identity.as_ref().map(Identity::serialize) }

    pub fn current_epoch(&self) -> Epoch { self.current_epoch }

    pub fn latest_transitioned_epoch(&self) -> Epoch { self.latest_transitioned_epoch }

    pub fn spent(&self) -> NullifierUsage { self.spent }

    pub fn subscribe(&self) -> watch::Receiver<UserLedgerView> { self.view.subscribe() }

    pub fn view(&self) -> UserLedgerView { self.view.borrow().clone() }

    /// Waits for the synchronizer, then restores a saved session if there is one.
    pub async fn load(&mut self) -> Result<()> {
        self.synchronizer.wait_until_loaded().await;
        self.current_epoch = self.synchronizer.current_epoch().await;
        self.phase = Phase::Loaded;

        let session: Option<SessionSnapshot> = load_json(self.store.as_ref(), USER_SESSION_KEY)?;
        if let Some(session) = session {
            let identity = Identity::deserialize(&session.identity)?;
            self.reputation = session.reputation;
            self.latest_transitioned_epoch = session.latest_transitioned_epoch;
            self.spent = if session.current_epoch == self.current_epoch {
                session.spent
            } else {
                NullifierUsage::Spent(0)
            };
            info!(commitment = %identity.commitment_hex(), "restored user session");
            self.bind_identity(identity).await?;
        } else {
            self.publish();
        }
        Ok(())
    }

    /// Binds an identity. Rebinding is refused; log out first.
    pub async fn set_identity(&mut self, identity: impl Into<IdentityInput>) -> Result<()> {
        if self.phase == Phase::Uninitialized {
            return Err(Error::Configuration("ledger state is not loaded".into()));
        }
        if self.identity.is_some() {
            return Err(Error::InvalidState("identity already set, change is not supported".into()));
        }
        let identity = identity.into().into_identity()?;
        self.bind_identity(identity).await
    }

    async fn bind_identity(&mut self, identity: Identity) -> Result<()> {
        self.identity = Some(identity);
        self.phase = Phase::IdentityBound;
        self.refresh().await?;
        self.persist()?;
        Ok(())
    }

    /// Re-derives everything from the mirror: epoch, sign-up seed, epoch keys, spent.
    pub async fn refresh(&mut self) -> Result<()> {
        let mirror_epoch = self.synchronizer.current_epoch().await;
        if mirror_epoch > self.current_epoch {
            self.enter_epoch(mirror_epoch);
        }
        if let Some(identity) = self.identity.clone() {
            let record = self.synchronizer.mirror().await.sign_up(&identity.commitment()).cloned();
            if let Some(record) = record {
                self.seed_sign_up(record);
            }
            if self.latest_transitioned_epoch == 0 {
                self.latest_transitioned_epoch = self.current_epoch;
            }
            self.catch_up_transitions(&identity).await;
            self.calculate_all_epks()?;
            self.reconcile_spent().await;
        }
        self.publish();
        Ok(())
    }

    fn seed_sign_up(&mut self, record: SignUpRecord) {
        let entry = self.reputation.entry(record.attester_id).or_default();
        if entry.sign_up {
            return;
        }
        entry.pos_rep = entry.pos_rep.saturating_add(record.airdrop);
        entry.sign_up = true;
        if self.latest_transitioned_epoch < record.epoch {
            self.latest_transitioned_epoch = record.epoch;
        }
        debug!(epoch = record.epoch, airdrop = record.airdrop, "seeded sign-up reputation");
    }

    /// Follows transitions made elsewhere with this identity: a transition out of
    /// epoch `e` retires the epoch keys of `e`, so a spent nonce-0 key nullifier
    /// means `e` was already folded.
    async fn catch_up_transitions(&mut self, identity: &Identity) {
        let from = self.latest_transitioned_epoch;
        let mut to = from;
        {
            let mirror = self.synchronizer.mirror().await;
            while to < self.current_epoch
                && mirror.is_epoch_key_nullifier_spent(&epoch_key_nullifier(identity.nullifier(), to, 0))
            {
                to += 1;
            }
        }
        if to > from {
            self.reputation = self.folded_reputation(identity, from, to).await;
            self.latest_transitioned_epoch = to;
            info!(from_epoch = from, to_epoch = to, "caught up with earlier transitions");
        }
    }

    fn enter_epoch(&mut self, epoch: Epoch) {
        debug!(from = self.current_epoch, to = epoch, "entering epoch");
        self.current_epoch = epoch;
        self.spent = NullifierUsage::Spent(0);
    }

    /// Epoch keys for epochs `1..=current_epoch`, in epoch then nonce order.
    pub fn calculate_all_epks(&mut self) -> Result<&[EpochKey]> {
        let identity = self.identity.as_ref().ok_or_else(|| Error::Configuration("no identity loaded".into()))?;
        let nullifier = *identity.nullifier();
        self.all_epks = (1..=self.current_epoch)
            .flat_map(|epoch| {
                derive_all_epoch_keys(
                    &nullifier,
                    epoch,
                    self.config.num_epoch_key_nonce_per_epoch,
                    self.config.epoch_tree_depth,
                )
            })
            .collect();
        Ok(&self.all_epks)
    }

    pub fn all_epoch_keys(&self) -> &[EpochKey] { &self.all_epks }

    /// The current epoch's keys: the last `num_epoch_key_nonce_per_epoch` derived.
    pub fn current_epoch_keys(&self) -> Vec<EpochKey> {
        let n = self.config.num_epoch_key_nonce_per_epoch as usize;
        self.all_epks[self.all_epks.len().saturating_sub(n)..].to_vec()
    }

    pub fn epoch_key(&self, nonce: u64) -> Result<EpochKey> {
        let identity = self.identity.as_ref().ok_or_else(|| Error::Configuration("no identity loaded".into()))?;
        Ok(derive_epoch_key(identity.nullifier(), self.current_epoch, nonce, self.config.epoch_tree_depth))
    }

    /// `(pos_rep, neg_rep)` at the configured attester; zero without an identity.
    pub fn load_reputation(&self) -> (u64, u64) {
        if self.identity.is_none() {
            return (0, 0);
        }
        let rep = self.reputation_at(self.config.attester_id);
        (rep.pos_rep, rep.neg_rep)
    }

    fn reputation_at(&self, attester_id: AttesterId) -> Reputation {
        self.reputation.get(&attester_id).cloned().unwrap_or_default()
    }

    pub fn balance(&self) -> i64 {
        let (pos, neg) = self.load_reputation();
        pos as i64 - neg as i64
    }

    pub fn needs_ust(&self) -> bool {
        self.identity.is_some() && self.current_epoch > self.latest_transitioned_epoch
    }

    /// Builds a proof spending `amount` reputation under epoch key `epk_nonce`
    /// while showing at least `min_rep` remains. Every check runs before the
    /// proof system is called.
    pub async fn gen_rep_proof(&mut self, amount: u64, epk_nonce: u64, min_rep: u64) -> Result<ReputationProof> {
        let identity = self.identity.clone().ok_or_else(|| Error::Configuration("no identity loaded".into()))?;
        let mirror_epoch = self.synchronizer.current_epoch().await;
        if mirror_epoch > self.current_epoch {
            self.enter_epoch(mirror_epoch);
            self.calculate_all_epks()?;
        }
        if self.needs_ust() {
            return Err(Error::InvalidState(format!(
                "user state transition required: epoch {} but transitioned to {}",
                self.current_epoch, self.latest_transitioned_epoch
            )));
        }
        let max_nonce = self.config.num_epoch_key_nonce_per_epoch;
        if epk_nonce >= max_nonce {
            return Err(Error::EpochKeyRange { nonce: epk_nonce, max: max_nonce });
        }
        let spent = match self.spent {
            NullifierUsage::Exhausted => return Err(Error::NullifierExhausted(self.current_epoch)),
            NullifierUsage::Spent(n) => n,
        };
        let balance = self.balance();
        let available = balance.max(0) as u64;
        if spent.saturating_add(amount.max(min_rep)) > available {
            return Err(Error::InsufficientReputation { spent, requested: amount, balance });
        }
        let budget = self.config.max_reputation_budget;
        if amount > budget {
            return Err(Error::ReputationBudgetExceeded { requested: amount, max: budget });
        }

        let nonce_list: Vec<i64> = (0..budget)
            .map(|i| if i < amount { (spent + i) as i64 } else { UNUSED_NONCE })
            .collect();
        let epoch = self.current_epoch;
        let output = self
            .prover
            .gen_reputation_proof(ReputationProofRequest {
                identity: identity.clone(),
                epoch,
                epoch_key_nonce: epk_nonce,
                epoch_tree_depth: self.config.epoch_tree_depth,
                attester_id: self.config.attester_id,
                min_rep,
                reputation: self.reputation_at(self.config.attester_id),
                nonce_list: nonce_list.clone(),
            })
            .await?;

        self.spent = NullifierUsage::Spent(spent + amount);
        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist spent counter");
        }
        self.publish();
        debug!(epoch, epk_nonce, amount, spent = spent + amount, "built reputation proof");

        Ok(ReputationProof {
            epoch_key: derive_epoch_key(identity.nullifier(), epoch, epk_nonce, self.config.epoch_tree_depth),
            epoch,
            proof: output.proof,
            public_signals: output.public_signals,
            first_nonce: spent,
            amount,
            nonce_list,
        })
    }

    /// Gives back the nullifiers of `proof` after the backend refused it.
    /// Only the most recent spend of the current epoch can be released.
    pub fn release_spend(&mut self, proof: &ReputationProof) -> Result<()> {
        let latest = NullifierUsage::Spent(proof.first_nonce + proof.amount);
        if proof.epoch != self.current_epoch || self.spent != latest {
            return Err(Error::InvalidState("only the latest spend of this epoch can be released".into()));
        }
        self.spent = NullifierUsage::Spent(proof.first_nonce);
        self.persist()?;
        self.publish();
        Ok(())
    }

    pub async fn gen_sign_up_proof(&self) -> Result<crate::prover::ProofOutput> {
        let identity = self.identity.clone().ok_or_else(|| Error::Configuration("identity not loaded".into()))?;
        self.prover
            .gen_user_sign_up_proof(SignUpProofRequest {
                identity,
                epoch: self.current_epoch,
                epoch_tree_depth: self.config.epoch_tree_depth,
                attester_id: self.config.attester_id,
                reputation: self.reputation_at(self.config.attester_id),
            })
            .await
    }

    /// Moves spent upward to match the nullifiers the chain has recorded.
    async fn reconcile_spent(&mut self) {
        let Some(identity) = self.identity.as_ref() else {
            return;
        };
        let NullifierUsage::Spent(spent) = self.spent else {
            return;
        };
        let available = self.balance().max(0) as u64;
        let observed = {
            let mirror = self.synchronizer.mirror().await;
            let mut count = 0;
            while count < available {
                let nullifier =
                    reputation_nullifier(identity.nullifier(), self.config.attester_id, self.current_epoch, count);
                if !mirror.is_reputation_nullifier_spent(&nullifier) {
                    break;
                }
                count += 1;
            }
            count
        };
        if available > 0 && observed >= available {
            self.spent = NullifierUsage::Exhausted;
        } else if observed > spent {
            debug!(from = spent, to = observed, "reconciled spent nullifiers");
            self.spent = NullifierUsage::Spent(observed);
        }
    }

    /// Reputation after folding the attestations of every epoch in `[from, to)`.
    async fn folded_reputation(&self, identity: &Identity, from: Epoch, to: Epoch) -> BTreeMap<AttesterId, Reputation> {
        let mut folded = self.reputation.clone();
        let mirror = self.synchronizer.mirror().await;
        for epoch in from..to {
            let Some(tree) = mirror.epoch_tree(epoch) else {
                continue;
            };
            let keys = derive_all_epoch_keys(
                identity.nullifier(),
                epoch,
                self.config.num_epoch_key_nonce_per_epoch,
                self.config.epoch_tree_depth,
            );
            for epk in keys {
                for (attester, rep) in tree.attesters_of(epk) {
                    folded.entry(*attester).or_default().absorb(rep.pos_rep, rep.neg_rep, rep.graffiti);
                }
            }
        }
        folded
    }

    /// Folds past epochs into the user's state: sync, prove, submit, confirm.
    pub async fn user_state_transition(
        &mut self,
        backend: &dyn SubmissionBackend,
        waiter: &TxWaiter,
    ) -> Result<SubmissionReceipt> {
        let identity = self.identity.clone().ok_or_else(|| Error::Configuration("user state not initialized".into()))?;
        self.synchronizer.wait_for_sync(None).await?;
        self.refresh().await?;
        if !self.needs_ust() {
            return Err(Error::InvalidState(format!("already transitioned to epoch {}", self.current_epoch)));
        }
        let from_epoch = self.latest_transitioned_epoch;
        let to_epoch = self.current_epoch;
        let folded = self.folded_reputation(&identity, from_epoch, to_epoch).await;

        let proofs = self
            .prover
            .gen_user_state_transition_proofs(TransitionProofRequest {
                identity,
                from_epoch,
                to_epoch,
                num_epoch_key_nonce_per_epoch: self.config.num_epoch_key_nonce_per_epoch,
                attester_id: self.config.attester_id,
                reputation: folded.get(&self.config.attester_id).cloned().unwrap_or_default(),
            })
            .await?;
        let payload = json!({ "results": proofs, "fromEpoch": from_epoch });
        let receipt = backend.submit(Endpoint::UserStateTransition, payload).await?;
        waiter.after_tx(&receipt.transaction_id).await?;

        self.reputation = folded;
        self.latest_transitioned_epoch = to_epoch;
        self.spent = NullifierUsage::Spent(0);
        self.calculate_all_epks()?;
        self.persist()?;
        self.publish();
        info!(from_epoch, to_epoch, tx = %receipt.transaction_id, "user state transition complete");
        Ok(receipt)
    }

    /// Whether `event` touches this identity. Epoch boundaries touch everyone.
    fn concerns_identity(&self, event: &LedgerEvent) -> bool {
        let Some(identity) = self.identity.as_ref() else {
            return matches!(event, LedgerEvent::EpochEnded { .. });
        };
        match event {
            LedgerEvent::UserSignedUp { identity_commitment, .. } => *identity_commitment == identity.commitment(),
            LedgerEvent::AttestationSubmitted { epoch_key, .. } => self.all_epks.contains(epoch_key),
            LedgerEvent::UserStateTransitioned { epoch_key_nullifiers, .. } => {
                let nonces = self.config.num_epoch_key_nonce_per_epoch;
                (self.latest_transitioned_epoch..=self.current_epoch).any(|epoch| {
                    (0..nonces).any(|nonce| {
                        epoch_key_nullifiers.contains(&epoch_key_nullifier(identity.nullifier(), epoch, nonce))
                    })
                })
            }
            LedgerEvent::EpochEnded { .. } => true,
        }
    }

    /// Dispatches a ledger log to the matching hook. Logs about other
    /// identities are skipped.
    pub async fn handle_log(&mut self, log: &LedgerLog) -> Result<()> {
        if !self.concerns_identity(&log.event) {
            return Ok(());
        }
        match &log.event {
            LedgerEvent::AttestationSubmitted { .. } => self.attestation_submitted().await,
            LedgerEvent::EpochEnded { epoch } => self.epoch_ended(*epoch).await?,
            LedgerEvent::UserSignedUp { .. } | LedgerEvent::UserStateTransitioned { .. } => {
                self.refresh().await?
            }
        }
        Ok(())
    }

    pub async fn attestation_submitted(&mut self) {
        self.reconcile_spent().await;
        self.publish();
    }

    pub async fn epoch_ended(&mut self, epoch: Epoch) -> Result<()> {
        if epoch + 1 > self.current_epoch {
            self.enter_epoch(epoch + 1);
        }
        if self.identity.is_some() {
            self.calculate_all_epks()?;
            self.persist()?;
        }
        self.publish();
        Ok(())
    }

    /// Subscribes to the ledger logs that affect this user and runs the hooks.
    pub async fn start_daemon(shared: &SharedUserState) -> Result<()> {
        let mut manager = shared.lock().await;
        if manager.identity.is_none() {
            return Err(Error::Configuration("no identity bound".into()));
        }
        if manager.daemon.is_some() {
            return Ok(());
        }
        let mut subscription = manager.synchronizer.subscribe(LogFilter::only(EventKind::ALL));
        let subscription_id = subscription.id();
        let weak = Arc::downgrade(shared);
        let handle = tokio::spawn(async move {
            while let Some(log) = subscription.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let mut manager = shared.lock().await;
                if let Err(e) = manager.handle_log(&log).await {
                    warn!(error = %e, block = log.block_number, "user hook failed");
                }
            }
        });
        manager.daemon = Some(UserDaemon { handle, subscription: subscription_id });
        manager.phase = Phase::DaemonRunning;
        manager.publish();
        Ok(())
    }

    pub fn stop_daemon(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.handle.abort();
            self.synchronizer.unsubscribe(daemon.subscription);
            if self.phase == Phase::DaemonRunning {
                self.phase = Phase::IdentityBound;
            }
        }
    }

    /// Unbinds the identity and forgets the saved session.
    pub fn logout(&mut self) -> Result<()> {
        self.stop_daemon();
        self.identity = None;
        self.reputation.clear();
        self.latest_transitioned_epoch = 0;
        self.spent = NullifierUsage::default();
        self.all_epks.clear();
        if self.phase != Phase::Uninitialized {
            self.phase = Phase::Loaded;
        }
        self.store.delete_snapshot(USER_SESSION_KEY)?;
        self.publish();
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let Some(identity) = self.identity.as_ref() else {
            return Ok(());
        };
        save_json(
            self.store.as_ref(),
            USER_SESSION_KEY,
            &SessionSnapshot {
                identity: identity.serialize(),
                reputation: self.reputation.clone(),
                latest_transitioned_epoch: self.latest_transitioned_epoch,
                current_epoch: self.current_epoch,
                spent: self.spent,
            },
        )
    }

    fn publish(&self) {
        let (pos_rep, neg_rep) = self.load_reputation();
        let view = UserLedgerView {
            phase: self.phase,
            commitment: self.identity.as_ref().map(Identity::commitment_hex),
            current_epoch: self.current_epoch,
            latest_transitioned_epoch: self.latest_transitioned_epoch,
            pos_rep,
            neg_rep,
            balance: pos_rep as i64 - neg_rep as i64,
            spent: self.spent,
            current_epoch_keys: self.current_epoch_keys(),
            needs_ust: self.needs_ust(),
            sync_percent: self.synchronizer.sync_percent(),
        };
        self.view.send_replace(view);
    }
}

impl Drop for UserStateManager {
    fn drop(&mut self) { self.stop_daemon(); }
}
