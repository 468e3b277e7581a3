// File: tests/user_flow_test.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use repledger::actions::SocialActions;
use repledger::chain::memory::InMemoryChain;
use repledger::chain::{ChainProvider, LedgerEvent};
use repledger::config::{LedgerConfig, SyncConfig};
use repledger::error::{Error, Result};
use repledger::prover::{epoch_key_signal, reputation_nullifiers, DigestProofSystem, TransitionProofs};
use repledger::queue::{LoadingState, OperationQueue};
use repledger::storage::SledSnapshotStore;
use repledger::submission::{Endpoint, SubmissionBackend, SubmissionReceipt};
use repledger::sync::ChainStateSynchronizer;
use repledger::types::Bytes32;
use repledger::user::{NullifierUsage, SharedUserState, UserStateManager};

/// Relay that turns submissions into the events the ledger contract would emit.
struct RelayBackend {
    chain: Arc<InMemoryChain>,
    config: LedgerConfig,
    reject_next: AtomicBool,
}

impl RelayBackend {
    fn new(chain: Arc<InMemoryChain>, config: LedgerConfig) -> Self {
        Self { chain, config, reject_next: AtomicBool::new(false) }
    }

    fn signals(payload: &Value) -> Result<Vec<String>> {
        Ok(serde_json::from_value(payload["publicSignals"].clone())?)
    }
}

#[async_trait]
impl SubmissionBackend for RelayBackend {
    async fn submit(&self, endpoint: Endpoint, payload: Value) -> Result<SubmissionReceipt> {
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Submission("invalid proof".into()));
        }
        let epoch = self.chain.current_epoch().await?;
        let budget = self.config.max_reputation_budget;
        let event = match endpoint {
            Endpoint::SignUp => {
                let commitment = payload["commitment"].as_str().unwrap_or_default();
                let identity_commitment: Bytes32 = hex::decode(commitment)
                    .ok()
                    .and_then(|raw| raw.try_into().ok())
                    .ok_or_else(|| Error::Submission("bad commitment".into()))?;
                LedgerEvent::UserSignedUp {
                    epoch,
                    identity_commitment,
                    attester_id: self.config.attester_id,
                    airdrop: self.config.airdrop_reputation,
                }
            }
            Endpoint::Post | Endpoint::Comment | Endpoint::Vote => {
                let signals = Self::signals(&payload)?;
                let spent_nullifiers = reputation_nullifiers(&signals, budget)?;
                LedgerEvent::AttestationSubmitted {
                    epoch,
                    epoch_key: epoch_key_signal(&signals, budget as usize + 1)?,
                    attester_id: self.config.attester_id,
                    pos_rep: 0,
                    neg_rep: spent_nullifiers.len() as u64,
                    graffiti: [0u8; 32],
                    spent_nullifiers,
                }
            }
            Endpoint::Airdrop => {
                let signals = Self::signals(&payload)?;
                let epoch_key = epoch_key_signal(&signals, 1)?;
                self.chain.mark_airdropped(epoch_key);
                LedgerEvent::AttestationSubmitted {
                    epoch,
                    epoch_key,
                    attester_id: self.config.attester_id,
                    pos_rep: self.config.airdrop_reputation,
                    neg_rep: 0,
                    graffiti: [0u8; 32],
                    spent_nullifiers: Vec::new(),
                }
            }
            Endpoint::UserStateTransition => {
                let proofs: TransitionProofs = serde_json::from_value(payload["results"].clone())?;
                LedgerEvent::UserStateTransitioned {
                    to_epoch: proofs.to_epoch,
                    state_leaf: proofs.state_leaf,
                    epoch_key_nullifiers: proofs.epoch_key_nullifiers,
                }
            }
        };
        let receipt = self.chain.mine(vec![event]);
        Ok(SubmissionReceipt { transaction_id: receipt.transaction_id, epoch: Some(epoch), id: None })
    }
}

struct Harness {
    chain: Arc<InMemoryChain>,
    sync: Arc<ChainStateSynchronizer>,
    user: SharedUserState,
    backend: Arc<RelayBackend>,
    actions: SocialActions,
}

async fn harness_on(chain: Arc<InMemoryChain>) -> Harness {
    let store = Arc::new(SledSnapshotStore::temporary().unwrap());
    let sync_config = SyncConfig { poll_interval_millis: 10, sync_timeout_secs: 5, ..Default::default() };
    let sync = ChainStateSynchronizer::new(chain.clone(), store, sync_config, 0);
    sync.load().await.unwrap();
    sync.wait_for_sync(None).await.unwrap();

    let config = LedgerConfig::default();
    let mut manager = UserStateManager::new(config.clone(), sync.clone(), Arc::new(DigestProofSystem));
    manager.load().await.unwrap();
    let user = manager.into_shared();
    let backend = Arc::new(RelayBackend::new(chain.clone(), config.clone()));
    let actions =
        SocialActions::new(user.clone(), sync.clone(), backend.clone(), Arc::new(OperationQueue::new()), config);
    Harness { chain, sync, user, backend, actions }
}

async fn harness() -> Harness { harness_on(Arc::new(InMemoryChain::new())).await }

#[tokio::test]
async fn test_sign_up_seeds_airdrop() {
    let h = harness().await;
    let outcome = h.actions.sign_up().await.unwrap();
    assert!(!outcome.serialized_identity.is_empty());

    let user = h.user.lock().await;
    assert_eq!(user.load_reputation(), (30, 0));
    assert_eq!(user.latest_transitioned_epoch(), 1);
    assert!(!user.needs_ust());
    assert_eq!(user.current_epoch_keys().len(), 3);
}

#[tokio::test]
async fn test_spend_scenario_nonce_list_and_overspend() {
    let h = harness().await;
    h.actions.sign_up().await.unwrap();

    let mut user = h.user.lock().await;
    let proof = user.gen_rep_proof(5, 0, 0).await.unwrap();
    assert_eq!(proof.nonce_list, vec![0, 1, 2, 3, 4, -1, -1, -1, -1, -1]);
    assert_eq!(user.spent(), NullifierUsage::Spent(5));

    let err = user.gen_rep_proof(26, 1, 0).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientReputation { spent: 5, requested: 26, balance: 30 }));
    assert_eq!(user.spent(), NullifierUsage::Spent(5));
}

#[tokio::test]
async fn test_post_spends_and_reconciles_with_chain() {
    let h = harness().await;
    h.actions.sign_up().await.unwrap();
    h.actions.publish_post("title".into(), "content".into(), 0, 0).await.unwrap();

    assert_eq!(h.user.lock().await.spent(), NullifierUsage::Spent(5));
    assert_eq!(h.sync.mirror().await.spent_reputation_nullifiers(), 5);
    assert_eq!(h.actions.queue().loading_state(), LoadingState::Success);
}

#[tokio::test]
async fn test_concurrent_actions_run_one_at_a_time() {
    let h = harness().await;
    h.actions.sign_up().await.unwrap();
    let (post, comment) = tokio::join!(
        h.actions.publish_post("a".into(), "b".into(), 0, 0),
        h.actions.leave_comment("c".into(), "post-1".into(), 1, 0),
    );
    post.unwrap();
    comment.unwrap();

    assert_eq!(h.user.lock().await.spent(), NullifierUsage::Spent(8));
    assert_eq!(h.sync.mirror().await.spent_reputation_nullifiers(), 8);
}

#[tokio::test]
async fn test_rejected_submission_releases_spend() {
    let h = harness().await;
    h.actions.sign_up().await.unwrap();

    h.backend.reject_next.store(true, Ordering::SeqCst);
    let err = h.actions.publish_post("a".into(), "b".into(), 0, 0).await.unwrap_err();
    assert!(matches!(err, Error::Submission(_)));
    assert_eq!(h.user.lock().await.spent(), NullifierUsage::Spent(0));
    assert_eq!(h.actions.queue().loading_state(), LoadingState::Failed);

    h.actions.queue().reset_loading();
    h.actions.publish_post("a".into(), "b".into(), 0, 0).await.unwrap();
    assert_eq!(h.user.lock().await.spent(), NullifierUsage::Spent(5));
}

#[tokio::test]
async fn test_new_epoch_requires_transition() {
    let h = harness().await;
    h.chain.end_epoch();
    h.chain.end_epoch();
    h.sync.wait_for_sync(None).await.unwrap();
    let outcome = h.actions.sign_up().await.unwrap();
    h.actions.publish_post("a".into(), "b".into(), 0, 0).await.unwrap();
    assert_eq!(h.user.lock().await.latest_transitioned_epoch(), 3);

    h.chain.end_epoch();
    h.sync.wait_for_sync(None).await.unwrap();
    {
        let mut user = h.user.lock().await;
        user.refresh().await.unwrap();
        assert_eq!(user.current_epoch(), 4);
        assert!(user.needs_ust());
        assert!(matches!(user.gen_rep_proof(1, 0, 0).await, Err(Error::InvalidState(_))));
    }

    let receipt = h.actions.transition_if_needed().await.unwrap();
    assert!(receipt.is_some());
    let user = h.user.lock().await;
    assert_eq!(user.spent(), NullifierUsage::Spent(0));
    assert_eq!(user.latest_transitioned_epoch(), user.current_epoch());
    assert_eq!(user.load_reputation(), (30, 5));
    drop(user);

    assert!(h.actions.transition_if_needed().await.unwrap().is_none());

    // A second device logging in follows the transition recorded on chain.
    let other = harness_on(h.chain.clone()).await;
    other.actions.login(outcome.serialized_identity.as_str()).await.unwrap();
    let user = other.user.lock().await;
    assert_eq!(user.latest_transitioned_epoch(), 4);
    assert_eq!(user.load_reputation(), (30, 5));
    assert!(!user.needs_ust());
}

#[tokio::test]
async fn test_vote_proves_at_least_its_cost() {
    let h = harness().await;
    h.actions.sign_up().await.unwrap();
    let target = repledger::actions::VoteTarget::Post("post-1".into());
    h.actions.vote(target.clone(), "receiver".into(), 0, 10, 0, 0).await.unwrap();
    assert_eq!(h.user.lock().await.spent(), NullifierUsage::Spent(10));

    // 10 spent + max(11, 11) still fits a balance of 30.
    h.actions.vote(target.clone(), "receiver".into(), 1, 6, 5, 0).await.unwrap();
    assert_eq!(h.user.lock().await.spent(), NullifierUsage::Spent(21));

    let err = h.actions.vote(target, "receiver".into(), 2, 10, 0, 0).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientReputation { spent: 21, requested: 10, balance: 30 }));
    assert_eq!(h.user.lock().await.spent(), NullifierUsage::Spent(21));
}

#[tokio::test]
async fn test_airdrop_once_per_epoch_key() {
    let h = harness().await;
    h.actions.sign_up().await.unwrap();
    h.actions.get_airdrop().await.unwrap();

    let err = h.actions.get_airdrop().await.unwrap_err();
    assert!(err.to_string().contains("The epoch key has been airdropped."));
}

#[tokio::test]
async fn test_login_requires_sign_up() {
    let h = harness().await;
    let outcome = h.actions.sign_up().await.unwrap();

    let other = harness_on(h.chain.clone()).await;
    let unknown = repledger::identity::Identity::generate().serialize();
    let err = other.actions.login(unknown.as_str()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidIdentity(_)));

    other.actions.login(outcome.serialized_identity.as_str()).await.unwrap();
    assert_eq!(other.user.lock().await.load_reputation(), (30, 0));
}
