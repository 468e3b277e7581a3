//! Queue-backed social actions
//!
//! Every chain-mutating action is an operation on the [`OperationQueue`]:
//! build the proof, submit it, wait for inclusion and resync, refresh the user.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::chain::ChainProvider;
use crate::config::LedgerConfig;
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityInput};
use crate::queue::{OperationOptions, OperationQueue, StatusReporter, TxWaiter};
use crate::submission::{Endpoint, SubmissionBackend, SubmissionReceipt};
use crate::sync::ChainStateSynchronizer;
use crate::user::{ReputationProof, SharedUserState, UserStateManager};

const AIRDROPPED: &str = "The epoch key has been airdropped.";

/// What a vote lands on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteTarget {
    Post(String),
    Comment(String),
}

impl VoteTarget {
    fn data_id(&self) -> &str {
        match self {
            VoteTarget::Post(id) | VoteTarget::Comment(id) => id,
        }
    }
}

/// Result of a successful sign-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpOutcome {
    /// Keep this: it is the only way back into the account.
    pub serialized_identity: String,
    pub commitment: String,
    pub receipt: SubmissionReceipt,
}

struct Spend {
    endpoint: Endpoint,
    amount: u64,
    epk_nonce: u64,
    min_rep: u64,
}

#[derive(Clone)]
struct Context {
    user: SharedUserState,
    backend: Arc<dyn SubmissionBackend>,
    provider: Arc<dyn ChainProvider>,
    waiter: TxWaiter,
}

impl Context {
    /// Proves a spend, submits it and releases the nullifiers if the backend refuses.
    async fn spend(
        &self,
        status: &StatusReporter,
        title: &str,
        spend: Spend,
        body: Value,
    ) -> Result<SubmissionReceipt> {
        let receipt = {
            let mut user = self.user.lock().await;
            status.update(title, "Generating ZK proof...");
            let proof = user.gen_rep_proof(spend.amount, spend.epk_nonce, spend.min_rep).await?;
            status.update(title, "Broadcasting...");
            match self.backend.submit(spend.endpoint, spend_payload(body, &proof)).await {
                Ok(receipt) => receipt,
                Err(e @ Error::Submission(_)) => {
                    if let Err(release) = user.release_spend(&proof) {
                        warn!(error = %release, "could not release rejected spend");
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        };
        status.update(title, "Waiting for TX inclusion...");
        self.confirm(&receipt).await?;
        Ok(receipt)
    }

    async fn confirm(&self, receipt: &SubmissionReceipt) -> Result<()> {
        self.waiter.after_tx(&receipt.transaction_id).await?;
        self.user.lock().await.refresh().await
    }
}

fn spend_payload(mut body: Value, proof: &ReputationProof) -> Value {
    if let Value::Object(map) = &mut body {
        map.insert("proof".into(), json!(proof.proof));
        map.insert("publicSignals".into(), json!(proof.public_signals));
    }
    body
}

pub struct SocialActions {
    context: Context,
    queue: Arc<OperationQueue>,
    config: LedgerConfig,
}

impl SocialActions {
    pub fn new(
        user: SharedUserState,
        synchronizer: Arc<ChainStateSynchronizer>,
        backend: Arc<dyn SubmissionBackend>,
        queue: Arc<OperationQueue>,
        config: LedgerConfig,
    ) -> Self {
        let context = Context {
            user,
            backend,
            provider: synchronizer.provider(),
            waiter: TxWaiter::new(synchronizer),
        };
        Self { context, queue, config }
    }

    pub fn queue(&self) -> &Arc<OperationQueue> { &self.queue }

    pub fn user(&self) -> &SharedUserState { &self.context.user }

    pub async fn publish_post(
        &self,
        title: String,
        content: String,
        epk_nonce: u64,
        min_rep: u64,
    ) -> Result<SubmissionReceipt> {
        let amount = self.config.post_reputation;
        let context = self.context.clone();
        let options = OperationOptions::new("Creating post").with_success_message("Post is finalized");
        self.queue
            .run(options, move |status| async move {
                let body = json!({ "title": title, "content": content, "proveKarma": amount });
                let spend = Spend { endpoint: Endpoint::Post, amount, epk_nonce, min_rep };
                context.spend(&status, "Creating post", spend, body).await
            })
            .await
    }

    pub async fn leave_comment(
        &self,
        content: String,
        post_id: String,
        epk_nonce: u64,
        min_rep: u64,
    ) -> Result<SubmissionReceipt> {
        let amount = self.config.comment_reputation;
        let context = self.context.clone();
        let options = OperationOptions::new("Creating comment").with_success_message("Comment is finalized!");
        self.queue
            .run(options, move |status| async move {
                let body = json!({ "content": content, "minRep": min_rep, "postId": post_id });
                let spend = Spend { endpoint: Endpoint::Comment, amount, epk_nonce, min_rep };
                context.spend(&status, "Creating comment", spend, body).await
            })
            .await
    }

    /// Spends `upvote + downvote` and proves at least that much remains.
    pub async fn vote(
        &self,
        target: VoteTarget,
        receiver: String,
        epk_nonce: u64,
        upvote: u64,
        downvote: u64,
        min_rep: u64,
    ) -> Result<SubmissionReceipt> {
        let amount = upvote + downvote;
        let min_rep = amount.max(min_rep);
        let context = self.context.clone();
        self.queue
            .run(OperationOptions::new("Creating Vote"), move |status| async move {
                let body = json!({
                    "upvote": upvote,
                    "downvote": downvote,
                    "minRep": min_rep,
                    "receiver": receiver,
                    "dataId": target.data_id(),
                    "isPost": matches!(target, VoteTarget::Post(_)),
                });
                let spend = Spend { endpoint: Endpoint::Vote, amount, epk_nonce, min_rep };
                context.spend(&status, "Creating Vote", spend, body).await
            })
            .await
    }

    pub async fn get_airdrop(&self) -> Result<SubmissionReceipt> {
        let context = self.context.clone();
        self.queue
            .run(OperationOptions::new("Getting airdrop"), move |status| async move {
                let (epoch_key, proof) = {
                    let user = context.user.lock().await;
                    let epoch_key = user.epoch_key(0)?;
                    if context.provider.is_epoch_key_airdropped(epoch_key).await? {
                        return Err(Error::Submission(AIRDROPPED.into()));
                    }
                    status.update("Getting airdrop", "Generating ZK proof...");
                    (epoch_key, user.gen_sign_up_proof().await?)
                };
                status.update("Getting airdrop", "Broadcasting...");
                let body = json!({ "proof": proof.proof, "publicSignals": proof.public_signals });
                let receipt = context.backend.submit(Endpoint::Airdrop, body).await?;
                status.update("Getting airdrop", "Waiting for TX inclusion...");
                context.confirm(&receipt).await?;
                info!(%epoch_key, "airdrop received");
                Ok(receipt)
            })
            .await
    }

    /// Creates a fresh identity, registers it and returns it serialized.
    pub async fn sign_up(&self) -> Result<SignUpOutcome> {
        let context = self.context.clone();
        self.queue
            .run(OperationOptions::new("Signing up"), move |status| async move {
                let identity = Identity::generate();
                let serialized_identity = identity.serialize();
                let commitment = identity.commitment_hex();
                let epoch_key = {
                    let mut user = context.user.lock().await;
                    if user.identity().is_some() {
                        return Err(Error::InvalidState("Identity already exists!".into()));
                    }
                    user.set_identity(identity).await?;
                    user.epoch_key(0)?
                };
                status.update("Signing up", "Waiting for TX inclusion...");
                let body = json!({ "commitment": commitment, "epk": epoch_key.to_string() });
                let submitted = match context.backend.submit(Endpoint::SignUp, body).await {
                    Ok(receipt) => context.confirm(&receipt).await.map(|()| receipt),
                    Err(e) => Err(e),
                };
                let receipt = match submitted {
                    Ok(receipt) => receipt,
                    Err(e) => {
                        context.user.lock().await.logout()?;
                        return Err(e);
                    }
                };
                UserStateManager::start_daemon(&context.user).await?;
                info!(%commitment, "signed up");
                Ok(SignUpOutcome { serialized_identity, commitment, receipt })
            })
            .await
    }

    /// Binds an identity that has already signed up on chain.
    pub async fn login(&self, identity: impl Into<IdentityInput>) -> Result<()> {
        let identity = identity.into().into_identity()?;
        if !self.context.provider.has_user_signed_up(&identity.commitment()).await? {
            return Err(Error::InvalidIdentity("identity has not signed up".into()));
        }
        self.context.user.lock().await.set_identity(identity).await?;
        UserStateManager::start_daemon(&self.context.user).await
    }

    pub async fn user_state_transition(&self) -> Result<SubmissionReceipt> {
        let context = self.context.clone();
        let options =
            OperationOptions::new("Performing user state transition").with_success_message("User state transitioned");
        self.queue
            .run(options, move |status| async move {
                status.update("Performing user state transition", "Generating ZK proofs...");
                let mut user = context.user.lock().await;
                user.user_state_transition(context.backend.as_ref(), &context.waiter).await
            })
            .await
    }

    /// Runs a user state transition only if the user is behind the current epoch.
    pub async fn transition_if_needed(&self) -> Result<Option<SubmissionReceipt>> {
        let needs_ust = {
            let mut user = self.context.user.lock().await;
            user.refresh().await?;
            user.needs_ust()
        };
        if !needs_ust {
            return Ok(None);
        }
        self.user_state_transition().await.map(Some)
    }
}
