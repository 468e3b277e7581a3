// ./src/lib.rs

pub mod actions;
pub mod chain;
pub mod config;
pub mod epoch;
pub mod epoch_key;
pub mod error;
pub mod hash;
pub mod identity;
pub mod logging;
pub mod mirror;
pub mod prover;
pub mod queue;
pub mod storage;
pub mod submission;
pub mod sync;
pub mod tree;
pub mod types;
pub mod user;

pub use actions::{SocialActions, VoteTarget};
pub use chain::{ChainProvider, LedgerEvent, LedgerLog};
pub use config::Config;
pub use epoch::{EpochManager, EpochSchedule};
pub use error::{Error, Result};
pub use identity::{Identity, IdentityInput};
pub use mirror::GlobalLedgerMirror;
pub use prover::ProofSystem;
pub use queue::{OperationQueue, OperationState, TxWaiter};
pub use submission::SubmissionBackend;
pub use sync::ChainStateSynchronizer;
pub use tree::StateTree;
pub use types::{Bytes32, Epoch, EpochKey, Reputation};
pub use user::{NullifierUsage, UserStateManager};
