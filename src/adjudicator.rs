//! On-chain adjudicator and funder seams.
//!
//! The engine never talks to a chain directly. Registering, progressing and
//! withdrawing go through [Adjudicator]; locking the initial funds goes
//! through [Funder]. Timing is abstracted behind [Timeout] so a backend
//! decides what "elapsed" means (block time, wall clock, simulated time).

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    abiencode::types::{Address, Hash, Signature, U256},
    channel::{ChannelId, PartIdx, Params, SignedWithdrawalAuth, State, Transaction},
    error::Result,
};

/// A point in the adjudicator's time.
#[async_trait]
pub trait Timeout: Debug + Send + Sync {
    /// Whether the point has passed. Backends that need to query the chain
    /// for this give up with [Cancelled][crate::Error::Cancelled].
    async fn is_elapsed(&self, cancel: &CancellationToken) -> Result<bool>;

    /// Resolves once elapsed, or fails with [Cancelled][crate::Error::Cancelled].
    async fn wait(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Phase of an on-chain dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputePhase {
    /// Registered, refutable with newer states until the timeout.
    Dispute,
    /// App channel after the dispute window, progressable until the timeout.
    ForceExec,
    Concluded,
}

/// Adjudicator's view of a channel.
#[derive(Debug, Clone)]
pub struct DisputeState {
    pub version: u64,
    pub phase: DisputePhase,
    /// End of the current dispute or force-exec window.
    pub timeout: Arc<dyn Timeout>,
    pub state_hash: Hash,
    pub challenge_duration: u64,
}

/// Events the adjudicator emits per channel.
#[derive(Debug, Clone)]
pub enum AdjudicatorEvent {
    Registered {
        channel_id: ChannelId,
        version: u64,
        state: State,
        timeout: Arc<dyn Timeout>,
    },
    Progressed {
        channel_id: ChannelId,
        state: State,
        actor: PartIdx,
        sig: Signature,
        timeout: Arc<dyn Timeout>,
    },
    Concluded {
        channel_id: ChannelId,
        version: u64,
    },
}

impl AdjudicatorEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            AdjudicatorEvent::Registered { channel_id, .. }
            | AdjudicatorEvent::Progressed { channel_id, .. }
            | AdjudicatorEvent::Concluded { channel_id, .. } => *channel_id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            AdjudicatorEvent::Registered { version, .. }
            | AdjudicatorEvent::Concluded { version, .. } => *version,
            AdjudicatorEvent::Progressed { state, .. } => state.version(),
        }
    }
}

/// Common part of every adjudicator call.
#[derive(Debug, Clone)]
pub struct AdjudicatorReq {
    pub params: Arc<Params>,
    pub tx: Transaction,
    /// Index of the calling participant.
    pub idx: PartIdx,
}

#[derive(Debug, Clone)]
pub struct ProgressReq {
    /// The registered (or last progressed) transaction.
    pub base: AdjudicatorReq,
    pub new_state: State,
    /// Signature of the actor (`base.idx`) on `new_state`.
    pub sig: Signature,
}

#[derive(Debug, Clone)]
pub struct WithdrawReq {
    pub base: AdjudicatorReq,
    /// One authorization per asset, for `base.idx`'s share.
    pub auths: Vec<SignedWithdrawalAuth>,
}

/// Events of one channel, in emission order.
pub type EventSubscription = mpsc::UnboundedReceiver<AdjudicatorEvent>;

#[async_trait]
pub trait Adjudicator: Debug + Send + Sync {
    /// Register `req.tx` on-chain. Returns the end of the dispute window.
    async fn register(&self, req: &AdjudicatorReq, cancel: &CancellationToken)
        -> Result<Arc<dyn Timeout>>;

    async fn progress(&self, req: &ProgressReq, cancel: &CancellationToken) -> Result<()>;

    /// Conclude the channel if needed and pay out `req.base.idx`'s share.
    /// `sub_states` are the final transactions of sub-channels holding funds
    /// locked in `req.base.tx`.
    async fn withdraw(
        &self,
        req: &WithdrawReq,
        sub_states: &[Transaction],
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn dispute_state(&self, id: ChannelId) -> Result<Option<DisputeState>>;

    fn subscribe(&self, id: ChannelId) -> Result<EventSubscription>;
}

/// What participant `idx` deposits for a new channel.
#[derive(Debug, Clone)]
pub struct FundingReq {
    pub params: Arc<Params>,
    pub state: State,
    pub idx: PartIdx,
    /// `agreement[asset][participant]`: how much everybody deposits.
    pub agreement: Vec<Vec<U256>>,
}

#[async_trait]
pub trait Funder: Debug + Send + Sync {
    /// Deposit our share and wait until all participants funded. Fails with
    /// [FundingTimeout][crate::Error::FundingTimeout] naming the
    /// participants that did not.
    async fn fund(&self, req: &FundingReq, cancel: &CancellationToken) -> Result<()>;
}

/// On-chain account of participant `idx` where withdrawals go.
pub fn default_receiver(params: &Params, idx: PartIdx) -> Option<Address> {
    params.participants().get(idx).copied()
}
