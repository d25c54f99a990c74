//! Error taxonomy shared by the channel machine, the protocols and the
//! backends.

use std::sync::Arc;

use crate::{
    abiencode,
    adjudicator::Timeout,
    channel::{AllocationError, AppError, PartIdx, Phase},
    sig, Address, Hash,
};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Coarse classification of an [Error], independent of where it originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Phase,
    Transition,
    App,
    Signature,
    FundingTimeout,
    Protocol,
    Adjudicator,
    Persist,
    Cancelled,
    Config,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error("concurrent update: already signing version {version}")]
    ConcurrentUpdate { version: u64 },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    App(#[from] AppError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("funding timed out, participants {peers:?} did not fund")]
    FundingTimeout { peers: Vec<PartIdx> },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("peer rejected: {reason}")]
    PeerRejected { reason: String },
    #[error(transparent)]
    Adjudicator(#[from] AdjudicatorError),
    #[error("on-chain version {on_chain} is ahead of local version {local}")]
    StateRegressed { local: u64, on_chain: u64 },
    #[error("persistence failed: {0}")]
    Persist(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid channel parameters: {0}")]
    InvalidParams(String),
    #[error("unknown app {0:?}")]
    UnknownApp(Address),
    #[error("unknown channel {0:?}")]
    UnknownChannel(Hash),
    #[error("bus: {0}")]
    Bus(String),
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
    #[error(transparent)]
    Conversion(#[from] crate::messages::ConversionError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
    /// A fatal error together with the last state of the channel it hit.
    #[error("channel {id:?} (phase {phase}, version {version}): {source}")]
    Channel {
        id: Hash,
        phase: Phase,
        version: u64,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Phase(_) | Error::ConcurrentUpdate { .. } => ErrorKind::Phase,
            Error::Transition(_) => ErrorKind::Transition,
            Error::App(AppError::Transition(_)) => ErrorKind::Transition,
            Error::App(_) => ErrorKind::App,
            Error::Signature(_) => ErrorKind::Signature,
            Error::FundingTimeout { .. } => ErrorKind::FundingTimeout,
            Error::Protocol(_)
            | Error::PeerRejected { .. }
            | Error::Bus(_)
            | Error::Conversion(_)
            | Error::InvalidParams(_)
            | Error::UnknownChannel(_) => ErrorKind::Protocol,
            Error::Adjudicator(_) | Error::StateRegressed { .. } => ErrorKind::Adjudicator,
            Error::Persist(_) => ErrorKind::Persist,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::UnknownApp(_) | Error::Config(_) => ErrorKind::Config,
            Error::Encoding(_) | Error::Internal(_) => ErrorKind::Internal,
            Error::Channel { source, .. } => source.kind(),
        }
    }

    /// Fatal errors leave the channel unable to make progress off-chain.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Channel { source, .. } => source.is_fatal(),
            Error::Adjudicator(e) => !e.is_retryable(),
            Error::StateRegressed { .. } => true,
            _ => matches!(
                self.kind(),
                ErrorKind::FundingTimeout | ErrorKind::Persist | ErrorKind::Internal
            ),
        }
    }

    /// The innermost error, unwrapping [Error::Channel].
    pub fn root(&self) -> &Error {
        match self {
            Error::Channel { source, .. } => source.root(),
            e => e,
        }
    }

    pub fn channel_id(&self) -> Option<Hash> {
        match self {
            Error::Channel { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Attach the channel's last-known phase and version to fatal errors.
    pub(crate) fn in_channel(self, id: Hash, phase: Phase, version: u64) -> Error {
        match self {
            e @ Error::Channel { .. } => e,
            e if e.is_fatal() => Error::Channel {
                id,
                phase,
                version,
                source: Box::new(e),
            },
            e => e,
        }
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Error {
        let msg = msg.into();
        debug_assert!(false, "internal invariant violated: {}", msg);
        Error::Internal(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation {op} not allowed in phase {phase}")]
pub struct PhaseError {
    pub op: &'static str,
    pub phase: Phase,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("current state is final")]
    CurrentStateIsFinal,
    #[error("assets changed")]
    AssetsMismatch,
    #[error("total of asset {asset} changed")]
    TotalAllocationMismatch { asset: usize },
    #[error("sub-allocations changed")]
    LockedMismatch,
    #[error("no participant with index {0}")]
    InvalidActor(PartIdx),
    #[error("participant {participant} lost funds of asset {asset} without being the actor")]
    UnauthorizedDebit { asset: usize, participant: PartIdx },
    #[error("app data must stay empty without an app")]
    AppDataWithoutApp,
    #[error(transparent)]
    InvalidAllocation(#[from] AllocationError),
    #[error("progression requires a state app")]
    ProgressionUnsupported,
    #[error("states of action apps advance through action rounds")]
    ActionAppUpdate,
    #[error("staged state is final, enable it with enable_final")]
    StagedStateIsFinal,
    #[error("staged state is not final, enable it with enable_update")]
    StagedStateNotFinal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("participant {0} already signed")]
    AlreadySigned(PartIdx),
    #[error("invalid signature from participant {0}")]
    Invalid(PartIdx),
    #[error("no participant with index {0}")]
    UnknownParticipant(PartIdx),
    #[error("signatures of participants {0:?} missing")]
    Missing(Vec<PartIdx>),
    #[error("account {account:?} is not participant {idx}")]
    AccountMismatch { account: Address, idx: PartIdx },
    #[error(transparent)]
    Backend(#[from] sig::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("channel id mismatch: expected {expected:?}, got {got:?}")]
    ChannelIdMismatch { expected: Hash, got: Hash },
    #[error("version out of sequence: expected {expected}, got {got}")]
    VersionMismatch { expected: u64, got: u64 },
    #[error("proposal id mismatch")]
    ProposalIdMismatch,
    #[error("sender {0:?} is not a peer of this channel")]
    UnknownPeer(Address),
    #[error("actor {actor} did not send the update")]
    ActorMismatch { actor: PartIdx },
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdjudicatorError {
    /// The chain rejected the call.
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("transaction not confirmed in time")]
    TxTimeout,
    #[error("adjudicator unavailable: {0}")]
    Unavailable(String),
    #[error("channel not concludable yet")]
    NotConcludable { timeout: Arc<dyn Timeout> },
    #[error("no dispute registered for this channel")]
    NotRegistered,
}

impl AdjudicatorError {
    /// Retryable errors may succeed when submitted again later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AdjudicatorError::Reverted(_))
    }
}
