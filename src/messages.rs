//! Typed messages exchanged between channel participants, and their
//! conversion from and to the protobuf types in [crate::wire::proto].

mod channel;
mod proposal;
mod sync;
mod update;

pub use proposal::{
    BaseChannelProposal, ChannelProposal, ChannelProposalAcc, ChannelProposalRej,
};
pub use sync::ChannelSync;
pub use update::{ChannelAction, ChannelUpdateAcc, ChannelUpdateMsg, ChannelUpdateRej};

pub(crate) use channel::{
    address_from, balances_from, balances_to, hash_from, opt_address_from, signature_from,
};

use crate::{
    abiencode::types::{Address, Hash},
    channel::ChannelId,
    wire::proto::{self, envelope},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("participant count mismatch")]
    ParticipantSizeMismatch,
    #[error("asset count mismatch")]
    AssetSizeMismatch,
    #[error("field `{0}` has the wrong byte length")]
    ByteLengthMismatch(&'static str),
    #[error("field `{0}` is missing")]
    ExpectedSome(&'static str),
    #[error("unknown phase {0}")]
    UnknownPhase(u32),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("frame: {0}")]
    Frame(String),
}

/// Messages sent between participants of a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ChannelProposal(ChannelProposal),
    ChannelProposalAcc(ChannelProposalAcc),
    ChannelProposalRej(ChannelProposalRej),
    ChannelUpdate(ChannelUpdateMsg),
    ChannelUpdateAcc(ChannelUpdateAcc),
    ChannelUpdateRej(ChannelUpdateRej),
    ChannelSync(ChannelSync),
    ChannelAction(ChannelAction),
}

impl Message {
    /// Channel the message belongs to. Proposal messages have none yet.
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            Message::ChannelUpdate(m) => Some(m.state.channel_id()),
            Message::ChannelUpdateAcc(m) => Some(m.channel_id),
            Message::ChannelUpdateRej(m) => Some(m.channel_id),
            Message::ChannelSync(m) => Some(m.current_tx.state.channel_id()),
            Message::ChannelAction(m) => Some(m.channel_id),
            _ => None,
        }
    }

    pub fn proposal_id(&self) -> Option<Hash> {
        match self {
            Message::ChannelProposal(m) => Some(m.base.proposal_id),
            Message::ChannelProposalAcc(m) => Some(m.proposal_id),
            Message::ChannelProposalRej(m) => Some(m.proposal_id),
            _ => None,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ChannelProposal(_) => "ChannelProposal",
            Message::ChannelProposalAcc(_) => "ChannelProposalAcc",
            Message::ChannelProposalRej(_) => "ChannelProposalRej",
            Message::ChannelUpdate(_) => "ChannelUpdate",
            Message::ChannelUpdateAcc(_) => "ChannelUpdateAcc",
            Message::ChannelUpdateRej(_) => "ChannelUpdateRej",
            Message::ChannelSync(_) => "ChannelSync",
            Message::ChannelAction(_) => "ChannelAction",
        }
    }
}

/// A routed [Message].
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: Address,
    pub recipient: Address,
    pub msg: Message,
}

impl From<&Envelope> for proto::Envelope {
    fn from(value: &Envelope) -> Self {
        let msg = match &value.msg {
            Message::ChannelProposal(m) => envelope::Msg::ChannelProposalMsg(m.into()),
            Message::ChannelProposalAcc(m) => envelope::Msg::ChannelProposalAccMsg(m.into()),
            Message::ChannelProposalRej(m) => envelope::Msg::ChannelProposalRejMsg(m.into()),
            Message::ChannelUpdate(m) => envelope::Msg::ChannelUpdateMsg(m.into()),
            Message::ChannelUpdateAcc(m) => envelope::Msg::ChannelUpdateAccMsg(m.into()),
            Message::ChannelUpdateRej(m) => envelope::Msg::ChannelUpdateRejMsg(m.into()),
            Message::ChannelSync(m) => envelope::Msg::ChannelSyncMsg(m.into()),
            Message::ChannelAction(m) => envelope::Msg::ChannelActionMsg(m.into()),
        };
        Self {
            sender: value.sender.0.to_vec(),
            recipient: value.recipient.0.to_vec(),
            msg: Some(msg),
        }
    }
}

impl TryFrom<proto::Envelope> for Envelope {
    type Error = ConversionError;

    fn try_from(value: proto::Envelope) -> Result<Self, Self::Error> {
        let msg = match value.msg.ok_or(ConversionError::ExpectedSome("msg"))? {
            envelope::Msg::ChannelProposalMsg(m) => Message::ChannelProposal(m.try_into()?),
            envelope::Msg::ChannelProposalAccMsg(m) => Message::ChannelProposalAcc(m.try_into()?),
            envelope::Msg::ChannelProposalRejMsg(m) => Message::ChannelProposalRej(m.try_into()?),
            envelope::Msg::ChannelUpdateMsg(m) => Message::ChannelUpdate(m.try_into()?),
            envelope::Msg::ChannelUpdateAccMsg(m) => Message::ChannelUpdateAcc(m.try_into()?),
            envelope::Msg::ChannelUpdateRejMsg(m) => Message::ChannelUpdateRej(m.try_into()?),
            envelope::Msg::ChannelSyncMsg(m) => Message::ChannelSync(m.try_into()?),
            envelope::Msg::ChannelActionMsg(m) => Message::ChannelAction(m.try_into()?),
        };
        Ok(Self {
            sender: address_from(&value.sender, "sender")?,
            recipient: address_from(&value.recipient, "recipient")?,
            msg,
        })
    }
}
