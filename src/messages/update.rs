use super::{hash_from, signature_from, ConversionError};
use crate::{
    abiencode::types::{Hash, Signature},
    channel::{PartIdx, State},
    wire::proto,
};

/// Proposal of the next state, signed by its actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdateMsg {
    pub state: State,
    pub actor_idx: PartIdx,
    pub sig: Signature,
}

impl TryFrom<proto::ChannelUpdateMsg> for ChannelUpdateMsg {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelUpdateMsg) -> Result<Self, Self::Error> {
        let update = value
            .channel_update
            .ok_or(ConversionError::ExpectedSome("channel_update"))?;

        Ok(Self {
            state: update
                .state
                .ok_or(ConversionError::ExpectedSome("channel_update.state"))?
                .try_into()?,
            actor_idx: update.actor_idx as usize,
            sig: signature_from(&value.sig, "sig")?,
        })
    }
}

impl From<&ChannelUpdateMsg> for proto::ChannelUpdateMsg {
    fn from(value: &ChannelUpdateMsg) -> Self {
        Self {
            channel_update: Some(proto::ChannelUpdate {
                state: Some((&value.state).into()),
                actor_idx: value.actor_idx as u32,
            }),
            sig: value.sig.0.to_vec(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelUpdateAcc {
    pub channel_id: Hash,
    pub version: u64,
    pub sig: Signature,
}

impl TryFrom<proto::ChannelUpdateAccMsg> for ChannelUpdateAcc {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelUpdateAccMsg) -> Result<Self, Self::Error> {
        Ok(ChannelUpdateAcc {
            channel_id: hash_from(&value.channel_id, "channel_id")?,
            version: value.version,
            sig: signature_from(&value.sig, "sig")?,
        })
    }
}

impl From<&ChannelUpdateAcc> for proto::ChannelUpdateAccMsg {
    fn from(value: &ChannelUpdateAcc) -> Self {
        Self {
            channel_id: value.channel_id.0.to_vec(),
            version: value.version,
            sig: value.sig.0.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdateRej {
    pub channel_id: Hash,
    pub version: u64,
    /// Hash of the rejected state, so that a late rejection does not hit a
    /// newer proposal of the same version.
    pub state_hash: Hash,
    pub reason: String,
}

impl TryFrom<proto::ChannelUpdateRejMsg> for ChannelUpdateRej {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelUpdateRejMsg) -> Result<Self, Self::Error> {
        Ok(ChannelUpdateRej {
            channel_id: hash_from(&value.channel_id, "channel_id")?,
            version: value.version,
            state_hash: hash_from(&value.state_hash, "state_hash")?,
            reason: value.reason,
        })
    }
}

impl From<&ChannelUpdateRej> for proto::ChannelUpdateRejMsg {
    fn from(value: &ChannelUpdateRej) -> Self {
        Self {
            channel_id: value.channel_id.0.to_vec(),
            version: value.version,
            reason: value.reason.clone(),
            state_hash: value.state_hash.0.to_vec(),
        }
    }
}

/// One participant's action for the action round building state `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAction {
    pub channel_id: Hash,
    pub version: u64,
    pub actor_idx: PartIdx,
    pub action: Vec<u8>,
}

impl TryFrom<proto::ChannelActionMsg> for ChannelAction {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelActionMsg) -> Result<Self, Self::Error> {
        Ok(Self {
            channel_id: hash_from(&value.channel_id, "channel_id")?,
            version: value.version,
            actor_idx: value.actor_idx as usize,
            action: value.action,
        })
    }
}

impl From<&ChannelAction> for proto::ChannelActionMsg {
    fn from(value: &ChannelAction) -> Self {
        Self {
            channel_id: value.channel_id.0.to_vec(),
            version: value.version,
            actor_idx: value.actor_idx as u32,
            action: value.action.clone(),
        }
    }
}
