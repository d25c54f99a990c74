use super::ConversionError;
use crate::{
    channel::{Phase, Transaction},
    wire::proto,
};

/// Replay of the sender's last known transaction, used to reconcile after a
/// restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSync {
    pub phase: Phase,
    pub current_tx: Transaction,
}

impl From<&ChannelSync> for proto::ChannelSyncMsg {
    fn from(value: &ChannelSync) -> Self {
        Self {
            phase: value.phase.as_u8() as u32,
            current_tx: Some((&value.current_tx).into()),
        }
    }
}

impl TryFrom<proto::ChannelSyncMsg> for ChannelSync {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelSyncMsg) -> Result<Self, Self::Error> {
        Ok(Self {
            phase: u8::try_from(value.phase)
                .ok()
                .and_then(Phase::from_u8)
                .ok_or(ConversionError::UnknownPhase(value.phase))?,
            current_tx: value
                .current_tx
                .ok_or(ConversionError::ExpectedSome("current_tx"))?
                .try_into()?,
        })
    }
}
