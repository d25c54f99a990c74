use serde::Serialize;

use super::{
    address_from, balances_from, balances_to, hash_from, opt_address_from, ConversionError,
};
use crate::{
    abiencode::{
        self, as_bytes,
        types::{Address, Bytes32, Hash, U256},
    },
    channel::{Allocation, ChannelId, NonceShare},
    error::{Error, ProtocolError, Result},
    wire::proto,
};

/// Channel configuration proposed by participant 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseChannelProposal {
    pub proposal_id: Hash,
    pub challenge_duration: u64,
    pub nonce_share: NonceShare,
    pub app: Option<Address>,
    pub init_data: Vec<u8>,
    pub init_bals: Allocation,
    /// `funding_agreement[asset][participant]`: what everybody deposits.
    pub funding_agreement: Vec<Vec<U256>>,
    /// Initial actions of an action app, one per participant. The initial
    /// state is built from them instead of `init_bals` when not empty.
    pub init_actions: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelProposal {
    pub base: BaseChannelProposal,
    /// Off-chain address the proposer signs states with.
    pub participant: Address,
    /// Wire addresses of all participants, proposer first.
    pub peers: Vec<Address>,
    /// Set for sub-channels funded from an existing channel.
    pub parent: Option<ChannelId>,
}

#[derive(Serialize)]
struct ProposalIdPreimage<'a> {
    nonce_share: NonceShare,
    peers: &'a [Address],
    challenge_duration: u64,
    init_bals: &'a Allocation,
    app: Address,
    #[serde(with = "as_bytes")]
    init_data: &'a [u8],
    init_actions: Vec<Hash>,
}

#[derive(Serialize)]
struct ActionPreimage<'a>(#[serde(with = "as_bytes")] &'a [u8]);

impl ChannelProposal {
    /// Proposal of a ledger channel whose participants deposit exactly their
    /// initial balances.
    pub fn new(
        challenge_duration: u64,
        nonce_share: NonceShare,
        participant: Address,
        peers: Vec<Address>,
        app: Option<Address>,
        init_data: Vec<u8>,
        init_bals: Allocation,
    ) -> Result<Self> {
        let funding_agreement = init_bals.balances.clone();
        let mut prop = Self {
            base: BaseChannelProposal {
                proposal_id: Hash::default(),
                challenge_duration,
                nonce_share,
                app: app.filter(|a| !a.is_zero()),
                init_data,
                init_bals,
                funding_agreement,
                init_actions: Vec::new(),
            },
            participant,
            peers,
            parent: None,
        };
        prop.base.proposal_id = prop.compute_id()?;
        prop.valid()?;
        Ok(prop)
    }

    /// Build the initial state of an action app channel from one action per
    /// participant. `init_bals` must be what the app derives from them.
    pub fn with_init_actions(mut self, init_actions: Vec<Vec<u8>>) -> Result<Self> {
        self.base.init_actions = init_actions;
        self.base.proposal_id = self.compute_id()?;
        self.valid()?;
        Ok(self)
    }

    /// Turn this into the proposal of a sub-channel of `parent`.
    pub fn with_parent(mut self, parent: ChannelId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Hash identifying this proposal before the channel id is known.
    pub fn compute_id(&self) -> Result<Hash> {
        let preimage = ProposalIdPreimage {
            nonce_share: self.base.nonce_share,
            peers: &self.peers,
            challenge_duration: self.base.challenge_duration,
            init_bals: &self.base.init_bals,
            app: self.base.app.unwrap_or_default(),
            init_data: &self.base.init_data,
            init_actions: self
                .base
                .init_actions
                .iter()
                .map(|a| abiencode::to_hash(&ActionPreimage(a)))
                .collect::<Result<_, _>>()?,
        };
        Ok(abiencode::to_hash(&preimage)?)
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    /// Checks a received (or constructed) proposal for consistency.
    pub fn valid(&self) -> Result<()> {
        let invalid = |reason: String| Error::from(ProtocolError::InvalidProposal(reason));
        let n = self.peers.len();
        if n < 2 {
            return Err(invalid(format!("{} peers", n)));
        }
        if self.base.challenge_duration == 0 {
            return Err(invalid("zero challenge duration".into()));
        }
        if !self.base.init_actions.is_empty() {
            if self.base.app.is_none() {
                return Err(invalid("initial actions without app".into()));
            }
            if self.base.init_actions.len() != n {
                return Err(invalid(format!(
                    "{} initial actions for {} peers",
                    self.base.init_actions.len(),
                    n
                )));
            }
        }
        if self.compute_id()? != self.base.proposal_id {
            return Err(ProtocolError::ProposalIdMismatch.into());
        }
        self.base
            .init_bals
            .valid(n)
            .map_err(|e| invalid(e.to_string()))?;
        if !self.base.init_bals.locked.is_empty() && self.parent.is_none() {
            return Err(invalid("ledger channel with locked funds".into()));
        }
        let agreement = &self.base.funding_agreement;
        if agreement.len() != self.base.init_bals.num_assets()
            || agreement.iter().any(|row| row.len() != n)
        {
            return Err(invalid("funding agreement dimensions".into()));
        }
        let init_totals = self
            .base
            .init_bals
            .totals()
            .map_err(|e| invalid(e.to_string()))?;
        for (asset, row) in agreement.iter().enumerate() {
            let total = row
                .iter()
                .try_fold(U256::zero(), |acc, b| acc.checked_add(*b))
                .ok_or_else(|| invalid("funding agreement overflows".into()))?;
            if total != init_totals[asset] {
                return Err(invalid(format!(
                    "funding agreement of asset {} does not cover the allocation",
                    asset
                )));
            }
        }
        Ok(())
    }
}

/// Acceptance of a proposal by one responder.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelProposalAcc {
    pub proposal_id: Hash,
    pub nonce_share: NonceShare,
    /// Off-chain address the responder signs states with.
    pub participant: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelProposalRej {
    pub proposal_id: Hash,
    pub reason: String,
}

impl From<&ChannelProposal> for proto::ChannelProposalMsg {
    fn from(value: &ChannelProposal) -> Self {
        let base = &value.base;
        Self {
            base_channel_proposal: Some(proto::BaseChannelProposal {
                proposal_id: base.proposal_id.0.to_vec(),
                challenge_duration: base.challenge_duration,
                nonce_share: base.nonce_share.0.to_vec(),
                app: base.app.map(|a| a.0.to_vec()).unwrap_or_default(),
                init_data: base.init_data.clone(),
                init_bals: Some((&base.init_bals).into()),
                funding_agreement: Some(balances_to(&base.funding_agreement)),
                init_actions: base.init_actions.clone(),
            }),
            participant: value.participant.0.to_vec(),
            peers: value.peers.iter().map(|p| p.0.to_vec()).collect(),
            parent: value.parent.map(|p| p.0.to_vec()).unwrap_or_default(),
        }
    }
}

impl TryFrom<proto::ChannelProposalMsg> for ChannelProposal {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelProposalMsg) -> Result<Self, Self::Error> {
        let base = value
            .base_channel_proposal
            .ok_or(ConversionError::ExpectedSome("base_channel_proposal"))?;
        let parent = match value.parent.is_empty() {
            true => None,
            false => Some(hash_from(&value.parent, "parent")?),
        };
        Ok(Self {
            base: BaseChannelProposal {
                proposal_id: hash_from(&base.proposal_id, "proposal_id")?,
                challenge_duration: base.challenge_duration,
                nonce_share: Bytes32::try_from(base.nonce_share.as_slice())
                    .or(Err(ConversionError::ByteLengthMismatch("nonce_share")))?,
                app: opt_address_from(&base.app, "app")?,
                init_data: base.init_data,
                init_bals: base
                    .init_bals
                    .ok_or(ConversionError::ExpectedSome("init_bals"))?
                    .try_into()?,
                funding_agreement: balances_from(
                    base.funding_agreement
                        .ok_or(ConversionError::ExpectedSome("funding_agreement"))?,
                )?,
                init_actions: base.init_actions,
            },
            participant: address_from(&value.participant, "participant")?,
            peers: value
                .peers
                .iter()
                .map(|p| address_from(p, "peers"))
                .collect::<Result<_, _>>()?,
            parent,
        })
    }
}

impl From<&ChannelProposalAcc> for proto::ChannelProposalAccMsg {
    fn from(value: &ChannelProposalAcc) -> Self {
        Self {
            proposal_id: value.proposal_id.0.to_vec(),
            nonce_share: value.nonce_share.0.to_vec(),
            participant: value.participant.0.to_vec(),
        }
    }
}

impl TryFrom<proto::ChannelProposalAccMsg> for ChannelProposalAcc {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelProposalAccMsg) -> Result<Self, Self::Error> {
        Ok(Self {
            proposal_id: hash_from(&value.proposal_id, "proposal_id")?,
            nonce_share: Bytes32::try_from(value.nonce_share.as_slice())
                .or(Err(ConversionError::ByteLengthMismatch("nonce_share")))?,
            participant: address_from(&value.participant, "participant")?,
        })
    }
}

impl From<&ChannelProposalRej> for proto::ChannelProposalRejMsg {
    fn from(value: &ChannelProposalRej) -> Self {
        Self {
            proposal_id: value.proposal_id.0.to_vec(),
            reason: value.reason.clone(),
        }
    }
}

impl TryFrom<proto::ChannelProposalRejMsg> for ChannelProposalRej {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelProposalRejMsg) -> Result<Self, Self::Error> {
        Ok(Self {
            proposal_id: hash_from(&value.proposal_id, "proposal_id")?,
            reason: value.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::state::tests::{asset, bals};

    fn proposal() -> ChannelProposal {
        ChannelProposal::new(
            60,
            Bytes32([3; 32]),
            Address([1; 20]),
            vec![Address([0xa; 20]), Address([0xb; 20])],
            None,
            vec![],
            Allocation::new(vec![asset(1)], bals(&[&[100, 50]])),
        )
        .unwrap()
    }

    #[test]
    fn id_binds_the_proposal_content() {
        let prop = proposal();
        assert!(prop.valid().is_ok());

        let mut other = prop.clone();
        other.base.nonce_share = Bytes32([4; 32]);
        assert_ne!(other.compute_id().unwrap(), prop.base.proposal_id);
        assert!(matches!(
            other.valid(),
            Err(Error::Protocol(ProtocolError::ProposalIdMismatch))
        ));
    }

    #[test]
    fn funding_agreement_must_cover_allocation() {
        let mut prop = proposal();
        prop.base.funding_agreement = bals(&[&[100, 49]]);
        assert!(matches!(
            prop.valid(),
            Err(Error::Protocol(ProtocolError::InvalidProposal(_)))
        ));
        // Who deposits what may differ from the initial balances.
        prop.base.funding_agreement = bals(&[&[150, 0]]);
        assert!(prop.valid().is_ok());
    }

    #[test]
    fn needs_two_peers() {
        let err = ChannelProposal::new(
            60,
            Bytes32([3; 32]),
            Address([1; 20]),
            vec![Address([0xa; 20])],
            None,
            vec![],
            Allocation::new(vec![asset(1)], bals(&[&[100]])),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidProposal(_))));
    }

    #[test]
    fn wire_conversion_keeps_everything() {
        let prop = proposal().with_parent(Hash([8; 32]));
        let decoded = ChannelProposal::try_from(proto::ChannelProposalMsg::from(&prop)).unwrap();
        assert_eq!(decoded, prop);
    }
}
