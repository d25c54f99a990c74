//! Protobuf messages exchanged between participants and stored by the
//! persister.
//!
//! Field numbers are part of the wire format; append, never renumber.

/// Balances of all participants for one asset.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Balance {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub balance: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Balances {
    #[prost(message, repeated, tag = "1")]
    pub balances: Vec<Balance>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Asset {
    #[prost(bytes = "vec", tag = "1")]
    pub chain_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub holder: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IndexMap {
    #[prost(uint32, repeated, tag = "1")]
    pub index_map: Vec<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubAlloc {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub bals: Option<Balance>,
    #[prost(message, optional, tag = "3")]
    pub index_map: Option<IndexMap>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Allocation {
    #[prost(message, repeated, tag = "1")]
    pub assets: Vec<Asset>,
    #[prost(message, optional, tag = "2")]
    pub balances: Option<Balances>,
    #[prost(message, repeated, tag = "3")]
    pub locked: Vec<SubAlloc>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct State {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(message, optional, tag = "4")]
    pub allocation: Option<Allocation>,
    #[prost(bytes = "vec", tag = "5")]
    pub data: Vec<u8>,
    #[prost(bool, tag = "6")]
    pub is_final: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Params {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub challenge_duration: u64,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub parts: Vec<Vec<u8>>,
    #[prost(bytes = "vec", tag = "4")]
    pub app: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub nonce: Vec<u8>,
    #[prost(bool, tag = "6")]
    pub ledger_channel: bool,
    #[prost(bool, tag = "7")]
    pub virtual_channel: bool,
}

/// Signatures are dense; an empty entry is a missing signature.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Transaction {
    #[prost(message, optional, tag = "1")]
    pub state: Option<State>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub sigs: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BaseChannelProposal {
    #[prost(bytes = "vec", tag = "1")]
    pub proposal_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub challenge_duration: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub nonce_share: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub app: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub init_data: Vec<u8>,
    #[prost(message, optional, tag = "6")]
    pub init_bals: Option<Allocation>,
    #[prost(message, optional, tag = "7")]
    pub funding_agreement: Option<Balances>,
    /// Actions the initial state of an action app is built from.
    #[prost(bytes = "vec", repeated, tag = "8")]
    pub init_actions: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelProposalMsg {
    #[prost(message, optional, tag = "1")]
    pub base_channel_proposal: Option<BaseChannelProposal>,
    #[prost(bytes = "vec", tag = "2")]
    pub participant: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub peers: Vec<Vec<u8>>,
    /// Empty for ledger channels.
    #[prost(bytes = "vec", tag = "4")]
    pub parent: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelProposalAccMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub proposal_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub nonce_share: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub participant: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelProposalRejMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub proposal_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelUpdate {
    #[prost(message, optional, tag = "1")]
    pub state: Option<State>,
    #[prost(uint32, tag = "2")]
    pub actor_idx: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelUpdateMsg {
    #[prost(message, optional, tag = "1")]
    pub channel_update: Option<ChannelUpdate>,
    #[prost(bytes = "vec", tag = "2")]
    pub sig: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelUpdateAccMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub sig: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelUpdateRejMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(string, tag = "3")]
    pub reason: String,
    /// Hash of the rejected state.
    #[prost(bytes = "vec", tag = "4")]
    pub state_hash: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelActionMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(uint32, tag = "3")]
    pub actor_idx: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub action: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelSyncMsg {
    #[prost(uint32, tag = "1")]
    pub phase: u32,
    #[prost(message, optional, tag = "2")]
    pub current_tx: Option<Transaction>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(bytes = "vec", tag = "1")]
    pub sender: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub recipient: Vec<u8>,
    #[prost(oneof = "envelope::Msg", tags = "3, 4, 5, 6, 7, 8, 9, 10")]
    pub msg: Option<envelope::Msg>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "3")]
        ChannelProposalMsg(super::ChannelProposalMsg),
        #[prost(message, tag = "4")]
        ChannelProposalAccMsg(super::ChannelProposalAccMsg),
        #[prost(message, tag = "5")]
        ChannelProposalRejMsg(super::ChannelProposalRejMsg),
        #[prost(message, tag = "6")]
        ChannelUpdateMsg(super::ChannelUpdateMsg),
        #[prost(message, tag = "7")]
        ChannelUpdateAccMsg(super::ChannelUpdateAccMsg),
        #[prost(message, tag = "8")]
        ChannelUpdateRejMsg(super::ChannelUpdateRejMsg),
        #[prost(message, tag = "9")]
        ChannelSyncMsg(super::ChannelSyncMsg),
        #[prost(message, tag = "10")]
        ChannelActionMsg(super::ChannelActionMsg),
    }
}

/// Everything needed to rebuild one channel after a restart.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelSnapshot {
    #[prost(uint32, tag = "1")]
    pub idx: u32,
    #[prost(message, optional, tag = "2")]
    pub params: Option<Params>,
    #[prost(uint32, tag = "3")]
    pub phase: u32,
    #[prost(message, optional, tag = "4")]
    pub current_tx: Option<Transaction>,
    #[prost(message, optional, tag = "5")]
    pub staging_tx: Option<Transaction>,
    #[prost(uint32, optional, tag = "6")]
    pub staging_actor: Option<u32>,
    #[prost(bytes = "vec", repeated, tag = "7")]
    pub peers: Vec<Vec<u8>>,
    #[prost(bytes = "vec", tag = "8")]
    pub parent: Vec<u8>,
}
