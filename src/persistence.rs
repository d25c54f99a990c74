//! Checkpointing of channel machines.
//!
//! Every persister call receives a complete [ChannelSnapshot] of the machine
//! at that moment, so a backend can store each call as one atomic write.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message as _;

use crate::{
    abiencode::types::Address,
    channel::{ChannelId, Machine, PartIdx, Params, Phase, Transaction},
    error::{Error, Result},
    messages::{address_from, hash_from, ConversionError},
    wire::proto,
};

/// What is stored per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub idx: PartIdx,
    pub params: Arc<Params>,
    pub phase: Phase,
    pub current_tx: Option<Transaction>,
    pub staging_tx: Option<Transaction>,
    pub staging_actor: Option<PartIdx>,
    /// Wire addresses of all participants.
    pub peers: Vec<Address>,
    pub parent: Option<ChannelId>,
}

impl ChannelSnapshot {
    pub fn of(machine: &Machine, peers: &[Address], parent: Option<ChannelId>) -> Self {
        Self {
            idx: machine.idx(),
            params: machine.params().clone(),
            phase: machine.phase(),
            current_tx: machine.current_tx().cloned(),
            staging_tx: machine.staging_tx().cloned(),
            staging_actor: machine.staging_actor(),
            peers: peers.to_vec(),
            parent,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.params.id()
    }

    pub fn version(&self) -> u64 {
        self.current_tx.as_ref().map_or(0, Transaction::version)
    }
}

impl From<&ChannelSnapshot> for proto::ChannelSnapshot {
    fn from(value: &ChannelSnapshot) -> Self {
        Self {
            idx: value.idx as u32,
            params: Some(value.params.as_ref().into()),
            phase: value.phase.as_u8() as u32,
            current_tx: value.current_tx.as_ref().map(Into::into),
            staging_tx: value.staging_tx.as_ref().map(Into::into),
            staging_actor: value.staging_actor.map(|a| a as u32),
            peers: value.peers.iter().map(|p| p.0.to_vec()).collect(),
            parent: value.parent.map(|p| p.0.to_vec()).unwrap_or_default(),
        }
    }
}

impl TryFrom<proto::ChannelSnapshot> for ChannelSnapshot {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelSnapshot) -> Result<Self, Self::Error> {
        let params: Params = value
            .params
            .ok_or(ConversionError::ExpectedSome("params"))?
            .try_into()?;
        let peers: Vec<Address> = value
            .peers
            .iter()
            .map(|p| address_from(p, "peers"))
            .collect::<Result<_, _>>()?;
        if peers.len() != params.num_parts() {
            return Err(ConversionError::ParticipantSizeMismatch);
        }
        Ok(Self {
            idx: value.idx as usize,
            params: Arc::new(params),
            phase: u8::try_from(value.phase)
                .ok()
                .and_then(Phase::from_u8)
                .ok_or(ConversionError::UnknownPhase(value.phase))?,
            current_tx: value.current_tx.map(TryInto::try_into).transpose()?,
            staging_tx: value.staging_tx.map(TryInto::try_into).transpose()?,
            staging_actor: value.staging_actor.map(|a| a as usize),
            peers,
            parent: match value.parent.is_empty() {
                true => None,
                false => Some(hash_from(&value.parent, "parent")?),
            },
        })
    }
}

#[async_trait]
pub trait Persister: Debug + Send + Sync {
    async fn channel_created(&self, snapshot: &ChannelSnapshot) -> Result<()>;

    async fn phase_changed(&self, snapshot: &ChannelSnapshot) -> Result<()>;

    /// A new staging transaction exists.
    async fn staged(&self, snapshot: &ChannelSnapshot) -> Result<()>;

    /// Participant `idx` signed the staging transaction.
    async fn sig_added(&self, snapshot: &ChannelSnapshot, idx: PartIdx) -> Result<()>;

    /// The staging transaction became the current one.
    async fn enabled(&self, snapshot: &ChannelSnapshot) -> Result<()>;

    async fn channel_removed(&self, id: ChannelId) -> Result<()>;

    async fn restore_channel(&self, id: ChannelId) -> Result<Option<ChannelSnapshot>>;

    /// All stored channels with `peer` among their participants.
    async fn restore_peer(&self, peer: Address) -> Result<Vec<ChannelSnapshot>>;

    /// Peers with at least one stored channel.
    async fn active_peers(&self) -> Result<Vec<Address>>;
}

/// Persister that stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersister;

#[async_trait]
impl Persister for NoopPersister {
    async fn channel_created(&self, _: &ChannelSnapshot) -> Result<()> {
        Ok(())
    }

    async fn phase_changed(&self, _: &ChannelSnapshot) -> Result<()> {
        Ok(())
    }

    async fn staged(&self, _: &ChannelSnapshot) -> Result<()> {
        Ok(())
    }

    async fn sig_added(&self, _: &ChannelSnapshot, _: PartIdx) -> Result<()> {
        Ok(())
    }

    async fn enabled(&self, _: &ChannelSnapshot) -> Result<()> {
        Ok(())
    }

    async fn channel_removed(&self, _: ChannelId) -> Result<()> {
        Ok(())
    }

    async fn restore_channel(&self, _: ChannelId) -> Result<Option<ChannelSnapshot>> {
        Ok(None)
    }

    async fn restore_peer(&self, _: Address) -> Result<Vec<ChannelSnapshot>> {
        Ok(Vec::new())
    }

    async fn active_peers(&self) -> Result<Vec<Address>> {
        Ok(Vec::new())
    }
}

/// One persister call, as recorded by [MemoryPersister].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOp {
    Created(ChannelId),
    PhaseChanged(ChannelId, Phase),
    Staged(ChannelId, u64),
    SigAdded(ChannelId, PartIdx),
    Enabled(ChannelId, u64),
    Removed(ChannelId),
}

/// In-memory persister. Snapshots are stored protobuf-encoded, the way a
/// database backend would store them.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    channels: Mutex<HashMap<ChannelId, Vec<u8>>>,
    ops: Mutex<Vec<PersistOp>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls so far, oldest first.
    pub fn ops(&self) -> Vec<PersistOp> {
        self.ops.lock().clone()
    }

    fn store(&self, snapshot: &ChannelSnapshot, op: PersistOp) {
        let bytes = proto::ChannelSnapshot::from(snapshot).encode_to_vec();
        self.channels.lock().insert(snapshot.id(), bytes);
        self.ops.lock().push(op);
    }

    fn load(bytes: &[u8]) -> Result<ChannelSnapshot> {
        let msg = proto::ChannelSnapshot::decode(bytes)
            .map_err(|e| Error::Persist(format!("corrupt snapshot: {}", e)))?;
        msg.try_into()
            .map_err(|e: ConversionError| Error::Persist(format!("corrupt snapshot: {}", e)))
    }

    fn all(&self) -> Result<Vec<ChannelSnapshot>> {
        self.channels.lock().values().map(|b| Self::load(b)).collect()
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn channel_created(&self, snapshot: &ChannelSnapshot) -> Result<()> {
        self.store(snapshot, PersistOp::Created(snapshot.id()));
        Ok(())
    }

    async fn phase_changed(&self, snapshot: &ChannelSnapshot) -> Result<()> {
        self.store(snapshot, PersistOp::PhaseChanged(snapshot.id(), snapshot.phase));
        Ok(())
    }

    async fn staged(&self, snapshot: &ChannelSnapshot) -> Result<()> {
        let version = snapshot
            .staging_tx
            .as_ref()
            .map_or(snapshot.version(), Transaction::version);
        self.store(snapshot, PersistOp::Staged(snapshot.id(), version));
        Ok(())
    }

    async fn sig_added(&self, snapshot: &ChannelSnapshot, idx: PartIdx) -> Result<()> {
        self.store(snapshot, PersistOp::SigAdded(snapshot.id(), idx));
        Ok(())
    }

    async fn enabled(&self, snapshot: &ChannelSnapshot) -> Result<()> {
        self.store(snapshot, PersistOp::Enabled(snapshot.id(), snapshot.version()));
        Ok(())
    }

    async fn channel_removed(&self, id: ChannelId) -> Result<()> {
        self.channels.lock().remove(&id);
        self.ops.lock().push(PersistOp::Removed(id));
        Ok(())
    }

    async fn restore_channel(&self, id: ChannelId) -> Result<Option<ChannelSnapshot>> {
        let bytes = self.channels.lock().get(&id).cloned();
        bytes.map(|b| Self::load(&b)).transpose()
    }

    async fn restore_peer(&self, peer: Address) -> Result<Vec<ChannelSnapshot>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|s| s.peers.contains(&peer))
            .collect())
    }

    async fn active_peers(&self) -> Result<Vec<Address>> {
        let mut peers: Vec<Address> = self
            .all()?
            .into_iter()
            .flat_map(|s| s.peers)
            .collect();
        peers.sort();
        peers.dedup();
        Ok(peers)
    }
}
