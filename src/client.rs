//! The main Perun object: owns the services a channel needs and the table of
//! open channels, opens channels and serves requests from peers.

mod channel;
mod proposal;
mod watcher;

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use channel::{Channel, UpdateRequest, UpdateResponse};
pub use proposal::ProposalResponse;

use crate::{
    abiencode::types::Address,
    adjudicator::{Adjudicator, Funder},
    channel::{AppRegistry, ChannelId, Machine, PartIdx, Phase},
    config::Config,
    error::{Error, Result},
    messages::{ChannelProposal, Envelope, Message},
    persistence::Persister,
    sig::{Account, Verifier},
    wire::{Bus, CacheGuard, Relay},
};

/// Decides on channel proposals received from peers.
#[async_trait]
pub trait ProposalHandler: Send + Sync {
    /// `idx` is the index we would get in the channel.
    async fn handle_proposal(&self, proposal: &ChannelProposal, idx: PartIdx) -> ProposalResponse;

    /// Called once an accepted channel is funded.
    fn channel_opened(&self, _channel: Arc<Channel>) {}
}

/// Decides on updates proposed by peers. Only called for updates the channel
/// machine and the app already validated.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle_update(&self, request: &UpdateRequest) -> UpdateResponse;
}

/// The pluggable backends of a client.
#[derive(Debug, Clone)]
pub struct Backend {
    pub verifier: Arc<dyn Verifier>,
    pub bus: Arc<dyn Bus>,
    pub funder: Arc<dyn Funder>,
    pub adjudicator: Arc<dyn Adjudicator>,
    pub persister: Arc<dyn Persister>,
}

/// Everything shared between the client and its channels.
#[derive(Debug)]
pub(crate) struct Services {
    /// Our address on the envelope bus.
    pub wire: Address,
    pub account: Arc<dyn Account>,
    pub verifier: Arc<dyn Verifier>,
    pub bus: Arc<dyn Bus>,
    pub relay: Arc<Relay>,
    pub funder: Arc<dyn Funder>,
    pub adjudicator: Arc<dyn Adjudicator>,
    pub persister: Arc<dyn Persister>,
    pub apps: AppRegistry,
    pub config: Config,
    /// Parent of every watcher token.
    pub shutdown: CancellationToken,
}

impl Services {
    pub async fn send(&self, recipient: Address, msg: Message) -> Result<()> {
        self.bus
            .publish(Envelope {
                sender: self.wire,
                recipient,
                msg,
            })
            .await
    }

    /// Send `msg` to every address in `peers` except ourselves.
    pub async fn broadcast(&self, peers: &[Address], msg: Message) -> Result<()> {
        for peer in peers.iter().filter(|p| **p != self.wire) {
            self.send(*peer, msg.clone()).await?;
        }
        Ok(())
    }
}

pub(crate) type ChannelTable = RwLock<HashMap<ChannelId, Arc<Channel>>>;

#[derive(Debug)]
struct ClientInner {
    services: Arc<Services>,
    channels: Arc<ChannelTable>,
    requests: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    /// Keeps proposal responses that arrive before we subscribe to them.
    _proposal_cache: CacheGuard,
    /// Stops the inbound pump.
    closed: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.services.shutdown.cancel();
        self.closed.cancel();
    }
}

/// Handle to a Perun client. Cheap to clone; all clones share the same
/// channels.
#[derive(Debug, Clone)]
pub struct PerunClient {
    inner: Arc<ClientInner>,
}

impl PerunClient {
    /// Create a client listening on `wire` for envelopes.
    ///
    /// Must be called from within a tokio runtime: it spawns the task moving
    /// envelopes from the bus into the client.
    pub fn new(
        wire: Address,
        account: Arc<dyn Account>,
        backend: Backend,
        apps: AppRegistry,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        let (relay, requests) = Relay::new();
        let mut inbound = backend.bus.subscribe_client(wire)?;
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        let pump_relay = relay.clone();
        let pump_stop = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_stop.cancelled() => break,
                    env = inbound.recv() => match env {
                        Some(env) => pump_relay.deliver(env),
                        None => break,
                    },
                }
            }
            debug!(client = ?wire, "inbound envelope pump stopped");
        });

        let proposal_cache = relay.cache(|env| {
            matches!(
                env.msg,
                Message::ChannelProposalAcc(_) | Message::ChannelProposalRej(_)
            )
        });
        let services = Services {
            wire,
            account,
            verifier: backend.verifier,
            bus: backend.bus,
            relay,
            funder: backend.funder,
            adjudicator: backend.adjudicator,
            persister: backend.persister,
            apps,
            config,
            shutdown,
        };
        info!(client = ?wire, account = ?services.account.address(), "client started");
        Ok(Self {
            inner: Arc::new(ClientInner {
                services: Arc::new(services),
                channels: Arc::default(),
                requests: Mutex::new(requests),
                _proposal_cache: proposal_cache,
                closed,
            }),
        })
    }

    /// Our address on the envelope bus.
    pub fn address(&self) -> Address {
        self.inner.services.wire
    }

    /// The address our channel states are signed with.
    pub fn account_address(&self) -> Address {
        self.inner.services.account.address()
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.inner.channels.read().get(&id).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.inner.channels.read().values().cloned().collect()
    }

    /// Serve requests from peers until `cancel` fires or the client shuts
    /// down. Only one `handle` loop may run per client.
    pub async fn handle(
        &self,
        proposals: Arc<dyn ProposalHandler>,
        updates: Arc<dyn UpdateHandler>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut requests = self
            .inner
            .requests
            .try_lock()
            .map_err(|_| Error::Bus("requests are already being handled".into()))?;
        let shutdown = self.inner.services.shutdown.clone();
        loop {
            let env = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = shutdown.cancelled() => return Ok(()),
                env = requests.recv() => match env {
                    Some(env) => env,
                    None => return Ok(()),
                },
            };
            self.handle_request(env, &proposals, updates.as_ref(), cancel)
                .await;
        }
    }

    async fn handle_request(
        &self,
        env: Envelope,
        proposals: &Arc<dyn ProposalHandler>,
        updates: &dyn UpdateHandler,
        cancel: &CancellationToken,
    ) {
        let sender = env.sender;
        match env.msg {
            Message::ChannelProposal(prop) => {
                let client = self.clone();
                let handler = proposals.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let id = prop.base.proposal_id;
                    match client.accept_proposal(sender, prop, handler.as_ref(), &cancel).await {
                        Ok(Some(channel)) => handler.channel_opened(channel),
                        Ok(None) => {}
                        Err(e) => warn!(proposal = ?id, error = %e, "opening proposed channel failed"),
                    }
                });
            }
            Message::ChannelUpdate(update) => {
                let id = update.state.channel_id();
                let Some(channel) = self.channel(id) else {
                    warn!(channel = ?id, ?sender, "update for unknown channel");
                    return;
                };
                if let Err(e) = channel.handle_update(sender, update, updates, cancel).await {
                    warn!(channel = ?id, ?sender, error = %e, "peer update not accepted");
                }
            }
            Message::ChannelAction(action) => {
                let id = action.channel_id;
                let Some(channel) = self.channel(id) else {
                    warn!(channel = ?id, ?sender, "action for unknown channel");
                    return;
                };
                if let Err(e) = channel.handle_action(sender, action, cancel).await {
                    warn!(channel = ?id, ?sender, error = %e, "peer action not recorded");
                }
            }
            Message::ChannelSync(sync) => {
                let id = sync.current_tx.state.channel_id();
                let Some(channel) = self.channel(id) else {
                    warn!(channel = ?id, ?sender, "sync for unknown channel");
                    return;
                };
                if let Err(e) = channel.handle_sync(sender, sync).await {
                    warn!(channel = ?id, ?sender, error = %e, "sync failed");
                }
            }
            msg => debug!(?sender, msg = msg.kind(), "dropping unsolicited message"),
        }
    }

    /// Rebuild all persisted channels, restart their watchers and ask peers
    /// of channels with pending updates to sync. A channel restored while
    /// its initial state was being signed ends up in `Funding` once a peer
    /// answers; funding it is up to the caller.
    pub async fn restore(&self, cancel: &CancellationToken) -> Result<Vec<Arc<Channel>>> {
        let services = &self.inner.services;
        let mut restored = Vec::new();
        for peer in services.persister.active_peers().await? {
            for snapshot in services.persister.restore_peer(peer).await? {
                let id = snapshot.id();
                if self.inner.channels.read().contains_key(&id) {
                    continue;
                }
                let app = services.apps.resolve(snapshot.params.app())?;
                let machine = Machine::restore(
                    services.account.clone(),
                    services.verifier.clone(),
                    snapshot.params.clone(),
                    app,
                    snapshot.idx,
                    snapshot.phase,
                    snapshot.current_tx.clone(),
                    snapshot.staging_tx.clone(),
                    snapshot.staging_actor,
                )?;
                let channel = Arc::new(Channel::new(
                    services.clone(),
                    Arc::downgrade(&self.inner.channels),
                    machine,
                    snapshot.peers.clone(),
                    snapshot.parent,
                ));
                self.inner.channels.write().insert(id, channel.clone());
                info!(channel = ?id, phase = %snapshot.phase, version = snapshot.version(), "channel restored");

                if matches!(
                    snapshot.phase,
                    Phase::InitSigning | Phase::Acting | Phase::Signing
                ) {
                    channel.sync(cancel).await?;
                }
                let watched = !matches!(
                    snapshot.phase,
                    Phase::InitActing | Phase::InitSigning | Phase::Funding | Phase::Withdrawn
                );
                if watched && services.config.auto_watch {
                    channel.start_watcher();
                }
                restored.push(channel);
            }
        }
        Ok(restored)
    }

    /// Stop all watchers and the request loop. Channels stay usable for
    /// explicit calls.
    pub fn shutdown(&self) {
        info!(client = ?self.address(), "client shutting down");
        self.inner.services.shutdown.cancel();
    }
}
