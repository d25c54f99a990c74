//! Handle to one open channel: off-chain updates and their signature
//! exchange, and the on-chain calls of a dispute.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelTable, Services, UpdateHandler};
use crate::{
    abiencode::types::{Address, Hash, U256},
    adjudicator::{
        default_receiver, AdjudicatorReq, DisputePhase, FundingReq, ProgressReq, Timeout,
        WithdrawReq,
    },
    channel::{
        make_signed_withdrawal_auths, ChannelId, Machine, PartIdx, Params, Phase, State,
        Transaction,
    },
    error::{AdjudicatorError, Error, PhaseError, ProtocolError, Result, SignatureError},
    messages::{
        ChannelAction, ChannelSync, ChannelUpdateAcc, ChannelUpdateMsg, ChannelUpdateRej,
        Envelope, Message,
    },
    persistence::ChannelSnapshot,
    wire::{CacheGuard, Subscription},
};

/// An update proposed by a peer, as shown to the [UpdateHandler].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub channel_id: ChannelId,
    pub current: State,
    pub next: State,
    pub actor: PartIdx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResponse {
    Accept,
    Reject { reason: String },
}

/// What a persister call records.
#[derive(Debug, Clone, Copy)]
enum Checkpoint {
    Phase,
    Staged,
    Sig(PartIdx),
    Enabled,
}

pub struct Channel {
    pub(super) services: Arc<Services>,
    pub(super) table: Weak<ChannelTable>,
    pub(super) id: ChannelId,
    pub(super) idx: PartIdx,
    pub(super) params: Arc<Params>,
    /// Wire address of every participant, by index.
    pub(super) peers: Vec<Address>,
    pub(super) parent: Option<ChannelId>,
    pub(super) machine: Mutex<Machine>,
    /// Bumped whenever a staged update is replaced by somebody else's.
    superseded: watch::Sender<u64>,
    /// Version of the current state.
    committed: watch::Sender<u64>,
    /// End of the current dispute or progression window.
    dispute_timeout: parking_lot::Mutex<Option<Arc<dyn Timeout>>>,
    pub(super) fatal: parking_lot::Mutex<Option<Arc<Error>>>,
    pub(super) watcher: CancellationToken,
    _response_cache: CacheGuard,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("idx", &self.idx)
            .field("peers", &self.peers)
            .field("parent", &self.parent)
            .finish()
    }
}

/// Acceptances and rejections of updates of channel `id` whose version
/// satisfies `versions`.
fn responses_to<F>(id: ChannelId, versions: F) -> impl Fn(&Envelope) -> bool + Send + Sync + 'static
where
    F: Fn(u64) -> bool + Send + Sync + 'static,
{
    move |env| match &env.msg {
        Message::ChannelUpdateAcc(acc) => acc.channel_id == id && versions(acc.version),
        Message::ChannelUpdateRej(rej) => rej.channel_id == id && versions(rej.version),
        _ => false,
    }
}

fn update_responses(id: ChannelId, version: u64) -> impl Fn(&Envelope) -> bool + Send + Sync {
    responses_to(id, move |v| v == version)
}

/// Whether `m` still stages `state` as proposed by `actor`.
fn stages(m: &Machine, state: &State, actor: PartIdx) -> bool {
    m.phase() == Phase::Signing
        && m.staging_actor() == Some(actor)
        && m.staging_tx().map(|tx| &tx.state) == Some(state)
}

impl Channel {
    pub(super) fn new(
        services: Arc<Services>,
        table: Weak<ChannelTable>,
        machine: Machine,
        peers: Vec<Address>,
        parent: Option<ChannelId>,
    ) -> Self {
        let params = machine.params().clone();
        let id = params.id();
        // Responses of other responders may arrive before the update itself.
        let response_cache = services.relay.cache(responses_to(id, |v| v > 0));
        let watcher = services.shutdown.child_token();
        Self {
            committed: watch::channel(machine.version()).0,
            idx: machine.idx(),
            id,
            params,
            peers,
            parent,
            machine: Mutex::new(machine),
            superseded: watch::channel(0).0,
            dispute_timeout: parking_lot::Mutex::new(None),
            fatal: parking_lot::Mutex::new(None),
            watcher,
            table,
            services,
            _response_cache: response_cache,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Our participant index.
    pub fn idx(&self) -> PartIdx {
        self.idx
    }

    pub fn params(&self) -> &Arc<Params> {
        &self.params
    }

    pub fn peers(&self) -> &[Address] {
        &self.peers
    }

    pub fn parent(&self) -> Option<ChannelId> {
        self.parent
    }

    pub async fn phase(&self) -> Phase {
        self.machine.lock().await.phase()
    }

    pub async fn state(&self) -> Option<State> {
        self.machine.lock().await.state().cloned()
    }

    pub async fn current_tx(&self) -> Option<Transaction> {
        self.machine.lock().await.current_tx().cloned()
    }

    pub async fn version(&self) -> u64 {
        self.machine.lock().await.version()
    }

    /// The error that stopped the watcher, if any.
    pub fn fatal_error(&self) -> Option<Arc<Error>> {
        self.fatal.lock().clone()
    }

    pub fn dispute_timeout(&self) -> Option<Arc<dyn Timeout>> {
        self.dispute_timeout.lock().clone()
    }

    pub(super) fn set_dispute_timeout(&self, timeout: Arc<dyn Timeout>) {
        *self.dispute_timeout.lock() = Some(timeout);
    }

    /// Attach the channel's phase and version to fatal errors.
    pub(super) fn fail(&self, m: &Machine, e: Error) -> Error {
        e.in_channel(self.id, m.phase(), m.version())
    }

    fn snapshot(&self, m: &Machine) -> ChannelSnapshot {
        ChannelSnapshot::of(m, &self.peers, self.parent)
    }

    async fn persist(&self, m: &Machine, what: Checkpoint) -> Result<()> {
        let snapshot = self.snapshot(m);
        let persister = &self.services.persister;
        let res = match what {
            Checkpoint::Phase => persister.phase_changed(&snapshot).await,
            Checkpoint::Staged => persister.staged(&snapshot).await,
            Checkpoint::Sig(idx) => persister.sig_added(&snapshot, idx).await,
            Checkpoint::Enabled => persister.enabled(&snapshot).await,
        };
        res.map_err(|e| self.fail(m, e))
    }

    pub(super) async fn persist_phase(&self, m: &Machine) -> Result<()> {
        self.persist(m, Checkpoint::Phase).await
    }

    pub(super) async fn persist_created(&self) -> Result<()> {
        let m = self.machine.lock().await;
        self.services
            .persister
            .channel_created(&self.snapshot(&m))
            .await
            .map_err(|e| self.fail(&m, e))
    }

    /// Collect the peers' signatures on the initial state and enable it.
    pub(super) async fn collect_initial_sigs(
        &self,
        mut accs: Subscription,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout = self.services.config.response_timeout();
        loop {
            {
                let mut m = self.machine.lock().await;
                if m.phase() != Phase::InitSigning {
                    // Completed through a sync.
                    return Ok(());
                }
                if m.staging_tx().map_or(false, Transaction::is_complete) {
                    m.enable_init()?;
                    self.persist(&m, Checkpoint::Phase).await?;
                    return Ok(());
                }
            }
            let env = accs.recv(cancel, timeout, "initial signatures").await?;
            let (Some(peer), Message::ChannelUpdateAcc(acc)) = (self.peer_idx(&env.sender), env.msg)
            else {
                continue;
            };
            let mut m = self.machine.lock().await;
            if m.phase() != Phase::InitSigning {
                continue;
            }
            match m.add_sig(peer, acc.sig) {
                Ok(()) => self.persist(&m, Checkpoint::Sig(peer)).await?,
                Err(Error::Signature(SignatureError::AlreadySigned(_))) => {}
                Err(e) => return Err(self.fail(&m, e)),
            }
        }
    }

    fn peer_idx(&self, addr: &Address) -> Option<PartIdx> {
        self.peers.iter().position(|p| p == addr)
    }

    /// Deposit our share and wait for the others, then start watching.
    pub(super) async fn fund(
        self: &Arc<Self>,
        agreement: Vec<Vec<U256>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let req = {
            let m = self.machine.lock().await;
            FundingReq {
                params: self.params.clone(),
                state: m
                    .state()
                    .cloned()
                    .ok_or_else(|| Error::internal("funding without initial state"))?,
                idx: self.idx,
                agreement,
            }
        };
        if let Err(e) = self.services.funder.fund(&req, cancel).await {
            let m = self.machine.lock().await;
            warn!(channel = ?self.id, error = %e, "funding failed");
            return Err(self.fail(&m, e));
        }

        let mut m = self.machine.lock().await;
        m.set_funded()?;
        self.persist(&m, Checkpoint::Phase).await?;
        drop(m);
        info!(channel = ?self.id, "channel funded");
        if self.services.config.auto_watch {
            self.start_watcher();
        }
        Ok(())
    }

    /// Propose `state` as the next state with us as actor and wait until
    /// every peer signed it.
    ///
    /// On cancellation the staged update is kept; drop it with
    /// [Channel::discard_update] or let a [Channel::sync] complete it.
    pub async fn update(&self, state: State, cancel: &CancellationToken) -> Result<()> {
        let version = state.version();
        let responses = self
            .services
            .relay
            .subscribe(update_responses(self.id, version));
        let msg = {
            let mut m = self.machine.lock().await;
            m.update(state.clone(), self.idx)?;
            let sig = match m.sign() {
                Ok(sig) => sig,
                Err(e) => {
                    m.discard_update()?;
                    return Err(e);
                }
            };
            self.persist(&m, Checkpoint::Staged).await?;
            ChannelUpdateMsg {
                state: state.clone(),
                actor_idx: self.idx,
                sig,
            }
        };
        debug!(channel = ?self.id, version, "update proposed");
        if let Err(e) = self
            .services
            .broadcast(&self.peers, Message::ChannelUpdate(msg))
            .await
        {
            self.abort_update(&state).await?;
            return Err(e);
        }
        self.collect_sigs(responses, &state, cancel).await
    }

    /// Update to the result of applying `f` to a copy of the current state
    /// with the version already bumped.
    pub async fn update_by<F>(&self, f: F, cancel: &CancellationToken) -> Result<()>
    where
        F: FnOnce(&mut State) -> Result<()>,
    {
        let mut next = self
            .state()
            .await
            .ok_or_else(|| Error::internal("channel without state"))?
            .make_next_state();
        f(&mut next)?;
        self.update(next, cancel).await
    }

    /// Drop the staged update.
    pub async fn discard_update(&self) -> Result<()> {
        let mut m = self.machine.lock().await;
        m.discard_update()?;
        self.persist(&m, Checkpoint::Phase).await
    }

    /// Discard our staged `state` unless it was replaced meanwhile.
    async fn abort_update(&self, state: &State) -> Result<()> {
        let mut m = self.machine.lock().await;
        if m.phase() == Phase::Signing && m.staging_tx().map(|tx| &tx.state) == Some(state) {
            m.discard_update()?;
            self.persist(&m, Checkpoint::Phase).await?;
        }
        Ok(())
    }

    async fn enable(&self, m: &mut Machine) -> Result<()> {
        let is_final = m.staging_tx().map_or(false, |tx| tx.state.is_final);
        if is_final {
            m.enable_final()?;
        } else {
            m.enable_update()?;
        }
        self.persist(m, Checkpoint::Enabled).await?;
        self.mark_committed(m.version());
        info!(channel = ?self.id, version = m.version(), is_final, "update enabled");
        Ok(())
    }

    /// Announce `version` as current and forget responses to it and to
    /// older updates nobody collected.
    fn mark_committed(&self, version: u64) {
        self.committed.send_replace(version);
        let stale = self.services.relay.purge(responses_to(self.id, move |v| v <= version));
        if stale > 0 {
            debug!(channel = ?self.id, version, stale, "dropped leftover update responses");
        }
    }

    /// Wait until the current state reaches `version`.
    async fn await_committed(
        &self,
        version: u64,
        cancel: &CancellationToken,
        what: &'static str,
    ) -> Result<()> {
        let mut committed = self.committed.subscribe();
        let timeout = self.services.config.response_timeout();
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(timeout, committed.wait_for(|v| *v >= version)) => match res {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(_)) => Err(Error::Bus("channel dropped".into())),
                Err(_) => Err(ProtocolError::Timeout(what).into()),
            },
        }
    }

    /// Collect signatures on the staged `state` until it can be enabled.
    async fn collect_sigs(
        &self,
        mut responses: Subscription,
        state: &State,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let version = state.version();
        let state_hash = state.hash()?;
        let timeout = self.services.config.response_timeout();
        let mut superseded = self.superseded.subscribe();
        loop {
            {
                let m = self.machine.lock().await;
                if m.version() >= version {
                    // Completed through a sync, or replaced.
                    return match m.state() == Some(state) {
                        true => Ok(()),
                        false => Err(Error::ConcurrentUpdate { version }),
                    };
                }
                if m.staging_tx().map(|tx| &tx.state) != Some(state) {
                    return Err(Error::ConcurrentUpdate { version });
                }
            }

            let env = tokio::select! {
                env = responses.recv(cancel, timeout, "ChannelUpdateAcc") => Some(env),
                _ = superseded.changed() => None,
            };
            let env = match env {
                None => continue,
                Some(Ok(env)) => env,
                Some(Err(Error::Cancelled)) => return Err(Error::Cancelled),
                Some(Err(e)) => {
                    warn!(channel = ?self.id, version, error = %e, "update failed, discarding it");
                    self.abort_update(state).await?;
                    return Err(e);
                }
            };
            let Some(peer) = self.peer_idx(&env.sender) else {
                continue;
            };

            let mut m = self.machine.lock().await;
            if m.staging_tx().map(|tx| &tx.state) != Some(state) {
                continue;
            }
            match env.msg {
                Message::ChannelUpdateAcc(acc) => match m.add_sig(peer, acc.sig) {
                    Ok(()) => {
                        self.persist(&m, Checkpoint::Sig(peer)).await?;
                        if m.staging_tx().map_or(false, Transaction::is_complete) {
                            return self.enable(&mut m).await;
                        }
                    }
                    // Duplicates, and signatures on an earlier proposal of
                    // this version.
                    Err(Error::Signature(e)) => {
                        debug!(channel = ?self.id, version, peer, error = %e, "ignoring signature");
                    }
                    Err(e) => {
                        m.discard_update()?;
                        self.persist(&m, Checkpoint::Phase).await?;
                        return Err(e);
                    }
                },
                Message::ChannelUpdateRej(rej) if rej.state_hash != state_hash => {
                    debug!(channel = ?self.id, version, peer, "ignoring rejection of an earlier proposal");
                }
                Message::ChannelUpdateRej(rej) => {
                    m.discard_update()?;
                    self.persist(&m, Checkpoint::Phase).await?;
                    info!(channel = ?self.id, version, peer, reason = %rej.reason, "update rejected by peer");
                    return Err(Error::PeerRejected { reason: rej.reason });
                }
                _ => {}
            }
        }
    }

    async fn reject_update(&self, version: u64, state_hash: Hash, reason: String) -> Result<()> {
        let rej = ChannelUpdateRej {
            channel_id: self.id,
            version,
            state_hash,
            reason,
        };
        self.services
            .broadcast(&self.peers, Message::ChannelUpdateRej(rej))
            .await
    }

    /// Process an update proposed by peer `sender`.
    ///
    /// Of two updates racing for the same version, the one of the lower
    /// participant index wins: we drop our own staged update for a peer with
    /// a lower index and ignore peers with a higher one. The machine is not
    /// locked while `handler` decides.
    pub(super) async fn handle_update(
        self: &Arc<Self>,
        sender: Address,
        msg: ChannelUpdateMsg,
        handler: &dyn UpdateHandler,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let actor = msg.actor_idx;
        let version = msg.state.version();
        if actor == self.idx || self.peers.get(actor) != Some(&sender) {
            return Err(ProtocolError::ActorMismatch { actor }.into());
        }
        let state_hash = msg.state.hash()?;
        // Rejections by other responders may come in while we stage.
        let responses = self
            .services
            .relay
            .subscribe(update_responses(self.id, version));

        let current = {
            let mut m = self.machine.lock().await;
            // Rounds of action apps are never replaced by plain updates.
            let staged_version = match m.phase() {
                Phase::Signing if m.app().as_action_app().is_none() => {
                    m.staging_tx().map(Transaction::version)
                }
                _ => None,
            };
            if staged_version == Some(version) {
                match m.staging_actor() {
                    Some(own) if own == self.idx => {
                        if actor > self.idx {
                            return Err(Error::ConcurrentUpdate { version });
                        }
                        info!(channel = ?self.id, version, actor, "yielding to concurrent update");
                        m.discard_update()?;
                        self.superseded.send_modify(|n| *n += 1);
                    }
                    // The actor gave up on its earlier proposal.
                    Some(same) if same == actor => {
                        info!(channel = ?self.id, version, actor, "replacing abandoned update");
                        m.discard_update()?;
                        self.superseded.send_modify(|n| *n += 1);
                    }
                    _ => {}
                }
            }

            if let Err(e) = m.update(msg.state.clone(), actor) {
                drop(m);
                self.reject_update(version, state_hash, e.to_string()).await?;
                return Err(e);
            }
            if let Err(e) = m.add_sig(actor, msg.sig) {
                m.discard_update()?;
                drop(m);
                self.reject_update(version, state_hash, e.to_string()).await?;
                return Err(e);
            }
            self.persist(&m, Checkpoint::Staged).await?;
            m.state()
                .cloned()
                .ok_or_else(|| Error::internal("update staged without current state"))?
        };

        let request = UpdateRequest {
            channel_id: self.id,
            current,
            next: msg.state.clone(),
            actor,
        };
        let response = handler.handle_update(&request).await;

        let mut m = self.machine.lock().await;
        if !stages(&m, &msg.state, actor) {
            debug!(channel = ?self.id, version, actor, "update replaced while the handler decided");
            return Err(Error::ConcurrentUpdate { version });
        }
        if let UpdateResponse::Reject { reason } = response {
            m.discard_update()?;
            self.persist(&m, Checkpoint::Phase).await?;
            drop(m);
            info!(channel = ?self.id, version, %reason, "update rejected");
            return self.reject_update(version, state_hash, reason).await;
        }

        let sig = match m.sign() {
            Ok(sig) => sig,
            Err(e) => {
                m.discard_update()?;
                return Err(e);
            }
        };
        self.persist(&m, Checkpoint::Sig(self.idx)).await?;
        let complete = m.staging_tx().map_or(false, Transaction::is_complete);
        if complete {
            self.enable(&mut m).await?;
        }
        drop(m);

        let acc = ChannelUpdateAcc {
            channel_id: self.id,
            version,
            sig,
        };
        self.services
            .broadcast(&self.peers, Message::ChannelUpdateAcc(acc))
            .await?;

        // More than two participants: wait for the other responders.
        if !complete {
            let channel = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.collect_sigs(responses, &msg.state, &cancel).await {
                    warn!(channel = ?channel.id, version, error = %e, "update did not complete");
                }
            });
        }
        Ok(())
    }

    /// Submit our action for the next round of an action app channel and
    /// wait until the state built from the round's actions is signed by
    /// everybody.
    ///
    /// The round completes with the last action to arrive. If the others do
    /// not act within the response timeout we give up waiting, but our
    /// action stays in the round.
    pub async fn submit_action(&self, action: Vec<u8>, cancel: &CancellationToken) -> Result<()> {
        let (version, responses) = {
            let mut m = self.machine.lock().await;
            let version = m.version() + 1;
            let responses = self
                .services
                .relay
                .subscribe(update_responses(self.id, version));
            m.add_action(self.idx, action.clone())?;
            (version, responses)
        };
        let msg = ChannelAction {
            channel_id: self.id,
            version,
            actor_idx: self.idx,
            action,
        };
        if let Err(e) = self
            .services
            .broadcast(&self.peers, Message::ChannelAction(msg))
            .await
        {
            self.abort_round(version).await?;
            return Err(e);
        }
        debug!(channel = ?self.id, version, "action submitted");

        if let Some(state) = self.stage_round(version).await? {
            return self.collect_sigs(responses, &state, cancel).await;
        }
        drop(responses);
        // Completed by a peer's action, whose handler collects the signatures.
        self.await_committed(version, cancel, "action round").await
    }

    /// Drop the actions of the unfinished round building `version`.
    async fn abort_round(&self, version: u64) -> Result<()> {
        let mut m = self.machine.lock().await;
        if m.phase() == Phase::Acting && m.version() + 1 == version {
            m.discard_actions()?;
        }
        Ok(())
    }

    /// Once every action of the round building `version` is in: stage the
    /// resulting state, sign it and send our signature. Returns the staged
    /// state.
    async fn stage_round(&self, version: u64) -> Result<Option<State>> {
        let (state, sig) = {
            let mut m = self.machine.lock().await;
            if m.phase() != Phase::Acting || m.version() + 1 != version || !m.actions_complete() {
                return Ok(None);
            }
            if let Err(e) = m.update_from_actions() {
                m.discard_actions()?;
                return Err(e);
            }
            let sig = match m.sign() {
                Ok(sig) => sig,
                Err(e) => {
                    m.discard_update()?;
                    return Err(e);
                }
            };
            self.persist(&m, Checkpoint::Staged).await?;
            let state = m
                .staging_tx()
                .map(|tx| tx.state.clone())
                .ok_or_else(|| Error::internal("action round staged nothing"))?;
            (state, sig)
        };
        debug!(channel = ?self.id, version, "action round complete");
        let acc = ChannelUpdateAcc {
            channel_id: self.id,
            version,
            sig,
        };
        self.services
            .broadcast(&self.peers, Message::ChannelUpdateAcc(acc))
            .await?;
        Ok(Some(state))
    }

    /// Record the action of peer `sender`. Completing the round starts the
    /// signature exchange in the background.
    pub(super) async fn handle_action(
        self: &Arc<Self>,
        sender: Address,
        msg: ChannelAction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let actor = msg.actor_idx;
        let version = msg.version;
        if actor == self.idx || self.peers.get(actor) != Some(&sender) {
            return Err(ProtocolError::ActorMismatch { actor }.into());
        }
        if version == 0 {
            return Err(ProtocolError::VersionMismatch {
                expected: 1,
                got: 0,
            }
            .into());
        }
        // The sender may start the next round before our copy of the
        // previous one is enabled.
        self.await_committed(version - 1, cancel, "previous action round")
            .await?;
        let responses = self
            .services
            .relay
            .subscribe(update_responses(self.id, version));
        {
            let mut m = self.machine.lock().await;
            let expected = m.version() + 1;
            if version != expected {
                return Err(ProtocolError::VersionMismatch {
                    expected,
                    got: version,
                }
                .into());
            }
            m.add_action(actor, msg.action)?;
        }
        debug!(channel = ?self.id, version, actor, "peer action recorded");

        let Some(state) = self.stage_round(version).await? else {
            return Ok(());
        };
        let channel = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.collect_sigs(responses, &state, &cancel).await {
                warn!(channel = ?channel.id, version, error = %e, "action round did not complete");
            }
        });
        Ok(())
    }

    fn sync_msg(&self, m: &Machine) -> Result<Message> {
        // Before the initial state is enabled we offer our partially signed
        // copy of it.
        let tx = match m.phase() {
            Phase::InitSigning => m.staging_tx(),
            _ => m.current_tx(),
        };
        let current_tx = tx.cloned().ok_or(PhaseError {
            op: "sync",
            phase: m.phase(),
        })?;
        Ok(Message::ChannelSync(ChannelSync {
            phase: m.phase(),
            current_tx,
        }))
    }

    /// Send our current transaction to all peers so that whoever is behind
    /// can catch up.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let msg = {
            let m = self.machine.lock().await;
            self.sync_msg(&m)?
        };
        self.services.broadcast(&self.peers, msg).await
    }

    pub(super) async fn handle_sync(&self, sender: Address, sync: ChannelSync) -> Result<()> {
        if self.peer_idx(&sender).is_none() {
            return Err(ProtocolError::UnknownPeer(sender).into());
        }
        let theirs = sync.current_tx.version();
        let mut m = self.machine.lock().await;
        let ours = m.version();

        if m.phase() == Phase::InitSigning {
            if sync.phase != Phase::InitSigning {
                m.adopt_synced(sync.current_tx)?;
                self.persist(&m, Checkpoint::Phase).await?;
                self.mark_committed(0);
                info!(channel = ?self.id, "adopted initial state from sync");
            }
            return Ok(());
        }
        let peer_before_init = sync.phase == Phase::InitSigning && m.current_tx().is_some();
        if theirs < ours || peer_before_init {
            let reply = self.sync_msg(&m)?;
            drop(m);
            debug!(channel = ?self.id, ours, theirs, "peer is behind, replaying our transaction");
            return self.services.send(sender, reply).await;
        }
        if theirs == ours + 1 && matches!(m.phase(), Phase::Acting | Phase::Signing) {
            m.adopt_synced(sync.current_tx)?;
            self.superseded.send_modify(|n| *n += 1);
            self.persist(&m, Checkpoint::Enabled).await?;
            self.mark_committed(theirs);
            info!(channel = ?self.id, version = theirs, "adopted transaction from sync");
        } else if theirs > ours + 1 {
            warn!(channel = ?self.id, ours, theirs, "peer is more than one version ahead");
        }
        Ok(())
    }

    /// Close the channel and withdraw our funds: cooperatively with a final
    /// update if possible, otherwise through a dispute.
    pub async fn settle(&self, cancel: &CancellationToken) -> Result<()> {
        let phase = self.phase().await;
        match phase {
            Phase::InitActing | Phase::InitSigning => Err(PhaseError { op: "settle", phase }.into()),
            Phase::Acting => {
                let mut last = self
                    .state()
                    .await
                    .ok_or_else(|| Error::internal("channel without state"))?
                    .make_next_state();
                last.is_final = true;
                match self.update(last, cancel).await {
                    Ok(()) => self.withdraw_concluded(cancel).await,
                    Err(Error::Cancelled) => Err(Error::Cancelled),
                    Err(e) => {
                        warn!(channel = ?self.id, error = %e, "cooperative close failed, settling on-chain");
                        self.force_settle(cancel).await
                    }
                }
            }
            _ => self.force_settle(cancel).await,
        }
    }

    async fn force_settle(&self, cancel: &CancellationToken) -> Result<()> {
        if matches!(
            self.phase().await,
            Phase::Funding | Phase::Acting | Phase::Signing
        ) {
            self.register(cancel).await?;
        }
        self.withdraw_concluded(cancel).await
    }

    /// Withdraw, waiting out the adjudicator's windows while the channel is
    /// not concludable.
    async fn withdraw_concluded(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let err = match self.withdraw(cancel).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            let Error::Adjudicator(AdjudicatorError::NotConcludable { timeout }) = err.root() else {
                return Err(err);
            };
            let timeout = timeout.clone();
            debug!(channel = ?self.id, "not concludable yet, waiting");
            timeout.wait(cancel).await?;
        }
    }

    fn adjudicator_req(&self, m: &Machine) -> Result<AdjudicatorReq> {
        Ok(AdjudicatorReq {
            params: self.params.clone(),
            tx: m.current_tx().cloned().ok_or(PhaseError {
                op: "adjudicator call",
                phase: m.phase(),
            })?,
            idx: self.idx,
        })
    }

    /// Register our current transaction with the adjudicator.
    pub async fn register(&self, cancel: &CancellationToken) -> Result<()> {
        let mut m = self.machine.lock().await;
        self.register_locked(&mut m, cancel).await
    }

    pub(super) async fn register_locked(
        &self,
        m: &mut Machine,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut next = m.clone();
        if next.phase() != Phase::Registering {
            next.set_registering()?;
        }
        let req = self.adjudicator_req(&next)?;
        let timeout = self
            .services
            .adjudicator
            .register(&req, cancel)
            .await
            .map_err(|e| self.fail(m, e))?;
        next.set_registered(req.tx.version())?;
        *m = next;
        self.set_dispute_timeout(timeout);
        self.persist(m, Checkpoint::Phase).await?;
        info!(channel = ?self.id, version = m.version(), "dispute registered");
        Ok(())
    }

    /// Advance a registered app channel on-chain by the state `f` makes of
    /// the current one. Waits for the dispute window to end first.
    pub async fn progress_by<F>(&self, f: F, cancel: &CancellationToken) -> Result<()>
    where
        F: FnOnce(&mut State) -> Result<()>,
    {
        let phase = self.phase().await;
        match phase {
            Phase::Registered => self.await_force_exec(cancel).await?,
            Phase::Progressed => {}
            phase => {
                return Err(PhaseError {
                    op: "progress_by",
                    phase,
                }
                .into())
            }
        }

        let mut m = self.machine.lock().await;
        let mut next = m.clone();
        let mut state = next
            .state()
            .ok_or_else(|| Error::internal("progression without state"))?
            .make_next_state();
        f(&mut state)?;
        next.set_progressing(state.clone())?;
        let sig = next.sign()?;
        let req = ProgressReq {
            base: self.adjudicator_req(&next)?,
            new_state: state.clone(),
            sig,
        };
        self.services
            .adjudicator
            .progress(&req, cancel)
            .await
            .map_err(|e| self.fail(&m, e))?;
        next.set_progressed(state, self.idx, Some(sig))?;
        *m = next;
        self.persist(&m, Checkpoint::Phase).await?;
        info!(channel = ?self.id, version = m.version(), "progressed on-chain");
        Ok(())
    }

    /// Wait for the dispute window of a registered channel to end. The
    /// adjudicator is asked whenever we do not know the window's end, as
    /// after a restore.
    async fn await_force_exec(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if let Some(timeout) = self.dispute_timeout() {
                timeout.wait(cancel).await?;
            }
            let dispute = self
                .services
                .adjudicator
                .dispute_state(self.id)
                .await?
                .ok_or(AdjudicatorError::NotRegistered)?;
            match dispute.phase {
                DisputePhase::ForceExec => return Ok(()),
                DisputePhase::Dispute => {
                    debug!(channel = ?self.id, version = dispute.version, "waiting for the dispute window to end");
                    self.set_dispute_timeout(dispute.timeout);
                }
                DisputePhase::Concluded => {
                    return Err(AdjudicatorError::Reverted("dispute already concluded".into()).into())
                }
            }
        }
    }

    /// Final transactions of the sub-channels holding funds locked in
    /// `state`.
    async fn sub_states(&self, state: &State) -> Vec<Transaction> {
        let children: Vec<Arc<Channel>> = match self.table.upgrade() {
            Some(table) => {
                let table = table.read();
                state
                    .allocation
                    .locked
                    .iter()
                    .filter_map(|sub| table.get(&sub.id).cloned())
                    .collect()
            }
            None => Vec::new(),
        };
        let mut txs = Vec::with_capacity(children.len());
        for child in children {
            if let Some(tx) = child.current_tx().await {
                txs.push(tx);
            }
        }
        txs
    }

    /// Withdraw our share of a concluded (or final) channel. Calling it
    /// again once withdrawn changes nothing.
    pub async fn withdraw(&self, cancel: &CancellationToken) -> Result<()> {
        let mut m = self.machine.lock().await;
        if m.phase() == Phase::Withdrawn {
            return Ok(());
        }
        let mut next = m.clone();
        if next.phase() != Phase::Withdrawing {
            next.set_withdrawing()?;
        }
        let tx = next
            .current_tx()
            .cloned()
            .ok_or_else(|| Error::internal("withdrawing without transaction"))?;
        let receiver = self
            .services
            .config
            .withdraw_receiver
            .or_else(|| default_receiver(&self.params, self.idx))
            .ok_or_else(|| Error::internal("no withdrawal receiver"))?;
        let auths = make_signed_withdrawal_auths(
            self.services.account.as_ref(),
            &self.params,
            &tx.state,
            receiver,
            self.idx,
        )?;
        let sub_states = self.sub_states(&tx.state).await;
        let req = WithdrawReq {
            base: AdjudicatorReq {
                params: self.params.clone(),
                tx,
                idx: self.idx,
            },
            auths,
        };
        self.services
            .adjudicator
            .withdraw(&req, &sub_states, cancel)
            .await
            .map_err(|e| self.fail(&m, e))?;

        next.set_withdrawn()?;
        *m = next;
        self.persist(&m, Checkpoint::Phase).await?;
        self.services
            .persister
            .channel_removed(self.id)
            .await
            .map_err(|e| self.fail(&m, e))?;
        drop(m);

        if let Some(table) = self.table.upgrade() {
            table.write().remove(&self.id);
        }
        self.watcher.cancel();
        info!(channel = ?self.id, ?receiver, "funds withdrawn");
        Ok(())
    }
}
