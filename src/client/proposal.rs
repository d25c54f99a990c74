//! Opening channels: proposal exchange, nonce agreement and the exchange of
//! signatures on the initial state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Channel, PerunClient, ProposalHandler};
use crate::{
    abiencode::types::{Address, Hash},
    channel::{combine_nonce_shares, Machine, NonceShare, PartIdx, Params},
    error::{Error, ProtocolError, Result},
    messages::{ChannelProposal, ChannelProposalAcc, ChannelProposalRej, ChannelUpdateAcc, Message},
    wire::Subscription,
};

/// Answer of a [ProposalHandler].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalResponse {
    Accept {
        /// Address our channel states will be signed with.
        participant: Address,
        nonce_share: NonceShare,
    },
    Reject {
        reason: String,
    },
}

/// Nonce shares and participant addresses collected so far, by index.
struct Agreement {
    shares: Vec<Option<NonceShare>>,
    participants: Vec<Option<Address>>,
}

impl Agreement {
    fn new(prop: &ChannelProposal) -> Self {
        let n = prop.num_peers();
        let mut agreement = Self {
            shares: vec![None; n],
            participants: vec![None; n],
        };
        agreement.set(0, prop.base.nonce_share, prop.participant);
        agreement
    }

    fn set(&mut self, idx: PartIdx, share: NonceShare, participant: Address) {
        self.shares[idx] = Some(share);
        self.participants[idx] = Some(participant);
    }

    fn is_complete(&self) -> bool {
        self.shares.iter().all(Option::is_some)
    }

    /// Params of the agreed channel, nonce shares combined in participant
    /// order.
    fn params(self, prop: &ChannelProposal) -> Result<Params> {
        let shares: Vec<NonceShare> = self.shares.into_iter().flatten().collect();
        let participants: Vec<Address> = self.participants.into_iter().flatten().collect();
        if shares.len() != prop.num_peers() || participants.len() != prop.num_peers() {
            return Err(Error::internal("agreement incomplete"));
        }
        Params::new(
            prop.base.challenge_duration,
            combine_nonce_shares(&shares),
            participants,
            prop.base.app,
            prop.parent.is_none(),
            false,
        )
    }
}

fn proposal_responses(id: Hash) -> impl Fn(&crate::messages::Envelope) -> bool + Send + Sync {
    move |env| {
        matches!(
            &env.msg,
            Message::ChannelProposalAcc(acc) if acc.proposal_id == id
        ) || matches!(
            &env.msg,
            Message::ChannelProposalRej(rej) if rej.proposal_id == id
        )
    }
}

fn initial_accs(env: &crate::messages::Envelope) -> bool {
    matches!(&env.msg, Message::ChannelUpdateAcc(acc) if acc.version == 0)
}

impl PerunClient {
    /// Propose a channel to its peers, open it and fund it. We are
    /// participant 0 and must be the first of `prop.peers`.
    ///
    /// If funding fails, the channel stays in the client's table in phase
    /// `Funding` so it can be settled; the error names it.
    pub async fn propose_channel(
        &self,
        prop: ChannelProposal,
        cancel: &CancellationToken,
    ) -> Result<Arc<Channel>> {
        let services = &self.inner.services;
        prop.valid()?;
        if prop.peers.first() != Some(&services.wire) {
            return Err(ProtocolError::InvalidProposal(
                "the proposer must be the first peer".into(),
            )
            .into());
        }
        let id = prop.base.proposal_id;
        let mut responses = services.relay.subscribe(proposal_responses(id));
        // Responders may sign the initial state before we know the channel id.
        let _initial = services.relay.cache(initial_accs);

        services
            .broadcast(&prop.peers, Message::ChannelProposal(prop.clone()))
            .await?;
        debug!(proposal = ?id, peers = prop.num_peers(), "channel proposed");

        let mut agreement = Agreement::new(&prop);
        self.collect_acceptances(&prop, &mut agreement, &mut responses, cancel)
            .await?;
        let params = agreement.params(&prop)?;
        self.open(prop, params, 0, cancel).await
    }

    /// Run a received proposal through `handler` and, if accepted, open and
    /// fund the channel. `Ok(None)` means we rejected it.
    pub(super) async fn accept_proposal(
        &self,
        sender: Address,
        prop: ChannelProposal,
        handler: &dyn ProposalHandler,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Channel>>> {
        let services = &self.inner.services;
        let id = prop.base.proposal_id;
        let idx = prop.peers.iter().position(|p| *p == services.wire);
        let checked = prop.valid().and_then(|()| match idx {
            Some(idx) if idx > 0 && prop.peers[0] == sender => Ok(idx),
            Some(_) => Err(ProtocolError::UnknownPeer(sender).into()),
            None => Err(ProtocolError::InvalidProposal("we are not a peer".into()).into()),
        });
        let idx = match checked {
            Ok(idx) => idx,
            Err(e) => {
                self.reject_proposal(&prop, e.to_string()).await?;
                return Err(e);
            }
        };

        let (participant, nonce_share) = match handler.handle_proposal(&prop, idx).await {
            ProposalResponse::Accept {
                participant,
                nonce_share,
            } => (participant, nonce_share),
            ProposalResponse::Reject { reason } => {
                info!(proposal = ?id, %reason, "proposal rejected");
                self.reject_proposal(&prop, reason).await?;
                return Ok(None);
            }
        };

        let mut responses = services.relay.subscribe(proposal_responses(id));
        // Installed before the acceptance goes out: the proposer may sign
        // the initial state as soon as it has all acceptances.
        let _initial = services.relay.cache(initial_accs);
        let acc = ChannelProposalAcc {
            proposal_id: id,
            nonce_share,
            participant,
        };
        services
            .broadcast(&prop.peers, Message::ChannelProposalAcc(acc))
            .await?;

        let mut agreement = Agreement::new(&prop);
        agreement.set(idx, nonce_share, participant);
        self.collect_acceptances(&prop, &mut agreement, &mut responses, cancel)
            .await?;
        let params = agreement.params(&prop)?;
        self.open(prop, params, idx, cancel).await.map(Some)
    }

    async fn reject_proposal(&self, prop: &ChannelProposal, reason: String) -> Result<()> {
        let rej = ChannelProposalRej {
            proposal_id: prop.base.proposal_id,
            reason,
        };
        self.inner
            .services
            .broadcast(&prop.peers, Message::ChannelProposalRej(rej))
            .await
    }

    async fn collect_acceptances(
        &self,
        prop: &ChannelProposal,
        agreement: &mut Agreement,
        responses: &mut Subscription,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout = self.inner.services.config.response_timeout();
        while !agreement.is_complete() {
            let env = responses
                .recv(cancel, timeout, "ChannelProposalAcc")
                .await?;
            let Some(idx) = prop.peers.iter().position(|p| *p == env.sender) else {
                debug!(sender = ?env.sender, "proposal response from a stranger");
                continue;
            };
            match env.msg {
                Message::ChannelProposalAcc(acc) if idx > 0 => {
                    agreement.set(idx, acc.nonce_share, acc.participant)
                }
                Message::ChannelProposalRej(rej) => {
                    info!(proposal = ?prop.base.proposal_id, peer = idx, reason = %rej.reason, "proposal rejected by peer");
                    return Err(Error::PeerRejected { reason: rej.reason });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Exchange signatures on the initial state, register the channel and
    /// fund it.
    async fn open(
        &self,
        prop: ChannelProposal,
        params: Params,
        idx: PartIdx,
        cancel: &CancellationToken,
    ) -> Result<Arc<Channel>> {
        let services = &self.inner.services;
        let params = Arc::new(params);
        let id = params.id();
        let app = services.apps.resolve(params.app())?;
        let mut machine = Machine::new(
            services.account.clone(),
            services.verifier.clone(),
            params.clone(),
            app,
            idx,
        )?;
        if prop.base.init_actions.is_empty() {
            machine.init(prop.base.init_bals.clone(), prop.base.init_data.clone())?;
        } else {
            machine.init_from_actions(&prop.base.init_actions)?;
            let allocation = machine.staging_tx().map(|tx| &tx.state.allocation);
            if allocation != Some(&prop.base.init_bals) {
                return Err(ProtocolError::InvalidProposal(
                    "initial actions do not yield the proposed balances".into(),
                )
                .into());
            }
        }

        let accs = services.relay.subscribe(move |env| {
            matches!(&env.msg, Message::ChannelUpdateAcc(acc) if acc.channel_id == id && acc.version == 0)
        });
        let sig = machine.sign()?;
        let channel = Arc::new(Channel::new(
            services.clone(),
            Arc::downgrade(&self.inner.channels),
            machine,
            prop.peers.clone(),
            prop.parent,
        ));
        self.inner.channels.write().insert(id, channel.clone());
        channel.persist_created().await?;

        let acc = ChannelUpdateAcc {
            channel_id: id,
            version: 0,
            sig,
        };
        let exchanged = match services
            .broadcast(&prop.peers, Message::ChannelUpdateAcc(acc))
            .await
        {
            Ok(()) => channel.collect_initial_sigs(accs, cancel).await,
            Err(e) => Err(e),
        };
        if let Err(e) = exchanged {
            // A cancelled exchange stays persisted and resumes on restore.
            if matches!(e, Error::Cancelled) {
                return Err(e);
            }
            warn!(channel = ?id, error = %e, "initial signatures not exchanged, dropping channel");
            self.inner.channels.write().remove(&id);
            if let Err(e) = services.persister.channel_removed(id).await {
                warn!(channel = ?id, error = %e, "removing channel from persistence failed");
            }
            return Err(e);
        }
        info!(channel = ?id, idx, peers = prop.num_peers(), "channel opened");

        channel
            .fund(prop.base.funding_agreement.clone(), cancel)
            .await?;
        Ok(channel)
    }
}
