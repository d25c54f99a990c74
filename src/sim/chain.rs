use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    abiencode::types::{Address, Hash, U256},
    adjudicator::{
        AdjudicatorEvent, DisputePhase, DisputeState, EventSubscription, FundingReq, ProgressReq,
        Timeout, WithdrawReq,
    },
    channel::{AppRegistry, Asset, ChannelId, PartIdx, Params, State, Transaction},
    error::{AdjudicatorError, Error, Result},
    sig::Verifier,
};

/// Deadline on the tokio clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTimeout {
    deadline: Instant,
}

impl SimTimeout {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[async_trait]
impl Timeout for SimTimeout {
    async fn is_elapsed(&self, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(Instant::now() >= self.deadline)
    }

    async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Ok(()),
        }
    }
}

fn reverted(reason: impl Into<String>) -> Error {
    AdjudicatorError::Reverted(reason.into()).into()
}

#[derive(Debug)]
struct Dispute {
    params: Arc<Params>,
    state: State,
    state_hash: Hash,
    phase: DisputePhase,
    timeout: Instant,
    paid: Vec<bool>,
    /// Payout per asset and participant, fixed on conclusion.
    outcome: Option<Vec<Vec<U256>>>,
}

impl Dispute {
    fn new(params: &Params, state: State, state_hash: Hash, timeout: Instant) -> Self {
        Self {
            params: Arc::new(params.clone()),
            state,
            state_hash,
            phase: DisputePhase::Dispute,
            timeout,
            paid: vec![false; params.num_parts()],
            outcome: None,
        }
    }

    fn challenge_duration(&self) -> Duration {
        Duration::from_secs(self.params.challenge_duration())
    }

    /// Once the dispute window of an app channel is over, the force-exec
    /// window follows.
    fn refresh(&mut self, now: Instant) {
        if self.phase == DisputePhase::Dispute
            && now >= self.timeout
            && self.params.app().is_some()
        {
            self.phase = DisputePhase::ForceExec;
            self.timeout += self.challenge_duration();
        }
    }

    fn concludable(&self, now: Instant) -> bool {
        match self.phase {
            DisputePhase::Dispute | DisputePhase::ForceExec => now >= self.timeout,
            DisputePhase::Concluded => true,
        }
    }
}

#[derive(Debug, Default)]
struct ChainState {
    accounts: HashMap<(Address, Asset), U256>,
    /// Per channel: deposit per (asset index, participant).
    deposits: HashMap<ChannelId, HashMap<(usize, PartIdx), U256>>,
    disputes: HashMap<ChannelId, Dispute>,
    subscribers: HashMap<ChannelId, Vec<mpsc::UnboundedSender<AdjudicatorEvent>>>,
}

impl ChainState {
    fn emit(&mut self, id: ChannelId, event: AdjudicatorEvent) {
        if let Some(subs) = self.subscribers.get_mut(&id) {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn deposit_of(&self, id: &ChannelId, asset: usize, idx: PartIdx) -> U256 {
        self.deposits
            .get(id)
            .and_then(|d| d.get(&(asset, idx)))
            .copied()
            .unwrap_or_default()
    }

    /// Fix the payout of a registered channel and mark it concluded.
    fn conclude(&mut self, id: ChannelId, sub_states: &[Transaction]) -> Result<()> {
        let dispute = self
            .disputes
            .get(&id)
            .ok_or(AdjudicatorError::NotRegistered)?;
        if dispute.outcome.is_some() {
            return Ok(());
        }
        let state = &dispute.state;
        let mut outcome = resolve_locked(state, sub_states)?;

        // Underfunded ledger channels pay back the deposits instead.
        if dispute.params.ledger_channel() {
            let totals = state
                .allocation
                .totals()
                .map_err(|e| reverted(e.to_string()))?;
            let n = dispute.params.num_parts();
            let deposits: Vec<Vec<U256>> = (0..totals.len())
                .map(|a| (0..n).map(|i| self.deposit_of(&id, a, i)).collect())
                .collect();
            let underfunded = deposits.iter().zip(&totals).any(|(row, total)| {
                row.iter().fold(U256::zero(), |acc, b| acc.saturating_add(*b)) < *total
            });
            if underfunded {
                info!(channel = ?id, "channel underfunded, refunding deposits");
                outcome = deposits;
            }
        }

        let version = state.version();
        if let Some(dispute) = self.disputes.get_mut(&id) {
            dispute.outcome = Some(outcome);
            dispute.phase = DisputePhase::Concluded;
        }
        info!(channel = ?id, version, "concluded");
        self.emit(
            id,
            AdjudicatorEvent::Concluded {
                channel_id: id,
                version,
            },
        );
        Ok(())
    }
}

/// Balances of `state` with every sub-allocation paid out according to the
/// final state of its sub-channel.
fn resolve_locked(state: &State, sub_states: &[Transaction]) -> Result<Vec<Vec<U256>>> {
    let mut bals = state.allocation.balances.clone();
    for sub in &state.allocation.locked {
        let tx = sub_states
            .iter()
            .find(|tx| tx.state.channel_id() == sub.id)
            .ok_or_else(|| reverted(format!("missing state of sub-channel {:?}", sub.id)))?;
        if !tx.state.is_final || !tx.is_complete() {
            return Err(reverted("sub-channel state is not final"));
        }
        let sub_bals = &tx.state.allocation.balances;
        if sub_bals.len() != bals.len() {
            return Err(reverted("sub-channel assets differ"));
        }
        for (asset, row) in sub_bals.iter().enumerate() {
            let total = row.iter().fold(U256::zero(), |acc, b| acc.saturating_add(*b));
            if Some(&total) != sub.bals.get(asset) {
                return Err(reverted("sub-channel total differs from the locked amount"));
            }
            for (j, amount) in row.iter().enumerate() {
                let target = match sub.index_map.is_empty() {
                    true => Some(j),
                    false => sub.index_map.get(j).map(|i| *i as usize),
                };
                let slot = target
                    .and_then(|t| bals[asset].get_mut(t))
                    .ok_or_else(|| reverted("sub-channel participant outside parent"))?;
                *slot = slot
                    .checked_add(*amount)
                    .ok_or_else(|| reverted("payout overflows"))?;
            }
        }
    }
    Ok(bals)
}

/// In-memory ledger with an adjudicator and asset holders.
#[derive(Debug)]
pub struct SimChain {
    state: Mutex<ChainState>,
    deposited: watch::Sender<u64>,
    verifier: Arc<dyn Verifier>,
    /// App contracts deployed on this chain.
    apps: AppRegistry,
}

impl SimChain {
    pub fn new(verifier: Arc<dyn Verifier>) -> Self {
        Self::with_apps(verifier, AppRegistry::new())
    }

    pub fn with_apps(verifier: Arc<dyn Verifier>, apps: AppRegistry) -> Self {
        Self {
            state: Mutex::default(),
            deposited: watch::channel(0).0,
            verifier,
            apps,
        }
    }

    pub fn mint(&self, account: Address, asset: Asset, amount: U256) {
        let mut st = self.state.lock();
        let bal = st.accounts.entry((account, asset)).or_default();
        *bal = bal.saturating_add(amount);
    }

    pub fn balance(&self, account: Address, asset: Asset) -> U256 {
        self.state
            .lock()
            .accounts
            .get(&(account, asset))
            .copied()
            .unwrap_or_default()
    }

    /// Amount participant `idx` deposited for asset number `asset`.
    pub fn deposit_of(&self, id: ChannelId, asset: usize, idx: PartIdx) -> U256 {
        self.state.lock().deposit_of(&id, asset, idx)
    }

    fn verify_tx(&self, params: &Params, tx: &Transaction) -> Result<Hash> {
        if tx.state.channel_id() != params.id() {
            return Err(reverted("state of another channel"));
        }
        tx.state
            .valid(params)
            .map_err(|e| reverted(e.to_string()))?;
        let sigs = tx
            .full_sigs()
            .ok_or_else(|| reverted("transaction not fully signed"))?;
        let hash = tx.state.hash()?;
        for (i, (sig, part)) in sigs.iter().zip(params.participants()).enumerate() {
            if !self.verifier.verify(*part, hash, sig) {
                return Err(reverted(format!("invalid signature of participant {}", i)));
            }
        }
        Ok(hash)
    }

    pub(crate) fn deposit(&self, req: &FundingReq) -> Result<()> {
        let participant = *req
            .params
            .participants()
            .get(req.idx)
            .ok_or_else(|| reverted("unknown participant"))?;
        let assets = &req.state.allocation.assets;
        if req.agreement.len() != assets.len() {
            return Err(reverted("funding agreement does not match the assets"));
        }
        let id = req.params.id();

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let mut amounts = Vec::with_capacity(assets.len());
        for (a, row) in req.agreement.iter().enumerate() {
            let amount = *row
                .get(req.idx)
                .ok_or_else(|| reverted("funding agreement too short"))?;
            let balance = st
                .accounts
                .get(&(participant, assets[a]))
                .copied()
                .unwrap_or_default();
            if balance < amount {
                return Err(reverted(format!("insufficient balance of asset {}", a)));
            }
            amounts.push(amount);
        }
        for (a, amount) in amounts.into_iter().enumerate() {
            let bal = st.accounts.entry((participant, assets[a])).or_default();
            *bal = *bal - amount;
            let dep = st
                .deposits
                .entry(id)
                .or_default()
                .entry((a, req.idx))
                .or_default();
            *dep = dep.saturating_add(amount);
        }
        drop(guard);

        debug!(channel = ?id, idx = req.idx, "deposited");
        self.deposited.send_modify(|n| *n += 1);
        Ok(())
    }

    fn unfunded(&self, req: &FundingReq) -> Vec<PartIdx> {
        let st = self.state.lock();
        let id = req.params.id();
        (0..req.params.num_parts())
            .filter(|i| {
                req.agreement.iter().enumerate().any(|(a, row)| {
                    st.deposit_of(&id, a, *i) < row.get(*i).copied().unwrap_or_default()
                })
            })
            .collect()
    }

    /// Wait until every participant deposited its share, at most one
    /// challenge duration.
    pub(crate) async fn await_funded(
        &self,
        req: &FundingReq,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(req.params.challenge_duration());
        let mut changes = self.deposited.subscribe();
        loop {
            if self.unfunded(req).is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    let peers = self.unfunded(req);
                    if peers.is_empty() {
                        return Ok(());
                    }
                    return Err(Error::FundingTimeout { peers });
                }
                // The sender lives as long as `self`.
                _ = changes.changed() => {}
            }
        }
    }

    pub(crate) fn register(&self, params: &Params, tx: &Transaction) -> Result<SimTimeout> {
        let hash = self.verify_tx(params, tx)?;
        let now = Instant::now();
        let id = params.id();

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let deadline = match st.disputes.get_mut(&id) {
            Some(dispute) => {
                dispute.refresh(now);
                if dispute.phase != DisputePhase::Dispute || now >= dispute.timeout {
                    return Err(reverted("dispute window closed"));
                }
                if tx.version() <= dispute.state.version() {
                    return Err(reverted(format!(
                        "version {} is not newer than registered version {}",
                        tx.version(),
                        dispute.state.version()
                    )));
                }
                dispute.state = tx.state.clone();
                dispute.state_hash = hash;
                dispute.timeout
            }
            None => {
                let deadline = now + Duration::from_secs(params.challenge_duration());
                st.disputes
                    .insert(id, Dispute::new(params, tx.state.clone(), hash, deadline));
                deadline
            }
        };

        let timeout = SimTimeout { deadline };
        info!(channel = ?id, version = tx.version(), "registered");
        st.emit(
            id,
            AdjudicatorEvent::Registered {
                channel_id: id,
                version: tx.version(),
                state: tx.state.clone(),
                timeout: Arc::new(timeout),
            },
        );
        if tx.state.is_final && tx.state.allocation.locked.is_empty() {
            st.conclude(id, &[])?;
        }
        Ok(timeout)
    }

    pub(crate) fn progress(&self, req: &ProgressReq) -> Result<()> {
        let params = &req.base.params;
        let id = params.id();
        let actor = req.base.idx;
        let app = self.apps.resolve(params.app())?;
        let signer = *params
            .participants()
            .get(actor)
            .ok_or_else(|| reverted("unknown actor"))?;
        let hash = req.new_state.hash()?;
        if !self.verifier.verify(signer, hash, &req.sig) {
            return Err(reverted("invalid signature of the actor"));
        }
        let now = Instant::now();

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let dispute = st
            .disputes
            .get_mut(&id)
            .ok_or(AdjudicatorError::NotRegistered)?;
        dispute.refresh(now);
        if dispute.phase != DisputePhase::ForceExec || now >= dispute.timeout {
            return Err(reverted("not in the force-exec window"));
        }
        if req.base.tx.state != dispute.state {
            return Err(reverted("progression does not start at the registered state"));
        }
        if req.new_state.channel_id() != id
            || req.new_state.version() != dispute.state.version() + 1
        {
            return Err(reverted("progression must advance the version by one"));
        }
        dispute
            .state
            .check_successor(&req.new_state, params)
            .map_err(|e| reverted(e.to_string()))?;
        app.valid_progression(params, &dispute.state, &req.new_state, actor)
            .map_err(|e| reverted(e.to_string()))?;

        dispute.state = req.new_state.clone();
        dispute.state_hash = hash;
        dispute.timeout = now + dispute.challenge_duration();
        let timeout = SimTimeout {
            deadline: dispute.timeout,
        };
        info!(channel = ?id, version = req.new_state.version(), actor, "progressed");
        st.emit(
            id,
            AdjudicatorEvent::Progressed {
                channel_id: id,
                state: req.new_state.clone(),
                actor,
                sig: req.sig,
                timeout: Arc::new(timeout),
            },
        );
        Ok(())
    }

    pub(crate) fn withdraw(&self, req: &WithdrawReq, sub_states: &[Transaction]) -> Result<()> {
        let params = &req.base.params;
        let id = params.id();
        let idx = req.base.idx;
        let tx = &req.base.tx;
        let participant = *params
            .participants()
            .get(idx)
            .ok_or_else(|| reverted("unknown participant"))?;
        if req.auths.len() != tx.state.allocation.num_assets() {
            return Err(reverted("need one withdrawal authorization per asset"));
        }
        for auth in &req.auths {
            if auth.auth.channel_id != id
                || auth.auth.participant != participant
                || !auth.verify(self.verifier.as_ref())
            {
                return Err(reverted("invalid withdrawal authorization"));
            }
        }
        let now = Instant::now();

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let needs_conclusion = match st.disputes.get_mut(&id) {
            // A final state concludes without a dispute.
            None => {
                if !tx.state.is_final {
                    return Err(AdjudicatorError::NotRegistered.into());
                }
                let hash = self.verify_tx(params, tx)?;
                st.disputes
                    .insert(id, Dispute::new(params, tx.state.clone(), hash, now));
                true
            }
            Some(dispute) => {
                dispute.refresh(now);
                let final_shortcut = dispute.phase == DisputePhase::Dispute
                    && tx.state.is_final
                    && tx.version() >= dispute.state.version();
                if final_shortcut {
                    dispute.state_hash = self.verify_tx(params, tx)?;
                    dispute.state = tx.state.clone();
                } else if !dispute.concludable(now) {
                    return Err(AdjudicatorError::NotConcludable {
                        timeout: Arc::new(SimTimeout {
                            deadline: dispute.timeout,
                        }),
                    }
                    .into());
                }
                dispute.phase != DisputePhase::Concluded
            }
        };
        if needs_conclusion {
            st.conclude(id, sub_states)?;
        }

        let dispute = st
            .disputes
            .get_mut(&id)
            .ok_or(AdjudicatorError::NotRegistered)?;
        if dispute.paid[idx] {
            debug!(channel = ?id, idx, "already withdrawn");
            return Ok(());
        }
        let outcome = dispute
            .outcome
            .clone()
            .ok_or_else(|| Error::internal("concluded channel without outcome"))?;
        let assets = dispute.state.allocation.assets.clone();
        dispute.paid[idx] = true;
        for (a, auth) in req.auths.iter().enumerate() {
            let amount = outcome[a][idx];
            let bal = st.accounts.entry((auth.auth.receiver, assets[a])).or_default();
            *bal = bal.saturating_add(amount);
        }
        info!(channel = ?id, idx, "withdrawn");
        Ok(())
    }

    pub fn dispute_state(&self, id: ChannelId) -> Option<DisputeState> {
        let now = Instant::now();
        let mut st = self.state.lock();
        let dispute = st.disputes.get_mut(&id)?;
        dispute.refresh(now);
        Some(DisputeState {
            version: dispute.state.version(),
            phase: dispute.phase,
            timeout: Arc::new(SimTimeout {
                deadline: dispute.timeout,
            }),
            state_hash: dispute.state_hash,
            challenge_duration: dispute.params.challenge_duration(),
        })
    }

    pub fn subscribe(&self, id: ChannelId) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.entry(id).or_default().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{
            machine::tests::{funded_pair, sign_all, signers},
            make_signed_withdrawal_auths, Machine,
        },
        sig::{Account, EthVerifier},
    };

    fn chain() -> SimChain {
        SimChain::new(Arc::new(EthVerifier::default()))
    }

    /// Both machines move to `balances` at the next version.
    fn advance(ms: &mut [Machine], balances: &[u64], is_final: bool) -> Transaction {
        let mut next = ms[0].state().unwrap().make_next_state();
        next.allocation.balances[0] = balances.iter().map(|b| U256::from(*b)).collect();
        next.is_final = is_final;
        // Participant 0 only loses funds in these tests.
        for m in ms.iter_mut() {
            m.update(next.clone(), 0).unwrap();
        }
        sign_all(ms);
        for m in ms.iter_mut() {
            if is_final {
                m.enable_final().unwrap();
            } else {
                m.enable_update().unwrap();
            }
        }
        ms[0].current_tx().unwrap().clone()
    }

    fn fund(chain: &SimChain, m: &Machine) {
        let accounts = signers(2, 0);
        let state = m.state().unwrap().clone();
        for (i, acc) in accounts.iter().enumerate() {
            let asset = state.allocation.assets[0];
            chain.mint(acc.address(), asset, U256::from(100u64));
            chain
                .deposit(&FundingReq {
                    params: m.params().clone(),
                    state: state.clone(),
                    idx: i,
                    agreement: state.allocation.balances.clone(),
                })
                .unwrap();
        }
    }

    fn withdraw_req(m: &Machine, idx: PartIdx, receiver: Address) -> WithdrawReq {
        let accounts = signers(2, 0);
        let tx = m.current_tx().unwrap().clone();
        let auths = make_signed_withdrawal_auths(
            accounts[idx].as_ref(),
            m.params(),
            &tx.state,
            receiver,
            idx,
        )
        .unwrap();
        WithdrawReq {
            base: crate::adjudicator::AdjudicatorReq {
                params: m.params().clone(),
                tx,
                idx,
            },
            auths,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refutation_needs_newer_version_inside_window() {
        let chain = chain();
        let mut ms = funded_pair();
        let v0 = ms[0].current_tx().unwrap().clone();
        let v1 = advance(&mut ms, &[90, 110], false);
        let params = ms[0].params().clone();
        let mut events = chain.subscribe(params.id());

        chain.register(&params, &v0).unwrap();
        assert!(chain.register(&params, &v0).is_err());
        chain.register(&params, &v1).unwrap();
        assert_eq!(events.recv().await.unwrap().version(), 0);
        assert_eq!(events.recv().await.unwrap().version(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let v2 = advance(&mut ms, &[80, 120], false);
        assert!(chain.register(&params, &v2).is_err());
        assert_eq!(chain.dispute_state(params.id()).unwrap().version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispute_state_carries_the_window_end() {
        let chain = chain();
        let ms = funded_pair();
        let params = ms[0].params().clone();
        let registered = chain.register(&params, ms[0].current_tx().unwrap()).unwrap();

        let dispute = chain.dispute_state(params.id()).unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(dispute.phase, DisputePhase::Dispute);
        assert!(!dispute.timeout.is_elapsed(&cancel).await.unwrap());

        dispute.timeout.wait(&cancel).await.unwrap();
        assert!(registered.is_elapsed(&cancel).await.unwrap());
        assert!(dispute.timeout.is_elapsed(&cancel).await.unwrap());

        cancel.cancel();
        assert!(matches!(
            registered.is_elapsed(&cancel).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unsigned_registration_reverts() {
        let chain = chain();
        let ms = funded_pair();
        let mut tx = ms[0].current_tx().unwrap().clone();
        tx.sigs[1] = None;
        assert!(matches!(
            chain.register(ms[0].params(), &tx),
            Err(Error::Adjudicator(AdjudicatorError::Reverted(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn final_state_withdraws_without_dispute() {
        let chain = chain();
        let mut ms = funded_pair();
        fund(&chain, &ms[0]);
        advance(&mut ms, &[70, 130], true);
        let asset = ms[0].state().unwrap().allocation.assets[0];

        let receiver = Address([0xee; 20]);
        chain.withdraw(&withdraw_req(&ms[0], 0, receiver), &[]).unwrap();
        chain.withdraw(&withdraw_req(&ms[0], 0, receiver), &[]).unwrap();
        assert_eq!(chain.balance(receiver, asset), U256::from(70u64));

        let other = Address([0xdd; 20]);
        chain.withdraw(&withdraw_req(&ms[1], 1, other), &[]).unwrap();
        assert_eq!(chain.balance(other, asset), U256::from(130u64));
        assert_eq!(
            chain.dispute_state(ms[0].params().id()).unwrap().phase,
            DisputePhase::Concluded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_final_withdrawal_waits_for_timeout() {
        let chain = chain();
        let mut ms = funded_pair();
        fund(&chain, &ms[0]);
        let tx = advance(&mut ms, &[90, 110], false);
        let params = ms[0].params().clone();
        let receiver = Address([0xee; 20]);

        assert!(matches!(
            chain.withdraw(&withdraw_req(&ms[0], 0, receiver), &[]),
            Err(Error::Adjudicator(AdjudicatorError::NotRegistered))
        ));
        let timeout = chain.register(&params, &tx).unwrap();
        let err = chain
            .withdraw(&withdraw_req(&ms[0], 0, receiver), &[])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Adjudicator(AdjudicatorError::NotConcludable { .. })
        ));

        timeout.wait(&CancellationToken::new()).await.unwrap();
        chain.withdraw(&withdraw_req(&ms[0], 0, receiver), &[]).unwrap();
        let asset = tx.state.allocation.assets[0];
        assert_eq!(chain.balance(receiver, asset), U256::from(90u64));
    }

    #[tokio::test(start_paused = true)]
    async fn underfunded_channel_refunds() {
        let chain = chain();
        let ms = funded_pair();
        let accounts = signers(2, 0);
        let state = ms[0].state().unwrap().clone();
        let asset = state.allocation.assets[0];
        chain.mint(accounts[0].address(), asset, U256::from(100u64));
        let req = FundingReq {
            params: ms[0].params().clone(),
            state: state.clone(),
            idx: 0,
            agreement: state.allocation.balances.clone(),
        };
        chain.deposit(&req).unwrap();
        assert_eq!(chain.balance(accounts[0].address(), asset), U256::zero());

        let err = chain
            .await_funded(&req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FundingTimeout { ref peers } if peers == &vec![1]));

        let params = ms[0].params().clone();
        chain
            .register(&params, ms[0].current_tx().unwrap())
            .unwrap()
            .wait(&CancellationToken::new())
            .await
            .unwrap();
        let receiver = accounts[0].address();
        chain.withdraw(&withdraw_req(&ms[0], 0, receiver), &[]).unwrap();
        assert_eq!(chain.balance(receiver, asset), U256::from(100u64));
    }

    #[tokio::test(start_paused = true)]
    async fn progression_needs_app_and_window() {
        let chain = chain();
        let ms = funded_pair();
        let params = ms[0].params().clone();
        let tx = ms[0].current_tx().unwrap().clone();
        chain.register(&params, &tx).unwrap();

        let next = tx.state.make_next_state();
        let accounts = signers(2, 0);
        let sig = accounts[0].sign_hash(next.hash().unwrap()).unwrap();
        let req = ProgressReq {
            base: crate::adjudicator::AdjudicatorReq {
                params,
                tx,
                idx: 0,
            },
            new_state: next,
            sig,
        };
        // Payment channels never enter force-exec.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(chain.progress(&req).is_err());
    }
}
