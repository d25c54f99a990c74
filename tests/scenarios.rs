//! End-to-end runs of clients over an in-process bus and a simulated chain.
//!
//! All tests run with a paused tokio clock: challenge durations elapse as
//! soon as every task is idle.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use perun_engine::{
    adjudicator::{Adjudicator, AdjudicatorReq, Funder},
    channel::{
        ActionApp, Allocation, AppError, AppRegistry, Asset, ChannelId, PartIdx, Params, Phase,
        State, StateApp,
    },
    messages::ChannelProposal,
    persistence::{ChannelSnapshot, MemoryPersister, PersistOp, Persister},
    sig::{Account, EthVerifier, Signer},
    sim::{SimAdjudicator, SimChain, SimFunder},
    wire::LocalBus,
    Address, Backend, Bytes32, Channel, Config, Error, ErrorKind, PerunClient, ProposalHandler,
    ProposalResponse, UpdateHandler, UpdateRequest, UpdateResponse, U256,
};
use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const APP: Address = Address([0xaa; 20]);

fn asset() -> Asset {
    Asset {
        chain_id: U256::from(1u64),
        holder: Address([0x11; 20]),
    }
}

fn signers(n: usize, seed: u64) -> Vec<Arc<Signer>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| Arc::new(Signer::new(&mut rng))).collect()
}

fn u(v: u64) -> U256 {
    U256::from(v)
}

/// How a party answers updates.
#[derive(Debug, Clone, Copy)]
enum Answer {
    Accept,
    /// Accept after thinking for a while.
    AcceptAfter(Duration),
    /// Reject the first update, accept the rest.
    RejectFirst,
    /// Accept only if the channel, read through the client, shows the
    /// update as staged on top of the request's current state.
    InspectChannel,
}

/// Accepts every proposal, answers updates per [Answer] and reports opened
/// channels.
struct Responder {
    account: Address,
    answer: Answer,
    answered: AtomicUsize,
    client: OnceLock<PerunClient>,
    opened: mpsc::UnboundedSender<Arc<Channel>>,
}

#[async_trait]
impl ProposalHandler for Responder {
    async fn handle_proposal(&self, _: &ChannelProposal, idx: PartIdx) -> ProposalResponse {
        ProposalResponse::Accept {
            participant: self.account,
            nonce_share: Bytes32([idx as u8 + 1; 32]),
        }
    }

    fn channel_opened(&self, channel: Arc<Channel>) {
        let _ = self.opened.send(channel);
    }
}

#[async_trait]
impl UpdateHandler for Responder {
    async fn handle_update(&self, req: &UpdateRequest) -> UpdateResponse {
        let first = self.answered.fetch_add(1, Ordering::SeqCst) == 0;
        let reject = |reason: &str| UpdateResponse::Reject {
            reason: reason.into(),
        };
        match self.answer {
            Answer::Accept => UpdateResponse::Accept,
            Answer::AcceptAfter(delay) => {
                tokio::time::sleep(delay).await;
                UpdateResponse::Accept
            }
            Answer::RejectFirst if first => reject("no"),
            Answer::RejectFirst => UpdateResponse::Accept,
            Answer::InspectChannel => {
                let Some(channel) = self.client.get().and_then(|c| c.channel(req.channel_id)) else {
                    return reject("unknown channel");
                };
                let staged = channel.phase().await == Phase::Signing;
                let current = channel.state().await.as_ref() == Some(&req.current);
                match staged && current {
                    true => UpdateResponse::Accept,
                    false => reject("channel does not show the update"),
                }
            }
        }
    }
}

/// App that allows any transition conserving funds.
#[derive(Debug)]
struct Permissive;

impl StateApp for Permissive {
    fn valid_init(&self, _: &Params, _: &State) -> Result<(), AppError> {
        Ok(())
    }

    fn valid_transition(&self, _: &Params, _: &State, _: &State, _: PartIdx) -> Result<(), AppError> {
        Ok(())
    }
}

/// Records everything like its [MemoryPersister] but never finishes
/// recording a peer's signature, like a process that stopped right there.
#[derive(Debug)]
struct StallOnSig(Arc<MemoryPersister>);

#[async_trait]
impl Persister for StallOnSig {
    async fn channel_created(&self, snapshot: &ChannelSnapshot) -> perun_engine::Result<()> {
        self.0.channel_created(snapshot).await
    }

    async fn phase_changed(&self, snapshot: &ChannelSnapshot) -> perun_engine::Result<()> {
        self.0.phase_changed(snapshot).await
    }

    async fn staged(&self, snapshot: &ChannelSnapshot) -> perun_engine::Result<()> {
        self.0.staged(snapshot).await
    }

    async fn sig_added(&self, _: &ChannelSnapshot, _: PartIdx) -> perun_engine::Result<()> {
        std::future::pending().await
    }

    async fn enabled(&self, snapshot: &ChannelSnapshot) -> perun_engine::Result<()> {
        self.0.enabled(snapshot).await
    }

    async fn channel_removed(&self, id: ChannelId) -> perun_engine::Result<()> {
        self.0.channel_removed(id).await
    }

    async fn restore_channel(&self, id: ChannelId) -> perun_engine::Result<Option<ChannelSnapshot>> {
        self.0.restore_channel(id).await
    }

    async fn restore_peer(&self, peer: Address) -> perun_engine::Result<Vec<ChannelSnapshot>> {
        self.0.restore_peer(peer).await
    }

    async fn active_peers(&self) -> perun_engine::Result<Vec<Address>> {
        self.0.active_peers().await
    }
}

struct World {
    chain: Arc<SimChain>,
    adjudicator: Arc<SimAdjudicator>,
    bus: Arc<LocalBus>,
    apps: AppRegistry,
}

struct Party {
    client: PerunClient,
    signer: Arc<Signer>,
    persister: Arc<MemoryPersister>,
    opened: mpsc::UnboundedReceiver<Arc<Channel>>,
}

impl World {
    fn new(apps: AppRegistry) -> Self {
        let chain = Arc::new(SimChain::with_apps(Arc::new(EthVerifier::default()), apps.clone()));
        Self {
            adjudicator: Arc::new(SimAdjudicator::new(chain.clone())),
            chain,
            bus: Arc::new(LocalBus::framed()),
            apps,
        }
    }

    fn funder(&self) -> Arc<dyn Funder> {
        Arc::new(SimFunder::new(self.chain.clone()))
    }

    fn party(&self, signer: Arc<Signer>, funder: Arc<dyn Funder>) -> Party {
        self.party_with(signer, funder, Answer::Accept)
    }

    fn party_with(&self, signer: Arc<Signer>, funder: Arc<dyn Funder>, answer: Answer) -> Party {
        self.chain.mint(signer.address(), asset(), u(100));
        self.connect(signer, funder, Arc::new(MemoryPersister::new()), answer)
    }

    fn connect(
        &self,
        signer: Arc<Signer>,
        funder: Arc<dyn Funder>,
        persister: Arc<MemoryPersister>,
        answer: Answer,
    ) -> Party {
        self.start(signer, funder, persister.clone(), persister, answer)
    }

    /// Start a client serving requests with a [Responder]. `persister` is
    /// where `backend_persister` ends up storing snapshots.
    fn start(
        &self,
        signer: Arc<Signer>,
        funder: Arc<dyn Funder>,
        backend_persister: Arc<dyn Persister>,
        persister: Arc<MemoryPersister>,
        answer: Answer,
    ) -> Party {
        let backend = Backend {
            verifier: Arc::new(EthVerifier::default()),
            bus: self.bus.clone(),
            funder,
            adjudicator: self.adjudicator.clone(),
            persister: backend_persister,
        };
        let client = PerunClient::new(
            signer.address(),
            signer.clone(),
            backend,
            self.apps.clone(),
            Config::default(),
        )
        .unwrap();

        let (tx, opened) = mpsc::unbounded_channel();
        let handler = Arc::new(Responder {
            account: signer.address(),
            answer,
            answered: AtomicUsize::new(0),
            client: OnceLock::new(),
            opened: tx,
        });
        let _ = handler.client.set(client.clone());
        let serving = client.clone();
        tokio::spawn(async move {
            serving
                .handle(handler.clone(), handler, &CancellationToken::new())
                .await
        });
        Party {
            client,
            signer,
            persister,
            opened,
        }
    }

    fn pair(&self) -> (Party, Party) {
        let s = signers(2, 7);
        (
            self.party(s[0].clone(), self.funder()),
            self.party(s[1].clone(), self.funder()),
        )
    }

    fn parties(&self, answers: &[Answer]) -> Vec<Party> {
        let s = signers(answers.len(), 13);
        s.into_iter()
            .zip(answers)
            .map(|(signer, answer)| self.party_with(signer, self.funder(), *answer))
            .collect()
    }

    fn balance(&self, party: &Party) -> U256 {
        self.chain.balance(party.signer.address(), asset())
    }
}

/// Proposal by the first of `parties`, everybody depositing `bals`.
fn proposal_of(parties: &[Party], cd: u64, app: Option<Address>, bals: Allocation) -> ChannelProposal {
    ChannelProposal::new(
        cd,
        Bytes32([9; 32]),
        parties[0].signer.address(),
        parties.iter().map(|p| p.client.address()).collect(),
        app,
        Vec::new(),
        bals,
    )
    .unwrap()
}

fn proposal(alice: &Party, bob: &Party, cd: u64, app: Option<Address>) -> ChannelProposal {
    ChannelProposal::new(
        cd,
        Bytes32([9; 32]),
        alice.signer.address(),
        vec![alice.client.address(), bob.client.address()],
        app,
        Vec::new(),
        Allocation::new(vec![asset()], vec![vec![u(100), u(100)]]),
    )
    .unwrap()
}

async fn open(
    alice: &mut Party,
    bob: &mut Party,
    cd: u64,
    app: Option<Address>,
) -> (Arc<Channel>, Arc<Channel>) {
    let prop = proposal(alice, bob, cd, app);
    let a = alice
        .client
        .propose_channel(prop, &CancellationToken::new())
        .await
        .unwrap();
    let b = bob.opened.recv().await.unwrap();
    assert_eq!(a.id(), b.id());
    (a, b)
}

/// Open `prop` among all `parties`; channels in participant order.
async fn open_all(parties: &mut [Party], prop: ChannelProposal) -> Vec<Arc<Channel>> {
    let first = parties[0]
        .client
        .propose_channel(prop, &CancellationToken::new())
        .await
        .unwrap();
    let mut channels = vec![first];
    for party in parties.iter_mut().skip(1) {
        let ch = party.opened.recv().await.unwrap();
        assert_eq!(ch.id(), channels[0].id());
        channels.push(ch);
    }
    channels
}

/// Shut `party`'s client down, keeping only what it persisted.
async fn crash(party: Party) -> (Arc<Signer>, Arc<MemoryPersister>) {
    let Party {
        client,
        signer,
        persister,
        ..
    } = party;
    client.shutdown();
    drop(client);
    tokio::time::sleep(Duration::from_millis(10)).await;
    (signer, persister)
}

async fn pay(ch: &Channel, from: PartIdx, to: PartIdx, amount: u64) -> perun_engine::Result<()> {
    ch.update_by(
        |s| {
            let row = &mut s.allocation.balances[0];
            row[from] = row[from] - u(amount);
            row[to] = row[to] + u(amount);
            Ok(())
        },
        &CancellationToken::new(),
    )
    .await
}

async fn balances(ch: &Channel) -> Vec<U256> {
    ch.state().await.unwrap().allocation.balances[0].clone()
}

#[tokio::test(start_paused = true)]
async fn cooperative_close_pays_final_balances() {
    let world = World::new(AppRegistry::new());
    let (mut alice, mut bob) = world.pair();
    let (a, b) = open(&mut alice, &mut bob, 60, None).await;
    assert_eq!(a.phase().await, Phase::Acting);
    assert_eq!(world.balance(&alice), u(0));

    for amount in [3, 4, 5, 1] {
        pay(&a, 0, 1, amount).await.unwrap();
    }
    pay(&b, 1, 0, 2).await.unwrap();
    assert_eq!(a.version().await, 5);
    assert_eq!(balances(&a).await, vec![u(89), u(111)]);
    assert_eq!(balances(&b).await, vec![u(89), u(111)]);

    let cancel = CancellationToken::new();
    a.settle(&cancel).await.unwrap();
    b.settle(&cancel).await.unwrap();

    assert_eq!(a.phase().await, Phase::Withdrawn);
    assert_eq!(b.phase().await, Phase::Withdrawn);
    assert_eq!(world.balance(&alice), u(89));
    assert_eq!(world.balance(&bob), u(111));
    assert!(alice.client.channel(a.id()).is_none());
    assert!(alice.persister.ops().contains(&PersistOp::Removed(a.id())));
    assert!(bob.persister.ops().contains(&PersistOp::Removed(b.id())));
}

#[tokio::test(start_paused = true)]
async fn watchers_refute_outdated_registration() {
    let world = World::new(AppRegistry::new());
    let (mut alice, mut bob) = world.pair();
    let (a, b) = open(&mut alice, &mut bob, 60, None).await;
    let initial = a.current_tx().await.unwrap();

    for _ in 0..4 {
        pay(&a, 0, 1, 5).await.unwrap();
    }
    assert_eq!(b.version().await, 4);

    // Alice registers the stale initial state behind her watcher's back.
    let stale = AdjudicatorReq {
        params: a.params().clone(),
        tx: initial,
        idx: 0,
    };
    world
        .adjudicator
        .register(&stale, &CancellationToken::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(180)).await;

    let dispute = world.adjudicator.dispute_state(a.id()).await.unwrap().unwrap();
    assert_eq!(dispute.version, 4);
    assert_eq!(a.phase().await, Phase::Withdrawn);
    assert_eq!(b.phase().await, Phase::Withdrawn);
    assert_eq!(world.balance(&alice), u(80));
    assert_eq!(world.balance(&bob), u(120));
    assert!(a.fatal_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn funding_timeout_is_settled_by_refund() {
    let world = World::new(AppRegistry::new());
    let s = signers(2, 7);
    let alice = world.party(s[0].clone(), Arc::new(SimFunder::new(world.chain.clone())));
    let bob = world.party(s[1].clone(), Arc::new(SimFunder::withholding(world.chain.clone())));

    let prop = proposal(&alice, &bob, 10, None);
    let err = alice
        .client
        .propose_channel(prop, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FundingTimeout);
    assert!(matches!(err.root(), Error::FundingTimeout { peers } if peers == &vec![1]));

    let channels = alice.client.channels();
    assert_eq!(channels.len(), 1);
    let a = &channels[0];
    assert_eq!(err.channel_id(), Some(a.id()));
    assert_eq!(a.phase().await, Phase::Funding);
    assert_eq!(world.balance(&alice), u(0));

    a.settle(&CancellationToken::new()).await.unwrap();
    assert_eq!(a.phase().await, Phase::Withdrawn);
    assert_eq!(world.balance(&alice), u(100));
    assert_eq!(world.balance(&bob), u(100));
}

#[tokio::test(start_paused = true)]
async fn concurrent_updates_lower_index_wins() {
    let world = World::new(AppRegistry::new());
    let (mut alice, mut bob) = world.pair();
    let (a, b) = open(&mut alice, &mut bob, 60, None).await;

    let (ra, rb) = tokio::join!(pay(&a, 0, 1, 10), pay(&b, 1, 0, 5));
    ra.unwrap();
    let err = rb.unwrap_err();
    assert!(matches!(err.root(), Error::ConcurrentUpdate { version: 1 }));

    assert_eq!(a.version().await, 1);
    assert_eq!(b.version().await, 1);
    assert_eq!(balances(&b).await, vec![u(90), u(110)]);
    assert_eq!(b.phase().await, Phase::Acting);

    // The loser can go again on top of the winner's state.
    pay(&b, 1, 0, 5).await.unwrap();
    assert_eq!(balances(&a).await, vec![u(95), u(105)]);
}

#[tokio::test(start_paused = true)]
async fn registered_app_channel_progresses_on_chain() {
    let mut apps = AppRegistry::new();
    apps.register_state_app(APP, Arc::new(Permissive)).unwrap();
    let world = World::new(apps);
    let (mut alice, mut bob) = world.pair();
    let (a, b) = open(&mut alice, &mut bob, 60, Some(APP)).await;

    for round in 1..=7u8 {
        a.update_by(
            |s| {
                s.app_data = vec![round];
                Ok(())
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    }
    assert_eq!(b.version().await, 7);

    let cancel = CancellationToken::new();
    a.register(&cancel).await.unwrap();
    assert_eq!(a.phase().await, Phase::Registered);

    // Half of Alice's balance goes to Bob.
    a.progress_by(
        |s| {
            s.app_data = vec![99];
            let row = &mut s.allocation.balances[0];
            let half = row[0] / u(2);
            row[0] = row[0] - half;
            row[1] = row[1] + half;
            Ok(())
        },
        &cancel,
    )
    .await
    .unwrap();
    assert_eq!(a.version().await, 8);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(a.phase().await, Phase::Progressed);
    assert_eq!(b.phase().await, Phase::Progressed);
    assert_eq!(b.version().await, 8);
    assert_eq!(b.state().await.unwrap().app_data, vec![99]);

    tokio::time::sleep(Duration::from_secs(240)).await;

    assert_eq!(b.phase().await, Phase::Withdrawn);
    assert_eq!(a.phase().await, Phase::Withdrawn);
    assert_eq!(world.balance(&alice), u(50));
    assert_eq!(world.balance(&bob), u(150));
}

#[tokio::test(start_paused = true)]
async fn restored_client_continues_channel() {
    let world = World::new(AppRegistry::new());
    let (mut alice, mut bob) = world.pair();
    let (a, b) = open(&mut alice, &mut bob, 60, None).await;
    pay(&a, 0, 1, 10).await.unwrap();

    // Crash: the client and its request loop go away, the persister stays.
    drop(a);
    let (signer, persister) = crash(alice).await;

    let alice = world.connect(signer, world.funder(), persister, Answer::Accept);
    let restored = alice.client.restore(&CancellationToken::new()).await.unwrap();
    assert_eq!(restored.len(), 1);
    let a = &restored[0];
    assert_eq!(a.id(), b.id());
    assert_eq!(a.phase().await, Phase::Acting);
    assert_eq!(a.version().await, 1);

    pay(a, 0, 1, 10).await.unwrap();
    pay(&b, 1, 0, 5).await.unwrap();
    assert_eq!(balances(a).await, vec![u(85), u(115)]);
    assert_eq!(balances(&b).await, vec![u(85), u(115)]);
}

#[tokio::test(start_paused = true)]
async fn late_responses_do_not_spoil_the_next_update() {
    let world = World::new(AppRegistry::new());
    let mut parties = world.parties(&[
        Answer::Accept,
        Answer::AcceptAfter(Duration::from_secs(1)),
        Answer::RejectFirst,
    ]);
    let bals = Allocation::new(vec![asset()], vec![vec![u(100); 3]]);
    let prop = proposal_of(&parties, 60, None, bals);
    let chs = open_all(&mut parties, prop).await;

    let err = pay(&chs[0], 0, 1, 10).await.unwrap_err();
    assert!(matches!(err.root(), Error::PeerRejected { reason } if reason == "no"));

    // The second participant accepts the rejected update after everybody
    // dropped it.
    tokio::time::sleep(Duration::from_secs(40)).await;
    for ch in &chs {
        assert_eq!(ch.phase().await, Phase::Acting);
        assert_eq!(ch.version().await, 0);
    }

    pay(&chs[0], 0, 2, 7).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    for ch in &chs {
        assert_eq!(ch.version().await, 1);
        assert_eq!(balances(ch).await, vec![u(93), u(100), u(107)]);
    }
}

#[tokio::test(start_paused = true)]
async fn update_handler_can_inspect_the_channel() {
    let world = World::new(AppRegistry::new());
    let s = signers(2, 7);
    let mut alice = world.party(s[0].clone(), world.funder());
    let mut bob = world.party_with(s[1].clone(), world.funder(), Answer::InspectChannel);
    let (a, b) = open(&mut alice, &mut bob, 60, None).await;

    pay(&a, 0, 1, 10).await.unwrap();
    pay(&a, 0, 1, 10).await.unwrap();
    assert_eq!(balances(&b).await, vec![u(80), u(120)]);
}

#[tokio::test(start_paused = true)]
async fn restored_registered_channel_progresses() {
    let mut apps = AppRegistry::new();
    apps.register_state_app(APP, Arc::new(Permissive)).unwrap();
    let world = World::new(apps);
    let (mut alice, mut bob) = world.pair();
    let (a, b) = open(&mut alice, &mut bob, 60, Some(APP)).await;
    a.update_by(
        |s| {
            s.app_data = vec![1];
            Ok(())
        },
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    a.register(&cancel).await.unwrap();
    drop(a);
    let (signer, persister) = crash(alice).await;

    let alice = world.connect(signer, world.funder(), persister, Answer::Accept);
    let restored = alice.client.restore(&cancel).await.unwrap();
    let a = &restored[0];
    assert_eq!(a.phase().await, Phase::Registered);

    a.progress_by(
        |s| {
            s.app_data = vec![2];
            Ok(())
        },
        &cancel,
    )
    .await
    .unwrap();
    assert_eq!(a.phase().await, Phase::Progressed);
    assert_eq!(a.version().await, 2);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(b.version().await, 2);
    assert_eq!(b.state().await.unwrap().app_data, vec![2]);
}

#[tokio::test(start_paused = true)]
async fn refutation_survives_adjudicator_outage() {
    let world = World::new(AppRegistry::new());
    let (mut alice, mut bob) = world.pair();
    let (a, b) = open(&mut alice, &mut bob, 60, None).await;
    let initial = a.current_tx().await.unwrap();
    for _ in 0..4 {
        pay(&a, 0, 1, 5).await.unwrap();
    }

    let stale = AdjudicatorReq {
        params: a.params().clone(),
        tx: initial,
        idx: 0,
    };
    world
        .adjudicator
        .register(&stale, &CancellationToken::new())
        .await
        .unwrap();
    // The first refutation attempt fails.
    world.adjudicator.fail_next(1);

    tokio::time::sleep(Duration::from_secs(180)).await;

    let dispute = world.adjudicator.dispute_state(a.id()).await.unwrap().unwrap();
    assert_eq!(dispute.version, 4);
    assert_eq!(a.phase().await, Phase::Withdrawn);
    assert_eq!(b.phase().await, Phase::Withdrawn);
    assert_eq!(world.balance(&alice), u(80));
    assert_eq!(world.balance(&bob), u(120));
    assert!(a.fatal_error().is_none());
    assert!(b.fatal_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn watcher_retries_failed_withdrawals() {
    let world = World::new(AppRegistry::new());
    let (mut alice, mut bob) = world.pair();
    let (a, b) = open(&mut alice, &mut bob, 60, None).await;
    pay(&a, 0, 1, 30).await.unwrap();

    a.register(&CancellationToken::new()).await.unwrap();
    world.adjudicator.fail_next(2);

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(a.phase().await, Phase::Withdrawn);
    assert_eq!(b.phase().await, Phase::Withdrawn);
    assert_eq!(world.balance(&alice), u(70));
    assert_eq!(world.balance(&bob), u(130));
}

#[tokio::test(start_paused = true)]
async fn newer_registered_state_stops_the_watcher() {
    let world = World::new(AppRegistry::new());
    let s = signers(2, 7);
    let mut alice = world.party(s[0].clone(), world.funder());
    let mut bob = world.party_with(
        s[1].clone(),
        world.funder(),
        Answer::AcceptAfter(Duration::from_secs(60)),
    );
    let (a, b) = open(&mut alice, &mut bob, 60, None).await;

    // Alice gives up on the update, Bob signs and enables it later.
    let err = pay(&a, 0, 1, 10).await.unwrap_err();
    assert!(matches!(err.root(), Error::Protocol(_)));
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(a.version().await, 0);
    assert_eq!(b.version().await, 1);

    b.register(&CancellationToken::new()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let fatal = a.fatal_error().unwrap();
    assert!(matches!(
        fatal.root(),
        Error::StateRegressed {
            local: 0,
            on_chain: 1
        }
    ));
    assert_eq!(fatal.channel_id(), Some(a.id()));
    assert!(matches!(
        *fatal,
        Error::Channel {
            phase: Phase::Acting,
            version: 0,
            ..
        }
    ));
    assert!(b.fatal_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn channel_restored_during_initial_signing_completes() {
    let world = World::new(AppRegistry::new());
    let s = signers(2, 7);
    world.chain.mint(s[0].address(), asset(), u(100));
    let stored = Arc::new(MemoryPersister::new());
    let alice = world.start(
        s[0].clone(),
        world.funder(),
        Arc::new(StallOnSig(stored.clone())),
        stored.clone(),
        Answer::Accept,
    );
    let bob = world.party(s[1].clone(), world.funder());

    // Alice hangs while recording Bob's initial signature.
    let prop = proposal(&alice, &bob, 60, None);
    let client = alice.client.clone();
    let proposing =
        tokio::spawn(async move { client.propose_channel(prop, &CancellationToken::new()).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    proposing.abort();
    let _ = proposing.await;

    let b = bob.client.channels().pop().unwrap();
    assert_eq!(b.phase().await, Phase::Funding);
    let snapshot = stored.restore_channel(b.id()).await.unwrap().unwrap();
    assert_eq!(snapshot.phase, Phase::InitSigning);
    assert_eq!(stored.ops(), vec![PersistOp::Created(b.id())]);

    let (signer, persister) = crash(alice).await;
    let alice = world.connect(signer, world.funder(), persister, Answer::Accept);
    let restored = alice.client.restore(&CancellationToken::new()).await.unwrap();
    let a = &restored[0];
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(a.phase().await, Phase::Funding);
    assert_eq!(a.current_tx().await, b.current_tx().await);
    assert!(alice
        .persister
        .ops()
        .contains(&PersistOp::PhaseChanged(a.id(), Phase::Funding)));
}

/// Each round, every participant but one moves funds of all assets to
/// another participant. The participant sitting out (`version % 3` of the
/// state being built) submits an empty action.
#[derive(Debug)]
struct Transfers;

fn sitting_out(next_version: u64) -> PartIdx {
    (next_version % 3) as PartIdx
}

impl ActionApp for Transfers {
    fn valid_action(&self, params: &Params, state: &State, actor: PartIdx, action: &[u8]) -> Result<(), AppError> {
        let reject = |reason: &str| AppError::Action {
            actor,
            reason: reason.into(),
        };
        match (actor == sitting_out(state.version() + 1), action) {
            (true, []) => Ok(()),
            (true, _) => Err(reject("must sit this round out")),
            (false, [to, _]) if usize::from(*to) < params.num_parts() && usize::from(*to) != actor => Ok(()),
            (false, _) => Err(reject("expected [recipient, amount]")),
        }
    }

    fn apply_actions(&self, _: &Params, state: &State, actions: &[Vec<u8>]) -> Result<State, AppError> {
        let mut next = state.make_next_state();
        for (actor, action) in actions.iter().enumerate() {
            let &[to, amount] = action.as_slice() else {
                continue;
            };
            for row in next.allocation.balances.iter_mut() {
                let amount = u(amount.into());
                if row[actor] < amount {
                    return Err(AppError::Action {
                        actor,
                        reason: "insufficient balance".into(),
                    });
                }
                row[actor] = row[actor] - amount;
                row[usize::from(to)] = row[usize::from(to)] + amount;
            }
        }
        Ok(next)
    }

    /// Every participant names its own initial balance, used for both assets.
    fn init_state(&self, _: &Params, actions: &[Vec<u8>]) -> Result<(Allocation, Vec<u8>), AppError> {
        let row: Vec<U256> = actions
            .iter()
            .map(|a| a.first().map_or(u(0), |b| u((*b).into())))
            .collect();
        let assets = vec![asset(), Asset { chain_id: u(2), ..asset() }];
        Ok((Allocation::new(assets, vec![row.clone(), row]), Vec::new()))
    }
}

#[tokio::test(start_paused = true)]
async fn three_party_action_rounds() {
    let mut apps = AppRegistry::new();
    apps.register_action_app(APP, Arc::new(Transfers)).unwrap();
    let world = World::new(apps);
    let mut parties = world.parties(&[Answer::Accept; 3]);
    let second = Asset {
        chain_id: u(2),
        ..asset()
    };
    for p in &parties {
        world.chain.mint(p.signer.address(), second, u(100));
    }

    let row = vec![u(10), u(5), u(20)];
    let bals = Allocation::new(vec![asset(), second], vec![row.clone(), row]);
    let prop = proposal_of(&parties, 60, Some(APP), bals)
        .with_init_actions(vec![vec![10], vec![5], vec![20]])
        .unwrap();
    let chs = open_all(&mut parties, prop).await;
    assert_eq!(world.balance(&parties[2]), u(80));

    // Action apps only move through action rounds.
    let err = pay(&chs[0], 0, 1, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transition);

    // Round for version 1: participant 1 sits out.
    let cancel = CancellationToken::new();
    let err = chs[1].submit_action(vec![0, 1], &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::App);
    let (r0, r1, r2) = tokio::join!(
        chs[0].submit_action(vec![1, 5], &cancel),
        chs[1].submit_action(vec![], &cancel),
        chs[2].submit_action(vec![0, 5], &cancel),
    );
    r0.unwrap();
    r1.unwrap();
    r2.unwrap();

    // Round for version 2: participant 2 sits out.
    let (r0, r1, r2) = tokio::join!(
        chs[0].submit_action(vec![2, 1], &cancel),
        chs[1].submit_action(vec![0, 2], &cancel),
        chs[2].submit_action(vec![], &cancel),
    );
    r0.unwrap();
    r1.unwrap();
    r2.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    for ch in &chs {
        assert_eq!(ch.version().await, 2);
        assert_eq!(ch.phase().await, Phase::Acting);
        for row in &ch.state().await.unwrap().allocation.balances {
            assert_eq!(row, &vec![u(11), u(8), u(16)]);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn action_round_outlives_impatient_submitter() {
    let mut apps = AppRegistry::new();
    apps.register_action_app(APP, Arc::new(Transfers)).unwrap();
    let world = World::new(apps);
    let mut parties = world.parties(&[Answer::Accept; 3]);
    let second = Asset {
        chain_id: u(2),
        ..asset()
    };
    for p in &parties {
        world.chain.mint(p.signer.address(), second, u(100));
    }
    let row = vec![u(10), u(10), u(10)];
    let bals = Allocation::new(vec![asset(), second], vec![row.clone(), row]);
    let prop = proposal_of(&parties, 60, Some(APP), bals)
        .with_init_actions(vec![vec![10]; 3])
        .unwrap();
    let chs = open_all(&mut parties, prop).await;

    let cancel = CancellationToken::new();
    let err = chs[0].submit_action(vec![2, 3], &cancel).await.unwrap_err();
    assert!(matches!(err.root(), Error::Protocol(_)));
    assert_eq!(chs[0].version().await, 0);
    let err = chs[0].submit_action(vec![1, 1], &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::App);

    // The others act late; the round still carries the first action.
    let (r1, r2) = tokio::join!(
        chs[1].submit_action(vec![], &cancel),
        chs[2].submit_action(vec![1, 1], &cancel),
    );
    r1.unwrap();
    r2.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    for ch in &chs {
        assert_eq!(ch.version().await, 1);
        assert_eq!(balances(ch).await, vec![u(7), u(11), u(12)]);
    }
}
