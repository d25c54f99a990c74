//! App plug-ins: the rules a channel's states follow beyond conservation of
//! funds.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use super::{Allocation, PartIdx, Params, State};
use crate::{
    abiencode::types::Address,
    error::{Error, Result, TransitionError},
};

/// Failures reported by app code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    /// The app classified the proposed transition as invalid.
    #[error("app rejected transition: {0}")]
    Transition(String),
    #[error("invalid action from participant {actor}: {reason}")]
    Action { actor: PartIdx, reason: String },
    #[error("app failure: {0}")]
    Other(String),
}

/// App that validates whole state transitions.
pub trait StateApp: Debug + Send + Sync {
    fn valid_init(&self, params: &Params, state: &State) -> Result<(), AppError>;

    fn valid_transition(
        &self,
        params: &Params,
        from: &State,
        to: &State,
        actor: PartIdx,
    ) -> Result<(), AppError>;
}

/// App whose states advance by folding one action per participant.
pub trait ActionApp: Debug + Send + Sync {
    fn valid_init(&self, _params: &Params, _state: &State) -> Result<(), AppError> {
        Ok(())
    }

    fn valid_action(
        &self,
        params: &Params,
        state: &State,
        actor: PartIdx,
        action: &[u8],
    ) -> Result<(), AppError>;

    /// Successor of `state` given one action per participant (indexed by
    /// participant). The result must have version `state.version() + 1`.
    fn apply_actions(
        &self,
        params: &Params,
        state: &State,
        actions: &[Vec<u8>],
    ) -> Result<State, AppError>;

    /// Initial allocation and app data from one action per participant.
    fn init_state(
        &self,
        params: &Params,
        actions: &[Vec<u8>],
    ) -> Result<(Allocation, Vec<u8>), AppError>;
}

/// The app of a channel, resolved from the address in its [Params].
#[derive(Debug, Clone)]
pub enum App {
    /// Payment channel: no app data, balance changes only by the actor.
    NoApp,
    State {
        address: Address,
        app: Arc<dyn StateApp>,
    },
    Action {
        address: Address,
        app: Arc<dyn ActionApp>,
    },
}

impl App {
    pub fn address(&self) -> Option<Address> {
        match self {
            App::NoApp => None,
            App::State { address, .. } | App::Action { address, .. } => Some(*address),
        }
    }

    pub(crate) fn valid_init(&self, params: &Params, state: &State) -> Result<()> {
        match self {
            App::NoApp if !state.app_data.is_empty() => {
                Err(TransitionError::AppDataWithoutApp.into())
            }
            App::NoApp => Ok(()),
            App::State { app, .. } => Ok(app.valid_init(params, state)?),
            App::Action { app, .. } => Ok(app.valid_init(params, state)?),
        }
    }

    /// App-specific part of validating an off-chain update.
    pub(crate) fn valid_update(
        &self,
        params: &Params,
        from: &State,
        to: &State,
        actor: PartIdx,
    ) -> Result<()> {
        match self {
            App::NoApp => Ok(valid_payment_transition(from, to, actor)?),
            App::State { app, .. } => Ok(app.valid_transition(params, from, to, actor)?),
            App::Action { .. } => Err(TransitionError::ActionAppUpdate.into()),
        }
    }

    /// App-specific part of validating an on-chain progression.
    pub(crate) fn valid_progression(
        &self,
        params: &Params,
        from: &State,
        to: &State,
        actor: PartIdx,
    ) -> Result<()> {
        match self {
            App::State { app, .. } => Ok(app.valid_transition(params, from, to, actor)?),
            App::NoApp | App::Action { .. } => Err(TransitionError::ProgressionUnsupported.into()),
        }
    }

    pub(crate) fn as_action_app(&self) -> Option<&Arc<dyn ActionApp>> {
        match self {
            App::Action { app, .. } => Some(app),
            _ => None,
        }
    }
}

/// Transition rule of channels without an app.
///
/// Totals are checked by the machine. On top of that, app data stays empty
/// and only the actor's own balances may decrease: everybody else can only
/// be credited.
pub(crate) fn valid_payment_transition(
    from: &State,
    to: &State,
    actor: PartIdx,
) -> Result<(), TransitionError> {
    if !to.app_data.is_empty() {
        return Err(TransitionError::AppDataWithoutApp);
    }
    if from.allocation.locked != to.allocation.locked {
        return Err(TransitionError::LockedMismatch);
    }
    let rows = from.allocation.balances.iter().zip(&to.allocation.balances);
    for (asset, (old, new)) in rows.enumerate() {
        for (participant, (o, n)) in old.iter().zip(new).enumerate() {
            if participant != actor && n < o {
                return Err(TransitionError::UnauthorizedDebit { asset, participant });
            }
        }
    }
    Ok(())
}

/// Apps known to a client, keyed by their on-chain address.
///
/// Built once and handed to the client; there is no global registry.
#[derive(Debug, Default, Clone)]
pub struct AppRegistry {
    apps: HashMap<Address, App>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_state_app(&mut self, address: Address, app: Arc<dyn StateApp>) -> Result<()> {
        self.insert(address, App::State { address, app })
    }

    pub fn register_action_app(
        &mut self,
        address: Address,
        app: Arc<dyn ActionApp>,
    ) -> Result<()> {
        self.insert(address, App::Action { address, app })
    }

    fn insert(&mut self, address: Address, app: App) -> Result<()> {
        if address.is_zero() {
            return Err(Error::Config("the zero address means no app".into()));
        }
        if self.apps.contains_key(&address) {
            return Err(Error::Config(format!("app {:?} registered twice", address)));
        }
        self.apps.insert(address, app);
        Ok(())
    }

    /// Resolve the app named in a channel's params.
    pub fn resolve(&self, address: Option<Address>) -> Result<App> {
        match address {
            None => Ok(App::NoApp),
            Some(addr) => self
                .apps
                .get(&addr)
                .cloned()
                .ok_or(Error::UnknownApp(addr)),
        }
    }
}
