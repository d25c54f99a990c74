//! Per-client envelope router.
//!
//! Every inbound envelope goes to all subscriptions whose predicate matches
//! it. Envelopes nobody subscribed to are kept if a cache predicate matches
//! them, otherwise they end up in the client's request queue.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    error::{Error, ProtocolError, Result},
    messages::Envelope,
};

pub type Predicate = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

struct Sub {
    id: u64,
    predicate: Predicate,
    tx: mpsc::UnboundedSender<Envelope>,
}

struct Cache {
    id: u64,
    predicate: Predicate,
}

struct Inner {
    next_id: u64,
    subs: Vec<Sub>,
    caches: Vec<Cache>,
    cached: VecDeque<Envelope>,
    requests: mpsc::UnboundedSender<Envelope>,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct Relay {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Relay")
            .field("subs", &inner.subs.len())
            .field("caches", &inner.caches.len())
            .field("cached", &inner.cached.len())
            .finish()
    }
}

impl Relay {
    /// A relay and the receiving end of its request queue.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (requests, rx) = mpsc::unbounded_channel();
        let relay = Arc::new(Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                subs: Vec::new(),
                caches: Vec::new(),
                cached: VecDeque::new(),
                requests,
            }),
        });
        (relay, rx)
    }

    /// Route one inbound envelope.
    pub fn deliver(&self, env: Envelope) {
        let mut inner = self.inner.lock();
        inner.subs.retain(|s| !s.tx.is_closed());

        let matching: Vec<_> = inner
            .subs
            .iter()
            .filter(|s| (s.predicate)(&env))
            .map(|s| s.tx.clone())
            .collect();
        if !matching.is_empty() {
            for tx in matching {
                let _ = tx.send(env.clone());
            }
        } else if inner.caches.iter().any(|c| (c.predicate)(&env)) {
            trace!(msg = env.msg.kind(), sender = ?env.sender, "cached");
            inner.cached.push_back(env);
        } else if inner.requests.send(env).is_err() {
            trace!("request queue closed, envelope dropped");
        }
    }

    /// Receive every future envelope matching `predicate`, starting with the
    /// matching ones currently cached.
    pub fn subscribe(
        self: &Arc<Self>,
        predicate: impl Fn(&Envelope) -> bool + Send + Sync + 'static,
    ) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        let mut rest = VecDeque::with_capacity(inner.cached.len());
        for env in inner.cached.drain(..) {
            if predicate(&env) {
                let _ = tx.send(env);
            } else {
                rest.push_back(env);
            }
        }
        inner.cached = rest;

        let id = inner.next_id();
        inner.subs.push(Sub {
            id,
            predicate: Box::new(predicate),
            tx,
        });
        Subscription {
            id,
            relay: Arc::downgrade(self),
            rx,
        }
    }

    /// Keep envelopes matching `predicate` that no subscription claims, until
    /// the returned guard is dropped.
    pub fn cache(
        self: &Arc<Self>,
        predicate: impl Fn(&Envelope) -> bool + Send + Sync + 'static,
    ) -> CacheGuard {
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        inner.caches.push(Cache {
            id,
            predicate: Box::new(predicate),
        });
        CacheGuard {
            id,
            relay: Arc::downgrade(self),
        }
    }

    /// Drop the cached envelopes matching `predicate`. Returns how many were
    /// dropped.
    pub fn purge(&self, predicate: impl Fn(&Envelope) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.cached.len();
        inner.cached.retain(|env| !predicate(env));
        before - inner.cached.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.lock().subs.retain(|s| s.id != id);
    }

    fn uncache(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.caches.retain(|c| c.id != id);
        let Inner { caches, cached, .. } = &mut *inner;
        cached.retain(|env| caches.iter().any(|c| (c.predicate)(env)));
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.inner.lock().cached.len()
    }
}

/// Envelopes matching a predicate. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    relay: Weak<Relay>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    /// Next matching envelope. `what` names the awaited message for the
    /// timeout error.
    pub async fn recv(
        &mut self,
        cancel: &CancellationToken,
        timeout: Duration,
        what: &'static str,
    ) -> Result<Envelope> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(timeout, self.rx.recv()) => match res {
                Ok(Some(env)) => Ok(env),
                Ok(None) => Err(Error::Bus("relay closed".into())),
                Err(_) => Err(ProtocolError::Timeout(what).into()),
            },
        }
    }

    /// A matching envelope that already arrived, if any.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.upgrade() {
            relay.unsubscribe(self.id);
        }
    }
}

/// Keeps a cache predicate installed. Dropping it discards the envelopes
/// only it was keeping.
#[derive(Debug)]
pub struct CacheGuard {
    id: u64,
    relay: Weak<Relay>,
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.upgrade() {
            relay.uncache(self.id);
        }
    }
}
