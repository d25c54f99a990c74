//! Envelope transport: the [Bus] seam, an in-process [LocalBus], the frame
//! codec and the per-client [Relay].

mod encoding;
pub mod proto;
mod relay;

use std::{collections::HashMap, fmt::Debug};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

pub use encoding::{decode_frame, encode_frame, MAX_FRAME_BODY};
pub use relay::{CacheGuard, Predicate, Relay, Subscription};

use crate::{
    abiencode::types::Address,
    error::{Error, Result},
    messages::Envelope,
};

/// Ordered point-to-point delivery of envelopes between clients.
///
/// Implementations keep envelopes from one sender to one recipient in FIFO
/// order.
#[async_trait]
pub trait Bus: Debug + Send + Sync {
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// All envelopes addressed to `addr`, including those published before
    /// the subscription.
    fn subscribe_client(&self, addr: Address) -> Result<mpsc::UnboundedReceiver<Envelope>>;
}

#[derive(Debug)]
enum Mailbox {
    Pending(Vec<Envelope>),
    Active(mpsc::UnboundedSender<Envelope>),
}

/// In-process [Bus] connecting clients of the same process.
#[derive(Debug, Default)]
pub struct LocalBus {
    framed: bool,
    mailboxes: Mutex<HashMap<Address, Mailbox>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that passes every envelope through [encode_frame] and
    /// [decode_frame], like a network transport would.
    pub fn framed() -> Self {
        Self {
            framed: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, env: Envelope) -> Result<()> {
        let env = if self.framed {
            decode_frame(&encode_frame(&env)?)?
        } else {
            env
        };
        trace!(sender = ?env.sender, recipient = ?env.recipient, msg = env.msg.kind(), "publish");

        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes
            .entry(env.recipient)
            .or_insert_with(|| Mailbox::Pending(Vec::new()));
        match mailbox {
            Mailbox::Pending(buf) => buf.push(env),
            Mailbox::Active(tx) => {
                // The recipient went away; keep its mail until it returns.
                if let Err(mpsc::error::SendError(env)) = tx.send(env) {
                    *mailbox = Mailbox::Pending(vec![env]);
                }
            }
        }
        Ok(())
    }

    fn subscribe_client(&self, addr: Address) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        let mut mailboxes = self.mailboxes.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = match mailboxes.remove(&addr) {
            Some(Mailbox::Active(old)) if !old.is_closed() => {
                mailboxes.insert(addr, Mailbox::Active(old));
                return Err(Error::Bus(format!("{:?} is already subscribed", addr)));
            }
            Some(Mailbox::Pending(buf)) => buf,
            Some(Mailbox::Active(_)) | None => Vec::new(),
        };
        for env in buffered {
            // The receiver is still in our hands, this cannot fail.
            let _ = tx.send(env);
        }
        mailboxes.insert(addr, Mailbox::Active(tx));
        Ok(rx)
    }
}
