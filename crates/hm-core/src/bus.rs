//! Message bus capability.
//!
//! The health manager talks to the rest of the cluster over a pub/sub bus:
//! it publishes start/stop messages, consumes heartbeats, and makes a single
//! request/reply call for API credentials. [`MessageBus`] is the seam; the
//! production transport lives outside this workspace.
//!
//! [`LocalBus`] is an in-process implementation on tokio channels. Requests
//! are delivered to exactly one subscriber, whose [`BusMessage::respond`]
//! completes the caller's [`ReplyFuture`] at most once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Resolves with the reply payload of a request.
pub type ReplyFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, BusError>> + Send>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no responders for subject {0}")]
    NoResponders(String),

    #[error("reply handle dropped before responding")]
    ReplyDropped,

    #[error("message is not a request")]
    NotARequest,

    #[error("publish failed: {0}")]
    Publish(String),
}

pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish.
    fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Single-shot request. The returned future resolves at most once.
    fn request(&self, subject: &str, payload: Vec<u8>) -> ReplyFuture;
}

/// A message delivered to a [`LocalBus`] subscriber.
#[derive(Debug)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    reply: Option<oneshot::Sender<Vec<u8>>>,
}

impl BusMessage {
    pub fn is_request(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer a request. Consumes the message, so a request can be answered
    /// only once.
    pub fn respond(self, payload: impl Into<Vec<u8>>) -> Result<(), BusError> {
        let reply = self.reply.ok_or(BusError::NotARequest)?;
        reply
            .send(payload.into())
            .map_err(|_| BusError::ReplyDropped)
    }
}

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>;

/// In-process message bus.
#[derive(Clone, Default)]
pub struct LocalBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every message published or requested on `subject`.
    pub fn subscribe(&self, subject: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        debug!(%subject, "bus subscription added");
        rx
    }

    /// Number of live subscribers on `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.lock()
            .get(subject)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut subscribers = self.lock();
        if let Some(subs) = subscribers.get_mut(subject) {
            subs.retain(|tx| {
                tx.send(BusMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    reply: None,
                })
                .is_ok()
            });
        }
        Ok(())
    }

    fn request(&self, subject: &str, payload: Vec<u8>) -> ReplyFuture {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut message = Some(BusMessage {
            subject: subject.to_string(),
            payload,
            reply: Some(reply_tx),
        });

        {
            let mut subscribers = self.lock();
            if let Some(subs) = subscribers.get_mut(subject) {
                // First live subscriber takes the request.
                subs.retain(|tx| match message.take() {
                    Some(msg) => match tx.send(msg) {
                        Ok(()) => true,
                        Err(mpsc::error::SendError(msg)) => {
                            message = Some(msg);
                            false
                        }
                    },
                    None => !tx.is_closed(),
                });
            }
        }

        if message.is_some() {
            let subject = subject.to_string();
            return Box::pin(async move { Err(BusError::NoResponders(subject)) });
        }

        Box::pin(async move { reply_rx.await.map_err(|_| BusError::ReplyDropped) })
    }
}
