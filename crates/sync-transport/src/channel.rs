//! Persistent channel collaborator and reply correlation.

use crate::{TransportError, TransportResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use sync_core::{HttpMethod, OperationId};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Outbound frame; `request_id` comes back on the matching reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEnvelope {
    pub request_id: OperationId,
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

/// Inbound frame answering an earlier envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReply {
    pub request_id: OperationId,
    pub status: u16,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// A long-lived bidirectional connection.
#[async_trait]
pub trait PersistentChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn send(&self, envelope: ChannelEnvelope) -> TransportResult<()>;

    /// Completes once the channel is no longer open.
    async fn closed(&self);
}

/// [`PersistentChannel`] that hands envelopes to the embedding application
/// through an mpsc queue. The application reports open/closed with
/// [`MpscChannel::set_open`].
pub struct MpscChannel {
    outbound: mpsc::Sender<ChannelEnvelope>,
    open: watch::Sender<bool>,
}

impl MpscChannel {
    /// Starts closed.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChannelEnvelope>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let (open, _) = watch::channel(false);
        (Self { outbound, open }, rx)
    }

    pub fn set_open(&self, open: bool) {
        self.open.send_replace(open);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.open.subscribe()
    }
}

#[async_trait]
impl PersistentChannel for MpscChannel {
    fn is_open(&self) -> bool {
        *self.open.borrow() && !self.outbound.is_closed()
    }

    async fn send(&self, envelope: ChannelEnvelope) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn closed(&self) {
        let mut open = self.open.subscribe();
        loop {
            let is_open = *open.borrow_and_update();
            if !is_open {
                return;
            }
            tokio::select! {
                changed = open.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.outbound.closed() => return,
            }
        }
    }
}

/// Matches channel replies to the dispatches waiting on them.
#[derive(Debug, Default)]
pub struct ChannelCorrelator {
    pending: Mutex<HashMap<OperationId, oneshot::Sender<ChannelReply>>>,
}

impl ChannelCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait slot for `id`. Registering again replaces the previous waiter.
    pub fn register(&self, id: OperationId) -> oneshot::Receiver<ChannelReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("lock poisoned").insert(id, tx);
        rx
    }

    /// Hand a reply to its waiter. Returns false for unknown request ids.
    pub fn deliver(&self, reply: ChannelReply) -> bool {
        let waiter = self
            .pending
            .lock()
            .expect("lock poisoned")
            .remove(&reply.request_id);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(request_id = %reply.request_id, "Reply for unknown request");
                false
            }
        }
    }

    pub fn cancel(&self, id: &OperationId) {
        self.pending.lock().expect("lock poisoned").remove(id);
    }

    /// Drop every waiter; they observe a closed channel.
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock().expect("lock poisoned");
        let cancelled = pending.len();
        pending.clear();
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("lock poisoned").len()
    }
}
