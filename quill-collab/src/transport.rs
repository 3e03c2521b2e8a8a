//! Boundary with the real-time messaging service.
//!
//! A [`Transport`] hands out one [`Channel`] per topic. Each channel is a
//! pair of unbounded queues: commands flow out (broadcast, presence track),
//! events flow in (broadcasts from others, presence snapshots, lifecycle).
//! Delivery is fire-and-forget; callers must tolerate duplicates, loss and
//! reordering.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::messages::{BroadcastMessage, PresencePayload};

/// Full presence map of a topic: presence key → tracked payloads, oldest
/// first.
pub type PresenceSnapshot = HashMap<String, Vec<Value>>;

/// Outgoing request on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    Broadcast { event: String, payload: Value },
    Track(Value),
    Untrack,
    Unsubscribe,
}

/// Incoming notification on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The subscription is live (initially, or again after a reconnect).
    Subscribed,
    Broadcast { event: String, payload: Value },
    PresenceSync(PresenceSnapshot),
    PresenceJoin { key: String },
    PresenceLeave { key: String },
    /// The transport dropped the subscription.
    Closed { reason: String },
}

/// Source of channels. Implemented by [`LocalHub`](crate::hub::LocalHub) and
/// [`RelayTransport`](crate::client::RelayTransport).
pub trait Transport: Send + Sync {
    /// Subscribe to `topic`, identifying this subscriber's presence entries
    /// by `presence_key`.
    fn subscribe(&self, topic: &str, presence_key: &str) -> Result<Channel, TransportError>;
}

/// Cloneable sending half of a channel.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    topic: Arc<str>,
    tx: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelSender {
    pub fn new(topic: impl Into<Arc<str>>, tx: mpsc::UnboundedSender<ChannelCommand>) -> Self {
        Self {
            topic: topic.into(),
            tx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Queue a command. Returns `false` if the transport side is gone.
    pub fn send(&self, command: ChannelCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A subscribed channel.
#[derive(Debug)]
pub struct Channel {
    sender: ChannelSender,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    pub fn new(sender: ChannelSender, events: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self { sender, events }
    }

    pub fn topic(&self) -> &str {
        self.sender.topic()
    }

    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (ChannelSender, mpsc::UnboundedReceiver<ChannelEvent>) {
        (self.sender, self.events)
    }
}

/// Sending halves of a session's three channels.
///
/// While offline every send is dropped; the protocol treats that exactly
/// like a lost message.
#[derive(Debug, Default)]
pub struct Outbox {
    presence: Option<ChannelSender>,
    locks: Option<ChannelSender>,
    updates: Option<ChannelSender>,
    online: bool,
}

impl Outbox {
    pub fn new(presence: ChannelSender, locks: ChannelSender, updates: ChannelSender) -> Self {
        Self {
            presence: Some(presence),
            locks: Some(locks),
            updates: Some(updates),
            online: true,
        }
    }

    /// An outbox with no channels behind it.
    pub fn offline() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.online && self.presence.is_some()
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn broadcast_lock(&self, msg: &BroadcastMessage) {
        self.broadcast(self.locks.as_ref(), msg);
    }

    pub fn broadcast_update(&self, msg: &BroadcastMessage) {
        self.broadcast(self.updates.as_ref(), msg);
    }

    pub fn track(&self, payload: &PresencePayload) {
        let Some(sender) = self.live(self.presence.as_ref()) else {
            return;
        };
        match serde_json::to_value(payload) {
            Ok(value) => {
                sender.send(ChannelCommand::Track(value));
            }
            Err(e) => log::warn!("Failed to encode presence payload: {e}"),
        }
    }

    pub fn untrack(&self) {
        if let Some(sender) = self.live(self.presence.as_ref()) {
            sender.send(ChannelCommand::Untrack);
        }
    }

    /// Unsubscribe all channels and forget them. Later sends are dropped.
    pub fn close(&mut self) {
        for sender in [self.presence.take(), self.locks.take(), self.updates.take()]
            .into_iter()
            .flatten()
        {
            sender.send(ChannelCommand::Unsubscribe);
        }
        self.online = false;
    }

    fn live<'a>(&self, sender: Option<&'a ChannelSender>) -> Option<&'a ChannelSender> {
        if self.online {
            sender
        } else {
            None
        }
    }

    fn broadcast(&self, sender: Option<&ChannelSender>, msg: &BroadcastMessage) {
        let Some(sender) = self.live(sender) else {
            log::trace!("Offline, dropping {} for {}", msg.event(), msg.field_name());
            return;
        };
        match msg.to_payload() {
            Ok(payload) => {
                sender.send(ChannelCommand::Broadcast {
                    event: msg.event().to_string(),
                    payload,
                });
            }
            Err(e) => log::warn!("Failed to encode {} payload: {e}", msg.event()),
        }
    }
}

/// Receiving ends paired with an [`Outbox`], for exercising components
/// without a transport.
#[cfg(test)]
pub(crate) struct OutboxTap {
    pub presence: mpsc::UnboundedReceiver<ChannelCommand>,
    pub locks: mpsc::UnboundedReceiver<ChannelCommand>,
    pub updates: mpsc::UnboundedReceiver<ChannelCommand>,
}

#[cfg(test)]
impl OutboxTap {
    pub fn new() -> (Outbox, Self) {
        let (ptx, presence) = mpsc::unbounded_channel();
        let (ltx, locks) = mpsc::unbounded_channel();
        let (utx, updates) = mpsc::unbounded_channel();
        let outbox = Outbox::new(
            ChannelSender::new("t:presence", ptx),
            ChannelSender::new("t:locks", ltx),
            ChannelSender::new("t:updates", utx),
        );
        (outbox, Self { presence, locks, updates })
    }

    pub fn drain(rx: &mut mpsc::UnboundedReceiver<ChannelCommand>) -> Vec<ChannelCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    /// Decoded broadcasts queued on the lock channel.
    pub fn lock_messages(&mut self) -> Vec<BroadcastMessage> {
        decode_all(Self::drain(&mut self.locks))
    }

    /// Decoded broadcasts queued on the update channel.
    pub fn update_messages(&mut self) -> Vec<BroadcastMessage> {
        decode_all(Self::drain(&mut self.updates))
    }
}

#[cfg(test)]
fn decode_all(commands: Vec<ChannelCommand>) -> Vec<BroadcastMessage> {
    commands
        .into_iter()
        .filter_map(|cmd| match cmd {
            ChannelCommand::Broadcast { event, payload } => {
                BroadcastMessage::from_broadcast(&event, &payload).ok().flatten()
            }
            _ => None,
        })
        .collect()
}
