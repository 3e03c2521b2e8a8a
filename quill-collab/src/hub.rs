//! In-process transport.
//!
//! [`LocalHub`] serves channels straight out of a [`RoomManager`], so
//! several sessions in one process (or one test) collaborate without a
//! network. Each subscription runs a small task that moves commands into
//! the room and room events out to the subscriber.
//!
//! The hub can be taken offline and back to exercise degraded mode: going
//! offline closes every subscription (`Closed`) and drops its presence;
//! coming back rejoins and reports `Subscribed`.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::broadcast::{Room, RoomEvent, RoomManager};
use crate::error::TransportError;
use crate::transport::{Channel, ChannelCommand, ChannelEvent, ChannelSender, Transport};

const DEFAULT_CAPACITY: usize = 256;

pub struct LocalHub {
    rooms: Arc<RoomManager>,
    link: watch::Sender<bool>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how far a subscriber may lag before losing events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (link, _) = watch::channel(true);
        Self {
            rooms: Arc::new(RoomManager::new(capacity)),
            link,
        }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn is_online(&self) -> bool {
        *self.link.borrow()
    }

    /// Simulate losing (`false`) or regaining (`true`) the messaging
    /// service.
    pub fn set_online(&self, online: bool) {
        log::info!("Local hub {}", if online { "online" } else { "offline" });
        self.link.send_replace(online);
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalHub {
    fn subscribe(&self, topic: &str, presence_key: &str) -> Result<Channel, TransportError> {
        if !self.is_online() {
            return Err(TransportError::Unavailable("hub offline".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let subscription = Subscription {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            presence_key: presence_key.to_string(),
            rooms: self.rooms.clone(),
            commands: command_rx,
            events: event_tx,
            link: self.link.subscribe(),
        };
        runtime.spawn(subscription.run());

        Ok(Channel::new(ChannelSender::new(topic, command_tx), event_rx))
    }
}

/// Why an attached subscription stopped.
enum Detach {
    /// Unsubscribed or the subscriber went away.
    Finished,
    /// The hub went offline.
    Offline,
}

struct Subscription {
    id: Uuid,
    topic: String,
    presence_key: String,
    rooms: Arc<RoomManager>,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    link: watch::Receiver<bool>,
}

impl Subscription {
    async fn run(mut self) {
        loop {
            let (room, rx, snapshot) = self
                .rooms
                .join(&self.topic, self.id, self.presence_key.as_str())
                .await;
            let _ = self.events.send(ChannelEvent::Subscribed);
            let _ = self.events.send(ChannelEvent::PresenceSync(snapshot));

            let detach = self.attached(&room, rx).await;
            room.leave(&self.id).await;
            self.rooms.remove_if_empty(&self.topic).await;

            match detach {
                Detach::Finished => return,
                Detach::Offline => {
                    let _ = self.events.send(ChannelEvent::Closed {
                        reason: "hub offline".into(),
                    });
                    if !self.detached().await {
                        return;
                    }
                }
            }
        }
    }

    async fn attached(&mut self, room: &Arc<Room>, mut rx: broadcast::Receiver<Arc<RoomEvent>>) -> Detach {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(ChannelCommand::Unsubscribe) => return Detach::Finished,
                    Some(ChannelCommand::Broadcast { event, payload }) => {
                        room.broadcast(self.id, event, payload);
                    }
                    Some(ChannelCommand::Track(payload)) => {
                        room.track(&self.id, payload).await;
                    }
                    Some(ChannelCommand::Untrack) => {
                        room.untrack(&self.id).await;
                    }
                },
                event = rx.recv() => match event {
                    Ok(event) => {
                        if let Some(ev) = event.for_member(self.id) {
                            if self.events.send(ev).is_err() {
                                return Detach::Finished;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Subscriber on {} lagged by {n} events", self.topic);
                        room.record_dropped(n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Detach::Finished,
                },
                changed = self.link.changed() => {
                    if changed.is_err() {
                        return Detach::Finished;
                    }
                    if !*self.link.borrow_and_update() {
                        return Detach::Offline;
                    }
                }
            }
        }
    }

    /// Wait for the hub to come back, dropping commands meanwhile. Returns
    /// `false` if the subscription ended instead.
    async fn detached(&mut self) -> bool {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(ChannelCommand::Unsubscribe) => return false,
                    Some(_) => log::trace!("Hub offline, dropping command on {}", self.topic),
                },
                changed = self.link.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    if *self.link.borrow_and_update() {
                        return true;
                    }
                }
            }
        }
    }
}
