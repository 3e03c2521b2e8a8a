//! Per-topic fan-out with presence tracking.
//!
//! Every topic gets one [`Room`]. Members share a tokio broadcast channel;
//! each event is sent once and every member's receiver filters out its own
//! broadcasts, so a message reaches the N-1 other members. A member that
//! falls more than `capacity` events behind loses the oldest ones, which the
//! protocol above treats like any other lost message.
//!
//! The room also keeps the presence map: one optional tracked payload per
//! member, grouped by presence key. Any change publishes the full map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::transport::{ChannelEvent, PresenceSnapshot};

/// Identifies one subscription to a room.
pub type MemberId = Uuid;

/// Event published to every member of a room.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Broadcast {
        from: MemberId,
        event: String,
        payload: Value,
    },
    PresenceSync(PresenceSnapshot),
    PresenceJoin { key: String },
    PresenceLeave { key: String },
}

impl RoomEvent {
    /// The channel event `member` should see, if any.
    pub fn for_member(&self, member: MemberId) -> Option<ChannelEvent> {
        match self {
            RoomEvent::Broadcast { from, .. } if *from == member => None,
            RoomEvent::Broadcast { event, payload, .. } => Some(ChannelEvent::Broadcast {
                event: event.clone(),
                payload: payload.clone(),
            }),
            RoomEvent::PresenceSync(snapshot) => Some(ChannelEvent::PresenceSync(snapshot.clone())),
            RoomEvent::PresenceJoin { key } => Some(ChannelEvent::PresenceJoin { key: key.clone() }),
            RoomEvent::PresenceLeave { key } => Some(ChannelEvent::PresenceLeave { key: key.clone() }),
        }
    }
}

/// Statistics for monitoring room health.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub members: usize,
}

#[derive(Debug)]
struct Member {
    presence_key: String,
    /// Tracked payload and the sequence number it was tracked at.
    tracked: Option<(u64, Value)>,
}

#[derive(Debug, Default)]
struct Members {
    by_id: HashMap<MemberId, Member>,
    track_seq: u64,
}

impl Members {
    fn snapshot(&self) -> PresenceSnapshot {
        let mut entries: Vec<(&str, u64, &Value)> = self
            .by_id
            .values()
            .filter_map(|m| {
                m.tracked
                    .as_ref()
                    .map(|(seq, v)| (m.presence_key.as_str(), *seq, v))
            })
            .collect();
        entries.sort_by_key(|(_, seq, _)| *seq);

        let mut snapshot = PresenceSnapshot::new();
        for (key, _, value) in entries {
            snapshot.entry(key.to_string()).or_default().push(value.clone());
        }
        snapshot
    }

    fn key_is_present(&self, key: &str) -> bool {
        self.by_id
            .values()
            .any(|m| m.presence_key == key && m.tracked.is_some())
    }
}

/// A broadcast room for a single topic.
pub struct Room {
    topic: String,
    sender: broadcast::Sender<Arc<RoomEvent>>,
    members: RwLock<Members>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl Room {
    /// `capacity` is how many events a member may lag behind before it
    /// starts losing them.
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            topic: topic.into(),
            sender,
            members: RwLock::new(Members::default()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a member. Returns its receiver and the presence map as of the
    /// moment it joined; every later change arrives on the receiver.
    pub async fn join(
        &self,
        id: MemberId,
        presence_key: impl Into<String>,
    ) -> (broadcast::Receiver<Arc<RoomEvent>>, PresenceSnapshot) {
        let mut members = self.members.write().await;
        members.by_id.insert(
            id,
            Member {
                presence_key: presence_key.into(),
                tracked: None,
            },
        );
        (self.sender.subscribe(), members.snapshot())
    }

    /// Remove a member, withdrawing its presence. Returns `false` if it was
    /// not a member.
    pub async fn leave(&self, id: &MemberId) -> bool {
        let mut members = self.members.write().await;
        let Some(member) = members.by_id.remove(id) else {
            return false;
        };
        if member.tracked.is_some() {
            self.presence_changed(&members, &member.presence_key, false);
        }
        true
    }

    /// Set a member's presence payload.
    pub async fn track(&self, id: &MemberId, payload: Value) -> bool {
        let mut members = self.members.write().await;
        members.track_seq += 1;
        let seq = members.track_seq;

        let Some(key) = members.by_id.get(id).map(|m| m.presence_key.clone()) else {
            return false;
        };
        let joined = !members.key_is_present(&key);
        if let Some(member) = members.by_id.get_mut(id) {
            member.tracked = Some((seq, payload));
        }
        self.presence_changed(&members, &key, joined);
        true
    }

    /// Withdraw a member's presence payload.
    pub async fn untrack(&self, id: &MemberId) -> bool {
        let mut members = self.members.write().await;
        let Some(member) = members.by_id.get_mut(id) else {
            return false;
        };
        if member.tracked.take().is_none() {
            return true;
        }
        let key = member.presence_key.clone();
        self.presence_changed(&members, &key, false);
        true
    }

    /// Fan a broadcast out to every member except `from`.
    ///
    /// Returns the number of receivers the event was queued for, the sender
    /// included.
    pub fn broadcast(&self, from: MemberId, event: impl Into<String>, payload: Value) -> usize {
        self.publish(RoomEvent::Broadcast {
            from,
            event: event.into(),
            payload,
        })
    }

    /// Count events a lagging member lost.
    pub fn record_dropped(&self, n: u64) {
        self.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.by_id.len()
    }

    pub async fn presence(&self) -> PresenceSnapshot {
        self.members.read().await.snapshot()
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            members: self.member_count().await,
        }
    }

    /// Publish join/leave for `key` and the new presence map. Called with the
    /// member write lock held so snapshots go out in order.
    fn presence_changed(&self, members: &Members, key: &str, joined: bool) {
        if joined {
            self.publish(RoomEvent::PresenceJoin {
                key: key.to_string(),
            });
        } else if !members.key_is_present(key) {
            self.publish(RoomEvent::PresenceLeave {
                key: key.to_string(),
            });
        }
        self.publish(RoomEvent::PresenceSync(members.snapshot()));
    }

    fn publish(&self, event: RoomEvent) -> usize {
        let count = self.sender.send(Arc::new(event)).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }
}

/// Maps topics to rooms.
///
/// Topics are isolated: a broadcast never leaves its room.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for `topic`.
    pub async fn get_or_create(&self, topic: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(topic) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(topic.to_string())
            .or_insert_with(|| {
                log::debug!("Opening room {topic}");
                Arc::new(Room::new(topic, self.default_capacity))
            })
            .clone()
    }

    /// Join `topic` as `id`, creating its room if needed.
    ///
    /// The map stays locked until the member is in, so a concurrent
    /// `remove_if_empty` cannot close the room underneath the new member.
    pub async fn join(
        &self,
        topic: &str,
        id: MemberId,
        presence_key: &str,
    ) -> (Arc<Room>, broadcast::Receiver<Arc<RoomEvent>>, PresenceSnapshot) {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(topic.to_string())
            .or_insert_with(|| {
                log::debug!("Opening room {topic}");
                Arc::new(Room::new(topic, self.default_capacity))
            })
            .clone();
        let (rx, snapshot) = room.join(id, presence_key).await;
        (room, rx, snapshot)
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(topic).cloned()
    }

    /// Remove the room for `topic` if nobody is in it.
    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(topic) {
            if room.member_count().await == 0 {
                rooms.remove(topic);
                log::debug!("Closed empty room {topic}");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn next(rx: &mut broadcast::Receiver<Arc<RoomEvent>>, me: MemberId) -> Option<ChannelEvent> {
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if let Some(ev) = event.for_member(me) {
                        return Some(ev);
                    }
                }
                Err(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_room_join_leave() {
        let room = Room::new("t", 16);
        let id = Uuid::new_v4();
        let (_rx, snapshot) = room.join(id, "alice").await;
        assert!(snapshot.is_empty());
        assert_eq!(room.member_count().await, 1);

        assert!(room.leave(&id).await);
        assert!(!room.leave(&id).await);
        assert_eq!(room.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let room = Room::new("t", 16);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (mut rx_a, _) = room.join(a, "a").await;
        let (mut rx_b, _) = room.join(b, "b").await;
        let (mut rx_c, _) = room.join(c, "c").await;

        let count = room.broadcast(a, "field_unlocked", json!({ "field_name": "title" }));
        assert_eq!(count, 3);

        assert!(next(&mut rx_a, a).await.is_none());
        for (rx, id) in [(&mut rx_b, b), (&mut rx_c, c)] {
            match next(rx, id).await {
                Some(ChannelEvent::Broadcast { event, .. }) => assert_eq!(event, "field_unlocked"),
                other => panic!("expected broadcast, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_track_publishes_join_and_sync() {
        let room = Room::new("t", 16);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (mut rx_b, _) = room.join(b, "bob").await;
        room.join(a, "alice").await;

        room.track(&a, json!({ "user_id": "alice" })).await;
        assert_eq!(
            next(&mut rx_b, b).await,
            Some(ChannelEvent::PresenceJoin { key: "alice".into() })
        );
        match next(&mut rx_b, b).await {
            Some(ChannelEvent::PresenceSync(snapshot)) => {
                assert_eq!(snapshot["alice"], vec![json!({ "user_id": "alice" })]);
            }
            other => panic!("expected sync, got {other:?}"),
        }

        // Re-tracking is not a new join.
        room.track(&a, json!({ "user_id": "alice", "current_field": "title" })).await;
        assert!(matches!(next(&mut rx_b, b).await, Some(ChannelEvent::PresenceSync(_))));
    }

    #[tokio::test]
    async fn test_shared_key_leaves_with_last_member() {
        let room = Room::new("t", 16);
        let (tab1, tab2, watcher) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        room.join(tab1, "alice").await;
        room.join(tab2, "alice").await;
        room.track(&tab1, json!(1)).await;
        room.track(&tab2, json!(2)).await;
        assert_eq!(room.presence().await["alice"], vec![json!(1), json!(2)]);

        let (mut rx, _) = room.join(watcher, "w").await;
        room.leave(&tab1).await;
        assert!(matches!(next(&mut rx, watcher).await, Some(ChannelEvent::PresenceSync(_))));

        room.untrack(&tab2).await;
        assert_eq!(
            next(&mut rx, watcher).await,
            Some(ChannelEvent::PresenceLeave { key: "alice".into() })
        );
        assert!(room.presence().await.is_empty());
    }

    #[tokio::test]
    async fn test_join_returns_current_presence() {
        let room = Room::new("t", 16);
        let a = Uuid::new_v4();
        room.join(a, "alice").await;
        room.track(&a, json!({ "user_id": "alice" })).await;

        let (_rx, snapshot) = room.join(Uuid::new_v4(), "bob").await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("alice"));
    }

    #[tokio::test]
    async fn test_room_stats() {
        let room = Room::new("t", 16);
        let a = Uuid::new_v4();
        let (_rx, _) = room.join(a, "a").await;
        room.broadcast(a, "e", json!(null));
        room.broadcast(a, "e", json!(null));
        room.record_dropped(3);

        let stats = room.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.members, 1);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let room1 = manager.get_or_create("article:1:locks").await;
        let room2 = manager.get_or_create("article:1:locks").await;
        assert!(Arc::ptr_eq(&room1, &room2));

        manager.get_or_create("article:1:updates").await;
        assert_eq!(manager.room_count().await, 2);
        assert_eq!(
            manager.active_topics().await,
            vec!["article:1:locks".to_string(), "article:1:updates".to_string()]
        );
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let id = Uuid::new_v4();
        let (room, _rx, snapshot) = manager.join("t", id, "a").await;
        assert!(snapshot.is_empty());
        assert!(Arc::ptr_eq(&room, &manager.get("t").await.unwrap()));

        assert!(!manager.remove_if_empty("t").await);
        room.leave(&id).await;
        assert!(manager.remove_if_empty("t").await);
        assert_eq!(manager.room_count().await, 0);
    }
}
