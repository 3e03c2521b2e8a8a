//! Presence aggregation: who is attached to the session and which field
//! each participant is editing.
//!
//! ## Data flow
//!
//! ```text
//! focus / blur / lock acquired
//!       │
//!       ▼
//! PresenceAggregator::track()        (debounced: last call in window wins)
//!       │
//!       ▼  deadline elapses
//! Outbox::track(PresencePayload)     ──► transport presence map
//!                                              │
//!                                              ▼  presence-sync
//!                              PresenceAggregator::on_sync()  (replace-all)
//! ```
//!
//! Presence is a continuously refreshed snapshot, so nothing is retried: a
//! dropped announcement heals on the next change or heartbeat.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::messages::{LocalUser, PresencePayload};
use crate::transport::{Outbox, PresenceSnapshot};

/// Another participant attached to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    pub user_email: String,
    pub last_seen: DateTime<Utc>,
    pub current_field: Option<String>,
}

impl From<PresencePayload> for Participant {
    fn from(p: PresencePayload) -> Self {
        Self {
            user_id: p.user_id,
            user_email: p.user_email,
            last_seen: p.last_seen,
            current_field: p.current_field,
        }
    }
}

/// Local projection of the presence channel.
#[derive(Debug)]
pub struct PresenceAggregator {
    local: LocalUser,
    /// Other participants, by user id. Rebuilt on every sync.
    participants: HashMap<String, Participant>,
    /// Field most recently passed to `track`.
    current_field: Option<String>,
    /// Pending debounced announcement.
    flush_at: Option<Instant>,
    next_heartbeat: Option<Instant>,
    debounce: Duration,
    heartbeat: Duration,
}

impl PresenceAggregator {
    pub fn new(local: LocalUser, debounce: Duration, heartbeat: Duration) -> Self {
        Self {
            local,
            participants: HashMap::new(),
            current_field: None,
            flush_at: None,
            next_heartbeat: None,
            debounce,
            heartbeat,
        }
    }

    /// Schedule an announcement of the local participant.
    ///
    /// Calls inside the debounce window replace each other and push the
    /// announcement back.
    pub fn track(&mut self, current_field: Option<String>, now: Instant) {
        self.current_field = current_field;
        self.flush_at = Some(now + self.debounce);
    }

    /// Announce immediately, cancelling any pending debounced call.
    pub fn announce(&mut self, now: Instant, wall: DateTime<Utc>, outbox: &Outbox) {
        let payload = self.local_payload(wall);
        log::debug!(
            "Presence: {} editing {:?}",
            self.local.user_email,
            payload.current_field
        );
        outbox.track(&payload);
        self.flush_at = None;
        self.next_heartbeat = Some(now + self.heartbeat);
    }

    /// Flush the debounced announcement or the heartbeat if due.
    pub fn on_deadline(&mut self, now: Instant, wall: DateTime<Utc>, outbox: &Outbox) {
        let flush_due = self.flush_at.is_some_and(|at| at <= now);
        let heartbeat_due = self.next_heartbeat.is_some_and(|at| at <= now);
        if flush_due || heartbeat_due {
            self.announce(now, wall, outbox);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.flush_at, self.next_heartbeat) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Replace the participant set with the transport's snapshot.
    pub fn on_sync(&mut self, snapshot: &PresenceSnapshot) {
        let mut next: HashMap<String, Participant> = HashMap::new();

        for (key, entries) in snapshot {
            let Some(latest) = entries.last() else {
                continue;
            };
            let payload: PresencePayload = match serde_json::from_value(latest.clone()) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("Skipping malformed presence entry {key}: {e}");
                    continue;
                }
            };
            if payload.user_id == self.local.user_id {
                continue;
            }

            // The same user may be attached under several keys (tabs);
            // keep the freshest announcement.
            let participant = Participant::from(payload);
            match next.get(&participant.user_id) {
                Some(existing) if existing.last_seen >= participant.last_seen => {}
                _ => {
                    next.insert(participant.user_id.clone(), participant);
                }
            }
        }

        log::debug!("Presence sync: {} other participant(s)", next.len());
        self.participants = next;
    }

    /// Forget everyone else (transport lost).
    pub fn clear_remote(&mut self) {
        self.participants.clear();
    }

    /// Withdraw the local participant and cancel pending announcements.
    pub fn leave(&mut self, outbox: &Outbox) {
        outbox.untrack();
        self.flush_at = None;
        self.next_heartbeat = None;
    }

    /// Other participants, ordered by email.
    pub fn active_users(&self) -> Vec<Participant> {
        let mut users: Vec<Participant> = self.participants.values().cloned().collect();
        users.sort_by(|a, b| a.user_email.cmp(&b.user_email));
        users
    }

    /// Participants currently announcing `field`.
    pub fn editors_of(&self, field: &str) -> Vec<Participant> {
        self.active_users()
            .into_iter()
            .filter(|p| p.current_field.as_deref() == Some(field))
            .collect()
    }

    pub fn current_field(&self) -> Option<&str> {
        self.current_field.as_deref()
    }

    fn local_payload(&self, wall: DateTime<Utc>) -> PresencePayload {
        PresencePayload {
            user_id: self.local.user_id.clone(),
            user_email: self.local.user_email.clone(),
            last_seen: wall,
            current_field: self.current_field.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelCommand, OutboxTap};
    use serde_json::json;

    fn aggregator() -> PresenceAggregator {
        PresenceAggregator::new(
            LocalUser::new("me", "me@example.com"),
            Duration::from_millis(300),
            Duration::from_secs(30),
        )
    }

    fn entry(user_id: &str, email: &str, last_seen: &str, field: Option<&str>) -> serde_json::Value {
        let mut v = json!({
            "user_id": user_id,
            "user_email": email,
            "last_seen": last_seen,
        });
        if let Some(f) = field {
            v["current_field"] = json!(f);
        }
        v
    }

    #[test]
    fn test_sync_excludes_local_user() {
        let mut presence = aggregator();
        let mut snapshot = PresenceSnapshot::new();
        snapshot.insert("me".into(), vec![entry("me", "me@example.com", "2024-05-01T10:00:00Z", None)]);
        snapshot.insert(
            "bob".into(),
            vec![entry("bob", "bob@example.com", "2024-05-01T10:00:00Z", Some("title"))],
        );

        presence.on_sync(&snapshot);
        let users = presence.active_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_email, "bob@example.com");
        assert_eq!(users[0].current_field.as_deref(), Some("title"));
    }

    #[test]
    fn test_sync_replaces_previous_snapshot() {
        let mut presence = aggregator();
        let mut first = PresenceSnapshot::new();
        first.insert("bob".into(), vec![entry("bob", "bob@example.com", "2024-05-01T10:00:00Z", None)]);
        presence.on_sync(&first);

        let mut second = PresenceSnapshot::new();
        second.insert("carol".into(), vec![entry("carol", "carol@example.com", "2024-05-01T10:00:05Z", None)]);
        presence.on_sync(&second);

        let emails: Vec<String> = presence.active_users().into_iter().map(|p| p.user_email).collect();
        assert_eq!(emails, vec!["carol@example.com".to_string()]);
    }

    #[test]
    fn test_sync_uses_latest_entry_and_skips_garbage() {
        let mut presence = aggregator();
        let mut snapshot = PresenceSnapshot::new();
        snapshot.insert(
            "bob".into(),
            vec![
                entry("bob", "bob@example.com", "2024-05-01T10:00:00Z", Some("title")),
                entry("bob", "bob@example.com", "2024-05-01T10:00:09Z", Some("content")),
            ],
        );
        snapshot.insert("junk".into(), vec![json!({ "nope": true })]);
        snapshot.insert("empty".into(), vec![]);

        presence.on_sync(&snapshot);
        let users = presence.active_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].current_field.as_deref(), Some("content"));
    }

    #[test]
    fn test_same_user_under_two_keys_keeps_freshest() {
        let mut presence = aggregator();
        let mut snapshot = PresenceSnapshot::new();
        snapshot.insert("tab-1".into(), vec![entry("bob", "bob@example.com", "2024-05-01T10:00:00Z", Some("title"))]);
        snapshot.insert("tab-2".into(), vec![entry("bob", "bob@example.com", "2024-05-01T10:00:04Z", Some("summary"))]);

        presence.on_sync(&snapshot);
        let users = presence.active_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].current_field.as_deref(), Some("summary"));
    }

    #[test]
    fn test_editors_of_field() {
        let mut presence = aggregator();
        let mut snapshot = PresenceSnapshot::new();
        snapshot.insert("bob".into(), vec![entry("bob", "bob@example.com", "2024-05-01T10:00:00Z", Some("title"))]);
        snapshot.insert("carol".into(), vec![entry("carol", "carol@example.com", "2024-05-01T10:00:00Z", None)]);
        presence.on_sync(&snapshot);

        let editors = presence.editors_of("title");
        assert_eq!(editors.len(), 1);
        assert_eq!(editors[0].user_id, "bob");
        assert!(presence.editors_of("content").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_is_debounced_last_call_wins() {
        let (outbox, mut wire) = OutboxTap::new();
        let mut presence = aggregator();
        let t0 = Instant::now();

        presence.track(Some("title".into()), t0);
        presence.track(Some("summary".into()), t0 + Duration::from_millis(100));
        assert_eq!(presence.next_deadline(), Some(t0 + Duration::from_millis(400)));

        // Not yet due.
        presence.on_deadline(t0 + Duration::from_millis(300), Utc::now(), &outbox);
        assert!(OutboxTap::drain(&mut wire.presence).is_empty());

        presence.on_deadline(t0 + Duration::from_millis(400), Utc::now(), &outbox);
        let sent = OutboxTap::drain(&mut wire.presence);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            ChannelCommand::Track(v) => assert_eq!(v["current_field"], json!("summary")),
            other => panic!("expected track, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reannounces() {
        let (outbox, mut wire) = OutboxTap::new();
        let mut presence = aggregator();
        let t0 = Instant::now();

        presence.announce(t0, Utc::now(), &outbox);
        assert_eq!(presence.next_deadline(), Some(t0 + Duration::from_secs(30)));
        presence.on_deadline(t0 + Duration::from_secs(30), Utc::now(), &outbox);
        assert_eq!(OutboxTap::drain(&mut wire.presence).len(), 2);
    }

    #[test]
    fn test_leave_untracks_and_cancels() {
        let (outbox, mut wire) = OutboxTap::new();
        let mut presence = aggregator();
        presence.track(None, Instant::now());
        presence.leave(&outbox);
        assert!(presence.next_deadline().is_none());
        assert_eq!(OutboxTap::drain(&mut wire.presence), vec![ChannelCommand::Untrack]);
    }
}
