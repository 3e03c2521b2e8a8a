//! One editing session: three channels, one pump.
//!
//! ```text
//!  presence ─┐                         ┌─► PresenceAggregator
//!  locks ────┼─► pump task ─► SessionState ─► LockManager
//!  updates ──┘      ▲                  └─► UpdateExchange
//!                   │ Notify                     │
//!  FieldBinding ────┘ (local calls)              ▼
//!                                             Outbox
//! ```
//!
//! All state sits in one [`SessionState`] behind a mutex that is never held
//! across an `.await`. Transport events, local calls and deadlines each take
//! the lock for one synchronous transition, so no handler interleaves with
//! another. Deadlines are plain values inside the components; the pump
//! sleeps until the earliest one and dispatches whatever is due.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::binding::{FieldBinding, FieldHandle, FieldStatus};
use crate::clock::Clock;
use crate::config::CollabConfig;
use crate::lock::{FieldLockState, LockManager};
use crate::messages::{BroadcastMessage, FieldUpdate, LocalUser, LockHolder};
use crate::presence::{Participant, PresenceAggregator};
use crate::transport::{ChannelCommand, ChannelEvent, Outbox, Transport};
use crate::update::{RemoteOutcome, Resolution, UpdateExchange};

/// The document a session edits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionId {
    Article(String),
    /// A document that does not exist yet.
    Draft(Uuid),
}

impl SessionId {
    pub fn article(id: impl Into<String>) -> Self {
        SessionId::Article(id.into())
    }

    /// A fresh draft id.
    pub fn draft() -> Self {
        SessionId::Draft(Uuid::new_v4())
    }

    pub fn topic(&self, prefix: &str, kind: ChannelKind) -> String {
        format!("{prefix}:{self}:{}", kind.as_str())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionId::Article(id) => f.write_str(id),
            SessionId::Draft(id) => write!(f, "draft-{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Presence,
    Locks,
    Updates,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Presence, ChannelKind::Locks, ChannelKind::Updates];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Presence => "presence",
            ChannelKind::Locks => "locks",
            ChannelKind::Updates => "updates",
        }
    }
}

/// Everything the session knows, mutated one transition at a time.
struct SessionState {
    clock: Clock,
    outbox: Outbox,
    presence: PresenceAggregator,
    locks: LockManager,
    updates: UpdateExchange,
    /// Channels currently reported down by the transport.
    down: HashSet<ChannelKind>,
    closed: bool,
}

impl SessionState {
    fn next_deadline(&self) -> Option<Instant> {
        [
            self.presence.next_deadline(),
            self.locks.next_deadline(),
            self.updates.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn on_deadline(&mut self, now: Instant) {
        let wall = self.clock.wall_at(now);
        self.updates.on_deadline(now, wall, &self.outbox);
        let expired = self.locks.on_deadline(now, wall, &self.outbox);
        for field in expired {
            if self.updates.focused() == Some(field.as_str()) {
                log::warn!("Lease on {field} ran out while it is still being edited");
            }
        }
        self.presence.on_deadline(now, wall, &self.outbox);
    }

    fn on_event(&mut self, kind: ChannelKind, event: ChannelEvent) {
        match event {
            ChannelEvent::Subscribed => self.on_subscribed(kind),
            ChannelEvent::Closed { reason } => self.on_closed(kind, &reason),
            ChannelEvent::Broadcast { event, payload } => self.on_broadcast(kind, &event, &payload),
            ChannelEvent::PresenceSync(snapshot) => {
                if kind == ChannelKind::Presence {
                    self.presence.on_sync(&snapshot);
                }
            }
            ChannelEvent::PresenceJoin { key } => log::debug!("{key} joined {}", kind.as_str()),
            ChannelEvent::PresenceLeave { key } => log::debug!("{key} left {}", kind.as_str()),
        }
    }

    fn on_subscribed(&mut self, kind: ChannelKind) {
        if !self.down.remove(&kind) || !self.down.is_empty() {
            return;
        }
        log::info!("Collaboration restored");
        self.outbox.set_online(true);
        let now = self.clock.instant();
        self.presence.announce(now, self.clock.wall_at(now), &self.outbox);
    }

    fn on_closed(&mut self, kind: ChannelKind, reason: &str) {
        let was_online = self.down.is_empty();
        self.down.insert(kind);
        if was_online {
            log::warn!("Collaboration lost ({} channel: {reason}), editing offline", kind.as_str());
            self.outbox.set_online(false);
            self.locks.clear_remote();
            self.presence.clear_remote();
        }
    }

    fn on_broadcast(&mut self, kind: ChannelKind, event: &str, payload: &Value) {
        let msg = match BroadcastMessage::from_broadcast(event, payload) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                log::trace!("Ignoring unknown event {event} on {}", kind.as_str());
                return;
            }
            Err(e) => {
                log::warn!("Dropping malformed {event} payload: {e}");
                return;
            }
        };
        match &msg {
            BroadcastMessage::Locked(_) | BroadcastMessage::Unlocked { .. } => {
                let wall = self.clock.now();
                self.locks.apply_remote(&msg, wall);
            }
            BroadcastMessage::Updated(update) => {
                if self.updates.apply_remote(update) == RemoteOutcome::Pending {
                    log::info!("{} changed {} while it is being edited", update.user_id, update.field_name);
                }
            }
        }
    }

    fn lock_field(&mut self, field: &str) -> bool {
        let now = self.clock.instant();
        let wall = self.clock.wall_at(now);
        if !self.locks.lock_field(field, now, wall, &self.outbox) {
            return false;
        }
        self.presence.track(Some(field.to_string()), now);
        true
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let wall = self.clock.now();
        self.updates.flush_all(wall, &self.outbox);
        self.updates.discard_outgoing();
        self.locks.release_all(&self.outbox);
        self.presence.leave(&self.outbox);
        self.outbox.close();
    }
}

/// A participant's view of one collaboratively edited document.
///
/// Must be created inside a Tokio runtime. Dropping the session tears it
/// down like [`close`](CollabSession::close).
pub struct CollabSession {
    id: SessionId,
    user: LocalUser,
    state: Arc<Mutex<SessionState>>,
    notify: Arc<Notify>,
    pump: Option<JoinHandle<()>>,
}

impl CollabSession {
    /// Subscribe the three channels of `id` and start the pump.
    ///
    /// If the transport refuses any channel the session runs without
    /// collaboration: every field is free and nothing is sent.
    pub fn join(transport: &dyn Transport, id: SessionId, user: LocalUser, config: CollabConfig) -> Self {
        let clock = Clock::new();
        let mut receivers: Vec<(ChannelKind, mpsc::UnboundedReceiver<ChannelEvent>)> = Vec::new();
        let mut senders = Vec::new();
        let mut failure = None;

        for kind in ChannelKind::ALL {
            let topic = id.topic(&config.topic_prefix, kind);
            match transport.subscribe(&topic, &user.user_id) {
                Ok(channel) => {
                    let (sender, events) = channel.into_parts();
                    senders.push(sender);
                    receivers.push((kind, events));
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let outbox = match failure {
            None => {
                let mut it = senders.into_iter();
                match (it.next(), it.next(), it.next()) {
                    (Some(p), Some(l), Some(u)) => Outbox::new(p, l, u),
                    _ => Outbox::offline(),
                }
            }
            Some(e) => {
                log::warn!("Session {id} running without collaboration: {e}");
                for sender in senders {
                    sender.send(ChannelCommand::Unsubscribe);
                }
                receivers.clear();
                Outbox::offline()
            }
        };

        let mut state = SessionState {
            clock,
            outbox,
            presence: PresenceAggregator::new(
                user.clone(),
                config.presence_debounce(),
                config.presence_heartbeat(),
            ),
            locks: LockManager::new(user.clone(), config.lock_ttl(), config.lease_policy),
            updates: UpdateExchange::new(
                user.clone(),
                config.default_policy,
                config.field_policies.clone(),
            ),
            down: HashSet::new(),
            closed: false,
        };

        if state.outbox.is_online() {
            let now = state.clock.instant();
            let wall = state.clock.wall_at(now);
            state.presence.announce(now, wall, &state.outbox);
            log::info!("Joined session {id} as {}", user.user_email);
        }

        let state = Arc::new(Mutex::new(state));
        let notify = Arc::new(Notify::new());
        let pump = tokio::spawn(pump(state.clone(), notify.clone(), receivers));

        Self {
            id,
            user,
            state,
            notify,
            pump: Some(pump),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn local_user(&self) -> &LocalUser {
        &self.user
    }

    /// Whether the session currently reaches the other participants.
    pub fn is_online(&self) -> bool {
        self.state().outbox.is_online()
    }

    /// A binding for one field widget.
    pub fn handle(self: &Arc<Self>, field: impl Into<String>) -> FieldHandle {
        FieldHandle::new(self.clone(), field)
    }

    /// Other participants, ordered by email.
    pub fn active_users(&self) -> Vec<Participant> {
        self.state().presence.active_users()
    }

    pub fn editors_of(&self, field: &str) -> Vec<Participant> {
        self.state().presence.editors_of(field)
    }

    /// Announce which field the local user is on. Debounced.
    pub fn track(&self, current_field: Option<String>) {
        self.mutate(|s| {
            let now = s.clock.instant();
            s.presence.track(current_field, now);
        });
    }

    pub fn lock_state(&self, field: &str) -> FieldLockState {
        let state = self.state();
        state.locks.lock_state(field, state.clock.now())
    }

    /// Fields the local user holds.
    pub fn held_fields(&self) -> Vec<String> {
        self.state().locks.held_fields()
    }

    /// Current local value of `field`.
    pub fn field_value(&self, field: &str) -> Option<Value> {
        self.state().updates.field_value(field).cloned()
    }

    /// Seed `field` with a stored value without broadcasting it.
    pub fn load_value(&self, field: &str, value: Value) {
        self.state().updates.load_value(field, value);
    }

    /// Send the pending emission of `field` now.
    pub fn flush_field(&self, field: &str) -> bool {
        self.mutate(|s| {
            let wall = s.clock.now();
            s.updates.flush_field(field, wall, &s.outbox)
        })
    }

    /// Drop the pending update of `field` without applying it.
    pub fn dismiss_pending(&self, field: &str) -> Option<FieldUpdate> {
        self.state().updates.dismiss_pending(field)
    }

    /// Flush pending emissions, release held fields, leave presence and
    /// unsubscribe. Nothing is sent afterwards.
    pub fn close(&self) {
        let was_open = {
            let mut state = self.state();
            let was_open = !state.closed;
            state.teardown();
            was_open
        };
        if was_open {
            log::info!("Left session {}", self.id);
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a local transition and wake the pump so it sees new deadlines.
    fn mutate<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let result = {
            let mut state = self.state();
            f(&mut state)
        };
        self.notify.notify_one();
        result
    }
}

impl FieldBinding for CollabSession {
    fn is_field_locked(&self, field: &str) -> bool {
        let state = self.state();
        state.locks.is_field_locked(field, state.clock.now())
    }

    fn lock_field(&self, field: &str) -> bool {
        self.mutate(|s| s.lock_field(field))
    }

    fn unlock_field(&self, field: &str) {
        self.mutate(|s| s.locks.unlock_field(field, &s.outbox));
    }

    fn broadcast_field_update(&self, field: &str, value: Value) {
        self.mutate(|s| {
            let now = s.clock.instant();
            let wall = s.clock.wall_at(now);
            s.updates.broadcast_field_update(field, value, now, wall, &s.outbox);
            s.locks.on_activity(field, now, wall, &s.outbox);
        });
    }

    fn get_field_locker(&self, field: &str) -> Option<LockHolder> {
        let state = self.state();
        state.locks.get_field_locker(field, state.clock.now())
    }

    fn pending_updates(&self) -> Vec<FieldUpdate> {
        self.state().updates.pending_updates()
    }

    fn pending_update(&self, field: &str) -> Option<FieldUpdate> {
        self.state().updates.pending_update(field).cloned()
    }

    fn field_status(&self, field: &str) -> FieldStatus {
        let state = self.state();
        let wall = state.clock.now();
        FieldStatus {
            held_locally: state.locks.holds(field, wall),
            holder: state.locks.get_field_locker(field, wall),
            pending: state.updates.pending_update(field).cloned(),
        }
    }

    fn resolve_conflict(&self, field: &str, resolution: Resolution) -> bool {
        self.mutate(|s| {
            let wall = s.clock.now();
            s.updates.resolve(field, resolution, wall, &s.outbox)
        })
    }

    fn begin_edit(&self, field: &str) -> bool {
        self.mutate(|s| {
            if !s.lock_field(field) {
                return false;
            }
            s.updates.focus(field);
            true
        })
    }

    fn end_edit(&self, field: &str, final_value: Value) {
        self.mutate(|s| {
            if s.updates.focused() != Some(field) {
                // Never got the field (read-only); nothing to commit.
                return;
            }
            let now = s.clock.instant();
            let wall = s.clock.wall_at(now);
            s.updates.commit_final(field, final_value, wall, &s.outbox);
            s.updates.unfocus(field);
            s.locks.unlock_field(field, &s.outbox);
            s.presence.track(None, now);
        });
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.close();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl fmt::Debug for CollabSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollabSession")
            .field("id", &self.id)
            .field("user", &self.user.user_email)
            .finish()
    }
}

enum Wake {
    Event(ChannelKind, Option<ChannelEvent>),
    Deadline,
    Nudge,
}

async fn next_event(rx: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>) -> Option<ChannelEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn pump(
    state: Arc<Mutex<SessionState>>,
    notify: Arc<Notify>,
    receivers: Vec<(ChannelKind, mpsc::UnboundedReceiver<ChannelEvent>)>,
) {
    let mut presence = None;
    let mut locks = None;
    let mut updates = None;
    for (kind, rx) in receivers {
        match kind {
            ChannelKind::Presence => presence = Some(rx),
            ChannelKind::Locks => locks = Some(rx),
            ChannelKind::Updates => updates = Some(rx),
        }
    }

    loop {
        let deadline = {
            let guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.closed {
                break;
            }
            guard.next_deadline()
        };

        let wake = tokio::select! {
            ev = next_event(&mut presence) => Wake::Event(ChannelKind::Presence, ev),
            ev = next_event(&mut locks) => Wake::Event(ChannelKind::Locks, ev),
            ev = next_event(&mut updates) => Wake::Event(ChannelKind::Updates, ev),
            _ = sleep_until(deadline) => Wake::Deadline,
            _ = notify.notified() => Wake::Nudge,
        };

        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.closed {
            break;
        }
        match wake {
            Wake::Event(kind, Some(event)) => guard.on_event(kind, event),
            Wake::Event(kind, None) => {
                // Transport side went away for good.
                match kind {
                    ChannelKind::Presence => presence = None,
                    ChannelKind::Locks => locks = None,
                    ChannelKind::Updates => updates = None,
                }
                guard.on_closed(kind, "transport dropped the channel");
            }
            Wake::Deadline => guard.on_deadline(Instant::now()),
            Wake::Nudge => {}
        }
    }
    log::debug!("Session pump stopped");
}
