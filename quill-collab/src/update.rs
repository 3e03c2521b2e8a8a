//! Field update broadcast and merge.
//!
//! Outgoing, every local edit becomes the field's draft and is emitted per
//! the field's [`EmissionPolicy`]. Anything not yet emitted sits in
//! `outgoing` as the field's single pending emission until its deadline,
//! the next qualifying edit, or a flush.
//!
//! Incoming, remote values for fields the local user is not focused on are
//! merged straight into the read model. A remote value for the focused field
//! is parked as a pending update and left for the user to adjudicate; prose
//! is never merged automatically.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::EmissionPolicy;
use crate::messages::{value_len, BroadcastMessage, FieldUpdate, LocalUser};
use crate::transport::Outbox;

/// User decision on a pending update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite the local draft with the remote value.
    AcceptTheirs,
    /// Keep the local draft and re-broadcast it.
    KeepMine,
    /// Leave both values in place, unresolved.
    Ignore,
}

/// What happened to an incoming update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    SelfEcho,
    /// Older than an update already seen from the same sender.
    Stale,
    Merged,
    Pending,
}

#[derive(Debug, Clone)]
struct PendingEmission {
    value: Value,
    /// `None` for threshold-held values, which only leave on the next
    /// qualifying edit or a flush.
    due: Option<Instant>,
}

#[derive(Debug)]
pub struct UpdateExchange {
    local: LocalUser,
    default_policy: EmissionPolicy,
    policies: HashMap<String, EmissionPolicy>,
    /// Local read model / editing buffer.
    values: HashMap<String, Value>,
    last_sent: HashMap<String, Value>,
    outgoing: HashMap<String, PendingEmission>,
    /// Remote values parked while the field is focused.
    pending: HashMap<String, FieldUpdate>,
    /// Newest `updated_at` seen per (field, sender).
    seen: HashMap<(String, String), DateTime<Utc>>,
    focused: Option<String>,
}

impl UpdateExchange {
    pub fn new(
        local: LocalUser,
        default_policy: EmissionPolicy,
        policies: HashMap<String, EmissionPolicy>,
    ) -> Self {
        Self {
            local,
            default_policy,
            policies,
            values: HashMap::new(),
            last_sent: HashMap::new(),
            outgoing: HashMap::new(),
            pending: HashMap::new(),
            seen: HashMap::new(),
            focused: None,
        }
    }

    pub fn policy_for(&self, field: &str) -> EmissionPolicy {
        self.policies.get(field).copied().unwrap_or(self.default_policy)
    }

    pub fn focus(&mut self, field: &str) {
        self.focused = Some(field.to_string());
    }

    /// Clear focus if `field` is the focused one.
    pub fn unfocus(&mut self, field: &str) {
        if self.focused.as_deref() == Some(field) {
            self.focused = None;
        }
    }

    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    /// Record a local edit and emit it according to the field's policy.
    ///
    /// Returns `true` if a `field_updated` went out now.
    pub fn broadcast_field_update(
        &mut self,
        field: &str,
        value: Value,
        now: Instant,
        wall: DateTime<Utc>,
        outbox: &Outbox,
    ) -> bool {
        self.values.insert(field.to_string(), value.clone());

        match self.policy_for(field) {
            EmissionPolicy::Immediate => {
                self.emit(field, value, wall, outbox);
                true
            }
            EmissionPolicy::Threshold { min_len_delta } => {
                let emit_now = match self.last_sent.get(field) {
                    None => true,
                    Some(prev) if *prev == value => {
                        // Back to what others already have.
                        self.outgoing.remove(field);
                        return false;
                    }
                    Some(prev) => {
                        let delta = value_len(prev).abs_diff(value_len(&value));
                        delta > min_len_delta || delta == 0
                    }
                };
                if emit_now {
                    self.emit(field, value, wall, outbox);
                } else {
                    log::trace!("Holding small edit of {field}");
                    self.outgoing
                        .insert(field.to_string(), PendingEmission { value, due: None });
                }
                emit_now
            }
            EmissionPolicy::Windowed { quiet_ms } => {
                self.outgoing.insert(
                    field.to_string(),
                    PendingEmission {
                        value,
                        due: Some(now + Duration::from_millis(quiet_ms)),
                    },
                );
                false
            }
        }
    }

    /// Emit the field's pending value now. Returns `true` if one existed.
    pub fn flush_field(&mut self, field: &str, wall: DateTime<Utc>, outbox: &Outbox) -> bool {
        match self.outgoing.remove(field) {
            Some(pending) => {
                self.emit(field, pending.value, wall, outbox);
                true
            }
            None => false,
        }
    }

    /// Commit the final value of an edit session locally and broadcast it,
    /// superseding anything still pending for the field.
    pub fn commit_final(&mut self, field: &str, value: Value, wall: DateTime<Utc>, outbox: &Outbox) {
        self.values.insert(field.to_string(), value.clone());
        self.emit(field, value, wall, outbox);
    }

    /// Emit every pending value (teardown).
    pub fn flush_all(&mut self, wall: DateTime<Utc>, outbox: &Outbox) {
        let mut fields: Vec<String> = self.outgoing.keys().cloned().collect();
        fields.sort();
        for field in fields {
            self.flush_field(&field, wall, outbox);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.outgoing.values().filter_map(|p| p.due).min()
    }

    /// Emit windowed values whose quiet period has elapsed.
    pub fn on_deadline(&mut self, now: Instant, wall: DateTime<Utc>, outbox: &Outbox) {
        let mut due: Vec<String> = self
            .outgoing
            .iter()
            .filter(|(_, p)| p.due.is_some_and(|at| at <= now))
            .map(|(field, _)| field.clone())
            .collect();
        due.sort();
        for field in due {
            self.flush_field(&field, wall, outbox);
        }
    }

    pub fn has_pending_emission(&self, field: &str) -> bool {
        self.outgoing.contains_key(field)
    }

    fn emit(&mut self, field: &str, value: Value, wall: DateTime<Utc>, outbox: &Outbox) {
        self.outgoing.remove(field);
        self.last_sent.insert(field.to_string(), value.clone());
        log::trace!("Broadcasting {field}");
        outbox.broadcast_update(&BroadcastMessage::Updated(FieldUpdate {
            field_name: field.to_string(),
            field_value: value,
            user_id: self.local.user_id.clone(),
            updated_at: wall,
        }));
    }

    /// Apply an update from another participant.
    ///
    /// Updates are taken in arrival order. Timestamps are only compared
    /// between updates of the same sender, since participants' clocks are
    /// not synchronized.
    pub fn apply_remote(&mut self, update: &FieldUpdate) -> RemoteOutcome {
        if update.user_id == self.local.user_id {
            return RemoteOutcome::SelfEcho;
        }
        let field = update.field_name.as_str();

        let key = (field.to_string(), update.user_id.clone());
        if self.seen.get(&key).is_some_and(|at| *at > update.updated_at) {
            log::trace!("Dropping out-of-order update of {field} from {}", update.user_id);
            return RemoteOutcome::Stale;
        }
        self.seen.insert(key, update.updated_at);

        if self.focused.as_deref() == Some(field) {
            log::debug!("Conflict on {field}: remote edit from {} while focused", update.user_id);
            self.pending.insert(field.to_string(), update.clone());
            return RemoteOutcome::Pending;
        }

        self.values
            .insert(field.to_string(), update.field_value.clone());
        self.pending.remove(field);
        RemoteOutcome::Merged
    }

    /// Settle the pending update of `field`. Returns `false` if there was
    /// nothing pending.
    pub fn resolve(
        &mut self,
        field: &str,
        resolution: Resolution,
        wall: DateTime<Utc>,
        outbox: &Outbox,
    ) -> bool {
        if !self.pending.contains_key(field) {
            return false;
        }
        match resolution {
            Resolution::Ignore => {}
            Resolution::AcceptTheirs => {
                if let Some(theirs) = self.pending.remove(field) {
                    log::debug!("Accepted remote value for {field}");
                    // The old draft must not go out after the accepted value.
                    self.outgoing.remove(field);
                    self.last_sent
                        .insert(field.to_string(), theirs.field_value.clone());
                    self.values.insert(field.to_string(), theirs.field_value);
                }
            }
            Resolution::KeepMine => {
                self.pending.remove(field);
                let mine = self.values.get(field).cloned().unwrap_or(Value::Null);
                log::debug!("Keeping local value for {field}, re-broadcasting");
                self.emit(field, mine, wall, outbox);
            }
        }
        true
    }

    /// Drop the pending update without touching either value.
    pub fn dismiss_pending(&mut self, field: &str) -> Option<FieldUpdate> {
        self.pending.remove(field)
    }

    /// Seed the read model without broadcasting (e.g. values loaded from
    /// storage).
    pub fn load_value(&mut self, field: &str, value: Value) {
        self.values.insert(field.to_string(), value.clone());
        self.last_sent.insert(field.to_string(), value);
    }

    pub fn field_value(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn pending_update(&self, field: &str) -> Option<&FieldUpdate> {
        self.pending.get(field)
    }

    /// All pending updates, ordered by field name.
    pub fn pending_updates(&self) -> Vec<FieldUpdate> {
        let mut updates: Vec<FieldUpdate> = self.pending.values().cloned().collect();
        updates.sort_by(|a, b| a.field_name.cmp(&b.field_name));
        updates
    }

    /// Forget queued emissions without sending them.
    pub fn discard_outgoing(&mut self) {
        self.outgoing.clear();
    }
}
