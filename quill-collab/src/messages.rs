//! Payload schemas exchanged on the session channels.
//!
//! Shapes are fixed across implementations:
//! ```text
//! field_locked    { "lock":   { field_name, user_id, user_email, locked_at, expires_at } }
//! field_unlocked  { "field_name" }
//! field_updated   { "update": { field_name, field_value, user_id, updated_at } }
//! presence        { user_id, user_email, last_seen, current_field? }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FIELD_LOCKED: &str = "field_locked";
pub const FIELD_UNLOCKED: &str = "field_unlocked";
pub const FIELD_UPDATED: &str = "field_updated";

/// The local participant, as supplied by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalUser {
    pub user_id: String,
    pub user_email: String,
}

impl LocalUser {
    pub fn new(user_id: impl Into<String>, user_email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_email: user_email.into(),
        }
    }
}

/// An advisory lease on one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLock {
    pub field_name: String,
    pub user_id: String,
    pub user_email: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FieldLock {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn holder(&self) -> LockHolder {
        LockHolder {
            user_id: self.user_id.clone(),
            user_email: self.user_email.clone(),
        }
    }
}

/// Identity of a lock holder, as shown next to a read-only field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockHolder {
    pub user_id: String,
    pub user_email: String,
}

/// A field value published by one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub field_name: String,
    pub field_value: Value,
    pub user_id: String,
    pub updated_at: DateTime<Utc>,
}

/// What each participant tracks on the presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: String,
    pub user_email: String,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_field: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct LockedBody {
    lock: FieldLock,
}

#[derive(Serialize, Deserialize)]
struct UnlockedBody {
    field_name: String,
}

#[derive(Serialize, Deserialize)]
struct UpdatedBody {
    update: FieldUpdate,
}

/// A decoded broadcast on the lock or update channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastMessage {
    Locked(FieldLock),
    Unlocked { field_name: String },
    Updated(FieldUpdate),
}

impl BroadcastMessage {
    /// Event name on the wire.
    pub fn event(&self) -> &'static str {
        match self {
            BroadcastMessage::Locked(_) => FIELD_LOCKED,
            BroadcastMessage::Unlocked { .. } => FIELD_UNLOCKED,
            BroadcastMessage::Updated(_) => FIELD_UPDATED,
        }
    }

    pub fn field_name(&self) -> &str {
        match self {
            BroadcastMessage::Locked(lock) => &lock.field_name,
            BroadcastMessage::Unlocked { field_name } => field_name,
            BroadcastMessage::Updated(update) => &update.field_name,
        }
    }

    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            BroadcastMessage::Locked(lock) => serde_json::to_value(LockedBody { lock: lock.clone() }),
            BroadcastMessage::Unlocked { field_name } => serde_json::to_value(UnlockedBody {
                field_name: field_name.clone(),
            }),
            BroadcastMessage::Updated(update) => serde_json::to_value(UpdatedBody {
                update: update.clone(),
            }),
        }
    }

    /// Decode a broadcast. Unknown event names yield `Ok(None)`.
    pub fn from_broadcast(event: &str, payload: &Value) -> Result<Option<Self>, serde_json::Error> {
        let msg = match event {
            FIELD_LOCKED => {
                let body: LockedBody = serde_json::from_value(payload.clone())?;
                BroadcastMessage::Locked(body.lock)
            }
            FIELD_UNLOCKED => {
                let body: UnlockedBody = serde_json::from_value(payload.clone())?;
                BroadcastMessage::Unlocked {
                    field_name: body.field_name,
                }
            }
            FIELD_UPDATED => {
                let body: UpdatedBody = serde_json::from_value(payload.clone())?;
                BroadcastMessage::Updated(body.update)
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

/// Length used by threshold emission: characters for strings, encoded
/// length for any other JSON value.
pub fn value_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Null => 0,
        other => other.to_string().len(),
    }
}
