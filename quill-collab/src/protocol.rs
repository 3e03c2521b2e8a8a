//! Relay wire protocol.
//!
//! Every WebSocket binary message is one bincode-encoded [`RelayFrame`]:
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────────┐
//! │ kind     │ conn_id   │ topic    │ event    │ payload      │
//! │ 1 byte   │ 16 bytes  │ string   │ string   │ JSON bytes   │
//! └──────────┴───────────┴──────────┴──────────┴──────────────┘
//! ```
//!
//! `conn_id` names one subscription, so a single socket can multiplex any
//! number of channels. `event` carries the broadcast event name, the
//! presence key for `Join`, `PresenceJoin` and `PresenceLeave`, or the
//! refusal reason for `Rejected`. The payload
//! is the JSON encoding of the channel payload, untouched by the relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::transport::PresenceSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Client → relay: subscribe `conn_id` to `topic` under presence key `event`
    Join = 1,
    /// Relay → client: subscription is live
    Joined = 2,
    /// Client → relay: drop the subscription
    Leave = 3,
    /// Either direction: broadcast `event` with `payload`
    Broadcast = 4,
    /// Client → relay: set this subscription's presence payload
    Track = 5,
    /// Client → relay: withdraw this subscription's presence payload
    Untrack = 6,
    /// Relay → client: full presence map of the topic
    PresenceState = 7,
    PresenceJoin = 8,
    PresenceLeave = 9,
    Ping = 10,
    Pong = 11,
    /// Relay → client: subscription refused, `event` carries the reason
    Rejected = 12,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub kind: FrameKind,
    pub conn_id: Uuid,
    pub topic: String,
    pub event: String,
    pub payload: Vec<u8>,
}

impl RelayFrame {
    fn bare(kind: FrameKind, conn_id: Uuid, topic: impl Into<String>) -> Self {
        Self {
            kind,
            conn_id,
            topic: topic.into(),
            event: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn join(conn_id: Uuid, topic: impl Into<String>, presence_key: impl Into<String>) -> Self {
        Self {
            event: presence_key.into(),
            ..Self::bare(FrameKind::Join, conn_id, topic)
        }
    }

    pub fn joined(conn_id: Uuid, topic: impl Into<String>) -> Self {
        Self::bare(FrameKind::Joined, conn_id, topic)
    }

    pub fn rejected(conn_id: Uuid, topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            event: reason.into(),
            ..Self::bare(FrameKind::Rejected, conn_id, topic)
        }
    }

    pub fn leave(conn_id: Uuid, topic: impl Into<String>) -> Self {
        Self::bare(FrameKind::Leave, conn_id, topic)
    }

    pub fn broadcast(
        conn_id: Uuid,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: &Value,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            event: event.into(),
            payload: json_bytes(payload)?,
            ..Self::bare(FrameKind::Broadcast, conn_id, topic)
        })
    }

    pub fn track(conn_id: Uuid, topic: impl Into<String>, payload: &Value) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: json_bytes(payload)?,
            ..Self::bare(FrameKind::Track, conn_id, topic)
        })
    }

    pub fn untrack(conn_id: Uuid, topic: impl Into<String>) -> Self {
        Self::bare(FrameKind::Untrack, conn_id, topic)
    }

    pub fn presence_state(
        conn_id: Uuid,
        topic: impl Into<String>,
        snapshot: &PresenceSnapshot,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(snapshot).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            payload,
            ..Self::bare(FrameKind::PresenceState, conn_id, topic)
        })
    }

    pub fn presence_join(conn_id: Uuid, topic: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            event: key.into(),
            ..Self::bare(FrameKind::PresenceJoin, conn_id, topic)
        }
    }

    pub fn presence_leave(conn_id: Uuid, topic: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            event: key.into(),
            ..Self::bare(FrameKind::PresenceLeave, conn_id, topic)
        }
    }

    pub fn ping() -> Self {
        Self::bare(FrameKind::Ping, Uuid::nil(), "")
    }

    pub fn pong() -> Self {
        Self::bare(FrameKind::Pong, Uuid::nil(), "")
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    /// JSON payload of a `Broadcast` or `Track` frame.
    pub fn json_payload(&self) -> Result<Value, ProtocolError> {
        match self.kind {
            FrameKind::Broadcast | FrameKind::Track => serde_json::from_slice(&self.payload)
                .map_err(|e| ProtocolError::Deserialization(e.to_string())),
            other => Err(ProtocolError::UnexpectedFrame(other)),
        }
    }

    /// Presence map of a `PresenceState` frame.
    pub fn snapshot(&self) -> Result<PresenceSnapshot, ProtocolError> {
        if self.kind != FrameKind::PresenceState {
            return Err(ProtocolError::UnexpectedFrame(self.kind));
        }
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

fn json_bytes(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}
