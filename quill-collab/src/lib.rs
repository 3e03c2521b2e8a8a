//! # quill-collab: collaborative field synchronization
//!
//! Lets several participants edit the fields of one article at once. Each
//! participant sees who else is there and which field they are on, takes
//! advisory leases on the fields it edits, and streams in-progress values
//! to the others. Remote edits to a field the local user is typing in are
//! held back for the user to accept or reject; prose is never auto-merged.
//!
//! ## Architecture
//!
//! ```text
//!   editing widget
//!        │ FieldHandle / FieldBinding
//!        ▼
//! ┌──────────────────────────────────────────────┐
//! │ CollabSession (one pump, one state mutex)    │
//! │  PresenceAggregator  LockManager  UpdateExchange
//! └──────┬──────────────────┬─────────────┬──────┘
//!        │ presence         │ locks       │ updates      (Outbox)
//!        ▼                  ▼             ▼
//! ┌──────────────────────────────────────────────┐
//! │ Transport: LocalHub (in-process)             │
//! │            RelayTransport ◄──ws──► RelayServer
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`messages`] - payloads exchanged on the channels
//! - [`presence`] - who is attached and what they edit
//! - [`lock`] - per-field leases
//! - [`update`] - value propagation and pending conflicts
//! - [`binding`] - the surface editing widgets consume
//! - [`session`] - wires the above to three channels
//! - [`transport`] - the channel abstraction
//! - [`broadcast`] - per-topic fan-out shared by both transports
//! - [`hub`] - in-process transport
//! - [`protocol`] / [`server`] / [`client`] - the WebSocket relay

pub mod binding;
pub mod broadcast;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod hub;
pub mod lock;
pub mod messages;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod update;

// Re-exports for convenience
pub use binding::{FieldBinding, FieldHandle, FieldMode, FieldStatus, FocusOutcome};
pub use broadcast::{Room, RoomManager, RoomStats};
pub use client::{ConnectionState, RelayTransport};
pub use config::{CollabConfig, EmissionPolicy, LeasePolicy};
pub use error::{ProtocolError, RelayError, TransportError};
pub use hub::LocalHub;
pub use lock::FieldLockState;
pub use messages::{FieldLock, FieldUpdate, LocalUser, LockHolder, PresencePayload};
pub use presence::Participant;
pub use protocol::{FrameKind, RelayFrame};
pub use server::{RelayConfig, RelayServer, ServerStats};
pub use session::{ChannelKind, CollabSession, SessionId};
pub use transport::{Channel, ChannelCommand, ChannelEvent, PresenceSnapshot, Transport};
pub use update::Resolution;
