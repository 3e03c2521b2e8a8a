//! Error types for the transport boundary and the relay.
//!
//! Nothing in here reaches editing widgets: the field binding façade only
//! answers queries. These errors surface at construction points
//! (subscribing, binding the relay, connecting a client).

use thiserror::Error;

/// Failure to obtain or use a channel from a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("channel closed")]
    Closed,
}

/// Relay wire protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected frame kind {0:?}")]
    UnexpectedFrame(crate::protocol::FrameKind),
}

/// Relay server / client errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
