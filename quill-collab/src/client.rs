//! WebSocket relay client.
//!
//! [`RelayTransport`] keeps one socket to a [`RelayServer`](crate::server::RelayServer)
//! and multiplexes every channel subscribed through it:
//!
//! ```text
//! Channel ─► command task ─┐                     ┌─► route(conn_id) ─► Channel
//! Channel ─► command task ─┼─► writer ─► socket ─► reader ─┤
//! Channel ─► command task ─┘                     └─► route(conn_id) ─► Channel
//! ```
//!
//! A subscription the relay refuses receives `Closed` with the relay's
//! reason. When the socket drops every channel receives `Closed` and further
//! subscriptions fail; sessions degrade to local editing. Reconnecting
//! means connecting a new transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::{ProtocolError, RelayError, TransportError};
use crate::protocol::{FrameKind, RelayFrame};
use crate::transport::{Channel, ChannelCommand, ChannelEvent, ChannelSender, Transport};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

type Routes = Arc<Mutex<HashMap<Uuid, mpsc::UnboundedSender<ChannelEvent>>>>;

const KEEPALIVE: Duration = Duration::from_secs(25);

pub struct RelayTransport {
    url: String,
    outgoing: mpsc::UnboundedSender<RelayFrame>,
    routes: Routes,
    state: watch::Receiver<ConnectionState>,
}

impl RelayTransport {
    /// Connect to a relay at `url` (e.g. `ws://127.0.0.1:9090`).
    ///
    /// Spawns the socket reader and writer tasks.
    pub async fn connect(url: impl Into<String>) -> Result<Self, RelayError> {
        let url = url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("Connected to relay {url}");

        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (state_tx, state) = watch::channel(ConnectionState::Connected);
        let state_tx = Arc::new(state_tx);

        // Writer task: forward outgoing frames to the socket, with keepalive
        let writer_state = state_tx.clone();
        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE);
            keepalive.tick().await;
            loop {
                let frame = tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = keepalive.tick() => RelayFrame::ping(),
                };
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Failed to encode {:?} frame: {e}", frame.kind);
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
            writer_state.send_replace(ConnectionState::Disconnected);
        });

        // Reader task: route incoming frames to their channels
        let reader_routes = routes.clone();
        tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                        Ok(frame) => route(&reader_routes, frame),
                        Err(e) => log::warn!("Failed to decode relay frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break "relay closed the connection".to_string(),
                    Some(Err(e)) => break e.to_string(),
                    Some(Ok(_)) => {}
                }
            };

            log::warn!("Relay connection lost: {reason}");
            let routes: Vec<_> = {
                let mut routes = lock(&reader_routes);
                state_tx.send_replace(ConnectionState::Disconnected);
                routes.drain().map(|(_, tx)| tx).collect()
            };
            for tx in routes {
                let _ = tx.send(ChannelEvent::Closed {
                    reason: reason.clone(),
                });
            }
        });

        Ok(Self {
            url,
            outgoing,
            routes,
            state,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        lock(&self.routes).len()
    }
}

impl Transport for RelayTransport {
    fn subscribe(&self, topic: &str, presence_key: &str) -> Result<Channel, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let conn_id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        {
            // Checked under the routes lock: the reader flips the state and
            // drains the routes under the same lock.
            let mut routes = lock(&self.routes);
            if self.connection_state() == ConnectionState::Disconnected {
                return Err(TransportError::Unavailable(format!("not connected to {}", self.url)));
            }
            routes.insert(conn_id, event_tx);
        }
        if self
            .outgoing
            .send(RelayFrame::join(conn_id, topic, presence_key))
            .is_err()
        {
            lock(&self.routes).remove(&conn_id);
            return Err(TransportError::Closed);
        }

        runtime.spawn(forward_commands(
            conn_id,
            topic.to_string(),
            command_rx,
            self.outgoing.clone(),
            self.routes.clone(),
        ));

        Ok(Channel::new(ChannelSender::new(topic, command_tx), event_rx))
    }
}

/// Turn one channel's commands into frames until it unsubscribes.
async fn forward_commands(
    conn_id: Uuid,
    topic: String,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    outgoing: mpsc::UnboundedSender<RelayFrame>,
    routes: Routes,
) {
    while let Some(command) = commands.recv().await {
        let frame = match command {
            ChannelCommand::Broadcast { event, payload } => {
                RelayFrame::broadcast(conn_id, topic.as_str(), event, &payload)
            }
            ChannelCommand::Track(payload) => RelayFrame::track(conn_id, topic.as_str(), &payload),
            ChannelCommand::Untrack => Ok(RelayFrame::untrack(conn_id, topic.as_str())),
            ChannelCommand::Unsubscribe => break,
        };
        match frame {
            Ok(frame) => {
                if outgoing.send(frame).is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("Dropping command on {topic}: {e}"),
        }
    }

    lock(&routes).remove(&conn_id);
    let _ = outgoing.send(RelayFrame::leave(conn_id, topic.as_str()));
}

fn route(routes: &Routes, frame: RelayFrame) {
    let event = match frame.kind {
        FrameKind::Joined => Ok(ChannelEvent::Subscribed),
        FrameKind::Broadcast => frame.json_payload().map(|payload| ChannelEvent::Broadcast {
            event: frame.event.clone(),
            payload,
        }),
        FrameKind::PresenceState => frame.snapshot().map(ChannelEvent::PresenceSync),
        FrameKind::PresenceJoin => Ok(ChannelEvent::PresenceJoin {
            key: frame.event.clone(),
        }),
        FrameKind::PresenceLeave => Ok(ChannelEvent::PresenceLeave {
            key: frame.event.clone(),
        }),
        FrameKind::Pong => {
            log::trace!("Relay pong");
            return;
        }
        FrameKind::Rejected => {
            log::warn!("Relay refused subscription to {}: {}", frame.topic, frame.event);
            if let Some(tx) = lock(routes).remove(&frame.conn_id) {
                let _ = tx.send(ChannelEvent::Closed { reason: frame.event });
            }
            return;
        }
        other => Err(ProtocolError::UnexpectedFrame(other)),
    };

    match event {
        Ok(event) => {
            if let Some(tx) = lock(routes).get(&frame.conn_id) {
                let _ = tx.send(event);
            }
        }
        Err(e) => log::warn!("Dropping relay frame for {}: {e}", frame.topic),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
