//! WebSocket relay: the messaging service sessions subscribe through.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── Room "article:42:presence"
//!             ├── RelayServer ────┼── Room "article:42:locks"
//! Client B ──┘   (per-connection  └── Room "article:42:updates"
//!                 subscription map)        │
//!                          ┌───────────────┼────────────┐
//!                          ▼               ▼            ▼
//!                       Client A        Client B     Client C
//! ```
//!
//! One socket carries any number of subscriptions, each named by the
//! `conn_id` the client picked. The relay only fans frames out and keeps
//! presence; it stores nothing and never interprets payloads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{Room, RoomEvent, RoomManager};
use crate::error::RelayError;
use crate::protocol::{FrameKind, RelayFrame};

/// Relay configuration. Deserializable from environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum subscriptions one connection may hold
    pub max_subscriptions: usize,
    /// Events buffered per subscriber before it starts losing them
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_subscriptions: 64,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

struct Subscription {
    room: Arc<Room>,
    forwarder: JoinHandle<()>,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                addr,
                rooms: self.rooms.clone(),
                stats: self.stats.clone(),
                config: self.config.clone(),
                subscriptions: HashMap::new(),
            };
            tokio::spawn(async move {
                if let Err(e) = connection.run(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

/// One client socket and its subscriptions.
struct Connection {
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    config: RelayConfig,
    subscriptions: HashMap<Uuid, Subscription>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {}", self.addr);

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self.process(&mut ws_sender, &mut ws_receiver).await;

        // Cleanup: leave every room, withdrawing presence.
        for (conn_id, sub) in self.subscriptions.drain() {
            sub.forwarder.abort();
            sub.room.leave(&conn_id).await;
            self.rooms.remove_if_empty(sub.room.topic()).await;
        }
        self.stats.write().await.active_connections -= 1;

        result
    }

    async fn process(&mut self, ws_sender: &mut WsSink, ws_receiver: &mut WsSource) -> Result<(), RelayError> {
        // Frames produced by this connection's room forwarders.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = self.stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        match RelayFrame::decode(&data) {
                            Ok(frame) => {
                                for reply in self.handle_frame(frame, &out_tx).await {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode frame from {}: {e}", self.addr),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {}", self.addr);
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                },
                frame = out_rx.recv() => {
                    // `out_tx` lives in this scope, so the queue never closes.
                    if let Some(frame) = frame {
                        ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                    }
                }
            }
        }
    }

    /// Apply one client frame. Returns frames to send straight back.
    async fn handle_frame(
        &mut self,
        frame: RelayFrame,
        out: &mpsc::UnboundedSender<RelayFrame>,
    ) -> Vec<RelayFrame> {
        match frame.kind {
            FrameKind::Join => self.join(frame, out).await,
            FrameKind::Leave => {
                if let Some(sub) = self.subscriptions.remove(&frame.conn_id) {
                    sub.forwarder.abort();
                    sub.room.leave(&frame.conn_id).await;
                    self.rooms.remove_if_empty(sub.room.topic()).await;
                    log::debug!("{} left {}", frame.conn_id, sub.room.topic());
                }
                Vec::new()
            }
            FrameKind::Broadcast => {
                if let Some(sub) = self.subscriptions.get(&frame.conn_id) {
                    match frame.json_payload() {
                        Ok(payload) => {
                            log::trace!("{} on {}", frame.event, sub.room.topic());
                            sub.room.broadcast(frame.conn_id, frame.event, payload);
                        }
                        Err(e) => log::warn!("Dropping broadcast with bad payload: {e}"),
                    }
                }
                Vec::new()
            }
            FrameKind::Track => {
                if let Some(sub) = self.subscriptions.get(&frame.conn_id) {
                    match frame.json_payload() {
                        Ok(payload) => {
                            sub.room.track(&frame.conn_id, payload).await;
                        }
                        Err(e) => log::warn!("Dropping presence with bad payload: {e}"),
                    }
                }
                Vec::new()
            }
            FrameKind::Untrack => {
                if let Some(sub) = self.subscriptions.get(&frame.conn_id) {
                    sub.room.untrack(&frame.conn_id).await;
                }
                Vec::new()
            }
            FrameKind::Ping => vec![RelayFrame::pong()],
            other => {
                log::debug!("Unexpected {other:?} frame from {}", self.addr);
                Vec::new()
            }
        }
    }

    async fn join(&mut self, frame: RelayFrame, out: &mpsc::UnboundedSender<RelayFrame>) -> Vec<RelayFrame> {
        if self.subscriptions.contains_key(&frame.conn_id) {
            return Vec::new();
        }
        if self.subscriptions.len() >= self.config.max_subscriptions {
            log::warn!(
                "Refusing subscription to {} from {}: limit of {} reached",
                frame.topic,
                self.addr,
                self.config.max_subscriptions
            );
            let reason = format!("subscription limit of {} reached", self.config.max_subscriptions);
            return vec![RelayFrame::rejected(frame.conn_id, frame.topic, reason)];
        }

        let (room, rx, snapshot) = self
            .rooms
            .join(&frame.topic, frame.conn_id, frame.event.as_str())
            .await;
        let forwarder = tokio::spawn(forward(rx, frame.conn_id, room.clone(), out.clone()));
        self.subscriptions.insert(frame.conn_id, Subscription { room, forwarder });
        log::debug!("{} joined {} as {}", frame.conn_id, frame.topic, frame.event);

        let mut replies = vec![RelayFrame::joined(frame.conn_id, frame.topic.as_str())];
        match RelayFrame::presence_state(frame.conn_id, frame.topic.as_str(), &snapshot) {
            Ok(state) => replies.push(state),
            Err(e) => log::warn!("Failed to encode presence for {}: {e}", frame.topic),
        }
        replies
    }
}

/// Move room events for one subscription onto the connection's queue.
async fn forward(
    mut rx: broadcast::Receiver<Arc<RoomEvent>>,
    conn_id: Uuid,
    room: Arc<Room>,
    out: mpsc::UnboundedSender<RelayFrame>,
) {
    let topic = room.topic();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Subscriber {conn_id} on {topic} lagged by {n} events");
                room.record_dropped(n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let frame = match &*event {
            RoomEvent::Broadcast { from, .. } if *from == conn_id => continue,
            RoomEvent::Broadcast { event, payload, .. } => {
                RelayFrame::broadcast(conn_id, topic, event.as_str(), payload)
            }
            RoomEvent::PresenceSync(snapshot) => RelayFrame::presence_state(conn_id, topic, snapshot),
            RoomEvent::PresenceJoin { key } => Ok(RelayFrame::presence_join(conn_id, topic, key.as_str())),
            RoomEvent::PresenceLeave { key } => Ok(RelayFrame::presence_leave(conn_id, topic, key.as_str())),
        };
        match frame {
            Ok(frame) => {
                if out.send(frame).is_err() {
                    return;
                }
            }
            Err(e) => log::warn!("Failed to encode frame for {topic}: {e}"),
        }
    }
}
