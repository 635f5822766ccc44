//! WebSocket front door of the sync engine.
//!
//! ```text
//! Client A ──┐                      ┌── Room (drawing a) ── BroadcastGroup
//!            ├── SyncServer ─ RoomBroker
//! Client B ──┘                      └── Room (drawing b) ── BroadcastGroup
//!                                          │
//!                                   PersistenceBridge
//!                                          │
//!                                 DrawingStore (RocksDB)
//! ```
//!
//! Each connection must open with a `join` frame. After admission the
//! connection task pumps two directions at once: client frames go to the
//! room, room envelopes go to the client.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::broker::{BrokerError, PeerSession, RoomBroker};
use crate::protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage};
use crate::room::{LeaveReason, RoomConfig};
use crate::stats::{ServerStats, SyncStats};
use crate::storage::{DrawingStorage, DrawingStore, MemoryStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// How long a fresh connection has to send its join frame
    pub join_timeout: Duration,
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            join_timeout: Duration::from_secs(10),
            room: RoomConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            join_timeout: Duration::from_secs(2),
            room: RoomConfig::for_testing(),
            ..Self::default()
        }
    }
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("No join within {0:?}")]
    JoinTimeout(Duration),

    #[error("Connection closed before join")]
    ClosedBeforeJoin,
}

type Ws = WebSocketStream<TcpStream>;

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    broker: RoomBroker,
}

impl SyncServer {
    /// Server over an already-open storage backend.
    pub fn new(config: ServerConfig, storage: Arc<dyn DrawingStorage>) -> Self {
        let broker = RoomBroker::new(storage, config.room.clone());
        Self { config, broker }
    }

    /// Open the storage named by `config.storage_path`, falling back to
    /// memory when none is configured.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        let storage: Arc<dyn DrawingStorage> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(DrawingStore::open(store_config)?)
            }
            None => {
                log::warn!("No storage path configured; drawings live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(config, storage))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn broker(&self) -> &RoomBroker {
        &self.broker
    }

    pub fn stats(&self) -> ServerStats {
        self.broker.stats()
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept loop over an existing listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let broker = self.broker.clone();
            let join_timeout = self.config.join_timeout;
            tokio::spawn(async move {
                let stats = broker.sync_stats().clone();
                SyncStats::incr(&stats.total_connections);
                SyncStats::incr(&stats.active_connections);

                if let Err(e) = handle_connection(stream, addr, broker, join_timeout).await {
                    log::warn!("Connection from {addr} ended: {e}");
                }
                SyncStats::decr(&stats.active_connections);
            });
        }
    }
}

async fn send_message(ws: &mut Ws, msg: &ServerMessage) -> Result<(), ConnectionError> {
    ws.send(Message::Text(msg.encode()?.into())).await?;
    Ok(())
}

/// Report a failure to the client and close.
async fn reject(ws: &mut Ws, kind: ErrorKind, message: String) {
    let _ = send_message(ws, &ServerMessage::error(kind, message)).await;
    let _ = ws.close(None).await;
}

/// Wait for the opening join frame.
async fn read_join(ws: &mut Ws) -> Result<crate::protocol::JoinRequest, ConnectionError> {
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                return match ClientMessage::decode(text.as_str())? {
                    ClientMessage::Join(join) => Ok(join),
                    other => Err(ProtocolError::Unexpected {
                        expected: "join",
                        got: other.kind(),
                    }
                    .into()),
                };
            }
            Message::Binary(_) => return Err(ProtocolError::UnsupportedFrame("binary").into()),
            Message::Ping(data) => ws.send(Message::Pong(data)).await?,
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ConnectionError::ClosedBeforeJoin)
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    broker: RoomBroker,
    join_timeout: Duration,
) -> Result<(), ConnectionError> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    log::info!("WebSocket connection established from {addr}");

    let join = match tokio::time::timeout(join_timeout, read_join(&mut ws)).await {
        Ok(Ok(join)) => join,
        Ok(Err(ConnectionError::ClosedBeforeJoin)) => return Err(ConnectionError::ClosedBeforeJoin),
        Ok(Err(e)) => {
            reject(&mut ws, ErrorKind::Protocol, e.to_string()).await;
            return Err(e);
        }
        Err(_) => {
            reject(&mut ws, ErrorKind::JoinTimeout, "no join received".into()).await;
            return Err(ConnectionError::JoinTimeout(join_timeout));
        }
    };

    let mut session = match broker.join(join.drawing_id, join.identity).await {
        Ok(session) => session,
        Err(e) => {
            reject(&mut ws, e.kind(), e.to_string()).await;
            return Err(e.into());
        }
    };

    log::info!(
        "Peer {} ({}) from {addr} joined drawing {}",
        session.peer_id(),
        session.identity().name,
        session.drawing_id()
    );

    let result = pump(&mut ws, &mut session).await;
    session.leave(LeaveReason::Disconnected).await;
    result
}

/// Shuttle frames both ways until either side is done.
async fn pump(ws: &mut Ws, session: &mut PeerSession) -> Result<(), ConnectionError> {
    let peer_id = session.peer_id();
    let (Some(snapshot), Some(mut rx)) = (session.take_snapshot(), session.take_receiver()) else {
        return Ok(());
    };
    send_message(ws, &ServerMessage::Snapshot(snapshot)).await?;

    let (mut ws_sender, mut ws_receiver) = ws.split();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ClientMessage::decode(text.as_str()) {
                            Ok(message) => {
                                log::trace!("Peer {peer_id}: {}", message.kind());
                                match session.relay(message).await {
                                    Ok(()) => {}
                                    Err(BrokerError::AlreadyJoined(_)) => {
                                        let err = ServerMessage::error(ErrorKind::Protocol, "already joined");
                                        ws_sender.send(Message::Text(err.encode()?.into())).await?;
                                    }
                                    Err(e) => {
                                        let err = ServerMessage::error(e.kind(), e.to_string());
                                        let _ = ws_sender.send(Message::Text(err.encode()?.into())).await;
                                        return Err(e.into());
                                    }
                                }
                            }
                            // One bad frame does not end the session.
                            Err(e) => log::debug!("Peer {peer_id}: dropping undecodable frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Peer {peer_id} disconnected");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }

            envelope = rx.recv() => {
                match envelope {
                    Ok(envelope) => {
                        if !envelope.is_for(&peer_id) {
                            continue;
                        }
                        ws_sender.send(Message::Text(envelope.frame.to_string().into())).await?;
                        if envelope.close {
                            let _ = ws_sender.close().await;
                            return Ok(());
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Peer {peer_id} lagged by {skipped} frames; resyncing");
                        let snapshot = session.resync(skipped).await?;
                        ws_sender
                            .send(Message::Text(ServerMessage::Snapshot(snapshot).encode()?.into()))
                            .await?;
                    }
                    Err(RecvError::Closed) => {
                        let err = ServerMessage::error(ErrorKind::RoomClosing, "room closed");
                        let _ = ws_sender.send(Message::Text(err.encode()?.into())).await;
                        let _ = ws_sender.close().await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert!(config.storage_path.is_none());
        assert_eq!(config.join_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_open_in_memory() {
        let server = SyncServer::open(ServerConfig::for_testing()).unwrap();
        assert_eq!(server.broker().room_count(), 0);
        assert_eq!(server.stats(), ServerStats::default());
    }

    #[tokio::test]
    async fn test_open_rocksdb() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().to_path_buf()),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::open(config).unwrap();
        assert!(server.broker().storage().list_drawings().unwrap().is_empty());
    }

    #[test]
    fn test_broker_errors_map_to_wire_kinds() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(BrokerError::LoadTimeout(id).kind(), ErrorKind::JoinTimeout);
        assert_eq!(BrokerError::RoomClosing(id).kind(), ErrorKind::RoomClosing);
    }
}
