//! WebSocket sync client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - A local scene kept converged with the room through the same
//!   reconciler the server uses
//! - Cursor and file relay
//! - Offline queue for element edits made while disconnected
//! - Periodic heartbeats

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::element::{Element, ElementMap};
use crate::files::FileBlob;
use crate::presence::{PeerIdentity, PeerInfo};
use crate::protocol::{
    ClientMessage, CursorRequest, ErrorKind, JoinRequest, PeerCursor, ProtocolError, ServerMessage, Snapshot,
};
use crate::reconcile::reconcile;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Server rejected join ({kind:?}): {message}")]
    Rejected { kind: ErrorKind, message: String },

    #[error("No snapshot within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Offline queue full")]
    QueueFull,
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Joined; the snapshot has been applied to the local scene
    Connected(Snapshot),
    /// Connection lost
    Disconnected,
    /// A fresh snapshot after falling behind
    Resynced(Snapshot),
    /// Elements accepted by the room from another peer, or merged from storage
    RemoteElements(Vec<Element>),
    RemoteFile(FileBlob),
    RemoteCursor(PeerCursor),
    PeerJoined(PeerInfo),
    PeerLeft(PeerInfo),
    HeartbeatAck,
    StorageWarning(String),
    StorageRecovered,
    /// Server closed this session
    Evicted(String),
    Error { kind: ErrorKind, message: String },
}

/// Element batches edited while disconnected.
///
/// Replayed in order on the next connect. The server's reconciler makes
/// replaying an already-superseded batch harmless.
pub struct OfflineQueue {
    queue: VecDeque<Vec<Element>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a batch. Returns false when full.
    pub fn enqueue(&mut self, elements: Vec<Element>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(elements);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<Element>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Elements across all queued batches.
    pub fn element_count(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

/// Client tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub heartbeat_interval: Duration,
    /// Wait for the join snapshot.
    pub handshake_timeout: Duration,
    pub offline_capacity: usize,
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
            offline_capacity: 10_000,
            event_capacity: 1024,
        }
    }
}

type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The sync client.
pub struct SyncClient {
    identity: PeerIdentity,
    drawing_id: Uuid,
    server_url: String,
    config: ClientConfig,

    state: Arc<RwLock<ConnectionState>>,

    /// Local copy of the scene
    scene: Arc<Mutex<ElementMap>>,

    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(identity: PeerIdentity, drawing_id: Uuid, server_url: impl Into<String>) -> Self {
        Self::with_config(identity, drawing_id, server_url, ClientConfig::default())
    }

    pub fn with_config(
        identity: PeerIdentity,
        drawing_id: Uuid,
        server_url: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            identity,
            drawing_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            scene: Arc::new(Mutex::new(ElementMap::new())),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(config.offline_capacity))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            config,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the drawing and wait for its snapshot.
    ///
    /// Spawns background tasks for reading, writing and heartbeats, then
    /// replays the offline queue.
    pub async fn connect(&mut self) -> Result<Snapshot, ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let result = self.handshake().await;
        let (ws, snapshot) = match result {
            Ok(ok) => ok,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        {
            let mut scene = self.scene.lock().await;
            reconcile(&mut scene, snapshot.elements.iter().cloned());
        }

        let (mut ws_writer, mut ws_reader) = ws.split();

        // Writer task: forward the outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Heartbeat task: ends once the client drops its sender
        let heartbeat_tx = out_tx.downgrade();
        let heartbeat_interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (Some(tx), Ok(frame)) = (heartbeat_tx.upgrade(), ClientMessage::Heartbeat.encode()) else {
                    break;
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected(snapshot.clone())).await;

        // Replay offline queue
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued element batches", queued.len());
            for batch in queued {
                self.send_frame(ClientMessage::update(&batch)?).await?;
            }
        }

        // Reader task: fold incoming frames into the scene and surface events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let scene = self.scene.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let message = match ServerMessage::decode(text.as_str()) {
                            Ok(message) => message,
                            Err(e) => {
                                log::debug!("Dropping undecodable server frame: {e}");
                                continue;
                            }
                        };
                        let closing = matches!(message, ServerMessage::Evicted { .. });
                        let event = apply_server_message(&scene, message).await;
                        let _ = event_tx.send(event).await;
                        if closing {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(snapshot)
    }

    async fn handshake(&self) -> Result<(ClientWs, Snapshot), ClientError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.server_url.as_str()).await?;

        let join = ClientMessage::Join(JoinRequest {
            drawing_id: self.drawing_id,
            identity: self.identity.clone(),
        });
        ws.send(Message::Text(join.encode()?.into())).await?;

        let timeout = self.config.handshake_timeout;
        let snapshot = tokio::time::timeout(timeout, wait_for_snapshot(&mut ws))
            .await
            .map_err(|_| ClientError::HandshakeTimeout(timeout))??;
        Ok((ws, snapshot))
    }

    async fn send_frame(&self, message: ClientMessage) -> Result<(), ClientError> {
        let frame = message.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx.send(frame).await.map_err(|_| ClientError::ConnectionClosed),
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Apply local edits and send them. Queued for replay while offline.
    pub async fn send_elements(&self, elements: Vec<Element>) -> Result<(), ClientError> {
        {
            let mut scene = self.scene.lock().await;
            reconcile(&mut scene, elements.iter().cloned());
        }

        if !self.is_connected().await {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(elements) {
                return Err(ClientError::QueueFull);
            }
            return Ok(());
        }

        self.send_frame(ClientMessage::update(&elements)?).await
    }

    pub async fn send_file(&self, blob: FileBlob) -> Result<(), ClientError> {
        self.send_frame(ClientMessage::File(blob)).await
    }

    /// Cursor positions are dropped while offline.
    pub async fn send_cursor(&self, x: f64, y: f64) -> Result<(), ClientError> {
        if !self.is_connected().await {
            return Ok(());
        }
        self.send_frame(ClientMessage::Presence(CursorRequest {
            cursor_x: x,
            cursor_y: y,
            identity: None,
        }))
        .await
    }

    pub async fn send_heartbeat(&self) -> Result<(), ClientError> {
        self.send_frame(ClientMessage::Heartbeat).await
    }

    /// Stop sending; the writer closes the socket once drained.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Current local scene, in first-seen order.
    pub async fn elements(&self) -> Vec<Element> {
        self.scene.lock().await.values().cloned().collect()
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn drawing_id(&self) -> Uuid {
        self.drawing_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

async fn wait_for_snapshot(ws: &mut ClientWs) -> Result<Snapshot, ClientError> {
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => match ServerMessage::decode(text.as_str())? {
                ServerMessage::Snapshot(snapshot) => return Ok(snapshot),
                ServerMessage::Error { kind, message } => return Err(ClientError::Rejected { kind, message }),
                other => {
                    return Err(ProtocolError::Unexpected {
                        expected: "snapshot",
                        got: other.kind(),
                    }
                    .into())
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ClientError::ConnectionClosed)
}

/// Fold a server frame into the local scene and turn it into an event.
async fn apply_server_message(scene: &Mutex<ElementMap>, message: ServerMessage) -> SyncEvent {
    match message {
        ServerMessage::Snapshot(snapshot) => {
            let mut scene = scene.lock().await;
            reconcile(&mut scene, snapshot.elements.iter().cloned());
            SyncEvent::Resynced(snapshot)
        }
        ServerMessage::Update(update) => {
            let mut scene = scene.lock().await;
            reconcile(&mut scene, update.elements.iter().cloned());
            SyncEvent::RemoteElements(update.elements)
        }
        ServerMessage::File(blob) => SyncEvent::RemoteFile(blob),
        ServerMessage::Presence(cursor) => SyncEvent::RemoteCursor(cursor),
        ServerMessage::Joined(info) => SyncEvent::PeerJoined(info),
        ServerMessage::Left(info) => SyncEvent::PeerLeft(info),
        ServerMessage::HeartbeatAck => SyncEvent::HeartbeatAck,
        ServerMessage::StorageWarning { message } => SyncEvent::StorageWarning(message),
        ServerMessage::StorageRecovered => SyncEvent::StorageRecovered,
        ServerMessage::Evicted { reason } => SyncEvent::Evicted(reason),
        ServerMessage::Error { kind, message } => SyncEvent::Error { kind, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ElementsUpdate;

    fn client() -> SyncClient {
        SyncClient::new(PeerIdentity::named("tester"), Uuid::new_v4(), "ws://localhost:9090")
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = client();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
        assert!(client.elements().await.is_empty());
        assert_eq!(client.identity().name, "tester");
    }

    #[tokio::test]
    async fn test_offline_edits_queue_and_apply_locally() {
        let client = client();
        client
            .send_elements(vec![Element::rectangle("a").versioned(1, 0)])
            .await
            .unwrap();
        client
            .send_elements(vec![Element::rectangle("a").versioned(2, 0)])
            .await
            .unwrap();

        assert_eq!(client.offline_queue_len().await, 2);
        let scene = client.elements().await;
        assert_eq!(scene.len(), 1);
        assert_eq!(scene[0].version(), 2);
    }

    #[tokio::test]
    async fn test_offline_cursor_is_dropped_and_file_fails() {
        let client = client();
        client.send_cursor(1.0, 2.0).await.unwrap();
        let blob = FileBlob::new("f", "image/png", "data:image/png;base64,AA==", 0);
        assert!(matches!(client.send_file(blob).await, Err(ClientError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_remote_update_reconciled_into_scene() {
        let scene = Mutex::new(ElementMap::new());
        scene
            .lock()
            .await
            .insert("a".into(), Element::rectangle("a").versioned(5, 0));

        let update = ServerMessage::Update(ElementsUpdate {
            elements: vec![
                Element::rectangle("a").versioned(4, 0),
                Element::rectangle("b").versioned(1, 0),
            ],
        });
        let event = apply_server_message(&scene, update).await;
        assert!(matches!(event, SyncEvent::RemoteElements(ref e) if e.len() == 2));

        let scene = scene.lock().await;
        assert_eq!(scene["a"].version(), 5);
        assert!(scene.contains_key("b"));
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(vec![Element::rectangle("a")]));
        assert!(queue.enqueue(vec![Element::rectangle("b"), Element::rectangle("c")]));
        assert!(!queue.enqueue(vec![Element::rectangle("d")]));
        assert_eq!(queue.element_count(), 3);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());

        queue.enqueue(vec![Element::rectangle("e")]);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
