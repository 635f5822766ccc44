//! JSON wire protocol between browser clients and the sync server.
//!
//! Every WebSocket text frame is one JSON object tagged by `"type"`:
//! ```text
//! client → server                    server → client
//! ─────────────────────────────      ─────────────────────────────────────
//! join      {drawingId, identity}    snapshot  {drawingId, elements,
//! update    {elements}                          appState, files, version,
//! file      {fileId, mimeType,                  peers}
//!            dataURL, created}       update    {elements}
//! presence  {cursorX, cursorY,       file      {fileId, mimeType, dataURL, created}
//!            identity?}              presence  {peerId, cursorX, cursorY, identity}
//! heartbeat                          joined / left {peerId, identity}
//!                                    heartbeatAck
//!                                    storageWarning {message} / storageRecovered
//!                                    evicted {reason}
//!                                    error {kind, message}
//! ```
//!
//! Inbound element batches stay as raw JSON values until the room decodes
//! them one by one, so a single malformed element does not void its batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::element::Element;
use crate::files::{FileBlob, FileMap};
use crate::presence::{CursorUpdate, PeerId, PeerIdentity, PeerInfo};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unsupported frame: {0}")]
    UnsupportedFrame(&'static str),

    #[error("Unexpected message: expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
}

// ───────────────────────────────────────────────────────────────────
// Client → server
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub drawing_id: Uuid,
    #[serde(default)]
    pub identity: PeerIdentity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub elements: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorRequest {
    pub cursor_x: f64,
    pub cursor_y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<PeerIdentity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Join(JoinRequest),
    Update(UpdateRequest),
    File(FileBlob),
    Presence(CursorRequest),
    Heartbeat,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::Update(_) => "update",
            ClientMessage::File(_) => "file",
            ClientMessage::Presence(_) => "presence",
            ClientMessage::Heartbeat => "heartbeat",
        }
    }

    /// Element update from already-typed elements.
    pub fn update(elements: &[Element]) -> Result<Self, ProtocolError> {
        let elements = elements
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClientMessage::Update(UpdateRequest { elements }))
    }
}

// ───────────────────────────────────────────────────────────────────
// Server → client
// ───────────────────────────────────────────────────────────────────

/// Full room state sent to a joining peer, and on resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub drawing_id: Uuid,
    pub elements: Vec<Element>,
    #[serde(default)]
    pub app_state: Value,
    #[serde(default)]
    pub files: FileMap,
    pub version: u64,
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementsUpdate {
    pub elements: Vec<Element>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerCursor {
    pub peer_id: PeerId,
    pub cursor_x: f64,
    pub cursor_y: f64,
    pub identity: PeerIdentity,
}

impl From<CursorUpdate> for PeerCursor {
    fn from(update: CursorUpdate) -> Self {
        Self {
            peer_id: update.peer_id,
            cursor_x: update.position.x,
            cursor_y: update.position.y,
            identity: update.identity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    RoomUnavailable,
    RoomClosing,
    JoinTimeout,
    Protocol,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Snapshot(Snapshot),
    Update(ElementsUpdate),
    File(FileBlob),
    Presence(PeerCursor),
    Joined(PeerInfo),
    Left(PeerInfo),
    HeartbeatAck,
    StorageWarning { message: String },
    StorageRecovered,
    Evicted { reason: String },
    Error { kind: ErrorKind, message: String },
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Snapshot(_) => "snapshot",
            ServerMessage::Update(_) => "update",
            ServerMessage::File(_) => "file",
            ServerMessage::Presence(_) => "presence",
            ServerMessage::Joined(_) => "joined",
            ServerMessage::Left(_) => "left",
            ServerMessage::HeartbeatAck => "heartbeatAck",
            ServerMessage::StorageWarning { .. } => "storageWarning",
            ServerMessage::StorageRecovered => "storageRecovered",
            ServerMessage::Evicted { .. } => "evicted",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind,
            message: message.into(),
        }
    }
}
