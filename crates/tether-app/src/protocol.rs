//! Wire messages exchanged over the broker's websocket.
//!
//! Text frames carry JSON objects tagged by `"type"`; binary frames carry raw
//! terminal bytes (client input one way, session output the other).

use serde::{Deserialize, Deserializer, Serialize};
use tether_pty::{SessionId, SessionInfo};

/// Messages sent from a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    CreateSession {
        cols: u16,
        rows: u16,
        #[serde(rename = "workspaceRef")]
        workspace_ref: String,
    },
    AttachSession {
        id: SessionId,
        cols: u16,
        rows: u16,
        #[serde(default)]
        replay: bool,
    },
    /// Text form of input; binary frames decode to this variant too.
    Input {
        #[serde(deserialize_with = "utf8_bytes")]
        data: Vec<u8>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    DetachSession,
    ListSessions,
    KillSession {
        id: SessionId,
    },
}

fn utf8_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(String::into_bytes)
}

/// Messages sent from the broker to a client as text frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Authenticated {
        principal: String,
    },
    SessionCreated {
        id: SessionId,
    },
    SessionAttached {
        id: SessionId,
        /// Bytes of scrollback queued ahead of live output.
        replayed: usize,
    },
    SessionDetached {
        id: SessionId,
    },
    SessionExited {
        id: SessionId,
        #[serde(rename = "exitCode")]
        exit_code: Option<u32>,
    },
    SessionList {
        sessions: Vec<SessionInfo>,
    },
    SessionKilled {
        id: SessionId,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Authentication,
    SpawnFailed,
    SessionNotFound,
    SessionDead,
    Geometry,
    NotAttached,
    InvalidMessage,
    Internal,
}

/// Everything a connection can emit, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Output(Vec<u8>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("malformed resize payload: {0}")]
    Geometry(String),
}

/// Decode a text frame.
///
/// A `resize` whose payload does not parse is reported as a geometry error
/// rather than a generic malformed message.
pub fn decode_text(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let is_resize = value.get("type").and_then(|t| t.as_str()) == Some("resize");
    serde_json::from_value(value).map_err(|e| {
        if is_resize {
            DecodeError::Geometry(e.to_string())
        } else {
            DecodeError::Malformed(e.to_string())
        }
    })
}

/// Binary frames are always raw input.
pub fn decode_binary(data: Vec<u8>) -> ClientMessage {
    ClientMessage::Input { data }
}
