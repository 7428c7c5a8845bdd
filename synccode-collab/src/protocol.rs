//! JSON wire protocol between editors and the room server.
//!
//! Every frame is one JSON object tagged by `"type"`:
//! ```text
//! client → server   operation | cursor | colors | leave
//! server → client   initial_state | edit | sync | cursor | user_list | error
//! ```
//!
//! Client edits are positional (`position` counts Unicode scalar values).
//! The room translates them into id-based [`Operation`]s and echoes both
//! forms to the other participants.
//!
//! Every applied batch bumps the room `version`. A client tags its batch
//! with the last version it saw (`base_version`). When another user's batch
//! landed after that version, the positions were resolved against a text the
//! sender had not seen, and the sender gets a `sync` frame carrying the
//! authoritative text. Untagged batches are judged against the sender's
//! previous batch (or its join).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::rga::Operation;

/// Kind of a positional client edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Insert,
    Delete,
}

/// One positional edit as sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOperation {
    /// Client-chosen id for retries. Filled with a UUID v4 when missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: EditKind,
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Delete length, 1 when missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
}

impl ClientOperation {
    pub fn insert(position: i64, text: impl Into<String>) -> Self {
        Self {
            operation_id: None,
            kind: EditKind::Insert,
            position,
            text: Some(text.into()),
            length: None,
        }
    }

    pub fn delete(position: i64, length: i64) -> Self {
        Self {
            operation_id: None,
            kind: EditKind::Delete,
            position,
            text: None,
            length: Some(length),
        }
    }

    pub fn with_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }
}

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Operation {
        operations: Vec<ClientOperation>,
        /// Room version the client's text reflected when it made the edits.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_version: Option<u64>,
    },
    Cursor { position: i64 },
    Colors,
    Leave,
}

impl ClientMessage {
    /// Untagged edit batch.
    pub fn edits(operations: Vec<ClientOperation>) -> Self {
        ClientMessage::Operation {
            operations,
            base_version: None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Operations carried by an `edit` message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EditPayload {
    /// Applied client edits with normalized positions and filled ids.
    pub operation: Vec<ClientOperation>,
    /// The same edits as id-based CRDT operations.
    #[serde(default)]
    pub crdt_operations: Vec<Operation>,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    InitialState {
        document_snapshot: String,
        users: Vec<String>,
        user_colors: BTreeMap<String, String>,
        #[serde(default)]
        cursor_position: BTreeMap<String, usize>,
        #[serde(default)]
        version: u64,
    },
    Edit {
        user_id: String,
        payload: EditPayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_snapshot: Option<String>,
        /// Room version after this edit.
        #[serde(default)]
        version: u64,
    },
    /// Authoritative text for a sender whose batch raced another user's.
    Sync {
        document_snapshot: String,
        version: u64,
    },
    Cursor {
        cursor_position: BTreeMap<String, usize>,
    },
    UserList {
        users: Vec<String>,
        user_colors: BTreeMap<String, String>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::InitialState { .. } => "initial_state",
            ServerMessage::Edit { .. } => "edit",
            ServerMessage::Sync { .. } => "sync",
            ServerMessage::Cursor { .. } => "cursor",
            ServerMessage::UserList { .. } => "user_list",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(&'static str),
}
