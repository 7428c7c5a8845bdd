//! Fan-out of encoded frames to the connections of one room.
//!
//! Each connection is a [`Transport`] whose `send_frame` never waits: the
//! server backs it with a bounded mpsc channel drained by the connection's
//! own task. A full or closed channel is reported as a failure so the caller
//! can evict that one connection and keep going.
//!
//! Reference: Kleppmann, Chapter 8 (Broadcast Protocols)

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

/// Identifies one physical connection. A user that reconnects gets a new one.
pub type ConnectionId = u64;

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
}

/// Non-blocking sink for encoded frames of one connection.
pub trait Transport: Send + Sync {
    fn send_frame(&self, frame: Arc<str>) -> Result<(), TransportError>;
}

impl Transport for mpsc::Sender<Arc<str>> {
    fn send_frame(&self, frame: Arc<str>) -> Result<(), TransportError> {
        self.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// Counters for one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct Member {
    connection: ConnectionId,
    transport: Arc<dyn Transport>,
}

/// The live connections of one room, keyed by user.
///
/// Owned by the room session and only touched under the room's lock, so it
/// needs no interior synchronization.
#[derive(Default)]
pub struct BroadcastGroup {
    members: BTreeMap<String, Member>,
    messages_sent: u64,
    messages_dropped: u64,
}

impl std::fmt::Debug for BroadcastGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastGroup")
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .field("messages_sent", &self.messages_sent)
            .finish()
    }
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user_id`'s connection, replacing any older one.
    ///
    /// Returns the replaced connection id.
    pub fn add(
        &mut self,
        user_id: &str,
        connection: ConnectionId,
        transport: Arc<dyn Transport>,
    ) -> Option<ConnectionId> {
        self.members
            .insert(
                user_id.to_string(),
                Member {
                    connection,
                    transport,
                },
            )
            .map(|old| old.connection)
    }

    /// Remove `user_id` whatever its connection.
    pub fn remove(&mut self, user_id: &str) -> Option<ConnectionId> {
        self.members.remove(user_id).map(|m| m.connection)
    }

    pub fn connection_of(&self, user_id: &str) -> Option<ConnectionId> {
        self.members.get(user_id).map(|m| m.connection)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }

    /// Send to one user.
    pub fn send_to(&mut self, user_id: &str, frame: Arc<str>) -> Result<(), TransportError> {
        let member = self.members.get(user_id).ok_or(TransportError::Closed)?;
        match member.transport.send_frame(frame) {
            Ok(()) => {
                self.messages_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.messages_dropped += 1;
                Err(e)
            }
        }
    }

    /// Send to every member except `exclude`.
    ///
    /// Returns the users whose send failed; the caller evicts them.
    pub fn broadcast(&mut self, frame: Arc<str>, exclude: Option<&str>) -> Vec<String> {
        let mut failed = Vec::new();
        for (user_id, member) in &self.members {
            if Some(user_id.as_str()) == exclude {
                continue;
            }
            match member.transport.send_frame(Arc::clone(&frame)) {
                Ok(()) => self.messages_sent += 1,
                Err(e) => {
                    log::warn!("Send to {user_id} failed: {e}");
                    self.messages_dropped += 1;
                    failed.push(user_id.clone());
                }
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            active_peers: self.members.len(),
        }
    }
}
