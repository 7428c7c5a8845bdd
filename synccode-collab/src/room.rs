//! Room coordinator: one shared document plus its participants.
//!
//! ```text
//!            join                 leave (last)
//!   Empty ─────────► Active ──────────────────► Destroyed
//!                    │    ▲
//!     no activity    │    │  join / edit / cursor
//!     (refresh_phase)▼    │
//!                    Idle ┘
//! ```
//!
//! Each batch that changes the document bumps the room version. A sender
//! whose batch was resolved against text it had not seen yet (another
//! user's batch landed in between) is flagged for a resync.
//!
//! A `Room` is plain synchronous state. Callers serialize access to it
//! (the registry keeps each room behind its own async mutex), so colors,
//! cursors and document edits are always updated together.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::dedup::Deduplicator;
use crate::presence::PresenceManager;
use crate::protocol::{ClientOperation, EditKind, EditPayload, ServerMessage};
use crate::rga::{Operation, ReplicaId, Rga, RgaError, DEFAULT_MAX_PENDING};

/// Room tuning knobs.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How many Lamport ticks a client `operation_id` is remembered for.
    pub dedup_horizon: u64,
    /// Cap on CRDT operations parked waiting for a dependency.
    pub max_pending: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            dedup_horizon: 65_536,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Empty,
    Active,
    Idle,
    Destroyed,
}

/// Room errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("user {user_id} has not joined room {room_id}")]
    NotJoined { room_id: String, user_id: String },
    #[error("room {0} has been destroyed")]
    Destroyed(String),
    #[error(transparent)]
    Sequence(#[from] RgaError),
}

#[derive(Debug, Clone)]
struct Participant {
    replica: ReplicaId,
    /// Last Lamport counter this participant produced (or the clock at join).
    last_counter: u64,
    /// Room version the participant's text matched after its last batch.
    synced_version: u64,
    /// Version produced by the most recent batch of someone else.
    last_foreign_version: u64,
}

/// What a joining user needs to start in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinState {
    pub document_snapshot: String,
    pub users: Vec<String>,
    pub user_colors: BTreeMap<String, String>,
    pub cursor_position: BTreeMap<String, usize>,
    pub color: String,
    pub replica: ReplicaId,
    pub version: u64,
}

impl JoinState {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::InitialState {
            document_snapshot: self.document_snapshot.clone(),
            users: self.users.clone(),
            user_colors: self.user_colors.clone(),
            cursor_position: self.cursor_position.clone(),
            version: self.version,
        }
    }
}

/// Result of an edit batch, ready to fan out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditBroadcast {
    pub user_id: String,
    /// Applied client edits, normalized.
    pub operations: Vec<ClientOperation>,
    pub crdt_operations: Vec<Operation>,
    pub document_snapshot: String,
    /// Edits skipped as retries of an already-applied `operation_id`.
    pub duplicates: usize,
    /// Room version after the batch.
    pub version: u64,
    /// The sender's text may differ from the room's; send it a `sync`.
    pub resync: bool,
}

impl EditBroadcast {
    /// Nothing to tell the other participants.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn to_message(&self, include_snapshot: bool) -> ServerMessage {
        ServerMessage::Edit {
            user_id: self.user_id.clone(),
            payload: EditPayload {
                operation: self.operations.clone(),
                crdt_operations: self.crdt_operations.clone(),
            },
            document_snapshot: include_snapshot.then(|| self.document_snapshot.clone()),
            version: self.version,
        }
    }

    /// `sync` frame for the sender.
    pub fn sync_message(&self) -> ServerMessage {
        ServerMessage::Sync {
            document_snapshot: self.document_snapshot.clone(),
            version: self.version,
        }
    }
}

/// Result of a leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Others are still here.
    Remaining(usize),
    /// That was the last participant; the final document text.
    Destroyed { snapshot: String },
}

/// One collaborative document and its participants.
#[derive(Debug)]
pub struct Room {
    id: String,
    phase: RoomPhase,
    config: RoomConfig,
    rga: Rga,
    participants: BTreeMap<String, Participant>,
    presence: PresenceManager,
    /// Applied client `operation_id`s, stamped with the clock at application.
    seen: Deduplicator<String>,
    next_replica: u64,
    /// Number of batches that changed the document.
    version: u64,
    last_activity: Instant,
    /// Document changed since the last checkpoint.
    dirty: bool,
}

impl Room {
    pub fn new(id: impl Into<String>, config: RoomConfig) -> Self {
        Self::from_snapshot(id, "", config)
    }

    /// Room whose document starts as `snapshot`.
    pub fn from_snapshot(id: impl Into<String>, snapshot: &str, config: RoomConfig) -> Self {
        let rga = Rga::from_snapshot(ReplicaId::SNAPSHOT, snapshot).with_max_pending(config.max_pending);
        Self {
            id: id.into(),
            phase: RoomPhase::Empty,
            config,
            rga,
            participants: BTreeMap::new(),
            presence: PresenceManager::new(),
            seen: Deduplicator::new(),
            next_replica: 1,
            version: 0,
            last_activity: Instant::now(),
            dirty: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    // ─── Participants ─────────────────────────────────────────────────

    /// Add `user_id`, assign a color and a replica id.
    ///
    /// Joining again while already active returns the current state without
    /// handing out a new replica id.
    pub fn join(&mut self, user_id: &str) -> Result<JoinState, RoomError> {
        self.ensure_alive()?;

        if !self.participants.contains_key(user_id) {
            let replica = ReplicaId(self.next_replica);
            self.next_replica += 1;
            self.participants.insert(
                user_id.to_string(),
                Participant {
                    replica,
                    last_counter: self.rga.clock().current(),
                    synced_version: self.version,
                    last_foreign_version: self.version,
                },
            );
            log::info!("User {user_id} joined room {} as {replica}", self.id);
        }
        let color = self.presence.assign_color(user_id);
        self.touch();

        let replica = self
            .participants
            .get(user_id)
            .map(|p| p.replica)
            .unwrap_or(ReplicaId::SNAPSHOT);

        Ok(JoinState {
            document_snapshot: self.rga.materialize(),
            users: self.users(),
            user_colors: self.presence.colors().clone(),
            cursor_position: self.presence.cursors().clone(),
            color,
            replica,
            version: self.version,
        })
    }

    /// Remove `user_id` with its color and cursor.
    pub fn leave(&mut self, user_id: &str) -> Result<LeaveOutcome, RoomError> {
        self.ensure_alive()?;
        if self.participants.remove(user_id).is_none() {
            return Err(self.not_joined(user_id));
        }
        self.presence.release(user_id);
        log::info!("User {user_id} left room {}", self.id);

        if self.participants.is_empty() {
            self.phase = RoomPhase::Destroyed;
            log::info!("Room {} is empty, destroying", self.id);
            return Ok(LeaveOutcome::Destroyed {
                snapshot: self.rga.materialize(),
            });
        }

        self.compact();
        self.touch();
        Ok(LeaveOutcome::Remaining(self.participants.len()))
    }

    // ─── Edits ────────────────────────────────────────────────────────

    /// Apply a batch of positional edits from `user_id`, in order.
    pub fn apply_edit(
        &mut self,
        user_id: &str,
        batch: Vec<ClientOperation>,
    ) -> Result<EditBroadcast, RoomError> {
        self.apply_edit_from(user_id, None, batch)
    }

    /// Like [`Room::apply_edit`], for a batch made against room version
    /// `base_version`. Without a base, the sender's previous batch (or its
    /// join) is taken as the version it had seen.
    pub fn apply_edit_from(
        &mut self,
        user_id: &str,
        base_version: Option<u64>,
        batch: Vec<ClientOperation>,
    ) -> Result<EditBroadcast, RoomError> {
        self.ensure_alive()?;
        let current = self.version;
        let (replica, seen_version, last_foreign) = self
            .participants
            .get(user_id)
            .map(|p| {
                let seen = base_version.map_or(p.synced_version, |base| base.min(current));
                (p.replica, seen, p.last_foreign_version)
            })
            .ok_or_else(|| self.not_joined(user_id))?;
        let resync = last_foreign > seen_version;

        let mut operations = Vec::with_capacity(batch.len());
        let mut crdt_operations = Vec::new();
        let mut duplicates = 0;

        for mut op in batch {
            let operation_id = op
                .operation_id
                .get_or_insert_with(|| Uuid::new_v4().to_string())
                .clone();
            if self.seen.contains(&operation_id) {
                log::debug!("Skipping replayed operation {operation_id} in room {}", self.id);
                duplicates += 1;
                continue;
            }

            let doc_len = self.rga.len();
            let position = clamp_offset(op.position, doc_len);
            op.position = position as i64;

            match op.kind {
                EditKind::Insert => {
                    let Some(text) = op.text.as_deref().filter(|t| !t.is_empty()) else {
                        log::warn!("Ignoring insert without text from {user_id} in room {}", self.id);
                        continue;
                    };
                    if let Some(crdt) = self.rga.generate_insert(replica, position, text) {
                        let crdt = crdt.with_origin(user_id);
                        self.rga.apply_operation(&crdt)?;
                        crdt_operations.push(crdt);
                    }
                }
                EditKind::Delete => {
                    let requested = op.length.unwrap_or(1).max(0) as usize;
                    let length = requested.min(doc_len - position);
                    op.length = Some(length as i64);
                    for crdt in self.rga.generate_delete(replica, position, length) {
                        let crdt = crdt.with_origin(user_id);
                        self.rga.apply_operation(&crdt)?;
                        crdt_operations.push(crdt);
                    }
                }
            }

            let now = self.rga.clock().current();
            self.seen.record(operation_id, now);
            if let Some(participant) = self.participants.get_mut(user_id) {
                participant.last_counter = now;
            }
            operations.push(op);
        }

        if !operations.is_empty() {
            self.version += 1;
            let version = self.version;
            for (id, participant) in self.participants.iter_mut() {
                if id != user_id {
                    participant.last_foreign_version = version;
                }
            }
            self.dirty = true;
            self.compact();
        }
        if let Some(participant) = self.participants.get_mut(user_id) {
            participant.synced_version = self.version;
        }
        if resync {
            log::debug!(
                "Batch from {user_id} in room {} raced version {last_foreign}, resyncing",
                self.id
            );
        }
        self.touch();

        Ok(EditBroadcast {
            user_id: user_id.to_string(),
            operations,
            crdt_operations,
            document_snapshot: self.rga.materialize(),
            duplicates,
            version: self.version,
            resync,
        })
    }

    /// Last-write-wins cursor update. Returns the full cursor map.
    pub fn update_cursor(
        &mut self,
        user_id: &str,
        offset: i64,
    ) -> Result<BTreeMap<String, usize>, RoomError> {
        self.ensure_alive()?;
        if !self.participants.contains_key(user_id) {
            return Err(self.not_joined(user_id));
        }
        let offset = clamp_offset(offset, self.rga.len());
        self.touch();
        Ok(self.presence.update_cursor(user_id, offset).clone())
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Move Active → Idle once nothing happened for `idle_after`.
    pub fn refresh_phase(&mut self, now: Instant, idle_after: Duration) -> RoomPhase {
        if self.phase == RoomPhase::Active
            && now.saturating_duration_since(self.last_activity) >= idle_after
        {
            log::debug!("Room {} is idle", self.id);
            self.phase = RoomPhase::Idle;
        }
        self.phase
    }

    /// Has the document changed since the last [`Room::mark_clean`]?
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn snapshot(&self) -> String {
        self.rga.materialize()
    }

    pub fn users(&self) -> Vec<String> {
        self.participants.keys().cloned().collect()
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id)
    }

    pub fn user_count(&self) -> usize {
        self.participants.len()
    }

    pub fn user_colors(&self) -> &BTreeMap<String, String> {
        self.presence.colors()
    }

    pub fn cursors(&self) -> &BTreeMap<String, usize> {
        self.presence.cursors()
    }

    pub fn replica_of(&self, user_id: &str) -> Option<ReplicaId> {
        self.participants.get(user_id).map(|p| p.replica)
    }

    /// Number of batches that changed the document so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn sequence(&self) -> &Rga {
        &self.rga
    }

    /// Client operation ids currently remembered.
    pub fn remembered_operation_ids(&self) -> usize {
        self.seen.len()
    }

    /// `user_list` frame for the current participants.
    pub fn user_list_message(&self) -> ServerMessage {
        ServerMessage::UserList {
            users: self.users(),
            user_colors: self.presence.colors().clone(),
        }
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn ensure_alive(&self) -> Result<(), RoomError> {
        if self.phase == RoomPhase::Destroyed {
            return Err(RoomError::Destroyed(self.id.clone()));
        }
        Ok(())
    }

    fn not_joined(&self, user_id: &str) -> RoomError {
        RoomError::NotJoined {
            room_id: self.id.clone(),
            user_id: user_id.to_string(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        if matches!(self.phase, RoomPhase::Empty | RoomPhase::Idle) {
            self.phase = RoomPhase::Active;
        }
    }

    /// Drop dedup state no participant can still need.
    fn compact(&mut self) {
        // Every future CRDT op is stamped above each active participant's
        // last counter.
        if let Some(stable) = self.participants.values().map(|p| p.last_counter).min() {
            self.rga.compact(stable);
        }
        let horizon = self
            .rga
            .clock()
            .current()
            .saturating_sub(self.config.dedup_horizon);
        self.seen.advance_watermark(horizon);
    }
}

fn clamp_offset(position: i64, len: usize) -> usize {
    usize::try_from(position.max(0)).map_or(len, |p| p.min(len))
}
