//! Connection registry: owns every live room and its connections.
//!
//! ```text
//! ConnectionRegistry
//!   rooms: RwLock<HashMap<room_id, Arc<RoomEntry>>>   (create / evict only)
//!             │
//!             ▼
//!   RoomEntry: Mutex<RoomSession>                      (one lock per room)
//!             ├── Room            document, participants, presence
//!             └── BroadcastGroup  user → transport
//! ```
//!
//! Lock order is always map → released → room, or room → map (eviction).
//! Nobody waits for a room lock while holding the map lock. Fan-out happens
//! under the room lock but never blocks: transports only `try_send` into
//! bounded per-connection queues. Store calls run on the blocking pool, so a
//! slow disk only holds up the room being saved or loaded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::broadcast::{BroadcastGroup, ConnectionId, Transport, TransportError};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::room::{LeaveOutcome, Room, RoomConfig, RoomError, RoomPhase};
use crate::storage::{DocumentStore, StoreError};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long to wait for a room lock before answering `Busy`.
    pub lock_timeout: Duration,
    /// Inactivity after which a room counts as idle.
    pub idle_after: Duration,
    /// Attach the full document text to every `edit` frame.
    pub snapshot_on_edit: bool,
    pub room: RoomConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            idle_after: Duration::from_secs(60),
            snapshot_on_edit: false,
            room: RoomConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            lock_timeout: Duration::from_millis(200),
            idle_after: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Room lock not acquired in time; retry later.
    #[error("room {0} is busy")]
    Busy(String),
    /// The handle no longer owns the user's slot (replaced or evicted).
    #[error("connection {connection} is no longer registered for {user_id} in {room_id}")]
    StaleConnection {
        room_id: String,
        user_id: String,
        connection: ConnectionId,
    },
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// Identifies one registered connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub room_id: String,
    pub user_id: String,
    pub connection: ConnectionId,
}

/// What the connection loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    /// The client asked to leave; stop reading.
    Close,
}

/// Registry-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub rooms_created: u64,
    pub connections_opened: u64,
    pub messages_broadcast: u64,
    pub evictions: u64,
    pub snapshots_persisted: u64,
}

#[derive(Default)]
struct AtomicRegistryStats {
    rooms_created: AtomicU64,
    connections_opened: AtomicU64,
    messages_broadcast: AtomicU64,
    evictions: AtomicU64,
    snapshots_persisted: AtomicU64,
}

struct RoomSession {
    room: Room,
    group: BroadcastGroup,
}

struct RoomEntry {
    session: Mutex<RoomSession>,
}

/// Owns all rooms; the only way to create or evict one.
pub struct ConnectionRegistry {
    rooms: RwLock<HashMap<String, Arc<RoomEntry>>>,
    store: Option<Arc<dyn DocumentStore>>,
    config: RegistryConfig,
    next_connection: AtomicU64,
    stats: AtomicRegistryStats,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store: None,
            config,
            next_connection: AtomicU64::new(1),
            stats: AtomicRegistryStats::default(),
        }
    }

    /// Registry that loads and persists snapshots through `store`.
    pub fn with_store(config: RegistryConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // ─── Connections ──────────────────────────────────────────────────

    /// Join `user_id` to `room_id` over `transport`.
    ///
    /// Creates the room on first join (from the stored snapshot, if any),
    /// sends `initial_state` to the joiner and `user_list` to everyone else.
    /// An older connection of the same user is replaced.
    pub async fn connect(
        &self,
        room_id: &str,
        user_id: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<ConnectionHandle, RegistryError> {
        loop {
            let entry = self.get_or_create(room_id).await?;
            let mut session = self.lock(room_id, &entry).await?;

            // Lost a race with the last leave: the entry is on its way out.
            if session.room.phase() == RoomPhase::Destroyed {
                drop(session);
                self.forget_room(room_id, &entry).await;
                continue;
            }

            let state = session.room.join(user_id)?;
            let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
            if let Some(old) = session.group.add(user_id, connection, transport) {
                log::info!("User {user_id} reconnected to {room_id}, replacing connection {old}");
            }
            self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);

            let initial: Arc<str> = Arc::from(state.to_message().encode()?);
            if let Err(e) = session.group.send_to(user_id, initial) {
                log::warn!("Could not send initial state to {user_id} in {room_id}: {e}");
                if self.evict(room_id, &mut session, vec![user_id.to_string()]).await {
                    drop(session);
                    self.forget_room(room_id, &entry).await;
                }
                return Err(e.into());
            }

            let user_list = session.room.user_list_message();
            let failed = self.fan_out(&mut session, &user_list, Some(user_id))?;
            if self.evict(room_id, &mut session, failed).await {
                drop(session);
                self.forget_room(room_id, &entry).await;
            }

            return Ok(ConnectionHandle {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                connection,
            });
        }
    }

    /// Remove `user_id` from `room_id` whatever connection it is on.
    pub async fn disconnect(&self, room_id: &str, user_id: &str) -> Result<(), RegistryError> {
        let entry = self.entry(room_id).await?;
        let mut session = self.lock(room_id, &entry).await?;
        if self.evict(room_id, &mut session, vec![user_id.to_string()]).await {
            drop(session);
            self.forget_room(room_id, &entry).await;
        }
        Ok(())
    }

    /// Clean up after a connection ended.
    ///
    /// Does nothing if the user has since reconnected on a newer connection.
    pub async fn release(&self, handle: &ConnectionHandle) -> Result<(), RegistryError> {
        let Some(entry) = self.rooms.read().await.get(&handle.room_id).cloned() else {
            return Ok(());
        };
        let mut session = self.lock(&handle.room_id, &entry).await?;
        if session.group.connection_of(&handle.user_id) != Some(handle.connection) {
            log::debug!(
                "Ignoring release of stale connection {} for {}",
                handle.connection,
                handle.user_id
            );
            return Ok(());
        }
        if self.evict(&handle.room_id, &mut session, vec![handle.user_id.clone()]).await {
            drop(session);
            self.forget_room(&handle.room_id, &entry).await;
        }
        Ok(())
    }

    // ─── Messages ─────────────────────────────────────────────────────

    /// Apply one client message on behalf of `handle`.
    pub async fn handle_message(
        &self,
        handle: &ConnectionHandle,
        message: ClientMessage,
    ) -> Result<Dispatch, RegistryError> {
        if message == ClientMessage::Leave {
            self.release(handle).await?;
            return Ok(Dispatch::Close);
        }

        let entry = self.entry(&handle.room_id).await?;
        let mut session = self.lock(&handle.room_id, &entry).await?;
        if session.group.connection_of(&handle.user_id) != Some(handle.connection) {
            return Err(RegistryError::StaleConnection {
                room_id: handle.room_id.clone(),
                user_id: handle.user_id.clone(),
                connection: handle.connection,
            });
        }

        let failed = match message {
            ClientMessage::Operation {
                operations,
                base_version,
            } => {
                let edit = session
                    .room
                    .apply_edit_from(&handle.user_id, base_version, operations)?;
                log::trace!(
                    "Room {}: {} edits from {} (version {})",
                    handle.room_id,
                    edit.operations.len(),
                    handle.user_id,
                    edit.version
                );
                let mut failed = if edit.is_empty() {
                    Vec::new()
                } else {
                    let msg = edit.to_message(self.config.snapshot_on_edit);
                    self.fan_out(&mut session, &msg, Some(&handle.user_id))?
                };
                // Queued after every edit frame it already reflects.
                if edit.resync {
                    let frame: Arc<str> = Arc::from(edit.sync_message().encode()?);
                    if session.group.send_to(&handle.user_id, frame).is_err() {
                        failed.push(handle.user_id.clone());
                    }
                }
                failed
            }
            ClientMessage::Cursor { position } => {
                let cursors = session.room.update_cursor(&handle.user_id, position)?;
                let msg = ServerMessage::Cursor {
                    cursor_position: cursors,
                };
                self.fan_out(&mut session, &msg, Some(&handle.user_id))?
            }
            ClientMessage::Colors => {
                let frame: Arc<str> = Arc::from(session.room.user_list_message().encode()?);
                match session.group.send_to(&handle.user_id, frame) {
                    Ok(()) => Vec::new(),
                    Err(_) => vec![handle.user_id.clone()],
                }
            }
            ClientMessage::Leave => Vec::new(),
        };

        if self.evict(&handle.room_id, &mut session, failed).await {
            drop(session);
            self.forget_room(&handle.room_id, &entry).await;
        }
        Ok(Dispatch::Continue)
    }

    /// Send `message` to everyone in `room_id` except `exclude`.
    ///
    /// Returns how many connections took the frame. Failed ones are evicted.
    pub async fn broadcast(
        &self,
        room_id: &str,
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<usize, RegistryError> {
        let entry = self.entry(room_id).await?;
        let mut session = self.lock(room_id, &entry).await?;
        let targets = session.group.len() - usize::from(exclude.is_some_and(|u| session.group.contains(u)));
        let failed = self.fan_out(&mut session, message, exclude)?;
        let delivered = targets - failed.len();
        if self.evict(room_id, &mut session, failed).await {
            drop(session);
            self.forget_room(room_id, &entry).await;
        }
        Ok(delivered)
    }

    /// Send an `error` frame to one user.
    pub async fn send_error(&self, handle: &ConnectionHandle, message: &str) -> Result<(), RegistryError> {
        let entry = self.entry(&handle.room_id).await?;
        let mut session = self.lock(&handle.room_id, &entry).await?;
        let frame: Arc<str> = Arc::from(ServerMessage::error(message).encode()?);
        session.group.send_to(&handle.user_id, frame)?;
        Ok(())
    }

    // ─── Checkpoints ──────────────────────────────────────────────────

    /// Persist rooms that went idle with unsaved changes.
    ///
    /// Busy rooms are skipped until the next round. Returns rooms persisted.
    pub async fn checkpoint_idle(&self) -> usize {
        self.checkpoint(false).await
    }

    /// Persist every room with unsaved changes, idle or not.
    pub async fn checkpoint_all(&self) -> usize {
        self.checkpoint(true).await
    }

    async fn checkpoint(&self, everything: bool) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let entries: Vec<(String, Arc<RoomEntry>)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        let now = Instant::now();
        let mut persisted = 0;
        for (room_id, entry) in entries {
            let Ok(mut session) = self.lock(&room_id, &entry).await else {
                continue;
            };
            let phase = session.room.refresh_phase(now, self.config.idle_after);
            let due = everything || phase == RoomPhase::Idle;
            if !due || !session.room.is_dirty() {
                continue;
            }
            let writer = Arc::clone(store);
            let (id, snapshot) = (room_id.clone(), session.room.snapshot());
            match run_blocking(move || writer.persist(&id, &snapshot)).await {
                Ok(()) => {
                    session.room.mark_clean();
                    self.stats.snapshots_persisted.fetch_add(1, Ordering::Relaxed);
                    persisted += 1;
                    log::debug!("Checkpointed room {room_id}");
                }
                Err(e) => log::error!("Failed to checkpoint room {room_id}: {e}"),
            }
        }
        persisted
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn has_room(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    /// Number of live connections in `room_id` (0 if the room is gone).
    pub async fn connection_count(&self, room_id: &str) -> Result<usize, RegistryError> {
        let Some(entry) = self.rooms.read().await.get(room_id).cloned() else {
            return Ok(0);
        };
        let count = self.lock(room_id, &entry).await?.group.len();
        Ok(count)
    }

    pub async fn users(&self, room_id: &str) -> Result<Vec<String>, RegistryError> {
        let entry = self.entry(room_id).await?;
        let users = self.lock(room_id, &entry).await?.room.users();
        Ok(users)
    }

    /// Current text of `room_id`.
    pub async fn snapshot(&self, room_id: &str) -> Result<String, RegistryError> {
        let entry = self.entry(room_id).await?;
        let text = self.lock(room_id, &entry).await?.room.snapshot();
        Ok(text)
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_rooms: self.room_count().await,
            rooms_created: self.stats.rooms_created.load(Ordering::Relaxed),
            connections_opened: self.stats.connections_opened.load(Ordering::Relaxed),
            messages_broadcast: self.stats.messages_broadcast.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            snapshots_persisted: self.stats.snapshots_persisted.load(Ordering::Relaxed),
        }
    }

    // ─── Internals ────────────────────────────────────────────────────

    async fn entry(&self, room_id: &str) -> Result<Arc<RoomEntry>, RegistryError> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))
    }

    async fn get_or_create(&self, room_id: &str) -> Result<Arc<RoomEntry>, RegistryError> {
        // Fast path: read lock
        if let Some(entry) = self.rooms.read().await.get(room_id) {
            return Ok(Arc::clone(entry));
        }

        let snapshot = match &self.store {
            Some(store) => {
                let (store, id) = (Arc::clone(store), room_id.to_string());
                run_blocking(move || store.load(&id)).await?
            }
            None => None,
        };

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(entry) = rooms.get(room_id) {
            return Ok(Arc::clone(entry));
        }

        let room = match snapshot {
            Some(text) => {
                log::info!("Restoring room {room_id} from snapshot ({} bytes)", text.len());
                Room::from_snapshot(room_id, &text, self.config.room.clone())
            }
            None => Room::new(room_id, self.config.room.clone()),
        };
        let entry = Arc::new(RoomEntry {
            session: Mutex::new(RoomSession {
                room,
                group: BroadcastGroup::new(),
            }),
        });
        rooms.insert(room_id.to_string(), Arc::clone(&entry));
        self.stats.rooms_created.fetch_add(1, Ordering::Relaxed);
        log::info!("Created room {room_id}");
        Ok(entry)
    }

    async fn lock<'a>(
        &self,
        room_id: &str,
        entry: &'a RoomEntry,
    ) -> Result<MutexGuard<'a, RoomSession>, RegistryError> {
        tokio::time::timeout(self.config.lock_timeout, entry.session.lock())
            .await
            .map_err(|_| {
                log::warn!("Timed out waiting for room {room_id}");
                RegistryError::Busy(room_id.to_string())
            })
    }

    /// Drop `entry` from the map unless it was already replaced.
    async fn forget_room(&self, room_id: &str, entry: &Arc<RoomEntry>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            rooms.remove(room_id);
            log::info!("Removed room {room_id}");
        }
    }

    fn fan_out(
        &self,
        session: &mut RoomSession,
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<Vec<String>, RegistryError> {
        let frame: Arc<str> = Arc::from(message.encode()?);
        self.stats.messages_broadcast.fetch_add(1, Ordering::Relaxed);
        Ok(session.group.broadcast(frame, exclude))
    }

    /// Remove `users` and run leave cleanup for each, including anyone whose
    /// transport fails while being told about it.
    ///
    /// Returns true if the room was destroyed; its snapshot is persisted
    /// before this returns, while the room lock is still held.
    async fn evict(&self, room_id: &str, session: &mut RoomSession, users: Vec<String>) -> bool {
        let mut queue = users;
        while let Some(user_id) = queue.pop() {
            let had_connection = session.group.remove(&user_id).is_some();
            match session.room.leave(&user_id) {
                Ok(LeaveOutcome::Destroyed { snapshot }) => {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    self.persist(room_id, snapshot, session.room.is_dirty()).await;
                    return true;
                }
                Ok(LeaveOutcome::Remaining(_)) => {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    let user_list = session.room.user_list_message();
                    match self.fan_out(session, &user_list, None) {
                        Ok(failed) => queue.extend(failed),
                        Err(e) => log::error!("Could not encode user list for {room_id}: {e}"),
                    }
                }
                Err(e) if had_connection => {
                    log::warn!("Connection of {user_id} in {room_id} had no participant: {e}")
                }
                Err(_) => {}
            }
        }
        false
    }

    async fn persist(&self, room_id: &str, snapshot: String, dirty: bool) {
        let Some(store) = &self.store else {
            return;
        };
        if !dirty {
            return;
        }
        let bytes = snapshot.len();
        let (store, id) = (Arc::clone(store), room_id.to_string());
        match run_blocking(move || store.persist(&id, &snapshot)).await {
            Ok(()) => {
                self.stats.snapshots_persisted.fetch_add(1, Ordering::Relaxed);
                log::info!("Persisted room {room_id} ({bytes} bytes)");
            }
            Err(e) => log::error!("Failed to persist room {room_id}: {e}"),
        }
    }
}

/// Run a store call on the blocking pool.
async fn run_blocking<T, F>(task: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| StoreError::Background(e.to_string()))?
}

/// Runs [`ConnectionRegistry::release`] when dropped, so a cancelled or
/// panicked connection task still cleans up its slot.
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    handle: Option<ConnectionHandle>,
}

impl ConnectionGuard {
    pub fn new(registry: Arc<ConnectionRegistry>, handle: ConnectionHandle) -> Self {
        Self {
            registry,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    /// Release now instead of on drop.
    pub async fn release(mut self) -> Result<(), RegistryError> {
        match self.handle.take() {
            Some(handle) => self.registry.release(&handle).await,
            None => Ok(()),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime to release {} in {}", handle.user_id, handle.room_id);
            return;
        };
        let registry = Arc::clone(&self.registry);
        runtime.spawn(async move {
            if let Err(e) = registry.release(&handle).await {
                log::warn!("Deferred release of {} failed: {e}", handle.user_id);
            }
        });
    }
}
