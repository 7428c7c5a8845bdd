//! # synccode-collab: Real-time collaborative text rooms
//!
//! Several users edit one shared document over independent WebSocket
//! connections. Every participant converges on the same text no matter the
//! order in which operations arrive.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON frames   ┌──────────────────────────────────┐
//! │ Editor      │ ◄─────────────► │ SyncServer                       │
//! │ (per user)  │  /ws/room/user  │   ConnectionRegistry             │
//! └─────────────┘                 │     ├── Room ── Rga (CRDT)       │
//!                                 │     │     ├── Deduplicator       │
//!                                 │     │     └── PresenceManager    │
//!                                 │     └── BroadcastGroup (fan-out) │
//!                                 └──────────────┬───────────────────┘
//!                                                │ snapshots
//!                                                ▼
//!                                     DocumentStore (Memory | RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`rga`]: Replicated growable array, ids and Lamport clock
//! - [`dedup`]: At-most-once bookkeeping with watermark compaction
//! - [`presence`]: Per-room colors and cursors
//! - [`room`]: Room coordinator and lifecycle
//! - [`broadcast`]: Per-room fan-out over non-blocking transports
//! - [`registry`]: Room ownership, connections, self-healing eviction
//! - [`protocol`]: JSON wire messages
//! - [`server`]: WebSocket server
//! - [`storage`]: Snapshot persistence

pub mod broadcast;
pub mod dedup;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod rga;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Transport, TransportError};
pub use dedup::Deduplicator;
pub use presence::{PresenceManager, DEFAULT_PALETTE};
pub use protocol::{
    ClientMessage, ClientOperation, EditKind, EditPayload, ProtocolError, ServerMessage,
};
pub use registry::{
    ConnectionGuard, ConnectionHandle, ConnectionRegistry, Dispatch, RegistryConfig,
    RegistryError, RegistryStats,
};
pub use rga::{
    ApplyOutcome, Element, LamportClock, Operation, OperationId, OperationKind, ReplicaId, Rga,
    RgaError,
};
pub use room::{EditBroadcast, JoinState, LeaveOutcome, Room, RoomConfig, RoomError, RoomPhase};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{DocumentStore, MemoryStore, RocksStore, SnapshotMetadata, StoreConfig, StoreError};
