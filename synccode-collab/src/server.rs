//! WebSocket server exposing rooms at `ws://<bind>/ws/{room_id}/{user_id}`.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌──────────────────────────┐
//!             ├── connection task ───►│ ConnectionRegistry       │
//! Client B ──┘   (select! loop)       │   Room ── Rga            │
//!      ▲                              │   BroadcastGroup ──┐     │
//!      │  bounded mpsc (try_send)     └────────────────────┼─────┘
//!      └───────────────────────────────────────────────────┘
//!                                     │
//!                                     ▼ checkpoint / last leave
//!                               DocumentStore (RocksDB)
//! ```
//!
//! Each connection task owns its socket. It reads client frames and hands
//! them to the registry, and it drains its outbound queue into the socket.
//! The room lock is never held while the socket is awaited.

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::registry::{ConnectionGuard, ConnectionRegistry, Dispatch, RegistryConfig, RegistryError};
use crate::storage::{DocumentStore, RocksStore, StoreConfig, StoreError};

type BoxError = Box<dyn Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Snapshot storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Frames buffered per connection before it counts as too slow
    pub outbound_capacity: usize,
    /// How often idle rooms are checkpointed
    pub checkpoint_interval: Duration,
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            storage_path: None,
            outbound_capacity: 256,
            checkpoint_interval: Duration::from_secs(30),
            registry: RegistryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `SYNCCODE_BIND_ADDR`, `SYNCCODE_STORAGE_PATH`
    /// and `SYNCCODE_SNAPSHOT_ON_EDIT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ServerConfig::from_env`] but reading variables from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("SYNCCODE_BIND_ADDR").filter(|v| !v.is_empty()) {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("SYNCCODE_STORAGE_PATH").filter(|v| !v.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(flag) = lookup("SYNCCODE_SNAPSHOT_ON_EDIT") {
            match parse_flag(&flag) {
                Some(on) => config.registry.snapshot_on_edit = on,
                None => log::warn!("Ignoring SYNCCODE_SNAPSHOT_ON_EDIT={flag:?}"),
            }
        }
        config
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Connection-level counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    malformed_messages: AtomicU64,
}

/// The room server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server, opening RocksDB if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let registry = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                ConnectionRegistry::with_store(config.registry.clone(), Arc::new(store))
            }
            None => ConnectionRegistry::new(config.registry.clone()),
        };
        Ok(Self::with_registry(config, registry))
    }

    /// Create a server persisting through an arbitrary store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let registry = ConnectionRegistry::with_store(config.registry.clone(), store);
        Self::with_registry(config, registry)
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let registry = ConnectionRegistry::new(config.registry.clone());
        Self::with_registry(config, registry)
    }

    fn with_registry(config: ServerConfig, registry: ConnectionRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let checkpointer = tokio::spawn(checkpoint_loop(
            Arc::clone(&self.registry),
            self.config.checkpoint_interval,
        ));

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let registry = Arc::clone(&self.registry);
            let stats = Arc::clone(&self.stats);
            let capacity = self.config.outbound_capacity;
            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handle_connection(stream, addr, registry, &stats, capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        };

        checkpointer.abort();
        result
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            malformed_messages: self.stats.malformed_messages.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await,
        }
    }
}

async fn checkpoint_loop(registry: Arc<ConnectionRegistry>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // First tick fires immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let persisted = registry.checkpoint_idle().await;
        if persisted > 0 {
            log::debug!("Checkpointed {persisted} idle rooms");
        }
    }
}

/// Extract `(room_id, user_id)` from `/ws/{room_id}/{user_id}`.
pub fn parse_route(path: &str) -> Option<(String, String)> {
    let mut segments = path.trim_end_matches('/').strip_prefix("/ws/")?.split('/');
    let room_id = segments.next().filter(|s| !s.is_empty())?;
    let user_id = segments.next().filter(|s| !s.is_empty())?;
    if segments.next().is_some() {
        return None;
    }
    Some((room_id.to_string(), user_id.to_string()))
}

fn not_found(path: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("no room route at {path}")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

async fn send_error<S>(sink: &mut S, message: &str) -> Result<(), BoxError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::text(ServerMessage::error(message).encode()?))
        .await?;
    Ok(())
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    stats: &AtomicServerStats,
    outbound_capacity: usize,
) -> Result<(), BoxError> {
    let mut route = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        match parse_route(path) {
            Some(parsed) => {
                route = Some(parsed);
                Ok(response)
            }
            None => {
                log::warn!("Rejecting {addr}: bad path {path}");
                Err(not_found(path))
            }
        }
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let Some((room_id, user_id)) = route else {
        return Ok(());
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (outbound, mut outbound_rx) = mpsc::channel::<Arc<str>>(outbound_capacity);
    let handle = match registry.connect(&room_id, &user_id, Arc::new(outbound)).await {
        Ok(handle) => handle,
        Err(e) => {
            log::warn!("{user_id} could not join {room_id}: {e}");
            send_error(&mut ws_sender, &e.to_string()).await?;
            ws_sender.close().await?;
            return Ok(());
        }
    };
    log::info!("{user_id} connected to {room_id} from {addr}");
    let guard = ConnectionGuard::new(Arc::clone(&registry), handle.clone());

    loop {
        tokio::select! {
            // Incoming WebSocket message
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        let message = match ClientMessage::decode(text.as_str()) {
                            Ok(message) => message,
                            Err(e) => {
                                stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Malformed message from {user_id} in {room_id}: {e}");
                                send_error(&mut ws_sender, &e.to_string()).await?;
                                continue;
                            }
                        };
                        match registry.handle_message(&handle, message).await {
                            Ok(Dispatch::Continue) => {}
                            Ok(Dispatch::Close) => {
                                log::info!("{user_id} left {room_id}");
                                break;
                            }
                            Err(e @ (RegistryError::StaleConnection { .. } | RegistryError::RoomNotFound(_))) => {
                                log::info!("Closing superseded connection of {user_id}: {e}");
                                break;
                            }
                            Err(e) => {
                                log::warn!("Rejected message from {user_id} in {room_id}: {e}");
                                send_error(&mut ws_sender, &e.to_string()).await?;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                        let e = ProtocolError::UnsupportedFrame("binary");
                        log::warn!("Rejected frame from {user_id} in {room_id}: {e}");
                        send_error(&mut ws_sender, &e.to_string()).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Outgoing frames queued by the room
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                    None => {
                        log::info!("{user_id} was evicted from {room_id}");
                        break;
                    }
                }
            }
        }
    }

    guard.release().await?;
    let _ = ws_sender.close().await;
    Ok(())
}
