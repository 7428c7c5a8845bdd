//! End-to-end tests over real WebSockets.
//!
//! Each test starts a server on a free port and talks to it with plain
//! tokio-tungstenite clients speaking the JSON protocol.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use synccode_collab::{
    ClientMessage, ClientOperation, DocumentStore, EditKind, MemoryStore, ServerConfig,
    ServerMessage, SyncServer,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return the port and the server.
async fn start_server(server: SyncServer) -> (u16, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(server);
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    (port, server)
}

async fn start_test_server() -> (u16, Arc<SyncServer>) {
    start_server(SyncServer::with_defaults()).await
}

async fn join(port: u16, room: &str, user: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/ws/{room}/{user}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, msg: &ClientMessage) {
    ws.send(Message::text(msg.encode().unwrap())).await.unwrap();
}

/// Next JSON frame, skipping control frames.
async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

/// Next JSON frame, or `None` once the connection has been quiet a while.
async fn try_recv(ws: &mut Ws) -> Option<ServerMessage> {
    loop {
        let frame = timeout(Duration::from_millis(300), ws.next()).await.ok()??.unwrap();
        if let Message::Text(text) = frame {
            return Some(ServerMessage::decode(text.as_str()).unwrap());
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let next = timeout(Duration::from_millis(150), ws.next()).await;
    assert!(next.is_err(), "expected no frame, got {next:?}");
}

async fn wait_until_room_gone(server: &SyncServer, room: &str) {
    for _ in 0..100 {
        if !server.registry().has_room(room).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room {room} was never cleaned up");
}

async fn wait_for_text(server: &SyncServer, room: &str, done: impl Fn(&str) -> bool) -> String {
    for _ in 0..200 {
        let text = server.registry().snapshot(room).await.unwrap();
        if done(&text) {
            return text;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room {room} never reached the expected text");
}

#[tokio::test]
async fn test_join_receives_initial_state() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "doc", "alice").await;

    match recv(&mut alice).await {
        ServerMessage::InitialState {
            document_snapshot,
            users,
            user_colors,
            cursor_position,
            version,
        } => {
            assert_eq!(document_snapshot, "");
            assert_eq!(users, vec!["alice".to_string()]);
            assert_eq!(user_colors["alice"], "#FF5733");
            assert!(cursor_position.is_empty());
            assert_eq!(version, 0);
        }
        other => panic!("expected initial_state, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bad_path_is_rejected() {
    let (port, _server) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}/nope");
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
}

#[tokio::test]
async fn test_edit_reaches_others_but_not_sender() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "doc", "alice").await;
    recv(&mut alice).await;
    let mut bob = join(port, "doc", "bob").await;
    recv(&mut bob).await;
    recv(&mut alice).await; // user_list
    let mut carol = join(port, "doc", "carol").await;
    recv(&mut carol).await;
    recv(&mut alice).await; // user_list
    recv(&mut bob).await; // user_list

    send(
        &mut alice,
        &ClientMessage::Operation {
            operations: vec![ClientOperation::insert(0, "hello").with_id("op-1")],
            base_version: None,
        },
    )
    .await;

    for ws in [&mut bob, &mut carol] {
        match recv(ws).await {
            ServerMessage::Edit {
                user_id,
                payload,
                document_snapshot,
                version,
            } => {
                assert_eq!(user_id, "alice");
                assert_eq!(version, 1);
                assert_eq!(payload.operation[0].operation_id.as_deref(), Some("op-1"));
                assert_eq!(payload.operation[0].text.as_deref(), Some("hello"));
                assert_eq!(payload.crdt_operations.len(), 1);
                assert_eq!(document_snapshot, None);
            }
            other => panic!("expected edit, got {other:?}"),
        }
    }
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_late_joiner_sees_document() {
    let (port, server) = start_test_server().await;
    let mut alice = join(port, "doc", "alice").await;
    recv(&mut alice).await;

    send(
        &mut alice,
        &ClientMessage::Operation {
            operations: vec![
                ClientOperation::insert(0, "fn main() {}"),
                ClientOperation::delete(0, 3),
            ],
            base_version: None,
        },
    )
    .await;
    send(&mut alice, &ClientMessage::Cursor { position: 4 }).await;

    // Alice is alone, so nothing comes back; wait on the registry instead.
    wait_for_text(&server, "doc", |text| text == "main() {}").await;

    let mut bob = join(port, "doc", "bob").await;
    match recv(&mut bob).await {
        ServerMessage::InitialState {
            document_snapshot,
            users,
            ..
        } => {
            assert_eq!(document_snapshot, "main() {}");
            assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
        }
        other => panic!("expected initial_state, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cursor_and_colors() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "doc", "alice").await;
    recv(&mut alice).await;
    let mut bob = join(port, "doc", "bob").await;
    recv(&mut bob).await;
    recv(&mut alice).await;

    send(&mut bob, &ClientMessage::Cursor { position: 0 }).await;
    match recv(&mut alice).await {
        ServerMessage::Cursor { cursor_position } => {
            assert_eq!(cursor_position.get("bob"), Some(&0));
        }
        other => panic!("expected cursor, got {other:?}"),
    }

    send(&mut bob, &ClientMessage::Colors).await;
    match recv(&mut bob).await {
        ServerMessage::UserList { users, user_colors } => {
            assert_eq!(users.len(), 2);
            assert_ne!(user_colors["alice"], user_colors["bob"]);
        }
        other => panic!("expected user_list, got {other:?}"),
    }
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_survives() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "doc", "alice").await;
    recv(&mut alice).await;

    alice.send(Message::text("{\"type\":\"teleport\"}")).await.unwrap();
    assert!(matches!(recv(&mut alice).await, ServerMessage::Error { .. }));

    send(&mut alice, &ClientMessage::Colors).await;
    assert!(matches!(recv(&mut alice).await, ServerMessage::UserList { .. }));
}

#[tokio::test]
async fn test_binary_frame_is_rejected() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "doc", "alice").await;
    recv(&mut alice).await;

    alice.send(Message::Binary(vec![0xde, 0xad].into())).await.unwrap();
    match recv(&mut alice).await {
        ServerMessage::Error { message } => assert_eq!(message, "unsupported frame: binary"),
        other => panic!("expected error, got {other:?}"),
    }

    send(&mut alice, &ClientMessage::Colors).await;
    assert!(matches!(recv(&mut alice).await, ServerMessage::UserList { .. }));
}

#[tokio::test]
async fn test_ping_is_answered() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "doc", "alice").await;
    recv(&mut alice).await;

    alice.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();
    let frame = timeout(Duration::from_secs(2), alice.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(frame, Message::Pong(_)));
}

#[tokio::test]
async fn test_leave_and_close_clean_up_room() {
    let (port, server) = start_test_server().await;
    let mut alice = join(port, "doc", "alice").await;
    recv(&mut alice).await;
    let mut bob = join(port, "doc", "bob").await;
    recv(&mut bob).await;
    recv(&mut alice).await;

    send(&mut bob, &ClientMessage::Leave).await;
    match recv(&mut alice).await {
        ServerMessage::UserList { users, .. } => assert_eq!(users, vec!["alice".to_string()]),
        other => panic!("expected user_list, got {other:?}"),
    }

    alice.close(None).await.unwrap();
    wait_until_room_gone(&server, "doc").await;
    assert_eq!(server.registry().connection_count("doc").await.unwrap(), 0);
}

#[tokio::test]
async fn test_snapshot_persisted_and_restored() {
    let store = Arc::new(MemoryStore::new());
    let (port, server) = start_server(SyncServer::with_store(ServerConfig::default(), store.clone())).await;

    let mut alice = join(port, "doc", "alice").await;
    recv(&mut alice).await;
    send(
        &mut alice,
        &ClientMessage::Operation {
            operations: vec![ClientOperation::insert(0, "persist me")],
            base_version: None,
        },
    )
    .await;
    send(&mut alice, &ClientMessage::Leave).await;
    wait_until_room_gone(&server, "doc").await;
    assert_eq!(store.load("doc").unwrap().as_deref(), Some("persist me"));

    let mut bob = join(port, "doc", "bob").await;
    match recv(&mut bob).await {
        ServerMessage::InitialState {
            document_snapshot, ..
        } => assert_eq!(document_snapshot, "persist me"),
        other => panic!("expected initial_state, got {other:?}"),
    }
}

#[tokio::test]
async fn test_snapshot_on_edit_flag() {
    let mut config = ServerConfig::default();
    config.registry.snapshot_on_edit = true;
    let (port, _server) = start_server(SyncServer::with_store(config, Arc::new(MemoryStore::new()))).await;

    let mut alice = join(port, "doc", "alice").await;
    recv(&mut alice).await;
    let mut bob = join(port, "doc", "bob").await;
    recv(&mut bob).await;
    recv(&mut alice).await;

    send(
        &mut alice,
        &ClientMessage::Operation {
            operations: vec![ClientOperation::insert(0, "abc")],
            base_version: None,
        },
    )
    .await;
    match recv(&mut bob).await {
        ServerMessage::Edit {
            document_snapshot, ..
        } => assert_eq!(document_snapshot.as_deref(), Some("abc")),
        other => panic!("expected edit, got {other:?}"),
    }
}

/// Local text of a WebSocket client that edits optimistically.
struct LocalCopy {
    text: Vec<char>,
    version: u64,
}

impl LocalCopy {
    fn new() -> Self {
        Self {
            text: Vec::new(),
            version: 0,
        }
    }

    fn apply(&mut self, op: &ClientOperation) {
        let position = usize::try_from(op.position.max(0)).unwrap().min(self.text.len());
        match op.kind {
            EditKind::Insert => {
                let inserted = op.text.as_deref().unwrap_or_default();
                self.text.splice(position..position, inserted.chars());
            }
            EditKind::Delete => {
                let length = usize::try_from(op.length.unwrap_or(1)).unwrap();
                let end = (position + length).min(self.text.len());
                self.text.drain(position..end);
            }
        }
    }

    /// Edit locally and return the batch to send, tagged with the version seen.
    fn edit(&mut self, op: ClientOperation) -> ClientMessage {
        self.apply(&op);
        ClientMessage::Operation {
            operations: vec![op],
            base_version: Some(self.version),
        }
    }

    fn follow(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::InitialState {
                document_snapshot,
                version,
                ..
            }
            | ServerMessage::Sync {
                document_snapshot,
                version,
            } => {
                self.text = document_snapshot.chars().collect();
                self.version = version;
            }
            ServerMessage::Edit { payload, version, .. } => {
                for op in &payload.operation {
                    self.apply(op);
                }
                self.version = version;
            }
            _ => {}
        }
    }

    fn text(&self) -> String {
        self.text.iter().collect()
    }
}

#[tokio::test]
async fn test_concurrent_editors_converge() {
    let (port, server) = start_test_server().await;
    let mut alice = join(port, "doc", "alice").await;
    let mut alice_copy = LocalCopy::new();
    alice_copy.follow(recv(&mut alice).await);
    let mut bob = join(port, "doc", "bob").await;
    let mut bob_copy = LocalCopy::new();
    bob_copy.follow(recv(&mut bob).await);
    recv(&mut alice).await; // user_list

    let seed = alice_copy.edit(ClientOperation::insert(0, "abc"));
    send(&mut alice, &seed).await;
    bob_copy.follow(recv(&mut bob).await);
    assert_eq!(bob_copy.text(), "abc");

    // Each side keeps typing without waiting for the other.
    for i in 0..10 {
        let a = alice_copy.edit(ClientOperation::insert(0, "a").with_id(format!("a-{i}")));
        let b = if i % 3 == 2 {
            bob_copy.edit(ClientOperation::delete(2, 1).with_id(format!("b-{i}")))
        } else {
            bob_copy.edit(ClientOperation::insert(i, "b").with_id(format!("b-{i}")))
        };
        send(&mut alice, &a).await;
        send(&mut bob, &b).await;
    }

    while let Some(msg) = try_recv(&mut alice).await {
        alice_copy.follow(msg);
    }
    while let Some(msg) = try_recv(&mut bob).await {
        bob_copy.follow(msg);
    }

    let text = server.registry().snapshot("doc").await.unwrap();
    assert!(text.chars().all(|c| "abc".contains(c)), "{text}");
    assert_eq!(alice_copy.text(), text);
    assert_eq!(bob_copy.text(), text);
}
