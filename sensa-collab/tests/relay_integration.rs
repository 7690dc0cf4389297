//! WebSocket relay tests: a real `RelayServer` on a loopback port with
//! `WsTransport` clients.

use std::sync::Arc;

use sensa_collab::{
    BackingStore, ChannelStatus, CollabConfig, CollabContext, CollabError, CollabState,
    ConnectionStatus, EditOp, Identity, MemoryStore, MindMapNode, PresenceEvent,
    RealtimeTransport, RelayConfig, RelayServer, Role, SessionId, TableFilter, Visibility,
    WsTransport, OPERATION_EVENT,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

/// Serve a fresh relay on `listener`. The handle resolves after shutdown.
fn serve_on(listener: TcpListener, store: Option<&MemoryStore>) -> (Arc<RelayServer>, JoinHandle<()>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = Arc::new(RelayServer::new(RelayConfig::for_testing()));
    if let Some(store) = store {
        server.attach_change_feed(store.changes());
    }
    let serving = server.clone();
    let handle = tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, handle)
}

/// Start a relay on a free port. Returns its URL and the server.
async fn start_relay(store: Option<&MemoryStore>) -> (String, Arc<RelayServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (server, _) = serve_on(listener, store);
    (url, server)
}

/// Shut `server` down and wait until `client` has noticed.
async fn stop_relay(server: &RelayServer, serving: JoinHandle<()>, client: &WsTransport) {
    server.shutdown();
    serving.await.unwrap();
    timeout(WAIT, async {
        while client.is_connected() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never saw the relay go away");
}

async fn connect(url: &str) -> WsTransport {
    timeout(WAIT, WsTransport::connect(url, &CollabConfig::for_testing()))
        .await
        .expect("connect timed out")
        .expect("connect failed")
}

#[tokio::test]
async fn test_broadcast_reaches_other_members_only() {
    let (url, _server) = start_relay(None).await;
    let a = connect(&url).await;
    let b = connect(&url).await;
    let session_id = SessionId::new();

    let chan_a = a.open_channel(session_id).await.unwrap();
    let chan_b = b.open_channel(session_id).await.unwrap();
    let mut own = chan_a.on_broadcast(OPERATION_EVENT);
    let mut incoming = chan_b.on_broadcast(OPERATION_EVENT);

    // Resolves only once the relay acknowledged it.
    a.broadcast(&chan_a, OPERATION_EVENT, json!({"n": 1})).await.unwrap();
    let msg = timeout(WAIT, incoming.recv()).await.unwrap().unwrap();
    assert_eq!(msg.payload, json!({"n": 1}));

    sleep(Duration::from_millis(50)).await;
    assert!(own.try_recv().is_none());
}

#[tokio::test]
async fn test_open_channel_twice_returns_same_handle() {
    let (url, _server) = start_relay(None).await;
    let a = connect(&url).await;
    let session_id = SessionId::new();
    let first = a.open_channel(session_id).await.unwrap();
    let second = a.open_channel(session_id).await.unwrap();
    assert!(first.same_channel(&second));
}

#[tokio::test]
async fn test_presence_join_update_and_disconnect() {
    let (url, _server) = start_relay(None).await;
    let a = connect(&url).await;
    let b = connect(&url).await;
    let session_id = SessionId::new();

    let chan_a = a.open_channel(session_id).await.unwrap();
    a.track(&chan_a, "a", json!({"name": "Alice"})).await.unwrap();

    // Late joiners get the current presences with their join reply.
    let chan_b = b.open_channel(session_id).await.unwrap();
    assert_eq!(chan_b.presence_state().get("a"), Some(&json!({"name": "Alice"})));

    let mut changes = chan_b.on_presence_change();
    a.track(&chan_a, "a", json!({"name": "Alice", "typing": true})).await.unwrap();
    let event = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert!(matches!(event, PresenceEvent::Update { ref key, .. } if key == "a"));

    drop(a);
    let event = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(event, PresenceEvent::Leave { key: "a".into() });
    assert!(chan_b.presence_state().is_empty());
}

#[tokio::test]
async fn test_table_changes_routed_by_session() {
    let store = MemoryStore::new();
    let (url, _server) = start_relay(Some(&store)).await;
    let client = connect(&url).await;
    let ada = Identity::new("Ada");

    let session = sensa_collab::Session::new("Routed", Visibility::Public, ada.user_id);
    let other = sensa_collab::Session::new("Elsewhere", Visibility::Public, ada.user_id);
    let channel = client.open_channel(session.id).await.unwrap();
    let mut changes = channel.on_table_change(TableFilter::table(sensa_collab::Table::Sessions));

    store.insert_session(&other).await.unwrap();
    store.insert_session(&session).await.unwrap();
    let change = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(change.session_id, session.id);
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = WsTransport::connect(format!("ws://{addr}"), &CollabConfig::for_testing())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CollabError::Channel(_)));
}

#[tokio::test]
async fn test_connect_rejects_zero_capacity() {
    let (url, _server) = start_relay(None).await;
    let config = CollabConfig {
        channel_capacity: 0,
        ..CollabConfig::for_testing()
    };
    let err = WsTransport::connect(url, &config).await.err().unwrap();
    assert!(matches!(err, CollabError::Validation(_)));
}

#[tokio::test]
async fn test_relay_stats() {
    let (url, server) = start_relay(None).await;
    let a = connect(&url).await;
    let chan = a.open_channel(SessionId::new()).await.unwrap();
    a.broadcast(&chan, OPERATION_EVENT, json!(null)).await.unwrap();

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert!(stats.total_frames >= 2);
    assert!(stats.total_bytes > 0);
    assert_eq!(server.rooms().room_count().await, 1);

    a.close_channel(&chan).await;
    drop(a);
    timeout(WAIT, async {
        while server.stats().await.active_connections > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(server.rooms().room_count().await, 0);
}

async fn wait_for(ctx: &CollabContext, mut f: impl FnMut(&CollabState) -> bool) -> CollabState {
    let mut rx = ctx.subscribe();
    let state = timeout(WAIT, rx.wait_for(|s| f(s)))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed")
        .clone();
    state
}

#[tokio::test]
async fn test_contexts_collaborate_over_relay() {
    let store = Arc::new(MemoryStore::new());
    let (url, _server) = start_relay(Some(&store)).await;

    let alice = CollabContext::new(
        Identity::new("Alice"),
        Arc::new(connect(&url).await),
        store.clone(),
        CollabConfig::for_testing(),
    )
    .unwrap();
    let bob = CollabContext::new(
        Identity::new("Bob"),
        Arc::new(connect(&url).await),
        store.clone(),
        CollabConfig::for_testing(),
    )
    .unwrap();

    let session = alice.create_session("Over the wire", Visibility::Public).await.unwrap();
    alice.join_session(session.id, Role::Facilitator).await.unwrap();
    bob.join_session(session.id, Role::Participant).await.unwrap();
    wait_for(&alice, |s| s.participants.len() == 2 && s.presences.len() == 1).await;

    let op = alice
        .add_operation(EditOp::NodeAdd {
            node: MindMapNode::with_id("root", "Networks"),
        })
        .await
        .unwrap();
    let state = wait_for(&bob, |s| s.operation_history.len() == 1).await;
    assert_eq!(state.operation_history[0].id, op.id);

    bob.update_cursor_position(10.0, 20.0).await.unwrap();
    wait_for(&alice, |s| s.presences.first().and_then(|p| p.cursor).is_some()).await;

    bob.send_chat_message("hello over the relay", None).await.unwrap();
    let state = wait_for(&alice, |s| s.chat_messages.len() == 1).await;
    assert_eq!(state.chat_messages[0].sender_name, "Bob");

    bob.leave_session().await.unwrap();
    wait_for(&alice, |s| s.presences.is_empty() && s.connected_participants().count() == 1).await;
}

#[tokio::test]
async fn test_open_channel_redials_after_relay_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (first, serving) = serve_on(listener, None);
    let client = connect(&format!("ws://{addr}")).await;
    let session_id = SessionId::new();
    let stale = client.open_channel(session_id).await.unwrap();

    stop_relay(&first, serving, &client).await;
    assert_ne!(stale.status(), ChannelStatus::Connected);
    assert!(client.broadcast(&stale, OPERATION_EVENT, json!(1)).await.is_err());

    let (_second, _serving) = serve_on(TcpListener::bind(addr).await.unwrap(), None);
    let peer = connect(&format!("ws://{addr}")).await;
    let peer_chan = peer.open_channel(session_id).await.unwrap();
    let mut incoming = peer_chan.on_broadcast(OPERATION_EVENT);

    let fresh = client.open_channel(session_id).await.unwrap();
    assert!(client.is_connected());
    assert!(!fresh.same_channel(&stale));
    client.broadcast(&fresh, OPERATION_EVENT, json!(2)).await.unwrap();
    let msg = timeout(WAIT, incoming.recv()).await.unwrap().unwrap();
    assert_eq!(msg.payload, json!(2));
}

#[tokio::test]
async fn test_context_rejoins_after_relay_restart() {
    let store = Arc::new(MemoryStore::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (first, serving) = serve_on(listener, Some(&store));
    let url = format!("ws://{addr}");

    let transport = Arc::new(connect(&url).await);
    let alice = CollabContext::new(
        Identity::new("Alice"),
        transport.clone(),
        store.clone(),
        CollabConfig::for_testing(),
    )
    .unwrap();
    let session = alice.create_session("Restart", Visibility::Public).await.unwrap();
    alice.join_session(session.id, Role::Participant).await.unwrap();

    stop_relay(&first, serving, &transport).await;
    wait_for(&alice, |s| s.connection_status == ConnectionStatus::Error).await;
    assert!(alice
        .add_operation(EditOp::NodeAdd {
            node: MindMapNode::with_id("lost", "Lost"),
        })
        .await
        .is_err());

    let (_second, _serving) = serve_on(TcpListener::bind(addr).await.unwrap(), Some(&store));
    alice.leave_session().await.unwrap();
    alice.join_session(session.id, Role::Participant).await.unwrap();
    let state = alice.state();
    assert!(state.is_connected());
    assert!(state.error.is_none());

    alice
        .add_operation(EditOp::NodeAdd {
            node: MindMapNode::with_id("root", "Back online"),
        })
        .await
        .unwrap();
    assert_eq!(alice.state().operation_history.len(), 1);
}
