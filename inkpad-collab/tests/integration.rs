//! Integration tests for the WebSocket authority and its participants.
//!
//! These tests start a real server and connect real clients,
//! verifying the full register / mutate / notify / pull pipeline.

use futures_util::{SinkExt, StreamExt};
use inkpad_collab::client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
use inkpad_collab::directory::{Directory, FileDirectory, InMemoryDirectory};
use inkpad_collab::engine::{EngineConfig, SyncEngine};
use inkpad_collab::mirror::LocalMirror;
use inkpad_collab::protocol::{
    Call, ChangeKind, Point, RemoteError, Reply, Segment, StatePayload, SyncMessage,
};
use inkpad_collab::revision::{RevisionController, RollbackOutcome};
use inkpad_collab::server::{ServerConfig, SyncServer};
use inkpad_collab::service::CallError;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Start a server on a free port, return its URL and a handle to it.
async fn start_test_server(server: SyncServer) -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(server);
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (url, server)
}

fn test_config() -> ServerConfig {
    ServerConfig {
        server_name: "pad".to_string(),
        delivery_timeout: Duration::from_millis(500),
        ..ServerConfig::default()
    }
}

async fn connected_client(url: &str) -> (SyncClient, tokio::sync::mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(url, ClientConfig::default());
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Connected)) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    (client, events)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 3s");
}

#[tokio::test]
async fn test_register_assigns_sequential_ids() {
    let (url, _server) = start_test_server(SyncServer::new(test_config())).await;
    let (a, _) = connected_client(&url).await;
    let (b, _) = connected_client(&url).await;

    let pa = a.register().await.unwrap();
    let pb = b.register().await.unwrap();

    assert!(pa.id <= 1000);
    assert_eq!(pb.id, pa.id + 1);
    assert_eq!(pa.name, format!("pad_client_{}", pa.id));
    assert_eq!(pb.name, format!("pad_client_{}", pb.id));
    assert_eq!(a.participant(), Some(pa));
}

#[tokio::test]
async fn test_edit_then_rollback_over_the_wire() {
    let (url, _server) = start_test_server(SyncServer::new(test_config())).await;
    let (client, _) = connected_client(&url).await;
    let me = client.register().await.unwrap();

    assert_eq!(
        client.get_state(ChangeKind::Text).await.unwrap(),
        StatePayload::Text("hello".into())
    );
    assert_eq!(client.get_rev_num().await.unwrap(), 1);

    let receipt = client
        .set_state(&me.name, StatePayload::Text("hello world".into()))
        .await
        .unwrap();
    assert_eq!(receipt.revision, 2);

    let client = Arc::new(client);
    let controller = RevisionController::new(client.clone());
    let outcome = controller.request_rollback(&me.name, 1).await.unwrap();
    assert_eq!(outcome, RollbackOutcome::Applied { restored: 1, revision: 3 });

    assert_eq!(client.get_rev_num().await.unwrap(), 3);
    assert_eq!(client.get_history(2).await.unwrap(), "hello world");
    assert_eq!(client.get_history(3).await.unwrap(), "hello");
    assert_eq!(
        client.get_state(ChangeKind::Text).await.unwrap(),
        StatePayload::Text("hello".into())
    );
}

#[tokio::test]
async fn test_history_out_of_range() {
    let (url, _server) = start_test_server(SyncServer::new(test_config())).await;
    let (client, _) = connected_client(&url).await;

    for requested in [0, 2, 99] {
        assert_eq!(
            client.get_history(requested).await.unwrap_err(),
            CallError::Remote(RemoteError::RevisionOutOfRange { requested, current: 1 })
        );
    }
    assert_eq!(client.get_history(1).await.unwrap(), "hello");
}

#[tokio::test]
async fn test_drawing_notifies_everyone_but_the_sender() {
    let (url, _server) = start_test_server(SyncServer::new(test_config())).await;
    let (a, mut events_a) = connected_client(&url).await;
    let (b, mut events_b) = connected_client(&url).await;
    let (c, mut events_c) = connected_client(&url).await;
    let pa = a.register().await.unwrap();
    b.register().await.unwrap();
    c.register().await.unwrap();

    let segment = Segment::new(Point::new(0, 0), Point::new(10, 10));
    let drawing = inkpad_collab::Drawing::new(vec![segment]);
    a.set_state(&pa.name, StatePayload::Drawing(drawing.clone()))
        .await
        .unwrap();

    for events in [&mut events_b, &mut events_c] {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(SyncEvent::Notified(ChangeKind::Drawing))) => {}
            other => panic!("Expected drawing notification, got {other:?}"),
        }
    }
    assert!(
        timeout(Duration::from_millis(200), events_a.recv()).await.is_err(),
        "sender must not be notified"
    );

    assert_eq!(
        b.get_state(ChangeKind::Drawing).await.unwrap(),
        StatePayload::Drawing(drawing)
    );
    // Drawing mutations do not create text revisions.
    assert_eq!(b.get_rev_num().await.unwrap(), 1);
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let (url, server) = start_test_server(SyncServer::new(test_config())).await;
    let (client, mut events) = connected_client(&url).await;
    let me = client.register().await.unwrap();
    let registry = server.authority().registry().clone();
    assert!(registry.contains(&me.name).await);

    client.disconnect().await;

    assert!(!registry.contains(&me.name).await);
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert_eq!(client.participant(), None);
    assert!(matches!(
        client.get_rev_num().await,
        Err(CallError::NotConnected)
    ));
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Disconnected)) | Ok(None) | Err(_) => {}
        other => panic!("Unexpected event after disconnect: {other:?}"),
    }
}

#[tokio::test]
async fn test_closed_connection_is_cleaned_up() {
    let (url, server) = start_test_server(SyncServer::new(test_config())).await;
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    let frame = SyncMessage::call(7, Call::Register).encode().unwrap();
    tx.send(Message::Binary(frame.into())).await.unwrap();
    let name = loop {
        match rx.next().await {
            Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data).unwrap() {
                SyncMessage::Reply { call_id: 7, result: Ok(Reply::Registered(p)) } => break p.name,
                other => panic!("Unexpected frame: {other:?}"),
            },
            Some(Ok(_)) => continue,
            other => panic!("Connection ended early: {other:?}"),
        }
    };

    let authority = server.authority();
    assert!(authority.registry().contains(&name).await);

    // Garbage frames are skipped, not fatal.
    tx.send(Message::Binary(vec![0xff, 0xfe, 0xfd].into())).await.unwrap();
    tx.send(Message::Close(None)).await.unwrap();
    drop(tx);
    drop(rx);

    for _ in 0..300 {
        if !authority.registry().contains(&name).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!authority.registry().contains(&name).await);

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert!(stats.total_calls >= 2);
}

#[tokio::test]
async fn test_client_resolves_server_through_directory() {
    let directory = Arc::new(InMemoryDirectory::new());
    let server = SyncServer::new(test_config()).with_directory(directory.clone());
    let (url, _server) = start_test_server(server).await;

    eventually(|| directory.resolve("pad").is_ok()).await;
    assert_eq!(directory.resolve("pad").unwrap(), url);

    let mut client =
        SyncClient::from_directory(directory.as_ref(), "pad", ClientConfig::default()).unwrap();
    assert_eq!(client.server_url(), url);
    client.connect().await.unwrap();
    assert_eq!(client.get_rev_num().await.unwrap(), 1);
}

#[tokio::test]
async fn test_server_publishes_to_file_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("directory.json");
    let server = SyncServer::new(test_config()).with_directory(Arc::new(FileDirectory::new(&path)));
    let (url, _server) = start_test_server(server).await;

    let reader = FileDirectory::new(&path);
    eventually(|| reader.resolve("pad").is_ok()).await;
    assert_eq!(reader.resolve("pad").unwrap(), url);

    let mut client = SyncClient::from_directory(&reader, "pad", ClientConfig::default()).unwrap();
    client.connect().await.unwrap();
    assert!(client.register().await.unwrap().name.starts_with("pad_client_"));
}

#[tokio::test]
async fn test_connect_to_nothing_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let mut client = SyncClient::new(url, ClientConfig::default());
    assert!(matches!(client.connect().await, Err(CallError::Connect(_))));
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_engines_converge_over_the_network() {
    let (url, _server) = start_test_server(SyncServer::new(test_config())).await;
    let config = EngineConfig {
        drawing_interval: Duration::from_millis(30),
        revision_interval: Duration::from_millis(30),
        retry_delay: Duration::from_millis(20),
    };

    let mut engines = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..2 {
        let (client, events) = connected_client(&url).await;
        let participant = client.register().await.unwrap();
        let mirror = Arc::new(LocalMirror::new());
        let engine = Arc::new(SyncEngine::new(
            Arc::new(client),
            participant,
            mirror,
            config.clone(),
        ));
        handles.push(engine.clone().spawn(Some(events)));
        engines.push(engine);
    }
    let (a, b) = (engines[0].mirror().clone(), engines[1].mirror().clone());

    eventually(|| a.text() == "hello" && b.text() == "hello").await;

    a.edit_text("typed on a", 10);
    eventually(|| b.text() == "typed on a").await;
    eventually(|| b.revision_display() == 2).await;

    b.draw(Segment::styled(Point::new(3, 4), Point::new(5, 6), "red"));
    eventually(|| a.drawing().len() == 1).await;
    assert_eq!(a.drawing(), b.drawing());

    b.request_rollback(1);
    eventually(|| a.text() == "hello" && b.text() == "hello").await;
    eventually(|| a.revision_display() == 3).await;

    for handle in handles {
        handle.shutdown().await;
    }
}
