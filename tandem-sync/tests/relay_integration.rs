//! Integration tests for Sessions talking through a real WebSocket relay.
//!
//! These tests start a relay on a free loopback port and connect Sessions
//! to it with `WsTransport`.

use serde_json::json;
use std::sync::Arc;
use tandem_sync::{
    ConnectionStatus, DocumentHandle, DocumentId, Fields, RelayConfig, RelayServer, RelayStatsHandle,
    Session, SessionBuilder, SyncConfig, WsTransport, YrsDocument,
};
use tokio::time::{Duration, Instant};

fn doc_id() -> DocumentId {
    DocumentId::new("field:wiki.body#3", "wiki", "body", "3")
}

/// Start a relay on a free port, return its URL and a stats handle.
async fn start_relay() -> (String, RelayStatsHandle) {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..RelayConfig::default()
    };
    let server = RelayServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let stats = server.stats_handle();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    (format!("ws://{addr}"), stats)
}

fn start_session(url: &str, doc: Arc<YrsDocument>, presence: Fields) -> Arc<Session> {
    SessionBuilder::new(doc_id(), doc)
        .transport(Arc::new(WsTransport::new(url)))
        .config(SyncConfig::for_testing())
        .presence(presence)
        .spawn()
        .unwrap()
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_two_sessions_converge_through_relay() {
    let (url, stats) = start_relay().await;

    let doc_a = Arc::new(YrsDocument::with_client_id(1));
    let a = start_session(&url, doc_a.clone(), Fields::new());
    assert!(eventually(|| a.is_synced()).await);
    doc_a.push_text("hello");

    let doc_b = Arc::new(YrsDocument::with_client_id(2));
    let b = start_session(&url, doc_b.clone(), Fields::new());
    assert!(eventually(|| doc_b.text() == "hello").await);
    assert!(eventually(|| b.is_synced()).await);

    doc_b.push_text(" world");
    assert!(eventually(|| doc_a.text() == "hello world").await);
    assert_eq!(doc_a.full_encode(), doc_b.full_encode());

    assert_eq!(stats.members("field:wiki.body#3").await, vec![1, 2]);
    assert_eq!(b.status().connection, ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_presence_through_relay() {
    let (url, _stats) = start_relay().await;

    let a = start_session(
        &url,
        Arc::new(YrsDocument::with_client_id(1)),
        [("name".to_string(), json!("ana"))].into_iter().collect(),
    );
    assert!(eventually(|| a.is_synced()).await);
    let b = start_session(&url, Arc::new(YrsDocument::with_client_id(2)), Fields::new());

    assert!(eventually(|| b.peer_presence(1).is_some()).await);
    assert_eq!(b.peer_presence(1).unwrap()["name"], json!("ana"));

    a.shutdown().await;
    assert!(eventually(|| b.peer_presence(1).is_none()).await);
}

#[tokio::test]
async fn test_shutdown_leaves_relay_channel() {
    let (url, stats) = start_relay().await;

    let a = start_session(&url, Arc::new(YrsDocument::with_client_id(1)), Fields::new());
    assert!(eventually(|| a.is_synced()).await);
    assert_eq!(stats.members("field:wiki.body#3").await, vec![1]);

    a.shutdown().await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while !stats.members("field:wiki.body#3").await.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stats.members("field:wiki.body#3").await.is_empty());
}
