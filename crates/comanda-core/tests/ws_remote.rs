//! WebSocket remote against an in-process document server

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use comanda_core::models::fields_from_value;
use comanda_core::remote::message::{ClientMessage, ServerMessage};
use comanda_core::remote::{ConnectionStatus, RemoteError, RemoteStore, WsRemote, WsRemoteConfig};
use comanda_core::storage::LocalCache;
use comanda_core::{Collection, Fields, Record, SyncStore};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct Documents {
    collections: HashMap<String, Collection>,
    subscribers: HashMap<String, usize>,
}

struct ServerState {
    documents: Mutex<Documents>,
    changes: broadcast::Sender<String>,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerState {
    fn snapshot(&self, collection: &str) -> Collection {
        self.documents
            .lock()
            .unwrap()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn merge(&self, collection: &str, id: &str, fields: Fields) {
        {
            let mut documents = self.documents.lock().unwrap();
            let records = documents
                .collections
                .entry(collection.to_string())
                .or_default();
            match records.iter_mut().find(|record| record.id() == id) {
                Some(record) => record.merge(&fields),
                None => records.push(Record::from_fields(id, fields)),
            }
        }
        let _ = self.changes.send(collection.to_string());
    }

    fn delete(&self, collection: &str, id: &str) {
        if let Some(records) = self
            .documents
            .lock()
            .unwrap()
            .collections
            .get_mut(collection)
        {
            records.retain(|record| record.id() != id);
        }
        let _ = self.changes.send(collection.to_string());
    }

    fn track(&self, collection: &str, delta: isize) {
        let mut documents = self.documents.lock().unwrap();
        let count = documents
            .subscribers
            .entry(collection.to_string())
            .or_default();
        *count = count.saturating_add_signed(delta);
    }

    fn subscriber_count(&self, collection: &str) -> usize {
        self.documents
            .lock()
            .unwrap()
            .subscribers
            .get(collection)
            .copied()
            .unwrap_or(0)
    }
}

struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    accept: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (changes, _) = broadcast::channel(64);
        let state = Arc::new(ServerState {
            documents: Mutex::new(Documents::default()),
            changes,
            connections: Mutex::new(Vec::new()),
        });

        let shared = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = tokio::spawn(serve(stream, shared.clone()));
                shared.connections.lock().unwrap().push(connection);
            }
        });

        Self {
            addr,
            state,
            accept,
        }
    }

    fn config(&self) -> WsRemoteConfig {
        let mut config = WsRemoteConfig::new(format!("ws://{}", self.addr));
        config.initial_reconnect_delay = Duration::from_millis(50);
        config.max_reconnect_delay = Duration::from_millis(200);
        config.handshake_timeout = Duration::from_secs(2);
        config
    }

    /// Kill every open connection, as a network drop would
    fn drop_connections(&self) {
        for connection in self.state.connections.lock().unwrap().drain(..) {
            connection.abort();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept.abort();
        self.drop_connections();
    }
}

async fn serve(stream: TcpStream, state: Arc<ServerState>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let mut changes = state.changes.subscribe();
    let mut subscribed: HashSet<String> = HashSet::new();

    loop {
        let reply = tokio::select! {
            msg = read.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(_)) => continue,
                    _ => break,
                };
                match ClientMessage::decode(&data).unwrap() {
                    ClientMessage::Join { .. } => ServerMessage::Peer {
                        sender_id: "test-server".to_string(),
                        selected_protocol_version: "1".to_string(),
                    },
                    ClientMessage::Subscribe { collection } => {
                        if subscribed.insert(collection.clone()) {
                            state.track(&collection, 1);
                        }
                        ServerMessage::Snapshot {
                            documents: state.snapshot(&collection),
                            collection,
                        }
                    }
                    ClientMessage::Unsubscribe { collection } => {
                        if subscribed.remove(&collection) {
                            state.track(&collection, -1);
                        }
                        continue;
                    }
                    ClientMessage::Merge { request_id, collection, .. } if collection == "forbidden" => {
                        ServerMessage::Error {
                            request_id: Some(request_id),
                            collection: None,
                            message: "permission denied".to_string(),
                        }
                    }
                    ClientMessage::Merge { request_id, collection, id, fields } => {
                        state.merge(&collection, &id, fields);
                        ServerMessage::Ack { request_id }
                    }
                    ClientMessage::Delete { request_id, collection, id } => {
                        state.delete(&collection, &id);
                        ServerMessage::Ack { request_id }
                    }
                    ClientMessage::Fetch { request_id, collection } => ServerMessage::Documents {
                        request_id,
                        documents: state.snapshot(&collection),
                    },
                }
            }
            changed = changes.recv() => {
                match changed {
                    Ok(collection) if subscribed.contains(&collection) => ServerMessage::Snapshot {
                        documents: state.snapshot(&collection),
                        collection,
                    },
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        if write
            .send(Message::Binary(reply.encode().unwrap()))
            .await
            .is_err()
        {
            break;
        }
    }

    for collection in subscribed {
        state.track(&collection, -1);
    }
}

fn fields(value: Value) -> Fields {
    fields_from_value(value).unwrap()
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_snapshot(stream: &mut comanda_core::remote::SnapshotStream) -> Collection {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("no snapshot in time")
            .expect("listener closed");
        if let Ok(records) = event {
            return records;
        }
    }
}

#[tokio::test]
async fn test_connect_and_handshake() {
    let server = TestServer::start().await;

    let remote = WsRemote::connect(server.config()).await.unwrap();

    assert_eq!(remote.status(), ConnectionStatus::Connected);
    assert!(remote.peer_id().starts_with("comanda-"));
}

#[tokio::test]
async fn test_merge_fetch_delete() {
    let server = TestServer::start().await;
    let remote = WsRemote::connect(server.config()).await.unwrap();

    remote
        .merge("orders", "o1", &fields(json!({"status": "NOVO", "total": 35})))
        .await
        .unwrap();
    remote
        .merge("orders", "o1", &fields(json!({"status": "PRONTO"})))
        .await
        .unwrap();

    let orders = remote.fetch_all("orders").await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(
        orders[0].to_value(),
        json!({"id": "o1", "status": "PRONTO", "total": 35})
    );

    remote.delete("orders", "o1").await.unwrap();
    assert!(remote.fetch_all("orders").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_request() {
    let server = TestServer::start().await;
    let remote = WsRemote::connect(server.config()).await.unwrap();

    let err = remote
        .merge("forbidden", "x", &Fields::new())
        .await
        .unwrap_err();

    assert_eq!(err, RemoteError::Rejected("permission denied".to_string()));
}

#[tokio::test]
async fn test_listener_sees_other_clients() {
    let server = TestServer::start().await;
    let kitchen = WsRemote::connect(server.config()).await.unwrap();
    let counter = WsRemote::connect(server.config()).await.unwrap();

    let mut stream = kitchen.listen("orders").await.unwrap();
    assert!(next_snapshot(&mut stream).await.is_empty());

    counter
        .merge("orders", "o7", &fields(json!({"status": "NOVO"})))
        .await
        .unwrap();

    let orders = next_snapshot(&mut stream).await;
    assert_eq!(orders[0].id(), "o7");
}

#[tokio::test]
async fn test_dropping_stream_unsubscribes() {
    let server = TestServer::start().await;
    let remote = WsRemote::connect(server.config()).await.unwrap();

    let first = remote.listen("products").await.unwrap();
    let second = remote.listen("products").await.unwrap();
    wait_until(|| server.state.subscriber_count("products") == 1).await;

    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.state.subscriber_count("products"), 1);

    drop(second);
    wait_until(|| server.state.subscriber_count("products") == 0).await;
}

#[tokio::test]
async fn test_reconnects_and_resubscribes() {
    let server = TestServer::start().await;
    let remote = WsRemote::connect(server.config()).await.unwrap();
    let mut stream = remote.listen("zip_ranges").await.unwrap();
    next_snapshot(&mut stream).await;
    let mut status = remote.subscribe_status();

    server.drop_connections();
    tokio::time::timeout(Duration::from_secs(5), status.changed())
        .await
        .unwrap()
        .unwrap();
    match tokio::time::timeout(Duration::from_secs(5), stream.next()).await {
        Ok(Some(Err(RemoteError::Disconnected))) => {}
        other => panic!("Expected a disconnect notice, got {:?}", other.map(|e| e.is_some())),
    }

    wait_until(|| *status.borrow() == ConnectionStatus::Connected).await;
    server.state.merge("zip_ranges", "z1", fields(json!({"fee": 7})));

    loop {
        let records = next_snapshot(&mut stream).await;
        if !records.is_empty() {
            assert_eq!(records[0].id(), "z1");
            break;
        }
    }
    remote.merge("zip_ranges", "z2", &Fields::new()).await.unwrap();
}

#[tokio::test]
async fn test_requests_fail_fast_while_disconnected() {
    let server = TestServer::start().await;
    let mut config = server.config();
    config.initial_reconnect_delay = Duration::from_secs(30);
    config.max_reconnect_delay = Duration::from_secs(30);
    let remote = WsRemote::connect(config).await.unwrap();

    server.drop_connections();
    wait_until(|| remote.status() == ConnectionStatus::Disconnected).await;

    let err = remote.fetch_all("orders").await.unwrap_err();
    assert_eq!(err, RemoteError::Disconnected);
}

#[tokio::test]
async fn test_sync_store_over_websocket() {
    let server = TestServer::start().await;
    let admin = SyncStore::mirrored(
        LocalCache::in_memory(),
        Arc::new(WsRemote::connect(server.config()).await.unwrap()),
    );
    let customer = SyncStore::mirrored(
        LocalCache::in_memory(),
        Arc::new(WsRemote::connect(server.config()).await.unwrap()),
    );

    let menu: Arc<Mutex<Collection>> = Arc::new(Mutex::new(Vec::new()));
    let seen = menu.clone();
    let _subscription = customer.subscribe("products", move |records: &[Record]| {
        *seen.lock().unwrap() = records.to_vec();
    });
    wait_until(|| server.state.subscriber_count("products") == 1).await;

    admin
        .save("products", "p1", fields(json!({"name": "Pizza Calabresa", "price": 49.9})))
        .await;

    wait_until(|| menu.lock().unwrap().len() == 1).await;
    assert_eq!(
        menu.lock().unwrap()[0].to_value(),
        json!({"id": "p1", "name": "Pizza Calabresa", "price": 49.9})
    );
    assert_eq!(customer.cached("products").len(), 1);

    let fetched = customer.get_all("products", Vec::new()).await;
    assert_eq!(fetched[0].id(), "p1");

    admin.remove("products", "p1").await;
    wait_until(|| menu.lock().unwrap().is_empty()).await;
}
