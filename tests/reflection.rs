//! Backend discovery over server reflection and proxying through it.

mod common;

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tonic::metadata::MetadataValue;
use tonic::Code;

use common::{http_client, msg, start_gateway, start_library_backend, to_json, DynamicClient, Gateway};
use rpc_gateway::backend::{RefreshOutcome, ReflectionMonitor, RemoteConn};
use rpc_gateway::registry::State;
use rpc_gateway::{testpb, GatewayServer, Mux};

fn remote(backend: &Gateway) -> RemoteConn {
    RemoteConn::connect_lazy("library", backend.url(""), Duration::from_secs(2))
        .unwrap()
        .with_reflection_timeout(Duration::from_secs(5))
}

async fn start_front() -> Gateway {
    start_gateway(GatewayServer::new(Mux::default())).await
}

fn snapshot(gateway: &Gateway) -> State {
    State::clone(&gateway.mux.registry().load())
}

#[tokio::test]
async fn test_register_then_drop_restores_state() {
    let backend = start_library_backend().await;
    let front = start_front().await;
    let conn = remote(&backend);
    let before = snapshot(&front);

    assert!(front.mux.registry().register_conn(&conn).await.unwrap());
    let registered = front.mux.registry().load();
    assert!(registered.methods().contains(&"/gateway.testpb.Library/GetBook"));
    assert!(registered.methods().contains(&"/gateway.testpb.Messaging/Echo"));
    assert_eq!(registered.conn_handler_count(conn.id()), 10);

    assert!(front.mux.registry().drop_conn(&conn));
    assert!(snapshot(&front) == before);
    assert!(!front.mux.registry().drop_conn(&conn));
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let backend = start_library_backend().await;
    let front = start_front().await;
    let conn = remote(&backend);

    assert!(front.mux.registry().register_conn(&conn).await.unwrap());
    let first = snapshot(&front);
    assert!(!front.mux.registry().register_conn(&conn).await.unwrap());
    assert!(snapshot(&front) == first);
}

#[tokio::test]
async fn test_rest_through_reflected_backend() {
    let backend = start_library_backend().await;
    let front = start_front().await;
    front.mux.registry().register_conn(&remote(&backend)).await.unwrap();
    let client = http_client();

    let response = client
        .get(front.url("/v1/shelves/1/books/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let book: Value = response.json().await.unwrap();
    assert_eq!(book, json!({"name": "shelves/1/books/1", "title": "Dune"}));

    let response = client
        .get(front.url("/v1/shelves/missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], 5);

    let response = client
        .get(front.url("/v1/shelves/1/books:watch?limit=2"))
        .send()
        .await
        .unwrap();
    let books: Vec<Value> = serde_json::Deserializer::from_slice(&response.bytes().await.unwrap())
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(books.len(), 2);
}

#[tokio::test]
async fn test_grpc_through_reflected_backend() {
    let backend = start_library_backend().await;
    let front = start_front().await;
    front.mux.registry().register_conn(&remote(&backend)).await.unwrap();
    let mut client = DynamicClient::connect(front.addr).await;

    let mut request = tonic::Request::new(msg("gateway.testpb.Message", json!({"text": "hi"})));
    request
        .metadata_mut()
        .insert("x-echo", MetadataValue::from_static("polo"));
    let reply = client.unary(testpb::ECHO, request).await.unwrap();
    assert_eq!(to_json(reply.get_ref()), json!({"text": "hi"}));
    assert_eq!(reply.metadata().get("x-echo").unwrap(), "polo");
    assert_eq!(reply.metadata().get("x-trailer").unwrap(), "done");

    let books = ["x", "y", "z"]
        .iter()
        .map(|name| msg("gateway.testpb.Book", json!({"name": name})))
        .collect();
    let reply = client.client_streaming(testpb::IMPORT_BOOKS, books).await.unwrap();
    assert_eq!(to_json(&reply)["count"], 3);

    let messages = ["a", "fail"]
        .iter()
        .map(|text| msg("gateway.testpb.ChatMessage", json!({"text": text})))
        .collect();
    let status = client.streaming(testpb::CHAT, messages).await.unwrap_err();
    assert_eq!(status.code(), Code::Aborted);
}

#[tokio::test]
async fn test_monitor_tracks_backend() {
    let backend = start_library_backend().await;
    let front = start_front().await;
    let registry = Arc::clone(front.mux.registry());
    let monitor = ReflectionMonitor::new(Arc::clone(&registry), remote(&backend), Duration::from_secs(60));

    assert_eq!(monitor.refresh().await, RefreshOutcome::Updated);
    assert_eq!(monitor.refresh().await, RefreshOutcome::Unchanged);

    backend.stop().await;
    assert_eq!(monitor.refresh().await, RefreshOutcome::Failed);
    assert!(registry.load().methods().is_empty());

    let response = http_client()
        .get(front.url("/v1/shelves/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_two_backends_share_methods() {
    let first = start_library_backend().await;
    let second = start_library_backend().await;
    let front = start_front().await;
    let (a, b) = (remote(&first), remote(&second));
    let registry = front.mux.registry();

    registry.register_conn(&a).await.unwrap();
    registry.register_conn(&b).await.unwrap();
    assert_eq!(registry.load().handlers("/gateway.testpb.Library/GetShelf").len(), 2);

    let state = registry.load();
    let newest = state.find("/v1/shelves/1", "GET").unwrap();
    assert_eq!(newest.binding.desc, state.handlers("/gateway.testpb.Library/GetShelf")[1].desc);

    registry.drop_conn(&b);
    let state = registry.load();
    let survivor = &state.handlers("/gateway.testpb.Library/GetShelf")[0];
    assert_eq!(survivor.conn(), Some(a.id()));
    let routed = state.find("/v1/shelves/1", "GET").unwrap();
    assert_eq!(routed.binding.desc, survivor.desc);
    assert_eq!(
        state.find("/gateway.testpb.Library/GetShelf", "POST").unwrap().binding.desc,
        survivor.desc
    );

    registry.register_conn(&b).await.unwrap();
    registry.drop_conn(&a);
    assert_eq!(registry.load().handlers("/gateway.testpb.Library/GetShelf").len(), 1);
    let response = http_client()
        .get(front.url("/v1/shelves/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
