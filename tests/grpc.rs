//! Native gRPC through a running gateway, driven by a tonic client.

mod common;

use std::time::{Duration, Instant};

use prost::Message;
use reqwest::StatusCode;
use serde_json::json;
use tonic::metadata::MetadataValue;
use tonic::Code;

use common::{h2c_client, http_client, msg, start_library, to_json, DynamicClient};
use rpc_gateway::testpb;

#[tokio::test]
async fn test_unary() {
    let gateway = start_library().await;
    let mut client = DynamicClient::connect(gateway.addr).await;

    let reply = client
        .unary(
            testpb::GET_BOOK,
            tonic::Request::new(msg("gateway.testpb.GetBookRequest", json!({"name": "shelves/1/books/2"}))),
        )
        .await
        .unwrap();
    assert_eq!(
        to_json(reply.get_ref()),
        json!({"name": "shelves/1/books/2", "title": "Dune"})
    );
    gateway.stop().await;
}

#[tokio::test]
async fn test_error_status() {
    let gateway = start_library().await;
    let mut client = DynamicClient::connect(gateway.addr).await;

    let status = client
        .unary(
            testpb::GET_SHELF,
            tonic::Request::new(msg("gateway.testpb.GetShelfRequest", json!({"name": "shelves/missing"}))),
        )
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(status.message(), "shelf shelves/missing not found");
}

#[tokio::test]
async fn test_unknown_method_is_unimplemented() {
    let gateway = common::start_gateway(rpc_gateway::GatewayServer::new(rpc_gateway::Mux::default())).await;
    let mut client = DynamicClient::connect(gateway.addr).await;

    let status = client
        .unary(
            testpb::GET_SHELF,
            tonic::Request::new(msg("gateway.testpb.GetShelfRequest", json!({"name": "shelves/1"}))),
        )
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);
}

#[tokio::test]
async fn test_server_streaming() {
    let gateway = start_library().await;
    let mut client = DynamicClient::connect(gateway.addr).await;

    let books = client
        .server_streaming(
            testpb::WATCH_BOOKS,
            msg("gateway.testpb.WatchBooksRequest", json!({"parent": "shelves/1", "limit": 4})),
        )
        .await
        .unwrap();
    let names: Vec<_> = books.iter().map(|b| to_json(b)["name"].clone()).collect();
    assert_eq!(
        names,
        ["shelves/1/books/0", "shelves/1/books/1", "shelves/1/books/2", "shelves/1/books/3"]
    );
}

#[tokio::test]
async fn test_client_streaming() {
    let gateway = start_library().await;
    let mut client = DynamicClient::connect(gateway.addr).await;

    let books = ["a", "b"]
        .iter()
        .map(|name| msg("gateway.testpb.Book", json!({"name": name})))
        .collect();
    let reply = client.client_streaming(testpb::IMPORT_BOOKS, books).await.unwrap();
    assert_eq!(to_json(&reply), json!({"count": 2, "names": ["a", "b"]}));
}

#[tokio::test]
async fn test_bidi_streaming() {
    let gateway = start_library().await;
    let mut client = DynamicClient::connect(gateway.addr).await;

    let messages = ["one", "two", "three"]
        .iter()
        .map(|text| msg("gateway.testpb.ChatMessage", json!({"room": "rooms/1", "text": text})))
        .collect();
    let replies = client.streaming(testpb::CHAT, messages).await.unwrap();
    let texts: Vec<_> = replies.iter().map(|r| to_json(r)["text"].clone()).collect();
    assert_eq!(texts, ["one", "two", "three"]);
    assert!(replies.iter().all(|r| to_json(r)["from"] == "echo"));
}

#[tokio::test]
async fn test_bidi_error_after_messages() {
    let gateway = start_library().await;
    let mut client = DynamicClient::connect(gateway.addr).await;

    let messages = ["ok", "fail"]
        .iter()
        .map(|text| msg("gateway.testpb.ChatMessage", json!({"text": text})))
        .collect();
    let status = client.streaming(testpb::CHAT, messages).await.unwrap_err();
    assert_eq!(status.code(), Code::Aborted);
}

#[tokio::test]
async fn test_metadata_headers_and_trailers() {
    let gateway = start_library().await;
    let mut client = DynamicClient::connect(gateway.addr).await;

    let mut request = tonic::Request::new(msg("gateway.testpb.Message", json!({"text": "hi"})));
    request
        .metadata_mut()
        .insert("x-echo", MetadataValue::from_static("marco"));
    let reply = client.unary(testpb::ECHO, request).await.unwrap();
    assert_eq!(reply.metadata().get("x-echo").unwrap(), "marco");
    assert_eq!(reply.metadata().get("x-trailer").unwrap(), "done");
    assert_eq!(to_json(reply.get_ref()), json!({"text": "hi"}));
}

/// tonic's client runs its own timer on `grpc-timeout`, so the deadline
/// is checked on the raw trailers-only response instead.
#[tokio::test]
async fn test_deadline_exceeded() {
    let gateway = start_library().await;
    let request = msg("gateway.testpb.Message", json!({"text": "slow"})).encode_to_vec();
    let mut body = vec![0u8];
    body.extend_from_slice(&(request.len() as u32).to_be_bytes());
    body.extend_from_slice(&request);

    let started = Instant::now();
    let response = h2c_client()
        .post(gateway.url("/gateway.testpb.Messaging/Echo"))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .header("grpc-timeout", "100m")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["grpc-status"], "4");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_native_grpc_requires_http2() {
    let gateway = start_library().await;
    let response = http_client()
        .post(gateway.url("/gateway.testpb.Library/GetShelf"))
        .header("content-type", "application/grpc")
        .body(vec![0u8, 0, 0, 0, 0])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_encoding_advertises_supported() {
    let gateway = start_library().await;
    let response = common::h2c_client()
        .post(gateway.url("/gateway.testpb.Library/GetShelf"))
        .header("content-type", "application/grpc")
        .header("grpc-encoding", "snappy")
        .body(vec![0u8, 0, 0, 0, 0])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(response.headers()["grpc-accept-encoding"], "gzip,identity");
}
