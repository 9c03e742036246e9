//! gRPC-Web and gRPC-Web-text over HTTP/1.1.

mod common;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use prost::Message;
use prost_reflect::DynamicMessage;
use reqwest::StatusCode;
use serde_json::json;

use common::{http_client, message_desc, msg, start_library, to_json};

/// One body frame: flag byte and payload.
#[derive(Debug)]
struct Frame {
    flag: u8,
    payload: Vec<u8>,
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn split_frames(mut body: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    while !body.is_empty() {
        assert!(body.len() >= 5, "truncated frame header");
        let flag = body[0];
        let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
        frames.push(Frame {
            flag,
            payload: body[5..5 + len].to_vec(),
        });
        body = &body[5 + len..];
    }
    frames
}

fn trailers(frame: &Frame) -> Vec<(String, String)> {
    assert_eq!(frame.flag, 0x80);
    String::from_utf8(frame.payload.clone())
        .unwrap()
        .split("\r\n")
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (name, value) = line.split_once(": ").unwrap();
            (name.to_string(), value.to_string())
        })
        .collect()
}

fn trailer<'a>(trailers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    trailers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn get_shelf_request(name: &str) -> Vec<u8> {
    frame(&msg("gateway.testpb.GetShelfRequest", json!({"name": name})).encode_to_vec())
}

#[tokio::test]
async fn test_grpc_web_trailer_frame() {
    let gateway = start_library().await;
    let response = http_client()
        .post(gateway.url("/gateway.testpb.Library/GetShelf"))
        .header("content-type", "application/grpc-web+proto")
        .body(get_shelf_request("shelves/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/grpc-web+proto");

    let frames = split_frames(&response.bytes().await.unwrap());
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].flag, 0);
    let shelf = DynamicMessage::decode(message_desc("gateway.testpb.Shelf"), frames[0].payload.as_slice()).unwrap();
    assert_eq!(to_json(&shelf), json!({"name": "shelves/1", "theme": "fiction"}));

    let trailers = trailers(&frames[1]);
    assert_eq!(trailer(&trailers, "grpc-status"), Some("0"));
    gateway.stop().await;
}

#[tokio::test]
async fn test_grpc_web_error_in_trailer_frame() {
    let gateway = start_library().await;
    let response = http_client()
        .post(gateway.url("/gateway.testpb.Library/GetShelf"))
        .header("content-type", "application/grpc-web")
        .body(get_shelf_request("shelves/missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frames = split_frames(&response.bytes().await.unwrap());
    let last = frames.last().unwrap();
    let trailers = trailers(last);
    assert_eq!(trailer(&trailers, "grpc-status"), Some("5"));
    assert_eq!(
        trailer(&trailers, "grpc-message"),
        Some("shelf shelves/missing not found")
    );
}

#[tokio::test]
async fn test_grpc_web_unknown_method() {
    let gateway = start_library().await;
    let response = http_client()
        .post(gateway.url("/gateway.testpb.Library/Nope"))
        .header("content-type", "application/grpc-web+proto")
        .body(frame(&[]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let frames = split_frames(&response.bytes().await.unwrap());
    assert_eq!(frames.len(), 1);
    assert_eq!(trailer(&trailers(&frames[0]), "grpc-status"), Some("12"));
}

#[tokio::test]
async fn test_grpc_web_text() {
    let gateway = start_library().await;
    let body = STANDARD.encode(get_shelf_request("shelves/2"));
    let response = http_client()
        .post(gateway.url("/gateway.testpb.Library/GetShelf"))
        .header("content-type", "application/grpc-web-text")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/grpc-web-text+proto"
    );

    let text = response.text().await.unwrap();
    let decoded = decode_concatenated(&text);
    let frames = split_frames(&decoded);
    assert_eq!(frames.len(), 2);
    let shelf = DynamicMessage::decode(message_desc("gateway.testpb.Shelf"), frames[0].payload.as_slice()).unwrap();
    assert_eq!(to_json(&shelf)["name"], "shelves/2");
    assert_eq!(trailer(&trailers(&frames[1]), "grpc-status"), Some("0"));
}

/// Decode base64 that may be several padded chunks back to back.
fn decode_concatenated(text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let end = rest
            .find('=')
            .map(|i| {
                let pad = rest[i..].chars().take_while(|c| *c == '=').count();
                i + pad
            })
            .unwrap_or(rest.len());
        out.extend(STANDARD.decode(&rest[..end]).unwrap());
        rest = &rest[end..];
    }
    out
}

#[tokio::test]
async fn test_grpc_web_json_subtype() {
    let gateway = start_library().await;
    let payload = br#"{"name": "shelves/5/books/1"}"#;
    let response = http_client()
        .post(gateway.url("/gateway.testpb.Library/GetBook"))
        .header("content-type", "application/grpc-web+json")
        .body(frame(payload))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/grpc-web+json");

    let frames = split_frames(&response.bytes().await.unwrap());
    let book: serde_json::Value = serde_json::from_slice(&frames[0].payload).unwrap();
    assert_eq!(book, json!({"name": "shelves/5/books/1", "title": "Dune"}));
}

#[tokio::test]
async fn test_grpc_web_deadline() {
    let gateway = start_library().await;
    let request = frame(&msg("gateway.testpb.Message", json!({"text": "slow"})).encode_to_vec());
    let response = http_client()
        .post(gateway.url("/gateway.testpb.Messaging/Echo"))
        .header("content-type", "application/grpc-web+proto")
        .header("grpc-timeout", "100m")
        .body(request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frames = split_frames(&response.bytes().await.unwrap());
    assert_eq!(frames.len(), 1);
    let trailers = trailers(&frames[0]);
    assert_eq!(trailer(&trailers, "grpc-status"), Some("4"));
}
