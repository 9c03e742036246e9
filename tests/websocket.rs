//! WebSocket streaming through a running gateway.

mod common;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::{http_client, start_library};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn send_json(socket: &mut Socket, value: Value) {
    socket.send(Message::text(value.to_string())).await.unwrap();
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        match socket.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Read until the server closes, returning the text frames and close code.
async fn drain(socket: &mut Socket) -> (Vec<Value>, Option<CloseCode>) {
    let mut messages = Vec::new();
    while let Some(message) = socket.next().await {
        match message.unwrap() {
            Message::Text(text) => messages.push(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(frame) => return (messages, frame.map(|f| f.code)),
            _ => {}
        }
    }
    (messages, None)
}

#[tokio::test]
async fn test_chat_params_apply_to_first_message() {
    let gateway = start_library().await;
    let (mut socket, _) = connect_async(gateway.ws_url("/v1/rooms/lobby:chat")).await.unwrap();

    send_json(&mut socket, json!({"text": "hello"})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"room": "rooms/lobby", "text": "hello", "from": "echo"})
    );

    send_json(&mut socket, json!({"text": "again"})).await;
    assert_eq!(next_json(&mut socket).await, json!({"text": "again", "from": "echo"}));

    socket.close(None).await.unwrap();
    let (rest, _) = drain(&mut socket).await;
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_handler_error_closes_with_mapped_code() {
    let gateway = start_library().await;
    let (mut socket, _) = connect_async(gateway.ws_url("/v1/rooms/1:chat")).await.unwrap();

    send_json(&mut socket, json!({"text": "fail"})).await;
    let (messages, code) = drain(&mut socket).await;
    assert!(messages.is_empty());
    assert_eq!(code, Some(CloseCode::Error));
}

#[tokio::test]
async fn test_binary_frame_is_rejected() {
    let gateway = start_library().await;
    let (mut socket, _) = connect_async(gateway.ws_url("/v1/rooms/1:chat")).await.unwrap();

    socket.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let (_, code) = drain(&mut socket).await;
    assert_eq!(code, Some(CloseCode::Unsupported));
}

#[tokio::test]
async fn test_server_stream_without_body() {
    let gateway = start_library().await;
    let (mut socket, _) = connect_async(gateway.ws_url("/v1/shelves/3/books:watch?limit=2"))
        .await
        .unwrap();

    let (messages, code) = drain(&mut socket).await;
    assert_eq!(
        messages,
        [
            json!({"name": "shelves/3/books/0"}),
            json!({"name": "shelves/3/books/1"}),
        ]
    );
    assert_eq!(code, Some(CloseCode::Normal));
}

#[tokio::test]
async fn test_unrouted_upgrade_is_not_found() {
    let gateway = start_library().await;
    let err = connect_async(gateway.ws_url("/v1/nowhere:chat")).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected an HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_websocket_rule_needs_upgrade() {
    let gateway = start_library().await;
    let response = http_client()
        .get(gateway.url("/v1/rooms/1:chat"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_client_close_is_answered() {
    let gateway = start_library().await;
    let (mut socket, _) = connect_async(gateway.ws_url("/v1/rooms/1:chat")).await.unwrap();

    socket
        .close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();
    let (messages, code) = drain(&mut socket).await;
    assert!(messages.is_empty());
    assert_eq!(code, Some(CloseCode::Normal));
}
