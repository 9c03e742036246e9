//! WebSocket stream.
//!
//! Every message is one JSON text frame in either direction. Path params
//! apply to the first received message only. The call status becomes the
//! close frame.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use prost_reflect::{DynamicMessage, MethodDescriptor};
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::codec::{too_large, Codec, JsonCodec};
use crate::http::status::ws_close_code;
use crate::routing::params::{message_at_mut, FieldPath, Params};
use crate::routing::router::Binding;
use crate::stream::{send_too_large, CallContext, Limits, MessageSink, MessageSource, ServerStream};

/// Longest close reason a control frame can carry.
const MAX_CLOSE_REASON: usize = 123;

/// A call over an upgraded WebSocket.
pub struct WsStream {
    ctx: CallContext,
    source: WsSource,
    sink: WsSink,
}

struct WsSource {
    desc: MethodDescriptor,
    body_path: Option<FieldPath>,
    params: Option<Params>,
    socket: SplitStream<WebSocket>,
    codec: Arc<dyn Codec>,
    max_receive: usize,
    eof: bool,
    /// The client sent a close frame or the connection ended.
    peer_closed: bool,
}

struct WsSink {
    response_path: FieldPath,
    socket: SplitSink<WebSocket, Message>,
    codec: Arc<dyn Codec>,
    max_send: usize,
}

impl WsStream {
    pub fn new(ctx: CallContext, binding: &Binding, params: Params, socket: WebSocket) -> Self {
        let (tx, rx) = socket.split();
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec::default());
        let limits = Limits::default();
        Self {
            ctx,
            source: WsSource {
                desc: binding.desc.clone(),
                body_path: binding.body.clone(),
                params: Some(params),
                socket: rx,
                codec: Arc::clone(&codec),
                max_receive: limits.max_receive,
                eof: false,
                peer_closed: false,
            },
            sink: WsSink {
                response_path: binding.response.clone(),
                socket: tx,
                codec,
                max_send: limits.max_send,
            },
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.source.max_receive = limits.max_receive;
        self.sink.max_send = limits.max_send;
        self
    }

    /// Close the socket with the code for the call status.
    ///
    /// When the client closed first its close frame has already been
    /// answered, so the sink is only flushed and shut.
    pub async fn finish(mut self, result: Result<(), Status>) {
        if self.source.peer_closed {
            if let Err(err) = self.sink.socket.close().await {
                tracing::debug!(method = %self.ctx.method, error = %err, "Close handshake not completed");
            }
            return;
        }
        let (code, reason) = match &result {
            Ok(()) => (ws_close_code(tonic::Code::Ok), String::new()),
            Err(status) => (ws_close_code(status.code()), truncate(status.message())),
        };
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if let Err(err) = self.sink.socket.send(Message::Close(Some(frame))).await {
            tracing::debug!(method = %self.ctx.method, error = %err, "Close frame not delivered");
        }
    }
}

fn log_dropped(kind: &str, md: &MetadataMap) {
    if !md.is_empty() {
        tracing::debug!(kind, entries = md.len(), "WebSocket calls carry no metadata, dropping it");
    }
}

fn truncate(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

impl WsSource {
    /// Next text frame, or `None` once the client closes.
    async fn next_text(&mut self) -> Result<Option<String>, Status> {
        loop {
            let Some(message) = self.socket.next().await else {
                self.peer_closed = true;
                return Ok(None);
            };
            let message = message.map_err(|err| {
                tracing::debug!(error = %err, "WebSocket read failed");
                self.peer_closed = true;
                Status::cancelled("context canceled")
            })?;
            match message {
                Message::Text(text) => {
                    let text = text.as_str();
                    if text.len() > self.max_receive {
                        return Err(too_large(text.len(), self.max_receive));
                    }
                    return Ok(Some(text.to_string()));
                }
                Message::Close(_) => {
                    self.peer_closed = true;
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Binary(_) => {
                    return Err(Status::invalid_argument("invalid message type: binary"))
                }
            }
        }
    }
}

#[async_trait]
impl MessageSource for WsSource {
    async fn recv_msg(&mut self) -> Result<Option<DynamicMessage>, Status> {
        if self.eof {
            return Ok(None);
        }
        let mut msg = DynamicMessage::new(self.desc.input());
        match &self.body_path {
            Some(path) => {
                let path = path.clone();
                let Some(text) = self.next_text().await? else {
                    self.eof = true;
                    return Ok(None);
                };
                let target = message_at_mut(&mut msg, &path)?;
                self.codec.unmarshal(text.as_bytes(), target)?;
            }
            None => self.eof = true,
        }
        if let Some(params) = self.params.take() {
            params.set(&mut msg)?;
        }
        Ok(Some(msg))
    }
}

#[async_trait]
impl MessageSink for WsSink {
    /// Dropped: the upgrade response was written before the call began.
    fn set_header(&mut self, md: MetadataMap) -> Result<(), Status> {
        log_dropped("header", &md);
        Ok(())
    }

    /// Dropped, like [`set_header`](Self::set_header); nothing is written.
    async fn send_header(&mut self, md: MetadataMap) -> Result<(), Status> {
        log_dropped("header", &md);
        Ok(())
    }

    /// Dropped: a close frame has no room for metadata.
    fn set_trailer(&mut self, md: MetadataMap) {
        log_dropped("trailer", &md);
    }

    async fn send_msg(&mut self, msg: &DynamicMessage) -> Result<(), Status> {
        let mut reply = msg.clone();
        let cur = message_at_mut(&mut reply, &self.response_path)?;
        let data = self.codec.marshal(cur)?;
        if data.len() > self.max_send {
            return Err(send_too_large(data.len(), self.max_send));
        }
        let text = String::from_utf8(data.to_vec())
            .map_err(|err| Status::internal(format!("json: error while marshaling: {err}")))?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| Status::cancelled("context canceled"))
    }
}

#[async_trait]
impl MessageSource for WsStream {
    async fn recv_msg(&mut self) -> Result<Option<DynamicMessage>, Status> {
        self.source.recv_msg().await
    }
}

#[async_trait]
impl MessageSink for WsStream {
    fn set_header(&mut self, md: MetadataMap) -> Result<(), Status> {
        self.sink.set_header(md)
    }

    async fn send_header(&mut self, md: MetadataMap) -> Result<(), Status> {
        self.sink.send_header(md).await
    }

    fn set_trailer(&mut self, md: MetadataMap) {
        self.sink.set_trailer(md)
    }

    async fn send_msg(&mut self, msg: &DynamicMessage) -> Result<(), Status> {
        self.sink.send_msg(msg).await
    }
}

impl ServerStream for WsStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn split(&mut self) -> (&mut dyn MessageSource, &mut dyn MessageSink) {
        (&mut self.source, &mut self.sink)
    }
}
