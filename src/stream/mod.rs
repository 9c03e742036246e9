//! Protocol stream adapters.
//!
//! # Data Flow
//! ```text
//! http::mux classifies the request
//!     → grpc.rs       application/grpc[+codec], HTTP/2 framing and trailers
//!     → web.rs        application/grpc-web[-text], trailers in the body
//!     → rest.rs       routed REST/JSON, params from path and query
//!     → websocket.rs  one JSON text frame per message
//!
//! Every adapter implements ServerStream:
//!     handler ── recv_msg ──▶ request messages
//!     handler ── send_msg ──▶ response messages (header sent implicitly)
//!     adapter finish() writes the status in the transport's own form
//! ```
//!
//! # Design Decisions
//! - The contract is split into a receiving and a sending half so a relay
//!   can pump both directions concurrently from one task
//! - Headers go out before the first body byte; the status is only
//!   written after the handler returns
//! - Cancellation comes from the response body being dropped and from
//!   the `grpc-timeout` deadline; both stop the handler future

pub mod grpc;
pub mod rest;
pub mod web;
pub mod websocket;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use prost_reflect::DynamicMessage;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::codec::{DEFAULT_MAX_RECEIVE_SIZE, DEFAULT_MAX_SEND_SIZE};
use crate::registry::Handler;

/// Wire protocol of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Grpc,
    GrpcWeb,
    GrpcWebText,
    Rest,
    WebSocket,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Grpc => "grpc",
            Protocol::GrpcWeb => "grpc-web",
            Protocol::GrpcWebText => "grpc-web-text",
            Protocol::Rest => "rest",
            Protocol::WebSocket => "websocket",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call context shared by every adapter.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Handler key, `/pkg.Service/Method`.
    pub method: String,
    pub protocol: Protocol,
    /// Filtered request headers.
    pub metadata: MetadataMap,
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(method: impl Into<String>, protocol: Protocol, metadata: MetadataMap) -> Self {
        Self {
            method: method.into(),
            protocol,
            metadata,
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        self
    }

    /// Time left before the deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Message size limits, after decompression on receive and after
/// compression on send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_receive: usize,
    pub max_send: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_receive: DEFAULT_MAX_RECEIVE_SIZE,
            max_send: DEFAULT_MAX_SEND_SIZE,
        }
    }
}

pub(crate) fn send_too_large(len: usize, limit: usize) -> Status {
    Status::resource_exhausted(format!(
        "grpc: trying to send message larger than max ({len} vs. {limit})"
    ))
}

/// Receiving half of a server stream.
#[async_trait]
pub trait MessageSource: Send {
    /// Next request message, or `None` once the client is done sending.
    async fn recv_msg(&mut self) -> Result<Option<DynamicMessage>, Status>;
}

/// Sending half of a server stream.
#[async_trait]
pub trait MessageSink: Send {
    /// Queue header metadata for the response head.
    fn set_header(&mut self, md: MetadataMap) -> Result<(), Status>;

    /// Write the response head now, with `md` joined to any queued header.
    async fn send_header(&mut self, md: MetadataMap) -> Result<(), Status>;

    /// Queue trailer metadata, written after the handler returns.
    fn set_trailer(&mut self, md: MetadataMap);

    async fn send_msg(&mut self, msg: &DynamicMessage) -> Result<(), Status>;
}

/// The call contract every protocol adapter implements.
pub trait ServerStream: MessageSource + MessageSink {
    fn context(&self) -> &CallContext;

    /// Borrow both halves at once.
    fn split(&mut self) -> (&mut dyn MessageSource, &mut dyn MessageSink);
}

/// Append every entry of `md` to `dst`.
pub(crate) fn join_metadata(dst: &mut HeaderMap, md: MetadataMap) {
    let mut name = None;
    for (key, value) in md.into_headers() {
        if key.is_some() {
            name = key;
        }
        if let Some(name) = &name {
            dst.append(name.clone(), value);
        }
    }
}

pub(crate) fn already_sent() -> Status {
    Status::internal("transport: the stream is done or WriteHeader was already called")
}

/// Run `handler` on `stream` until it returns, the client goes away or
/// the call deadline passes.
///
/// `closed` must resolve only when the response can no longer be
/// delivered, not when the request body ends. A passed deadline takes
/// precedence over a disconnect noticed in the same poll.
pub async fn invoke(
    handler: &Handler,
    stream: &mut dyn ServerStream,
    closed: impl Future<Output = ()>,
) -> Result<(), Status> {
    let deadline = stream.context().deadline;
    let expired = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        _ = expired => Err(Status::deadline_exceeded("context deadline exceeded")),
        _ = closed => Err(Status::cancelled("context canceled")),
        result = handler.call(stream) => result,
    }
}
