//! Dynamic proxy handlers for reflected backends.
//!
//! # Data Flow
//! ```text
//! ServerStream (any protocol)
//!     ── recv_msg ──▶ inbound relay ──mpsc──▶ tonic client stream ──▶ backend
//!     ◀─ send_msg ─── outbound relay ◀─ Streaming<DynamicMessage> ◀── backend
//! ```
//!
//! # Design Decisions
//! - Messages stay `DynamicMessage` end to end; the backend's own
//!   descriptors drive encoding
//! - Both relays run in one task. The outbound relay decides when the call
//!   is over; its error wins over an inbound one
//! - A cancelled inbound side counts as a clean end of input

use std::pin::pin;
use std::str::FromStr;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::Channel;
use tonic::{Code, Status};

use crate::registry::handler::Service;
use crate::stream::{MessageSink, MessageSource, ServerStream};

const RELAY_BUFFER: usize = 16;

/// tonic codec over descriptor-driven messages.
#[derive(Debug, Clone)]
pub struct DynamicCodec {
    decode: MessageDescriptor,
}

impl DynamicCodec {
    /// A codec decoding responses as `decode`.
    pub fn new(decode: MessageDescriptor) -> Self {
        Self { decode }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.decode.clone())
    }
}

#[derive(Debug)]
pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|err| Status::internal(format!("proto: error while marshaling: {err}")))
    }
}

#[derive(Debug)]
pub struct DynamicDecoder(MessageDescriptor);

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        DynamicMessage::decode(self.0.clone(), src)
            .map(Some)
            .map_err(|err| Status::internal(format!("proto: error while unmarshaling: {err}")))
    }
}

/// Forwards every call on a method to a remote backend.
#[derive(Debug, Clone)]
pub struct ProxyService {
    channel: Channel,
}

impl ProxyService {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

/// Whether a relay error should fail the call.
fn is_stream_error(status: &Status) -> bool {
    status.code() != Code::Cancelled
}

#[async_trait]
impl Service for ProxyService {
    async fn call(&self, method: &MethodDescriptor, stream: &mut dyn ServerStream) -> Result<(), Status> {
        let ctx = stream.context().clone();
        let path = PathAndQuery::from_str(&ctx.method)
            .map_err(|err| Status::internal(format!("invalid method path {:?}: {err}", ctx.method)))?;
        let client_streaming = method.is_client_streaming();
        let (source, sink) = stream.split();

        // The first message is read before dialing so a bad request fails
        // with its own error rather than the backend's.
        let first = source.recv_msg().await?;
        if first.is_none() && !client_streaming {
            return Err(Status::internal("missing request message"));
        }

        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        let more = first.is_some() && client_streaming;
        if let Some(first) = first {
            tx.send(first)
                .await
                .map_err(|_| Status::internal("request relay closed"))?;
        }

        let mut inbound = pin!(relay_inbound(source, tx, more));
        let mut outbound = pin!(relay_outbound(
            self.channel.clone(),
            path,
            method.output(),
            ctx,
            rx,
            sink,
        ));

        let mut inbound_result = None;
        let result = loop {
            tokio::select! {
                res = &mut inbound, if inbound_result.is_none() => inbound_result = Some(res),
                res = &mut outbound => break res,
            }
        };
        result?;
        match inbound_result {
            Some(Err(err)) if is_stream_error(&err) => Err(err),
            _ => Ok(()),
        }
    }
}

async fn relay_inbound(
    source: &mut dyn MessageSource,
    tx: mpsc::Sender<DynamicMessage>,
    more: bool,
) -> Result<(), Status> {
    if !more {
        return Ok(());
    }
    while let Some(msg) = source.recv_msg().await? {
        tracing::trace!("Relaying request message");
        if tx.send(msg).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn relay_outbound(
    channel: Channel,
    path: PathAndQuery,
    output: MessageDescriptor,
    ctx: crate::stream::CallContext,
    rx: mpsc::Receiver<DynamicMessage>,
    sink: &mut dyn MessageSink,
) -> Result<(), Status> {
    let mut request = tonic::Request::new(ReceiverStream::new(rx));
    *request.metadata_mut() = ctx.metadata.clone();
    if let Some(timeout) = ctx.timeout() {
        request.set_timeout(timeout);
    }

    let mut grpc = Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|err| Status::unavailable(format!("backend not ready: {err}")))?;
    let response = grpc
        .streaming(request, path, DynamicCodec::new(output))
        .await?;

    let (metadata, mut replies, _) = response.into_parts();
    sink.send_header(metadata).await?;
    while let Some(reply) = replies.message().await? {
        sink.send_msg(&reply).await?;
    }
    if let Some(trailers) = replies.trailers().await? {
        sink.set_trailer(trailers);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testpb;

    #[test]
    fn test_stream_errors() {
        assert!(!is_stream_error(&Status::cancelled("context canceled")));
        assert!(is_stream_error(&Status::not_found("x")));
        assert!(is_stream_error(&Status::unavailable("x")));
    }

    #[test]
    fn test_dynamic_codec_descriptor() {
        let desc = testpb::pool().get_message_by_name("gateway.testpb.Book").unwrap();
        let mut codec = DynamicCodec::new(desc.clone());
        assert_eq!(codec.decoder().0, desc);
    }
}
