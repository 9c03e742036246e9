//! gRPC and gRPC-Web streams.
//!
//! # Responsibilities
//! - Read length-prefixed request frames, decompressing flagged ones
//! - Write the response head on first use, then framed messages
//! - End the call with the status: HTTP/2 trailers for native gRPC, a
//!   trailer frame in the body for gRPC-Web
//!
//! # Design Decisions
//! - Responses reuse the compressor the client picked for its request
//! - A native call that fails before any header is sent answers
//!   trailers-only, with the status in the response head

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use bytes::{Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use prost_reflect::{DynamicMessage, MethodDescriptor};
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::codec::frame::{encode_frame, Base64Encoder, BodyReader, FLAG_COMPRESSED};
use crate::codec::{Codec, Compressor};
use crate::http::response::{set_outgoing_metadata, status_headers, ResponseWriter};
use crate::stream::web::{response_content_type, trailer_frame};
use crate::stream::{
    already_sent, join_metadata, send_too_large, CallContext, Limits, MessageSink, MessageSource,
    Protocol, ServerStream,
};

const GRPC_ENCODING: HeaderName = HeaderName::from_static("grpc-encoding");
const GRPC_ACCEPT_ENCODING: HeaderName = HeaderName::from_static("grpc-accept-encoding");

/// A call over `application/grpc` or `application/grpc-web[-text]`.
pub struct GrpcStream {
    ctx: CallContext,
    source: GrpcSource,
    sink: GrpcSink,
}

struct GrpcSource {
    desc: MethodDescriptor,
    reader: BodyReader,
    codec: Arc<dyn Codec>,
    compressor: Option<Arc<dyn Compressor>>,
    max_receive: usize,
}

struct GrpcSink {
    method: String,
    protocol: Protocol,
    writer: ResponseWriter,
    codec: Arc<dyn Codec>,
    subtype: String,
    compressor: Option<Arc<dyn Compressor>>,
    accept_encoding: Option<String>,
    header: HeaderMap,
    trailer: HeaderMap,
    text: Option<Base64Encoder>,
    max_send: usize,
}

impl GrpcStream {
    /// `subtype` is the codec name from the request content type.
    pub fn new(
        ctx: CallContext,
        desc: MethodDescriptor,
        body: Body,
        writer: ResponseWriter,
        codec: Arc<dyn Codec>,
        subtype: impl Into<String>,
    ) -> Self {
        let text = ctx.protocol == Protocol::GrpcWebText;
        let reader = BodyReader::new(body);
        let limits = Limits::default();
        let source = GrpcSource {
            desc,
            reader: if text { reader.base64() } else { reader },
            codec: Arc::clone(&codec),
            compressor: None,
            max_receive: limits.max_receive,
        };
        let sink = GrpcSink {
            method: ctx.method.clone(),
            protocol: ctx.protocol,
            writer,
            codec,
            subtype: subtype.into(),
            compressor: None,
            accept_encoding: None,
            header: HeaderMap::new(),
            trailer: HeaderMap::new(),
            text: text.then(Base64Encoder::default),
            max_send: limits.max_send,
        };
        Self { ctx, source, sink }
    }

    /// Decompress flagged request frames with `compressor` and compress
    /// responses with it.
    pub fn with_compressor(mut self, compressor: Option<Arc<dyn Compressor>>) -> Self {
        self.source.compressor = compressor.clone();
        self.sink.compressor = compressor;
        self
    }

    /// Advertise `grpc-accept-encoding` on the response.
    pub fn with_accept_encoding(mut self, accept_encoding: impl Into<String>) -> Self {
        self.sink.accept_encoding = Some(accept_encoding.into());
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.source.max_receive = limits.max_receive;
        self.sink.max_send = limits.max_send;
        self
    }

    /// Resolves once the client stops reading the response.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        self.sink.writer.closed()
    }

    /// Write the call status and end the response.
    pub async fn finish(self, result: Result<(), Status>) {
        self.sink.finish(result).await
    }
}

impl GrpcSink {
    fn is_web(&self) -> bool {
        matches!(self.protocol, Protocol::GrpcWeb | Protocol::GrpcWebText)
    }

    fn head_headers(&mut self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let content_type = response_content_type(self.protocol, &self.subtype);
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        if let Some(compressor) = &self.compressor {
            if let Ok(value) = HeaderValue::from_str(compressor.name()) {
                headers.insert(GRPC_ENCODING, value);
            }
        }
        if let Some(accept) = &self.accept_encoding {
            if let Ok(value) = HeaderValue::from_str(accept) {
                headers.insert(GRPC_ACCEPT_ENCODING, value);
            }
        }
        set_outgoing_metadata(&mut headers, &std::mem::take(&mut self.header));
        headers
    }

    fn commit_head(&mut self) {
        if self.writer.head_sent() {
            return;
        }
        let headers = self.head_headers();
        self.writer.set_status(StatusCode::OK);
        *self.writer.headers_mut() = headers;
        self.writer.send_head();
    }

    async fn write(&mut self, data: Bytes) -> Result<(), Status> {
        let data = match &mut self.text {
            Some(encoder) => encoder.encode(&data),
            None => data,
        };
        self.writer.write(data).await
    }

    async fn finish(mut self, result: Result<(), Status>) {
        let status = match result {
            Ok(()) => Status::ok(""),
            Err(status) => status,
        };
        let mut trailers = status_headers(&status);
        set_outgoing_metadata(&mut trailers, &std::mem::take(&mut self.trailer));

        let written = if self.is_web() {
            self.commit_head();
            match self.write(trailer_frame(&trailers)).await {
                Ok(()) => match self.text.as_mut().map(Base64Encoder::finish) {
                    Some(rest) => self.writer.write(rest).await,
                    None => Ok(()),
                },
                Err(err) => Err(err),
            }
        } else if self.writer.head_sent() {
            self.writer.write_trailers(trailers).await
        } else {
            let mut headers = self.head_headers();
            headers.extend(trailers);
            self.writer.set_status(StatusCode::OK);
            *self.writer.headers_mut() = headers;
            self.writer.send_head();
            Ok(())
        };

        if let Err(err) = written {
            tracing::debug!(method = %self.method, error = %err, "Status not delivered");
        }
    }
}

#[async_trait]
impl MessageSource for GrpcSource {
    async fn recv_msg(&mut self) -> Result<Option<DynamicMessage>, Status> {
        loop {
            let Some(frame) = self.reader.next_frame(self.max_receive).await? else {
                return Ok(None);
            };
            if frame.is_trailer() {
                continue;
            }
            let payload = if frame.is_compressed() {
                let compressor = self.compressor.as_ref().ok_or_else(|| {
                    Status::internal("grpc: compressed flag set with identity or empty encoding")
                })?;
                compressor.decompress(&frame.payload, self.max_receive)?
            } else {
                frame.payload
            };
            let mut msg = DynamicMessage::new(self.desc.input());
            self.codec.unmarshal(&payload, &mut msg)?;
            return Ok(Some(msg));
        }
    }
}

#[async_trait]
impl MessageSink for GrpcSink {
    fn set_header(&mut self, md: MetadataMap) -> Result<(), Status> {
        if self.writer.head_sent() {
            return Err(already_sent());
        }
        join_metadata(&mut self.header, md);
        Ok(())
    }

    async fn send_header(&mut self, md: MetadataMap) -> Result<(), Status> {
        self.set_header(md)?;
        self.commit_head();
        Ok(())
    }

    fn set_trailer(&mut self, md: MetadataMap) {
        join_metadata(&mut self.trailer, md);
    }

    async fn send_msg(&mut self, msg: &DynamicMessage) -> Result<(), Status> {
        self.commit_head();

        let mut payload = BytesMut::new();
        self.codec.marshal_append(&mut payload, msg)?;
        let (flag, payload) = match &self.compressor {
            Some(compressor) => {
                let mut compressed = BytesMut::new();
                compressor.compress(&payload, &mut compressed)?;
                (FLAG_COMPRESSED, compressed)
            }
            None => (0, payload),
        };
        if payload.len() > self.max_send {
            return Err(send_too_large(payload.len(), self.max_send));
        }

        let mut frame = BytesMut::new();
        encode_frame(flag, &payload, &mut frame);
        self.write(frame.freeze()).await
    }
}

#[async_trait]
impl MessageSource for GrpcStream {
    async fn recv_msg(&mut self) -> Result<Option<DynamicMessage>, Status> {
        self.source.recv_msg().await
    }
}

#[async_trait]
impl MessageSink for GrpcStream {
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

impl ServerStream for GrpcStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn split(&mut self) -> (&mut dyn MessageSource, &mut dyn MessageSink) {
        (&mut self.source, &mut self.sink)
    }
}
