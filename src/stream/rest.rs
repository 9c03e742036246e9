//! REST stream.
//!
//! # Responsibilities
//! - Decode the request body into the sub-message the route's `body`
//!   names, then apply path and query params over it
//! - Encode replies from the route's `response_body` sub-message with the
//!   negotiated codec, compressing when the client accepts it
//! - Pass `google.api.HttpBody` through as raw bytes in both directions
//! - Answer failures with a status body and the mapped HTTP status
//!
//! # Design Decisions
//! - Client-streaming bodies are split with the codec's own delimiter;
//!   server-streaming replies are written the same way
//! - A client-streaming `HttpBody` yields one message per body chunk
//! - Headers are committed with the first body byte, so a handler that
//!   fails before replying still gets its error status

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body::Body as _;
use prost_reflect::{
    DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor, ReflectMessage, Value,
};
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::codec::frame::BodyReader;
use crate::codec::{Codec, CodecRegistry, Compressor, JsonCodec};
use crate::http::response::{set_outgoing_metadata, ResponseWriter};
use crate::http::status::{http_status, status_body, twirp_body};
use crate::routing::params::{message_at_mut, FieldPath, Params};
use crate::routing::router::Binding;
use crate::routing::rule::HTTP_BODY;
use crate::stream::{
    already_sent, join_metadata, send_too_large, CallContext, Limits, MessageSink, MessageSource,
    ServerStream,
};

/// Content type assumed when the request has none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Codec for `desc`: one registered for its full name, else for `media_type`.
pub fn lookup_codec(
    codecs: &CodecRegistry,
    desc: &MessageDescriptor,
    media_type: &str,
) -> Result<Arc<dyn Codec>, Status> {
    codecs
        .get(desc.full_name())
        .or_else(|| codecs.get(media_type))
        .ok_or_else(|| {
            Status::internal(format!("no codec registered for content-type {media_type:?}"))
        })
}

fn not_streaming(codec: &dyn Codec) -> Status {
    Status::internal(format!("codec {:?} does not support streaming", codec.name()))
}

/// A routed REST call.
pub struct RestStream {
    ctx: CallContext,
    source: RestSource,
    sink: RestSink,
}

struct RestSource {
    desc: MethodDescriptor,
    body_path: Option<FieldPath>,
    params: Option<Params>,
    reader: BodyReader,
    has_body: bool,
    codecs: CodecRegistry,
    content_type: String,
    media_type: String,
    max_receive: usize,
    eof: bool,
}

struct RestSink {
    method: String,
    pool: DescriptorPool,
    server_streaming: bool,
    response_path: FieldPath,
    writer: ResponseWriter,
    codecs: CodecRegistry,
    accept: String,
    compressor: Option<Arc<dyn Compressor>>,
    header: HeaderMap,
    trailer: HeaderMap,
    header_sent: bool,
    max_send: usize,
    twirp: bool,
}

impl RestStream {
    pub fn new(
        ctx: CallContext,
        binding: &Binding,
        params: Params,
        body: Body,
        writer: ResponseWriter,
        codecs: CodecRegistry,
    ) -> Self {
        let limits = Limits::default();
        let source = RestSource {
            desc: binding.desc.clone(),
            body_path: binding.body.clone(),
            params: Some(params),
            has_body: !body.is_end_stream(),
            reader: BodyReader::new(body),
            codecs: codecs.clone(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            media_type: DEFAULT_CONTENT_TYPE.to_string(),
            max_receive: limits.max_receive,
            eof: false,
        };
        let sink = RestSink {
            method: ctx.method.clone(),
            pool: binding.desc.parent_pool().clone(),
            server_streaming: binding.desc.is_server_streaming(),
            response_path: binding.response.clone(),
            writer,
            codecs,
            accept: DEFAULT_CONTENT_TYPE.to_string(),
            compressor: None,
            header: HeaderMap::new(),
            trailer: HeaderMap::new(),
            header_sent: false,
            max_send: limits.max_send,
            twirp: false,
        };
        Self { ctx, source, sink }
    }

    /// The request `Content-Type`, raw and as a media type.
    pub fn with_content_type(mut self, content_type: &str, media_type: &str) -> Self {
        self.source.content_type = content_type.to_string();
        self.source.media_type = media_type.to_string();
        self
    }

    /// The negotiated response media type.
    pub fn with_accept(mut self, accept: &str) -> Self {
        self.sink.accept = accept.to_string();
        self
    }

    /// Compress response bodies with the negotiated `Accept-Encoding`.
    pub fn with_compressor(mut self, compressor: Option<Arc<dyn Compressor>>) -> Self {
        self.sink.compressor = compressor;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.source.max_receive = limits.max_receive;
        self.sink.max_send = limits.max_send;
        self
    }

    /// Write errors in the Twirp shape.
    pub fn with_twirp(mut self, twirp: bool) -> Self {
        self.sink.twirp = twirp;
        self
    }

    /// Resolves once the client stops reading the response.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        self.sink.writer.closed()
    }

    /// Write the error body, if any, and end the response.
    pub async fn finish(self, result: Result<(), Status>) {
        self.sink.finish(result).await
    }
}

#[async_trait]
impl MessageSource for RestSource {
    async fn recv_msg(&mut self) -> Result<Option<DynamicMessage>, Status> {
        if self.eof {
            return Ok(None);
        }
        let mut msg = DynamicMessage::new(self.desc.input());
        let streaming = self.desc.is_client_streaming();

        if let (Some(path), true) = (&self.body_path, self.has_body) {
            let target = message_at_mut(&mut msg, path)?;
            let target_desc = target.descriptor();

            if target_desc.full_name() == HTTP_BODY {
                let data = if streaming {
                    self.reader.next_chunk(self.max_receive).await?
                } else {
                    self.eof = true;
                    Some(self.reader.read_to_end(self.max_receive).await?)
                };
                let Some(data) = data else {
                    self.eof = true;
                    return Ok(None);
                };
                target.set_field_by_name("content_type", Value::String(self.content_type.clone()));
                target.set_field_by_name("data", Value::Bytes(data));
            } else {
                let codec = lookup_codec(&self.codecs, &target_desc, &self.media_type)?;
                let data = if streaming {
                    let stream = codec.as_stream().ok_or_else(|| not_streaming(codec.as_ref()))?;
                    self.reader.next_message(stream, self.max_receive).await?
                } else {
                    self.eof = true;
                    Some(self.reader.read_to_end(self.max_receive).await?)
                };
                let Some(data) = data else {
                    self.eof = true;
                    return Ok(None);
                };
                codec.unmarshal(&data, target)?;
            }
        } else {
            self.eof = true;
        }

        if let Some(params) = self.params.take() {
            params.set(&mut msg)?;
        }
        Ok(Some(msg))
    }
}

impl RestSink {
    fn commit_head(&mut self, content_type: Option<&str>) {
        if self.writer.head_sent() {
            return;
        }
        let mut headers = HeaderMap::new();
        if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(ct).ok()) {
            headers.insert(CONTENT_TYPE, value);
        }
        if let Some(compressor) = &self.compressor {
            if let Ok(value) = HeaderValue::from_str(compressor.name()) {
                headers.insert(CONTENT_ENCODING, value);
            }
        }
        set_outgoing_metadata(&mut headers, &std::mem::take(&mut self.header));
        self.header_sent = true;
        self.writer.set_status(StatusCode::OK);
        *self.writer.headers_mut() = headers;
        self.writer.send_head();
    }

    async fn write(&mut self, data: Bytes) -> Result<(), Status> {
        let data = match &self.compressor {
            Some(compressor) => {
                let mut compressed = BytesMut::new();
                compressor.compress(&data, &mut compressed)?;
                compressed.freeze()
            }
            None => data,
        };
        self.writer.write(data).await
    }

    async fn finish(mut self, result: Result<(), Status>) {
        let written = match result {
            Ok(()) if self.writer.head_sent() => {
                let trailers = std::mem::take(&mut self.trailer);
                if trailers.is_empty() {
                    Ok(())
                } else {
                    let mut filtered = HeaderMap::new();
                    set_outgoing_metadata(&mut filtered, &trailers);
                    self.writer.write_trailers(filtered).await
                }
            }
            Ok(()) => {
                let trailers = std::mem::take(&mut self.trailer);
                set_outgoing_metadata(&mut self.header, &trailers);
                self.commit_head(None);
                Ok(())
            }
            Err(status) => self.write_error(&status).await,
        };
        if let Err(err) = written {
            tracing::debug!(method = %self.method, error = %err, "Response not delivered");
        }
    }

    async fn write_error(&mut self, status: &Status) -> Result<(), Status> {
        let (content_type, body) = if self.twirp {
            (DEFAULT_CONTENT_TYPE.to_string(), twirp_body(status))
        } else {
            let (content_type, codec): (String, Arc<dyn Codec>) = match self.codecs.get(&self.accept) {
                Some(codec) => (self.accept.clone(), codec),
                None => (DEFAULT_CONTENT_TYPE.to_string(), Arc::new(JsonCodec::default())),
            };
            (content_type, status_body(status, codec.as_ref(), Some(&self.pool)))
        };

        if self.writer.head_sent() {
            tracing::debug!(method = %self.method, code = ?status.code(), "Error after response started");
            return self.write(body).await;
        }

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        set_outgoing_metadata(&mut headers, &std::mem::take(&mut self.header));
        set_outgoing_metadata(&mut headers, status.metadata().as_ref());
        set_outgoing_metadata(&mut headers, &std::mem::take(&mut self.trailer));
        self.writer.set_status(http_status(status.code()));
        *self.writer.headers_mut() = headers;
        self.writer.send_head();
        self.writer.write(body).await
    }
}

#[async_trait]
impl MessageSink for RestSink {
    fn set_header(&mut self, md: MetadataMap) -> Result<(), Status> {
        if self.header_sent {
            return Err(already_sent());
        }
        join_metadata(&mut self.header, md);
        Ok(())
    }

    /// Queues the header for the first body byte; the status is not
    /// committed here.
    async fn send_header(&mut self, md: MetadataMap) -> Result<(), Status> {
        self.set_header(md)?;
        self.header_sent = true;
        Ok(())
    }

    fn set_trailer(&mut self, md: MetadataMap) {
        join_metadata(&mut self.trailer, md);
    }

    async fn send_msg(&mut self, msg: &DynamicMessage) -> Result<(), Status> {
        let mut reply = msg.clone();
        let cur = message_at_mut(&mut reply, &self.response_path)?;
        let desc = cur.descriptor();

        let (content_type, body) = if desc.full_name() == HTTP_BODY {
            let content_type = cur
                .get_field_by_name("content_type")
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            let data = cur
                .get_field_by_name("data")
                .and_then(|v| v.as_bytes().cloned())
                .unwrap_or_default();
            (content_type, data)
        } else {
            let codec = lookup_codec(&self.codecs, &desc, &self.accept)?;
            let mut buf = BytesMut::new();
            if self.server_streaming {
                let stream = codec.as_stream().ok_or_else(|| not_streaming(codec.as_ref()))?;
                stream.size_write(&mut buf, cur)?;
            } else {
                codec.marshal_append(&mut buf, cur)?;
            }
            (self.accept.clone(), buf.freeze())
        };
        if body.len() > self.max_send {
            return Err(send_too_large(body.len(), self.max_send));
        }

        let content_type = (!content_type.is_empty()).then_some(content_type.as_str());
        self.commit_head(content_type);
        self.write(body).await
    }
}

#[async_trait]
impl MessageSource for RestStream {
    async fn recv_msg(&mut self) -> Result<Option<DynamicMessage>, Status> {
        self.source.recv_msg().await
    }
}

#[async_trait]
impl MessageSink for RestStream {
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

impl ServerStream for RestStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn split(&mut self) -> (&mut dyn MessageSource, &mut dyn MessageSink) {
        (&mut self.source, &mut self.sink)
    }
}
