//! Request dispatch.
//!
//! # Responsibilities
//! - Classify each request by content type and upgrade header
//! - Check the gRPC transport requirements before any handler runs
//! - Resolve REST and WebSocket routes, then pick a handler
//! - Run the handler in its own task and stream its response
//!
//! # Design Decisions
//! - Order: gRPC-Web, gRPC, WebSocket, then REST as the fallback
//! - The handler task owns the stream; the response future only waits
//!   for the head, so streaming calls start answering immediately
//! - Failures found before a stream exists are answered in the form the
//!   client's protocol expects

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use prost_reflect::ServiceDescriptor;
use tonic::{Code, Status};

use crate::codec::compress::IDENTITY;
use crate::codec::frame::BodyReader;
use crate::codec::negotiate::{negotiate_content_encoding, negotiate_content_type};
use crate::codec::{CodecRegistry, CompressorRegistry, JsonCodec};
use crate::error::GatewayError;
use crate::http::request::{content_type, incoming_metadata, is_websocket_request, media_type, parse_grpc_timeout};
use crate::http::response::{empty, status_headers, ResponseWriter};
use crate::http::status::{http_status, status_body, twirp_body};
use crate::observability::metrics;
use crate::registry::{Handler, Registry, Service};
use crate::routing::params::parse_query;
use crate::routing::router::WEBSOCKET_VERB;
use crate::routing::HttpRule;
use crate::stream::grpc::GrpcStream;
use crate::stream::rest::{RestStream, DEFAULT_CONTENT_TYPE};
use crate::stream::web::{parse_content_type, response_content_type, trailer_frame};
use crate::stream::websocket::WsStream;
use crate::stream::{invoke, CallContext, Limits, Protocol, ServerStream};

const TWIRP_VERSION: &str = "twirp-version";
const GRPC_TIMEOUT: &str = "grpc-timeout";
const GRPC_ENCODING: &str = "grpc-encoding";
const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";

/// Options shared by every call through a [`Mux`].
#[derive(Debug, Clone, Default)]
pub struct MuxOptions {
    /// Codecs by media type, gRPC subtype or message full name.
    pub codecs: CodecRegistry,
    /// Compressors by encoding name.
    pub compressors: CompressorRegistry,
    pub limits: Limits,
    /// Service-config rules, routed in addition to method annotations.
    pub http_rules: Vec<HttpRule>,
}

/// Multi-protocol dispatcher over a [`Registry`].
#[derive(Clone)]
pub struct Mux {
    registry: Arc<Registry>,
    opts: Arc<MuxOptions>,
}

impl Mux {
    pub fn new(opts: MuxOptions) -> Self {
        let registry = Arc::new(Registry::with_http_rules(opts.http_rules.clone()));
        Self {
            registry,
            opts: Arc::new(opts),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn options(&self) -> &MuxOptions {
        &self.opts
    }

    /// Serve every method of `service` with `implementation`.
    pub fn register_service(
        &self,
        service: &ServiceDescriptor,
        implementation: Arc<dyn Service>,
    ) -> Result<(), GatewayError> {
        self.registry.register_service(service, implementation)
    }

    /// Dispatch one request.
    pub async fn serve(&self, req: Request) -> Response {
        let media = media_type(content_type(req.headers()));
        if let Some((protocol, subtype)) = parse_content_type(&media) {
            let subtype = subtype.to_string();
            return self.serve_grpc(req, protocol, &subtype).await;
        }
        if is_websocket_request(req.headers()) {
            return self.serve_websocket(req).await;
        }
        self.serve_rest(req).await
    }

    async fn serve_grpc(&self, req: Request, protocol: Protocol, subtype: &str) -> Response {
        let start = Instant::now();
        if protocol == Protocol::Grpc && req.version() != Version::HTTP_2 {
            return plain_error(StatusCode::BAD_REQUEST, "gRPC requires HTTP/2");
        }
        if req.method() != Method::POST {
            return plain_error(StatusCode::BAD_REQUEST, "gRPC requires POST");
        }
        let Some(codec) = self.opts.codecs.get(subtype) else {
            return plain_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                &format!("unsupported content subtype {subtype:?}"),
            );
        };
        let compressor = match header_str(req.headers(), GRPC_ENCODING) {
            None | Some(IDENTITY) => None,
            Some(name) => match self.opts.compressors.get(name) {
                Some(compressor) => Some(compressor),
                None => {
                    let mut response = plain_error(
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        &format!("unsupported grpc-encoding {name:?}"),
                    );
                    if let Ok(value) = HeaderValue::from_str(&self.opts.compressors.accept_encoding()) {
                        response.headers_mut().insert(GRPC_ACCEPT_ENCODING, value);
                    }
                    return response;
                }
            },
        };
        let timeout = match header_str(req.headers(), GRPC_TIMEOUT).map(parse_grpc_timeout) {
            None => None,
            Some(Ok(timeout)) => Some(timeout),
            Some(Err(status)) => return plain_error(StatusCode::BAD_REQUEST, status.message()),
        };

        let method = req.uri().path().to_string();
        let handler = match self.registry.load().pick(&method) {
            Ok(handler) => handler,
            Err(status) => {
                tracing::debug!(protocol = %protocol, method = %method, "Unknown method");
                metrics::record_rpc(protocol.as_str(), &method, status.code(), start);
                return grpc_error(protocol, subtype, &status);
            }
        };

        let ctx = CallContext::new(&method, protocol, incoming_metadata(req.headers())).with_timeout(timeout);
        let (writer, pending) = ResponseWriter::channel();
        let stream = GrpcStream::new(ctx, handler.desc.clone(), req.into_body(), writer, codec, subtype)
            .with_compressor(compressor)
            .with_accept_encoding(self.opts.compressors.accept_encoding())
            .with_limits(self.opts.limits);

        tokio::spawn(async move {
            let mut stream = stream;
            let closed = stream.closed();
            let result = run(&handler, &mut stream, closed, start).await;
            stream.finish(result).await;
        });
        pending.into_response().await
    }

    async fn serve_websocket(&self, req: Request) -> Response {
        let start = Instant::now();
        let (mut parts, _body) = req.into_parts();
        let headers = parts.headers.clone();

        let state = self.registry.load();
        let route = match state.find(parts.uri.path(), WEBSOCKET_VERB) {
            Ok(route) => route,
            Err(err) => return self.rest_error(&headers, &Status::from(err)),
        };
        let binding = Arc::clone(&route.binding);
        let mut params = match route.params() {
            Ok(params) => params,
            Err(status) => return self.rest_error(&headers, &status),
        };
        if let Some(query) = parts.uri.query() {
            if let Err(status) = parse_query(&binding.desc.input(), query, &mut params) {
                return self.rest_error(&headers, &status);
            }
        }
        let handler = match state.pick(&binding.name) {
            Ok(handler) => handler,
            Err(status) => return self.rest_error(&headers, &status),
        };

        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => return rejection.into_response(),
        };
        let ctx = CallContext::new(binding.name.clone(), Protocol::WebSocket, incoming_metadata(&headers));
        let limits = self.opts.limits;

        upgrade
            .max_message_size(limits.max_receive)
            .on_upgrade(move |socket| async move {
                let mut stream = WsStream::new(ctx, &binding, params, socket).with_limits(limits);
                let result = run(&handler, &mut stream, std::future::pending(), start).await;
                stream.finish(result).await;
            })
    }

    async fn serve_rest(&self, req: Request) -> Response {
        let start = Instant::now();
        let headers = req.headers().clone();
        let state = self.registry.load();

        let route = match state.find(req.uri().path(), req.method().as_str()) {
            Ok(route) => route,
            Err(err) => {
                let status = Status::from(err);
                tracing::debug!(path = %req.uri().path(), verb = %req.method(), "No route matched");
                metrics::record_rpc(Protocol::Rest.as_str(), "", status.code(), start);
                return self.rest_error(&headers, &status);
            }
        };
        let binding = Arc::clone(&route.binding);
        let mut params = match route.params() {
            Ok(params) => params,
            Err(status) => return self.rest_error(&headers, &status),
        };
        if let Some(query) = req.uri().query() {
            if let Err(status) = parse_query(&binding.desc.input(), query, &mut params) {
                return self.rest_error(&headers, &status);
            }
        }
        let handler = match state.pick(&binding.name) {
            Ok(handler) => handler,
            Err(status) => {
                metrics::record_rpc(Protocol::Rest.as_str(), &binding.name, status.code(), start);
                return self.rest_error(&headers, &status);
            }
        };

        let raw_content_type = match content_type(&headers) {
            "" => DEFAULT_CONTENT_TYPE.to_string(),
            ct => ct.to_string(),
        };
        let request_media = media_type(&raw_content_type);
        let body = match self.decode_content_encoding(&headers, req.into_body()).await {
            Ok(body) => body,
            Err(status) => return self.rest_error(&headers, &status),
        };

        let accept = self.negotiate_accept(&headers, &request_media);
        let offers = self.opts.compressors.names();
        let compressor = negotiate_content_encoding(header_str(&headers, ACCEPT_ENCODING.as_str()), &offers)
            .and_then(|name| self.opts.compressors.get(name));

        let ctx = CallContext::new(binding.name.clone(), Protocol::Rest, incoming_metadata(&headers));
        let (writer, pending) = ResponseWriter::channel();
        let stream = RestStream::new(ctx, &binding, params, body, writer, self.opts.codecs.clone())
            .with_content_type(&raw_content_type, &request_media)
            .with_accept(&accept)
            .with_compressor(compressor)
            .with_limits(self.opts.limits)
            .with_twirp(headers.contains_key(TWIRP_VERSION));

        tokio::spawn(async move {
            let mut stream = stream;
            let closed = stream.closed();
            let result = run(&handler, &mut stream, closed, start).await;
            stream.finish(result).await;
        });
        pending.into_response().await
    }

    /// Undo a request `Content-Encoding` the gateway has a compressor for.
    async fn decode_content_encoding(&self, headers: &HeaderMap, body: Body) -> Result<Body, Status> {
        let Some(compressor) = header_str(headers, CONTENT_ENCODING.as_str())
            .filter(|name| *name != IDENTITY)
            .and_then(|name| self.opts.compressors.get(name))
        else {
            return Ok(body);
        };
        let limit = self.opts.limits.max_receive;
        let compressed = BodyReader::new(body).read_to_end(limit).await?;
        let data = compressor.decompress(&compressed, limit)?;
        Ok(Body::from(data))
    }

    /// Response media type from `Accept`, defaulting to the request's own
    /// type when a codec handles it.
    fn negotiate_accept(&self, headers: &HeaderMap, request_media: &str) -> String {
        let offers = self.opts.codecs.media_types();
        let default = offers
            .iter()
            .copied()
            .find(|offer| *offer == request_media)
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        negotiate_content_type(header_str(headers, ACCEPT.as_str()), &offers, default).to_string()
    }

    /// An error response in the REST form for a call that never started.
    fn rest_error(&self, headers: &HeaderMap, status: &Status) -> Response {
        let (content_type, body) = if headers.contains_key(TWIRP_VERSION) {
            (DEFAULT_CONTENT_TYPE.to_string(), twirp_body(status))
        } else {
            let request_media = media_type(content_type(headers));
            let accept = self.negotiate_accept(headers, &request_media);
            let body = match self.opts.codecs.get(&accept) {
                Some(codec) => status_body(status, codec.as_ref(), None),
                None => status_body(status, &JsonCodec::default(), None),
            };
            (accept, body)
        };
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = http_status(status.code());
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        response
    }
}

impl Default for Mux {
    fn default() -> Self {
        Self::new(MuxOptions::default())
    }
}

/// Run `handler` to completion, then log and count the outcome.
async fn run<S: ServerStream>(
    handler: &Handler,
    stream: &mut S,
    closed: impl Future<Output = ()>,
    start: Instant,
) -> Result<(), Status> {
    let protocol = stream.context().protocol;
    let result = invoke(handler, stream, closed).await;
    let code = result.as_ref().err().map_or(Code::Ok, Status::code);
    match &result {
        Ok(()) => tracing::debug!(protocol = %protocol, method = %handler.name, "Call finished"),
        Err(status) => tracing::info!(
            protocol = %protocol,
            method = %handler.name,
            code = ?status.code(),
            message = %status.message(),
            "Call failed"
        ),
    }
    metrics::record_rpc(protocol.as_str(), &handler.name, code, start);
    result
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    let mut response = empty(status);
    *response.body_mut() = Body::from(message.to_string());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// A gRPC answer carrying only a status.
fn grpc_error(protocol: Protocol, subtype: &str, status: &Status) -> Response {
    let trailers = status_headers(status);
    let content_type = response_content_type(protocol, subtype);
    let mut response = match protocol {
        Protocol::GrpcWeb => Response::new(Body::from(trailer_frame(&trailers))),
        Protocol::GrpcWebText => {
            Response::new(Body::from(Bytes::from(STANDARD.encode(trailer_frame(&trailers)))))
        }
        _ => {
            let mut response = empty(StatusCode::OK);
            response.headers_mut().extend(trailers);
            response
        }
    };
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testpb;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use prost_reflect::{DynamicMessage, MethodDescriptor, Value};

    struct Shelves;

    #[async_trait]
    impl Service for Shelves {
        async fn call(
            &self,
            method: &MethodDescriptor,
            stream: &mut dyn ServerStream,
        ) -> Result<(), Status> {
            let request = stream
                .recv_msg()
                .await?
                .ok_or_else(|| Status::invalid_argument("missing request"))?;
            let name = request
                .get_field_by_name("name")
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            if name == "shelves/missing" {
                return Err(Status::not_found("no such shelf"));
            }
            let mut reply = DynamicMessage::new(method.output());
            reply.set_field_by_name("name", Value::String(name));
            stream.send_msg(&reply).await
        }
    }

    fn mux() -> Mux {
        let mux = Mux::default();
        let service = testpb::pool().get_service_by_name(testpb::LIBRARY).unwrap();
        mux.register_service(&service, Arc::new(Shelves)).unwrap();
        mux
    }

    fn request(method: &str, uri: &str) -> http::request::Builder {
        http::Request::builder().method(method).uri(uri)
    }

    #[tokio::test]
    async fn test_rest_dispatch() {
        let response = mux()
            .serve(request("GET", "/v1/shelves/1").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["name"], "shelves/1");
    }

    #[tokio::test]
    async fn test_rest_not_found() {
        let response = mux()
            .serve(request("GET", "/nothing/here").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = mux()
            .serve(request("GET", "/v1/shelves/missing").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "no such shelf");
    }

    #[tokio::test]
    async fn test_grpc_requires_http2() {
        let response = mux()
            .serve(
                request("POST", "/gateway.testpb.Library/GetShelf")
                    .header(CONTENT_TYPE, "application/grpc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_grpc_checks() {
        let grpc = |method: &str, content_type: &str| {
            request(method, "/gateway.testpb.Library/GetShelf")
                .version(Version::HTTP_2)
                .header(CONTENT_TYPE, content_type.to_string())
        };
        let mux = mux();

        let response = mux.serve(grpc("GET", "application/grpc").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = mux
            .serve(grpc("POST", "application/grpc+yaml").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = mux
            .serve(
                grpc("POST", "application/grpc")
                    .header(GRPC_ENCODING, "br")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = mux
            .serve(
                grpc("POST", "application/grpc")
                    .header(GRPC_TIMEOUT, "soon")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_grpc_unknown_method() {
        let response = mux()
            .serve(
                request("POST", "/gateway.testpb.Library/Nope")
                    .version(Version::HTTP_2)
                    .header(CONTENT_TYPE, "application/grpc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["grpc-status"], "12");
    }

    #[tokio::test]
    async fn test_twirp_route_error() {
        let response = mux()
            .serve(
                request("GET", "/missing")
                    .header(TWIRP_VERSION, "v7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "not_found");
    }
}
