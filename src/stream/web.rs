//! gRPC-Web translation.
//!
//! gRPC-Web runs the gRPC framing over HTTP/1.1. Trailers cannot be relied
//! on there, so the status travels in a final body frame flagged `0x80`
//! whose payload is an HTTP/1 header block. The `-text` variant base64s the
//! whole body in both directions.
//!
//! The stream itself is [`GrpcStream`](super::grpc::GrpcStream) in web
//! mode; this module holds the pieces that differ.

use bytes::{Bytes, BytesMut};
use http::HeaderMap;

use crate::codec::frame::{encode_frame, FLAG_TRAILER};
use crate::stream::Protocol;

pub const GRPC: &str = "application/grpc";
pub const GRPC_WEB: &str = "application/grpc-web";
pub const GRPC_WEB_TEXT: &str = "application/grpc-web-text";

/// Default content subtype.
pub const DEFAULT_SUBTYPE: &str = "proto";

/// Split a gRPC-family media type into its protocol and codec subtype.
///
/// `application/grpc-web-text+json` gives `(GrpcWebText, "json")`; a
/// missing subtype is `proto`. Anything else is `None`.
pub fn parse_content_type(media_type: &str) -> Option<(Protocol, &str)> {
    let (base, subtype) = match media_type.split_once('+') {
        Some((base, subtype)) => (base, subtype),
        None => (media_type, DEFAULT_SUBTYPE),
    };
    let protocol = match base {
        GRPC => Protocol::Grpc,
        GRPC_WEB => Protocol::GrpcWeb,
        GRPC_WEB_TEXT => Protocol::GrpcWebText,
        _ => return None,
    };
    if subtype.is_empty() {
        return None;
    }
    Some((protocol, subtype))
}

/// Whether the media type belongs to gRPC-Web.
pub fn is_web_content_type(media_type: &str) -> bool {
    matches!(
        parse_content_type(media_type),
        Some((Protocol::GrpcWeb | Protocol::GrpcWebText, _))
    )
}

/// Response content type for `protocol` and codec `subtype`.
pub fn response_content_type(protocol: Protocol, subtype: &str) -> String {
    let base = match protocol {
        Protocol::GrpcWeb => GRPC_WEB,
        Protocol::GrpcWebText => GRPC_WEB_TEXT,
        _ => GRPC,
    };
    format!("{base}+{subtype}")
}

/// Serialize trailers as an HTTP/1 header block with lowercase keys.
pub fn encode_trailer_block(trailers: &HeaderMap) -> Bytes {
    let mut block = BytesMut::new();
    for (name, value) in trailers {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    block.freeze()
}

/// The trailer frame ending a gRPC-Web body.
pub fn trailer_frame(trailers: &HeaderMap) -> Bytes {
    let block = encode_trailer_block(trailers);
    let mut frame = BytesMut::new();
    encode_frame(FLAG_TRAILER, &block, &mut frame);
    frame.freeze()
}
