//! Request inspection.
//!
//! # Responsibilities
//! - Request IDs (UUID v4) set on entry and echoed on the response
//! - Turn request headers into incoming call metadata
//! - Decode `grpc-timeout`
//! - Small classifiers used by the mux (content type, upgrade)

use std::time::Duration;

use http::header::{CONTENT_TYPE, UPGRADE};
use http::{HeaderMap, HeaderName};
use tonic::metadata::MetadataMap;
use tonic::Status;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

/// Header carrying the request ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Headers owned by the gRPC transport, never passed through as metadata.
pub const RESERVED_HEADERS: [&str; 10] = [
    "content-type",
    "user-agent",
    "grpc-message-type",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-message",
    "grpc-status",
    "grpc-timeout",
    "grpc-status-details-bin",
    "te",
];

/// Connection-level headers.
pub const HOP_BY_HOP_HEADERS: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Layer that assigns a UUID v4 request ID when the client sent none.
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID), MakeRequestUuid)
}

/// Layer that copies the request ID onto the response.
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID))
}

pub fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS.contains(&name) || HOP_BY_HOP_HEADERS.contains(&name)
}

/// Incoming metadata for a request: reserved and hop-by-hop headers are
/// dropped and `-bin` values must be valid base64.
pub fn incoming_metadata(headers: &HeaderMap) -> MetadataMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let key = name.as_str();
        if key.starts_with(':') || is_reserved_header(key) {
            continue;
        }
        if key.ends_with("-bin") && decode_bin(value.as_bytes()).is_none() {
            tracing::debug!(header = %key, "Dropping malformed binary header");
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    MetadataMap::from_headers(filtered)
}

fn decode_bin(value: &[u8]) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
    use base64::Engine;

    if value.len() % 4 == 0 {
        STANDARD.decode(value).ok()
    } else {
        STANDARD_NO_PAD.decode(value).ok()
    }
}

/// Decode a `grpc-timeout` value: up to 8 digits and a unit.
pub fn parse_grpc_timeout(value: &str) -> Result<Duration, Status> {
    let invalid = || Status::invalid_argument(format!("malformed grpc-timeout {value:?}"));
    if value.len() < 2 || value.len() > 9 || !value.is_ascii() {
        return Err(invalid());
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    let timeout = match unit {
        "H" => Duration::from_secs(n * 3600),
        "M" => Duration::from_secs(n * 60),
        "S" => Duration::from_secs(n),
        "m" => Duration::from_millis(n),
        "u" => Duration::from_micros(n),
        "n" => Duration::from_nanos(n),
        _ => return Err(invalid()),
    };
    Ok(timeout)
}

/// Whether the request asks for a WebSocket upgrade.
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    headers
        .get_all(UPGRADE)
        .iter()
        .any(|v| v.as_bytes().eq_ignore_ascii_case(b"websocket"))
}

/// The request content type, or `""`.
pub fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// The media type without parameters, lowercased.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}
