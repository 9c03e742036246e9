//! Status code mapping and error bodies.
//!
//! # Responsibilities
//! - Fixed code → HTTP status and code → WebSocket close code tables
//! - REST error bodies: `google.rpc.Status` through the negotiated codec,
//!   or the Twirp shape when the client speaks Twirp

use std::sync::OnceLock;

use bytes::Bytes;
use http::StatusCode;
use prost_reflect::{DescriptorPool, DynamicMessage, Value};
use tonic::{Code, Status};

use crate::codec::Codec;
use crate::routing::rule::{base_pool, RPC_STATUS};

const HTTP_STATUS: [u16; 17] = [
    200, // OK
    408, // Cancelled
    500, // Unknown
    400, // InvalidArgument
    504, // DeadlineExceeded
    404, // NotFound
    409, // AlreadyExists
    403, // PermissionDenied
    429, // ResourceExhausted
    400, // FailedPrecondition
    409, // Aborted
    400, // OutOfRange
    501, // Unimplemented
    500, // Internal
    503, // Unavailable
    500, // DataLoss
    401, // Unauthenticated
];

const NORMAL_CLOSURE: u16 = 1000;
const GOING_AWAY: u16 = 1001;
const UNSUPPORTED_DATA: u16 = 1003;
const POLICY_VIOLATION: u16 = 1008;
const INTERNAL_ERROR: u16 = 1011;

const WS_CLOSE: [u16; 17] = [
    NORMAL_CLOSURE,
    GOING_AWAY,
    INTERNAL_ERROR,
    UNSUPPORTED_DATA,
    GOING_AWAY,
    INTERNAL_ERROR,
    INTERNAL_ERROR,
    INTERNAL_ERROR,
    INTERNAL_ERROR,
    INTERNAL_ERROR,
    INTERNAL_ERROR,
    INTERNAL_ERROR,
    UNSUPPORTED_DATA,
    INTERNAL_ERROR,
    INTERNAL_ERROR,
    INTERNAL_ERROR,
    POLICY_VIOLATION,
];

/// HTTP status for a status code.
pub fn http_status(code: Code) -> StatusCode {
    HTTP_STATUS
        .get(code as usize)
        .and_then(|s| StatusCode::from_u16(*s).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// WebSocket close code for a status code.
pub fn ws_close_code(code: Code) -> u16 {
    WS_CLOSE.get(code as usize).copied().unwrap_or(INTERNAL_ERROR)
}

/// Lowercase `google.rpc.Code` name, as Twirp spells it.
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "ok",
        Code::Cancelled => "cancelled",
        Code::Unknown => "unknown",
        Code::InvalidArgument => "invalid_argument",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::NotFound => "not_found",
        Code::AlreadyExists => "already_exists",
        Code::PermissionDenied => "permission_denied",
        Code::ResourceExhausted => "resource_exhausted",
        Code::FailedPrecondition => "failed_precondition",
        Code::Aborted => "aborted",
        Code::OutOfRange => "out_of_range",
        Code::Unimplemented => "unimplemented",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::DataLoss => "data_loss",
        Code::Unauthenticated => "unauthenticated",
    }
}

/// Twirp error body: `{"code":"not_found","msg":"...","meta":{}}`.
pub fn twirp_body(status: &Status) -> Bytes {
    let body = serde_json::json!({
        "code": code_name(status.code()),
        "msg": status.message(),
        "meta": {},
    });
    Bytes::from(body.to_string())
}

fn fallback_pool() -> &'static DescriptorPool {
    static POOL: OnceLock<DescriptorPool> = OnceLock::new();
    POOL.get_or_init(|| base_pool().unwrap_or_else(|_| DescriptorPool::global()))
}

/// `status` as a `google.rpc.Status` message, details included.
///
/// Uses `pool` when it knows `google.rpc.Status`, so detail types
/// registered there resolve.
pub fn status_message(status: &Status, pool: Option<&DescriptorPool>) -> Option<DynamicMessage> {
    let pool = pool
        .filter(|p| p.get_message_by_name(RPC_STATUS).is_some())
        .unwrap_or_else(|| fallback_pool());
    let desc = pool.get_message_by_name(RPC_STATUS)?;

    let mut msg = if status.details().is_empty() {
        DynamicMessage::new(desc)
    } else {
        DynamicMessage::decode(desc.clone(), status.details())
            .unwrap_or_else(|_| DynamicMessage::new(desc))
    };
    msg.set_field_by_name("code", Value::I32(status.code() as i32));
    msg.set_field_by_name("message", Value::String(status.message().to_string()));
    Some(msg)
}

/// Encode `status` with `codec` for a REST error body.
pub fn status_body(status: &Status, codec: &dyn Codec, pool: Option<&DescriptorPool>) -> Bytes {
    if let Some(mut msg) = status_message(status, pool) {
        if let Ok(body) = codec.marshal(&msg) {
            return body;
        }
        // Detail types the pool cannot resolve only fail the JSON form.
        msg.clear_field_by_name("details");
        if let Ok(body) = codec.marshal(&msg) {
            return body;
        }
    }
    let body = serde_json::json!({
        "code": status.code() as i32,
        "message": status.message(),
    });
    Bytes::from(body.to_string())
}
