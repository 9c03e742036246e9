//! Message codecs and compression.
//!
//! # Data Flow
//! ```text
//! Inbound bytes:
//!     frame.rs (gRPC length prefix, base64 text, raw body)
//!     → compress.rs (optional gzip)
//!     → proto.rs / json.rs (bytes → DynamicMessage)
//!
//! Outbound message:
//!     proto.rs / json.rs (DynamicMessage → bytes, appended to a reused buffer)
//!     → compress.rs → frame.rs
//!
//! Selection:
//!     negotiate.rs (Accept / Accept-Encoding) → registry lookup by
//!     message name, media type or gRPC subtype
//! ```
//!
//! # Design Decisions
//! - Codecs work on `DynamicMessage`, so one instance serves every method
//! - Stream framing splits from a buffer instead of reading from an
//!   `AsyncRead`; a partial frame simply waits for more bytes
//! - Registries keep insertion order, which is also the negotiation order

pub mod compress;
pub mod frame;
pub mod json;
pub mod negotiate;
pub mod proto;

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use prost_reflect::DynamicMessage;
use tonic::Status;

pub use compress::{Compressor, CompressorRegistry, Gzip};
pub use json::JsonCodec;
pub use proto::ProtoCodec;

/// Default receive limit, 4 MiB.
pub const DEFAULT_MAX_RECEIVE_SIZE: usize = 4 * 1024 * 1024;

/// Default send limit.
pub const DEFAULT_MAX_SEND_SIZE: usize = i32::MAX as usize;

/// Serializes dynamic messages to and from one wire format.
pub trait Codec: Send + Sync + 'static {
    /// Canonical name, also the gRPC content-subtype.
    fn name(&self) -> &str;

    /// Serialize `msg` onto the end of `buf`.
    fn marshal_append(&self, buf: &mut BytesMut, msg: &DynamicMessage) -> Result<(), Status>;

    /// Replace the contents of `msg` with the decoded `data`.
    fn unmarshal(&self, data: &[u8], msg: &mut DynamicMessage) -> Result<(), Status>;

    fn marshal(&self, msg: &DynamicMessage) -> Result<Bytes, Status> {
        let mut buf = BytesMut::new();
        self.marshal_append(&mut buf, msg)?;
        Ok(buf.freeze())
    }

    /// Self-delimiting form of this codec, if it has one.
    fn as_stream(&self) -> Option<&dyn StreamCodec> {
        None
    }
}

/// A codec that can find message boundaries in a byte stream.
pub trait StreamCodec: Codec {
    /// Split one encoded message off the front of `buf`.
    ///
    /// Returns `Ok(None)` while `buf` holds only part of a message.
    fn size_read(&self, buf: &mut BytesMut, limit: usize) -> Result<Option<Bytes>, Status>;

    /// Append `msg` to `buf` in self-delimited form.
    fn size_write(&self, buf: &mut BytesMut, msg: &DynamicMessage) -> Result<(), Status>;
}

pub(crate) fn marshal_error(codec: &str, err: impl fmt::Display) -> Status {
    Status::internal(format!("{codec}: error while marshaling: {err}"))
}

pub(crate) fn unmarshal_error(codec: &str, err: impl fmt::Display) -> Status {
    Status::internal(format!("{codec}: error while unmarshaling: {err}"))
}

pub(crate) fn too_large(len: usize, limit: usize) -> Status {
    Status::resource_exhausted(format!(
        "grpc: received message larger than max ({len} vs. {limit})"
    ))
}

/// Codecs keyed by media type, codec name or message full name.
#[derive(Clone)]
pub struct CodecRegistry {
    entries: Vec<(String, Arc<dyn Codec>)>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register `codec` under `key`, replacing any previous entry.
    pub fn insert(&mut self, key: impl Into<String>, codec: Arc<dyn Codec>) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = codec,
            None => self.entries.push((key, codec)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Codec>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, codec)| Arc::clone(codec))
    }

    /// Registered media types, in registration order.
    pub fn media_types(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|(k, _)| k.as_str())
            .filter(|k| k.contains('/'))
            .collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let json: Arc<dyn Codec> = Arc::new(JsonCodec::default());
        let proto: Arc<dyn Codec> = Arc::new(ProtoCodec);
        let mut registry = Self::empty();
        registry.insert("application/json", Arc::clone(&json));
        registry.insert("application/protobuf", Arc::clone(&proto));
        registry.insert("application/x-protobuf", Arc::clone(&proto));
        registry.insert("application/octet-stream", Arc::clone(&proto));
        registry.insert("json", json);
        registry.insert("proto", proto);
        registry
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, c)| (k, c.name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = CodecRegistry::default();
        assert_eq!(registry.get("application/json").unwrap().name(), "json");
        assert_eq!(registry.get("application/x-protobuf").unwrap().name(), "proto");
        assert_eq!(registry.get("proto").unwrap().name(), "proto");
        assert!(registry.get("text/plain").is_none());
        assert_eq!(
            registry.media_types(),
            vec![
                "application/json",
                "application/protobuf",
                "application/x-protobuf",
                "application/octet-stream",
            ]
        );
    }

    #[test]
    fn test_insert_replaces() {
        let mut registry = CodecRegistry::default();
        registry.insert("application/json", Arc::new(ProtoCodec));
        assert_eq!(registry.get("application/json").unwrap().name(), "proto");
        assert_eq!(registry.media_types().len(), 4);
    }
}
