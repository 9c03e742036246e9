//! Message compression.
//!
//! A compressor's name is used both as the `grpc-encoding` value and the
//! HTTP `Content-Encoding` value. `identity` is never registered; it means
//! no compressor.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tonic::Status;

use super::too_large;

/// Name meaning "no compression".
pub const IDENTITY: &str = "identity";

pub trait Compressor: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Compress `data` onto the end of `out`.
    fn compress(&self, data: &[u8], out: &mut BytesMut) -> Result<(), Status>;

    /// Decompress `data`, failing once the output exceeds `limit` bytes.
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Bytes, Status>;
}

/// Free-list of scratch buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    pub fn get(&self) -> Vec<u8> {
        self.buffers.lock().pop().unwrap_or_default()
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    pub fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// gzip with pooled scratch buffers.
#[derive(Debug)]
pub struct Gzip {
    level: Compression,
    pool: BufferPool,
}

impl Gzip {
    pub fn new(level: Compression) -> Self {
        Self {
            level,
            pool: BufferPool::new(32),
        }
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self::new(Compression::default())
    }
}

impl Compressor for Gzip {
    fn name(&self) -> &str {
        "gzip"
    }

    fn compress(&self, data: &[u8], out: &mut BytesMut) -> Result<(), Status> {
        let mut encoder = GzEncoder::new(self.pool.get(), self.level);
        let result = encoder.write_all(data).and_then(|_| encoder.finish());
        match result {
            Ok(buf) => {
                out.extend_from_slice(&buf);
                self.pool.put(buf);
                Ok(())
            }
            Err(err) => Err(Status::internal(format!("gzip: compress: {err}"))),
        }
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Bytes, Status> {
        let mut buf = self.pool.get();
        let read = MultiGzDecoder::new(data)
            .take(limit as u64 + 1)
            .read_to_end(&mut buf);
        let result = match read {
            Ok(n) if n > limit => Err(too_large(n, limit)),
            Ok(_) => Ok(Bytes::copy_from_slice(&buf)),
            Err(err) => Err(Status::internal(format!("gzip: decompress: {err}"))),
        };
        self.pool.put(buf);
        result
    }
}

/// Compressors keyed by encoding name.
#[derive(Clone)]
pub struct CompressorRegistry {
    entries: Vec<Arc<dyn Compressor>>,
}

impl CompressorRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register `compressor` under its own name, replacing any previous one.
    pub fn insert(&mut self, compressor: Arc<dyn Compressor>) {
        self.entries.retain(|c| c.name() != compressor.name());
        self.entries.push(compressor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Compressor>> {
        self.entries
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|c| c.name()).collect()
    }

    /// Value for the `grpc-accept-encoding` header.
    pub fn accept_encoding(&self) -> String {
        let mut names = self.names();
        names.push(IDENTITY);
        names.join(",")
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.insert(Arc::new(Gzip::default()));
        registry
    }
}

impl fmt::Debug for CompressorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_round_trip_reuses_buffers() {
        let gzip = Gzip::default();
        let data = b"hello hello hello hello".repeat(8);
        let mut out = BytesMut::new();
        gzip.compress(&data, &mut out).unwrap();
        assert!(out.len() < data.len());
        assert_eq!(&gzip.decompress(&out, 1024).unwrap()[..], &data[..]);
        assert_eq!(gzip.pool.pooled(), 1);
    }

    #[test]
    fn test_gzip_concatenated_members() {
        let gzip = Gzip::default();
        let mut out = BytesMut::new();
        gzip.compress(b"first,", &mut out).unwrap();
        gzip.compress(b"second", &mut out).unwrap();
        assert_eq!(&gzip.decompress(&out, 1024).unwrap()[..], b"first,second");
    }

    #[test]
    fn test_gzip_limit() {
        let gzip = Gzip::default();
        let mut out = BytesMut::new();
        gzip.compress(&[0u8; 4096], &mut out).unwrap();
        let err = gzip.decompress(&out, 1024).unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
    }

    #[test]
    fn test_registry() {
        let registry = CompressorRegistry::default();
        assert!(registry.get("gzip").is_some());
        assert!(registry.get("GZIP").is_some());
        assert!(registry.get("br").is_none());
        assert_eq!(registry.accept_encoding(), "gzip,identity");
    }
}
