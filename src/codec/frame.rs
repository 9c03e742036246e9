//! Request body framing.
//!
//! # Responsibilities
//! - gRPC length-prefixed frames: `flag(1) | length(4, BE) | payload`
//! - Incremental base64 for `grpc-web-text` bodies in both directions
//! - A buffered body reader that yields frames, codec-delimited messages
//!   or the whole body

use axum::body::Body;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http_body::Body as _;
use http_body_util::BodyExt;
use tonic::Status;

use super::{too_large, StreamCodec};

/// Length of the gRPC frame header.
pub const HEADER_SIZE: usize = 5;

/// Frame flag: payload is compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Frame flag: payload is a gRPC-Web trailer block.
pub const FLAG_TRAILER: u8 = 0x80;

/// One length-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flag: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn is_compressed(&self) -> bool {
        self.flag & FLAG_COMPRESSED != 0
    }

    pub fn is_trailer(&self) -> bool {
        self.flag & FLAG_TRAILER != 0
    }
}

/// Append a frame header and `payload` to `out`.
pub fn encode_frame(flag: u8, payload: &[u8], out: &mut BytesMut) {
    out.reserve(HEADER_SIZE + payload.len());
    out.put_u8(flag);
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(payload);
}

/// Split one frame off the front of `buf`, or `None` if it is incomplete.
pub fn decode_frame(buf: &mut BytesMut, limit: usize) -> Result<Option<Frame>, Status> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let flag = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len > limit {
        return Err(too_large(len, limit));
    }
    if buf.len() < HEADER_SIZE + len {
        return Ok(None);
    }
    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(len).freeze();
    Ok(Some(Frame { flag, payload }))
}

/// Streaming base64 decoder.
///
/// Clients may send each frame separately padded, so decoding restarts
/// after every padded quantum.
#[derive(Debug, Default)]
pub struct Base64Decoder {
    pending: Vec<u8>,
}

impl Base64Decoder {
    pub fn decode(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<(), Status> {
        self.pending
            .extend(chunk.iter().filter(|b| !b.is_ascii_whitespace()));
        let complete = self.pending.len() - self.pending.len() % 4;

        let mut start = 0;
        for quantum in (0..complete).step_by(4) {
            let end = quantum + 4;
            if self.pending[end - 1] == b'=' || end == complete {
                let decoded = STANDARD
                    .decode(&self.pending[start..end])
                    .map_err(|err| Status::invalid_argument(format!("invalid base64 body: {err}")))?;
                out.extend_from_slice(&decoded);
                start = end;
            }
        }
        self.pending.drain(..complete);
        Ok(())
    }

    pub fn finish(&self) -> Result<(), Status> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(Status::invalid_argument("truncated base64 body"))
        }
    }
}

/// Streaming base64 encoder producing one continuous padded stream.
#[derive(Debug, Default)]
pub struct Base64Encoder {
    pending: Vec<u8>,
}

impl Base64Encoder {
    /// Encode as much of `data` as fits in whole 3-byte groups.
    pub fn encode(&mut self, data: &[u8]) -> Bytes {
        self.pending.extend_from_slice(data);
        let whole = self.pending.len() - self.pending.len() % 3;
        let encoded = STANDARD.encode(&self.pending[..whole]);
        self.pending.drain(..whole);
        Bytes::from(encoded)
    }

    /// Flush the remainder with padding.
    pub fn finish(&mut self) -> Bytes {
        let encoded = STANDARD.encode(&self.pending);
        self.pending.clear();
        Bytes::from(encoded)
    }
}

/// Buffered reader over an inbound HTTP body.
#[derive(Debug)]
pub struct BodyReader {
    body: Body,
    buf: BytesMut,
    eof: bool,
    text: Option<Base64Decoder>,
}

impl BodyReader {
    pub fn new(body: Body) -> Self {
        Self {
            body,
            buf: BytesMut::new(),
            eof: false,
            text: None,
        }
    }

    /// Decode the body as base64 before framing.
    pub fn base64(mut self) -> Self {
        self.text = Some(Base64Decoder::default());
        self
    }

    /// Whether no more bytes can be read.
    pub fn is_end_stream(&self) -> bool {
        self.buf.is_empty() && (self.eof || self.body.is_end_stream())
    }

    /// Read the next data chunk into the buffer. Returns `false` at EOF.
    async fn fill(&mut self) -> Result<bool, Status> {
        while !self.eof {
            match self.body.frame().await {
                None => {
                    self.eof = true;
                    if let Some(text) = &self.text {
                        text.finish()?;
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "Request body read failed");
                    return Err(Status::cancelled("context canceled"));
                }
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    match &mut self.text {
                        Some(text) => text.decode(&data, &mut self.buf)?,
                        None => self.buf.extend_from_slice(&data),
                    }
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Next gRPC frame, or `None` at a clean end of body.
    pub async fn next_frame(&mut self, limit: usize) -> Result<Option<Frame>, Status> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, limit)? {
                return Ok(Some(frame));
            }
            if !self.fill().await? {
                return self.end();
            }
        }
    }

    /// Next message delimited by `codec`, or `None` at a clean end of body.
    pub async fn next_message(
        &mut self,
        codec: &dyn StreamCodec,
        limit: usize,
    ) -> Result<Option<Bytes>, Status> {
        loop {
            if let Some(msg) = codec.size_read(&mut self.buf, limit)? {
                return Ok(Some(msg));
            }
            if !self.fill().await? {
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    self.buf.clear();
                }
                return self.end();
            }
        }
    }

    /// Whatever bytes are available next, or `None` at the end of body.
    pub async fn next_chunk(&mut self, limit: usize) -> Result<Option<Bytes>, Status> {
        while self.buf.is_empty() {
            if !self.fill().await? {
                return Ok(None);
            }
        }
        let len = self.buf.len().min(limit.max(1));
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// The rest of the body, failing if it grows past `limit`.
    pub async fn read_to_end(&mut self, limit: usize) -> Result<Bytes, Status> {
        while self.fill().await? {
            if self.buf.len() > limit {
                return Err(too_large(self.buf.len(), limit));
            }
        }
        Ok(self.buf.split().freeze())
    }

    fn end<T>(&self) -> Result<Option<T>, Status> {
        if self.buf.is_empty() {
            Ok(None)
        } else {
            Err(Status::internal("unexpected EOF in message stream"))
        }
    }
}
