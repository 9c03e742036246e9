//! Protobuf JSON codec.
//!
//! Stream framing has no prefix: a message ends where its outermost
//! object closes. The scanner tracks brace depth and string escapes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost_reflect::{DeserializeOptions, DynamicMessage, ReflectMessage, SerializeOptions};
use tonic::Status;

use super::{marshal_error, too_large, unmarshal_error, Codec, StreamCodec};

const NAME: &str = "json";

#[derive(Debug, Clone)]
pub struct JsonCodec {
    serialize: SerializeOptions,
    deserialize: DeserializeOptions,
}

impl JsonCodec {
    pub fn new(serialize: SerializeOptions, deserialize: DeserializeOptions) -> Self {
        Self {
            serialize,
            deserialize,
        }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(SerializeOptions::new(), DeserializeOptions::new())
    }
}

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        NAME
    }

    fn marshal_append(&self, buf: &mut BytesMut, msg: &DynamicMessage) -> Result<(), Status> {
        let mut serializer = serde_json::Serializer::new(buf.writer());
        msg.serialize_with_options(&mut serializer, &self.serialize)
            .map_err(|err| marshal_error(NAME, err))
    }

    fn unmarshal(&self, data: &[u8], msg: &mut DynamicMessage) -> Result<(), Status> {
        let mut deserializer = serde_json::Deserializer::from_slice(data);
        let decoded =
            DynamicMessage::deserialize_with_options(msg.descriptor(), &mut deserializer, &self.deserialize)
                .map_err(|err| unmarshal_error(NAME, err))?;
        deserializer.end().map_err(|err| unmarshal_error(NAME, err))?;
        *msg = decoded;
        Ok(())
    }

    fn as_stream(&self) -> Option<&dyn StreamCodec> {
        Some(self)
    }
}

impl StreamCodec for JsonCodec {
    fn size_read(&self, buf: &mut BytesMut, limit: usize) -> Result<Option<Bytes>, Status> {
        let start = buf
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(buf.len());
        buf.advance(start);
        match scan_value(buf, limit)? {
            Some(end) => Ok(Some(buf.split_to(end).freeze())),
            None => Ok(None),
        }
    }

    fn size_write(&self, buf: &mut BytesMut, msg: &DynamicMessage) -> Result<(), Status> {
        self.marshal_append(buf, msg)
    }
}

/// Length of the first complete JSON object or array in `buf`.
fn scan_value(buf: &[u8], limit: usize) -> Result<Option<usize>, Status> {
    match buf.first() {
        None => return Ok(None),
        Some(b'{') | Some(b'[') => {}
        Some(c) => {
            return Err(unmarshal_error(
                NAME,
                format!("invalid character {:?} looking for beginning of value", *c as char),
            ))
        }
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in buf.iter().enumerate() {
        if i >= limit {
            return Err(too_large(i + 1, limit));
        }
        if in_string {
            match c {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some(i + 1));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}
