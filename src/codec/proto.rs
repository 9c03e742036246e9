//! Binary protobuf codec.
//!
//! Stream framing is a 4-byte big-endian length followed by the message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use prost_reflect::DynamicMessage;
use tonic::Status;

use super::{marshal_error, too_large, unmarshal_error, Codec, StreamCodec};

const NAME: &str = "proto";

#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoCodec;

impl Codec for ProtoCodec {
    fn name(&self) -> &str {
        NAME
    }

    fn marshal_append(&self, buf: &mut BytesMut, msg: &DynamicMessage) -> Result<(), Status> {
        buf.reserve(msg.encoded_len());
        msg.encode(buf).map_err(|err| marshal_error(NAME, err))
    }

    fn unmarshal(&self, data: &[u8], msg: &mut DynamicMessage) -> Result<(), Status> {
        msg.clear();
        msg.merge(data).map_err(|err| unmarshal_error(NAME, err))
    }

    fn as_stream(&self) -> Option<&dyn StreamCodec> {
        Some(self)
    }
}

impl StreamCodec for ProtoCodec {
    fn size_read(&self, buf: &mut BytesMut, limit: usize) -> Result<Option<Bytes>, Status> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > limit {
            return Err(too_large(len, limit));
        }
        if buf.len() < 4 + len {
            return Ok(None);
        }
        buf.advance(4);
        Ok(Some(buf.split_to(len).freeze()))
    }

    fn size_write(&self, buf: &mut BytesMut, msg: &DynamicMessage) -> Result<(), Status> {
        let len = msg.encoded_len();
        let len = u32::try_from(len).map_err(|_| marshal_error(NAME, "message too large"))?;
        buf.put_u32(len);
        self.marshal_append(buf, msg)
    }
}
