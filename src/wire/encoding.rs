use prost::{bytes::BufMut, Message as _};

use super::proto;
use crate::messages::{ConversionError, Envelope};

/// Largest protobuf body a frame can carry.
pub const MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Encode `env` as a frame: a big-endian `u16` body length followed by the
/// protobuf body.
///
/// This is not `encode_length_delimited`, which would write the length as a
/// LEB128 varint.
pub fn encode_frame(env: &Envelope) -> Result<Vec<u8>, ConversionError> {
    let msg = proto::Envelope::from(env);
    let len = msg.encoded_len();
    if len > MAX_FRAME_BODY {
        return Err(ConversionError::Frame(format!(
            "body of {} bytes does not fit a frame",
            len
        )));
    }

    let mut buf = Vec::with_capacity(2 + len);
    buf.put_slice(&(len as u16).to_be_bytes());
    msg.encode(&mut buf)
        .map_err(|e| ConversionError::Frame(e.to_string()))?;
    Ok(buf)
}

/// Decode one frame. The input must contain exactly one frame.
pub fn decode_frame(frame: &[u8]) -> Result<Envelope, ConversionError> {
    if frame.len() < 2 {
        return Err(ConversionError::Frame("missing length prefix".into()));
    }
    let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let body = &frame[2..];
    if body.len() != len {
        return Err(ConversionError::Frame(format!(
            "length prefix says {} bytes, got {}",
            len,
            body.len()
        )));
    }
    let msg = proto::Envelope::decode(body).map_err(|e| ConversionError::Frame(e.to_string()))?;
    msg.try_into()
}
