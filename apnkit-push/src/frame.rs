//! Binary frame encoding for the legacy gateway.
//!
//! Layout of one notification frame:
//!
//! ```text
//! +---------+------------------+----------------+--------------------+---------+
//! | command | token length     | token          | payload length     | payload |
//! | 1 byte  | 2 bytes BE (=32) | 32 bytes       | 2 bytes BE (<=256) | N bytes |
//! +---------+------------------+----------------+--------------------+---------+
//! ```
//!
//! The command is always `0`. Both length fields have a zero high byte
//! for every legal frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::token::TOKEN_LEN;
use crate::{DeviceToken, PushError, Result};

/// Command code of the simple notification format.
pub const COMMAND_SIMPLE: u8 = 0;

/// Maximum encoded payload size accepted by the gateway.
pub const MAX_PAYLOAD_BYTES: usize = 256;

/// Bytes preceding the payload.
pub const HEADER_LEN: usize = 1 + 2 + TOKEN_LEN + 2;

/// Encode a device token and JSON payload into a wire frame.
///
/// The size limit applies to the UTF-8 byte count of the payload.
pub fn encode_frame(token: &DeviceToken, payload: &str) -> Result<Bytes> {
    let size = payload.len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(PushError::PayloadTooLarge {
            size,
            limit: MAX_PAYLOAD_BYTES,
        });
    }

    let token = token.to_wire()?;

    let mut frame = BytesMut::with_capacity(HEADER_LEN + size);
    frame.put_u8(COMMAND_SIMPLE);
    frame.put_u16(TOKEN_LEN as u16);
    frame.put_slice(&token);
    frame.put_u16(size as u16);
    frame.put_slice(payload.as_bytes());

    Ok(frame.freeze())
}

/// A decoded notification frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command code.
    pub command: u8,
    /// Raw device token.
    pub token: Vec<u8>,
    /// JSON payload.
    pub payload: String,
}

impl Frame {
    /// Decode one frame from the front of `buf`, advancing past it.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame.
    pub fn decode(buf: &mut Bytes) -> Result<Option<Self>> {
        if buf.len() < 3 {
            return Ok(None);
        }
        let token_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if buf.len() < 3 + token_len + 2 {
            return Ok(None);
        }
        let payload_len =
            u16::from_be_bytes([buf[3 + token_len], buf[3 + token_len + 1]]) as usize;
        if buf.len() < 3 + token_len + 2 + payload_len {
            return Ok(None);
        }

        let command = buf.get_u8();
        buf.advance(2);
        let token = buf.split_to(token_len).to_vec();
        buf.advance(2);
        let payload = String::from_utf8(buf.split_to(payload_len).to_vec())
            .map_err(|e| PushError::Serialization(format!("frame payload is not UTF-8: {}", e)))?;

        Ok(Some(Self {
            command,
            token,
            payload,
        }))
    }

    /// Decode every complete frame in `data`.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut buf = Bytes::copy_from_slice(data);
        let mut frames = Vec::new();
        while let Some(frame) = Self::decode(&mut buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Device token in canonical form.
    pub fn device_token(&self) -> DeviceToken {
        DeviceToken::from_bytes(&self.token)
    }
}
