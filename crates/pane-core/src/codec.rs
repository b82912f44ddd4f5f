//! CBOR encoding for pane protocol frames.
//!
//! Message-framed transports (WebSocket) carry one bare CBOR value per
//! message. Byte-stream transports (Unix socket) use length-prefixed frames:
//! `[4-byte big-endian length][CBOR payload]`.

use crate::error::{PaneError, PaneResult};
use std::io::Cursor;

/// Largest accepted frame payload (1 MiB plus headroom for the envelope).
pub const MAX_FRAME_LEN: usize = 1_048_576 + 4096;

/// Encode a value as a bare CBOR payload.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> PaneResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> PaneResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Encode a value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> PaneResult<Vec<u8>> {
    let payload = cbor_encode(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(PaneError::InvalidMessage(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete decoded messages.
    ///
    /// A declared frame length above [`MAX_FRAME_LEN`] is an error; the
    /// stream cannot be resynchronised after that and should be dropped.
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> PaneResult<Vec<T>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        while let Some(len) = self.next_len()? {
            if self.buffer.len() < 4 + len {
                break;
            }
            let msg: T = cbor_decode(&self.buffer[4..4 + len])?;
            messages.push(msg);
            self.buffer.drain(..4 + len);
        }

        Ok(messages)
    }

    fn next_len(&self) -> PaneResult<Option<usize>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                as usize;
        if len > MAX_FRAME_LEN {
            return Err(PaneError::InvalidMessage(format!(
                "frame too large: {len} bytes"
            )));
        }
        Ok(Some(len))
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
