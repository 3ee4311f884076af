//! Stream framing for the Meshtastic client API
//!
//! Every protobuf on the stream is preceded by a 4-byte header:
//!
//! - Bytes 0-1: Magic (0x94C3)
//! - Bytes 2-3: Payload length (big-endian u16)
//!
//! The radio also writes plain-text debug output to the same stream when
//! its debug console is on, so the decoder resynchronises on the magic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::config::MESHTASTIC_MAGIC;
use crate::error::{BridgeError, Result};

/// Largest payload the radio will send or accept
pub const MAX_FRAME_PAYLOAD: usize = 512;

const HEADER_LEN: usize = 4;
const MAGIC_HI: u8 = (MESHTASTIC_MAGIC >> 8) as u8;
const MAGIC_LO: u8 = (MESHTASTIC_MAGIC & 0xFF) as u8;

/// Frame a payload with the stream header
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(BridgeError::InvalidPacket(format!(
            "payload of {} bytes exceeds frame limit {}",
            payload.len(),
            MAX_FRAME_PAYLOAD
        )));
    }
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u16(MESHTASTIC_MAGIC);
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Incremental decoder for framed payloads
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_PAYLOAD * 2),
        }
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes waiting for a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete payload from the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed. A corrupt length is
    /// reported once as an error; the decoder skips past it so the next
    /// call continues with the following magic.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if !self.sync_to_magic() {
            return Ok(None);
        }
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if length > MAX_FRAME_PAYLOAD {
            self.buffer.advance(2);
            return Err(BridgeError::InvalidPacket(format!(
                "frame length {} exceeds maximum",
                length
            )));
        }

        let total = HEADER_LEN + length;
        if self.buffer.len() < total {
            trace!(have = self.buffer.len(), need = total, "Waiting for complete frame");
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total);
        frame.advance(HEADER_LEN);
        Ok(Some(frame.freeze()))
    }

    /// Drop bytes before the first magic; false if none is buffered yet
    fn sync_to_magic(&mut self) -> bool {
        if self.buffer.len() >= 2 && self.buffer[0] == MAGIC_HI && self.buffer[1] == MAGIC_LO {
            return true;
        }
        match self
            .buffer
            .windows(2)
            .position(|w| w[0] == MAGIC_HI && w[1] == MAGIC_LO)
        {
            Some(pos) => {
                trace!(discarded = pos, "Skipping bytes before magic");
                self.buffer.advance(pos);
                true
            }
            None => {
                // Keep a trailing first magic byte, it may be completed by the next read
                let keep = usize::from(self.buffer.last() == Some(&MAGIC_HI));
                let discard = self.buffer.len() - keep;
                if discard > 0 {
                    if discard > 1 {
                        warn!(discarded = discard, "Discarding stream bytes without magic");
                    }
                    self.buffer.advance(discard);
                }
                false
            }
        }
    }
}
