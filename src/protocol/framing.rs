//! Wire framing codec.
//!
//! Each frame is a 4-byte big-endian length `N` followed by `N` bytes of
//! UTF-8 JSON (one [`Envelope`]):
//!
//! ```text
//! [u32 BE length] [length bytes of JSON]
//! ```
//!
//! The decoder accumulates arbitrary byte chunks and emits complete
//! items. A frame that fails JSON decoding is consumed whole and surfaced
//! as [`Decoded::Malformed`] — the stream never desynchronizes. A length
//! prefix above the cap is unrecoverable: `feed` returns an error and the
//! connection must close with `FRAME_TOO_LARGE`.

use anyhow::{bail, Result};
use bytes::{Buf, BytesMut};

use super::envelope::Envelope;

/// One decoder output item.
#[derive(Debug)]
pub enum Decoded {
    /// A well-formed envelope.
    Envelope(Envelope),
    /// A complete frame whose bytes were not a valid envelope.
    ///
    /// The frame has already been consumed; subsequent frames decode
    /// normally. The connection should answer with `MALFORMED_FRAME`.
    Malformed(String),
}

/// Incremental frame decoder that handles partial reads.
///
/// One instance per connection (single consumer). Feed bytes via
/// [`FrameDecoder::feed`] and extract complete items.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame: u32,
}

impl FrameDecoder {
    /// Create a decoder enforcing the given frame-size cap.
    pub fn new(max_frame: u32) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
        }
    }

    /// Feed bytes into the decoder and extract all complete items.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error when a length prefix is zero or exceeds the cap;
    /// both are fatal for the connection.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Decoded>> {
        self.buf.extend_from_slice(bytes);
        let mut items = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

            if length == 0 {
                bail!("invalid frame: zero length");
            }
            if length > self.max_frame {
                bail!("frame too large: {length} bytes (max {})", self.max_frame);
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break; // incomplete frame, wait for more data
            }

            let payload = &self.buf[4..total];
            match serde_json::from_slice::<Envelope>(payload) {
                Ok(envelope) => items.push(Decoded::Envelope(envelope)),
                Err(e) => items.push(Decoded::Malformed(e.to_string())),
            }

            self.buf.advance(total);
        }

        Ok(items)
    }

    /// True when the decoder holds a partial frame.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Encode an envelope into a wire frame.
///
/// # Errors
///
/// Returns an error when the serialized envelope exceeds `max_frame`.
pub fn encode(envelope: &Envelope, max_frame: u32) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(envelope)?;
    if payload.len() > max_frame as usize {
        bail!(
            "envelope {} serializes to {} bytes (max {max_frame})",
            envelope.id,
            payload.len()
        );
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}
