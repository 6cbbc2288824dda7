//! Stream Framing
//!
//! Every frame on the wire is `HEADER | LENGTH | BODY`:
//! - `HEADER`: a fixed ASCII magic string (default `henrylee2cn`).
//! - `LENGTH`: 4-byte little-endian signed body length.
//! - `BODY`: the JSON-encoded `Message`.
//!
//! Decoding scans byte by byte for the header, so leading garbage is skipped
//! and a stream that lost sync recovers at the next header. Partial frames are
//! left in the carry-over buffer until more bytes arrive.

use crate::error::{Result, TransportError};

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const DEFAULT_PACK_HEADER: &str = "henrylee2cn";
pub const LENGTH_FIELD_LEN: usize = 4;

#[derive(Debug, Clone)]
pub struct Framer {
    header: Vec<u8>,
    max_frame_len: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_PACK_HEADER)
    }
}

impl Framer {
    pub fn new(header: &str) -> Self {
        let header = if header.is_empty() {
            tracing::warn!("Empty pack header, falling back to {}", DEFAULT_PACK_HEADER);
            DEFAULT_PACK_HEADER
        } else {
            header
        };

        Self {
            header: header.as_bytes().to_vec(),
            max_frame_len: i32::MAX as usize,
        }
    }

    /// Length fields above `max` are treated as a header mismatch rather than
    /// as a frame to wait for. `pack` refuses bodies above it.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max.min(i32::MAX as usize);
        self
    }

    pub fn pack(&self, payload: &[u8]) -> Result<BytesMut> {
        let len = i32::try_from(payload.len())
            .ok()
            .filter(|&len| len as usize <= self.max_frame_len)
            .ok_or(TransportError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            })?;

        let mut buf = BytesMut::with_capacity(self.header.len() + LENGTH_FIELD_LEN + payload.len());
        buf.put_slice(&self.header);
        buf.put_i32_le(len);
        buf.put_slice(payload);
        Ok(buf)
    }

    /// Extracts every complete frame from `buffer`.
    ///
    /// On return `buffer` holds only the unconsumed suffix: an incomplete
    /// frame, or fewer bytes than a header plus length field.
    pub fn unpack(&self, buffer: &mut BytesMut) -> Vec<Bytes> {
        let header_len = self.header.len();
        let prefix_len = header_len + LENGTH_FIELD_LEN;
        let mut frames = Vec::new();
        let mut i = 0;

        while buffer.len() >= i + prefix_len {
            if buffer[i..i + header_len] != self.header[..] {
                i += 1;
                continue;
            }

            let mut len_bytes = [0u8; LENGTH_FIELD_LEN];
            len_bytes.copy_from_slice(&buffer[i + header_len..i + prefix_len]);
            let Some(body_len) = self.checked_len(i32::from_le_bytes(len_bytes)) else {
                tracing::trace!("Implausible frame length at offset {}, resyncing", i);
                i += 1;
                continue;
            };

            if buffer.len() < i + prefix_len + body_len {
                break;
            }

            // Drop whatever garbage preceded the header, then cut the frame off.
            buffer.advance(i);
            let mut frame = buffer.split_to(prefix_len + body_len);
            frames.push(frame.split_off(prefix_len).freeze());
            i = 0;
        }

        buffer.advance(i);
        frames
    }

    /// Slice form of [`Framer::unpack`]: returns the frames and the carry-over.
    pub fn unpack_slice(&self, bytes: &[u8]) -> (Vec<Bytes>, BytesMut) {
        let mut buffer = BytesMut::from(bytes);
        let frames = self.unpack(&mut buffer);
        (frames, buffer)
    }

    fn checked_len(&self, raw: i32) -> Option<usize> {
        if raw < 0 {
            return None;
        }
        let len = raw as usize;
        (len <= self.max_frame_len).then_some(len)
    }
}
