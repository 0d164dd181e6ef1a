// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Length-prefix framing for the TCP byte stream.
//!
//! TCP needs framing because it is a stream protocol. Every message is
//! prefixed with a 4-byte big-endian payload length:
//!
//! ```text
//! +----------------+------------------+
//! | length (4B BE) | payload          |
//! +----------------+------------------+
//! ```

use std::io;

/// Length prefix size.
pub const FRAME_HEADER_LEN: usize = 4;

/// Incremental frame decoder with an internal reassembly buffer.
pub struct FrameCodec {
    buf: Vec<u8>,
    max_frame: usize,
}

impl FrameCodec {
    /// Create a codec enforcing the given maximum payload size.
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    /// Frame a payload into `out`.
    pub fn encode_into(payload: &[u8], out: &mut Vec<u8>) {
        out.reserve(FRAME_HEADER_LEN + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
    }

    /// Frame a payload into a fresh buffer.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        Self::encode_into(payload, &mut out);
        out
    }

    /// Append raw stream bytes to the reassembly buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop one complete frame from the reassembly buffer.
    ///
    /// `Ok(None)` means more bytes are needed. An oversized length prefix
    /// is a protocol violation and poisons the connection.
    pub fn decode_buffered(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit {}", len, self.max_frame),
            ));
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.buf.drain(..FRAME_HEADER_LEN + len);
        Ok(Some(payload))
    }

    /// Bytes currently buffered (partial frame).
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
