//! Packet Framing
//!
//! Every packet on a channel is a fixed 8-byte header followed by a body:
//! a `u32` magic value and the `u32` body length, both little-endian. The
//! magic value is supplied by the active payload transform, so the expected
//! value depends on what the handshake negotiated; validating it is the
//! channel state machine's job.
//!
//! Parsing never consumes input. A caller peeks the buffered bytes, parses
//! the header, and only consumes once the whole packet is available. That
//! keeps a short read transactional: the header is simply re-parsed once
//! more bytes arrive.

use byteorder::{ByteOrder, LittleEndian};

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 8;

/// Packet header: magic value plus body length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub body_len: u32,
}

impl FrameHeader {
    pub fn new(magic: u32, body_len: u32) -> Self {
        Self { magic, body_len }
    }

    /// Parse a header from buffered bytes.
    ///
    /// Returns `None` when fewer than [`HEADER_SIZE`] bytes are available;
    /// that is not an error, just a signal to wait for more input.
    pub fn parse(buf: &[u8]) -> Option<FrameHeader> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(FrameHeader {
            magic: LittleEndian::read_u32(&buf[0..4]),
            body_len: LittleEndian::read_u32(&buf[4..8]),
        })
    }

    /// Encode the header into its wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut out[0..4], self.magic);
        LittleEndian::write_u32(&mut out[4..8], self.body_len);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader::new(0xDEAD_BEEF, 4096);
        let bytes = header.encode();
        assert_eq!(FrameHeader::parse(&bytes), Some(header));
    }

    #[test]
    fn short_input_is_not_an_error() {
        let header = FrameHeader::new(1, 2);
        let bytes = header.encode();
        for n in 0..HEADER_SIZE {
            assert_eq!(FrameHeader::parse(&bytes[..n]), None);
        }
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let header = FrameHeader::new(7, 9);
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(b"body bytes");
        assert_eq!(FrameHeader::parse(&bytes), Some(header));
    }
}
