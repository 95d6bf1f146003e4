//! Payload Transforms
//!
//! A channel's packet bodies pass through exactly one transform: identity
//! until the handshake negotiates otherwise, then optionally LZ4 or Snappy.
//! Each transform has its own header magic value, so a stream produced with
//! a different transform - or by something that is not a Stagewire peer at
//! all - fails the very first header check instead of producing garbage
//! records downstream.

use crate::error::{CodecError, Result};
use types::messages::Compression;

/// Header magic for untransformed bodies ("SWIR")
pub const MAGIC_IDENTITY: u32 = 0x5357_4952;
/// Header magic for LZ4-compressed bodies ("SWLZ")
pub const MAGIC_LZ4: u32 = 0x5357_4C5A;
/// Header magic for Snappy-compressed bodies ("SWSN")
pub const MAGIC_SNAPPY: u32 = 0x5357_534E;

/// The transform a channel applies to every packet body it writes and reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadTransform {
    algo: Option<Compression>,
}

impl PayloadTransform {
    /// The pre-handshake transform: bodies pass through unmodified.
    pub fn identity() -> Self {
        Self { algo: None }
    }

    /// The transform for a negotiated algorithm; `None` stays identity.
    pub fn new(algo: Option<Compression>) -> Self {
        Self { algo }
    }

    pub fn algorithm(&self) -> Option<Compression> {
        self.algo
    }

    /// The magic value this transform stamps into packet headers.
    pub fn magic(&self) -> u32 {
        match self.algo {
            None => MAGIC_IDENTITY,
            Some(Compression::Lz4) => MAGIC_LZ4,
            Some(Compression::Snappy) => MAGIC_SNAPPY,
        }
    }

    /// Transform an outgoing body.
    pub fn encode(&self, body: &[u8]) -> Result<Vec<u8>> {
        match self.algo {
            None => Ok(body.to_vec()),
            Some(Compression::Lz4) => Ok(lz4_flex::block::compress_prepend_size(body)),
            Some(Compression::Snappy) => {
                // Raw snappy blocks carry their own decompressed-length prefix.
                let mut encoder = snap::raw::Encoder::new();
                encoder
                    .compress_vec(body)
                    .map_err(|e| CodecError::compress("snappy", e.to_string()))
            }
        }
    }

    /// Reverse the transform on a fully buffered incoming body.
    pub fn decode(&self, body: &[u8]) -> Result<Vec<u8>> {
        match self.algo {
            None => Ok(body.to_vec()),
            Some(Compression::Lz4) => lz4_flex::block::decompress_size_prepended(body)
                .map_err(|e| CodecError::decompress("lz4", e.to_string())),
            Some(Compression::Snappy) => {
                let mut decoder = snap::raw::Decoder::new();
                decoder
                    .decompress_vec(body)
                    .map_err(|e| CodecError::decompress("snappy", e.to_string()))
            }
        }
    }
}
