//! Codec Error Types

use thiserror::Error;

/// Errors produced while encoding or decoding packets and records.
///
/// An incomplete frame is deliberately *not* represented here: waiting for
/// more bytes is a normal outcome and `frame::FrameHeader::parse` models it
/// as `None`.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A record failed to serialize
    #[error("record encode failed: {message}")]
    RecordEncode { message: String },

    /// A packet body did not decode into a known record shape
    #[error("record decode failed: {message}")]
    RecordDecode { message: String },

    /// An outgoing body failed to compress
    #[error("{codec} compression failed: {message}")]
    Compress {
        codec: &'static str,
        message: String,
    },

    /// A compressed body failed to inflate
    #[error("{codec} decompression failed: {message}")]
    Decompress {
        codec: &'static str,
        message: String,
    },
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

impl CodecError {
    pub fn record_encode(message: impl Into<String>) -> Self {
        Self::RecordEncode {
            message: message.into(),
        }
    }

    pub fn record_decode(message: impl Into<String>) -> Self {
        Self::RecordDecode {
            message: message.into(),
        }
    }

    pub fn compress(codec: &'static str, message: impl Into<String>) -> Self {
        Self::Compress {
            codec,
            message: message.into(),
        }
    }

    pub fn decompress(codec: &'static str, message: impl Into<String>) -> Self {
        Self::Decompress {
            codec,
            message: message.into(),
        }
    }
}
