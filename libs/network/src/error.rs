//! Bus Error Types
//!
//! One taxonomy for the whole core. The split that matters operationally:
//! `Protocol` tears the offending channel down, the binding/topology errors
//! are returned to the calling application, and undeliverable messages are
//! not errors at all - they are logged and dropped.

use codec::CodecError;
use thiserror::Error;

/// Main bus error type
#[derive(Error, Debug)]
pub enum BusError {
    /// A channel violated the wire protocol; it is torn down, not retried
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// A distance-0 topology row with this name already exists
    #[error("duplicate local entry: {name}")]
    DuplicateLocalEntry { name: String },

    /// The stagepoint already has a binding
    #[error("stagepoint already bound: {stage}")]
    StagepointAlreadyBound { stage: String },

    /// No binding exists at the stagepoint
    #[error("no binding at stagepoint: {stage}")]
    BindingNotFound { stage: String },

    /// The binding's consumer kind (typed vs binary) is fixed by the first
    /// subscription and cannot be mixed
    #[error("incompatible subscription kind at {stage}")]
    IncompatibleSubscriptionKind { stage: String },

    /// A (payload type, holder state) pair is already subscribed
    #[error("duplicate subscription for payload type {payload_type}")]
    DuplicateSubscription { payload_type: String },

    /// No decoder was registered for an inbound typed payload
    #[error("no decoder registered for payload type {payload_type}")]
    UnknownPayloadType { payload_type: String },

    /// Encoding/decoding failure from the codec layer
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A transactional write on a channel failed
    #[error("channel i/o error: {message}")]
    Io { message: String },
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|f| f.to_string()),
        }
    }

    pub fn io(err: &std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}
