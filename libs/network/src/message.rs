//! In-Flight Message Representation
//!
//! A locally originated message stays unserialized for as long as it stays
//! on this node: the payload is an `Arc<dyn Any>` plus an encode closure
//! captured at `send()` time, and serialization happens exactly once, at
//! the moment the message is handed to a remote channel. Messages that
//! arrived from a channel are already bytes and stay that way.

use codec::Result as CodecResult;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use types::{EndpointName, SendMsg, Stagepoint};

/// Closure that serializes a typed payload on demand.
pub type EncodeFn = Arc<dyn Fn() -> CodecResult<Vec<u8>> + Send + Sync>;

/// An application payload in one of its two representations.
#[derive(Clone)]
pub enum Payload {
    /// Locally produced, not yet serialized.
    Typed {
        tag: String,
        value: Arc<dyn Any + Send + Sync>,
        encode: EncodeFn,
    },
    /// Serialized bytes, as carried inside a `SendMsg`.
    Binary { tag: String, bytes: Vec<u8> },
}

impl Payload {
    /// Build a typed payload, capturing its encoder for the one
    /// serialization that may happen later.
    pub fn typed<T>(tag: impl Into<String>, value: T) -> Self
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        let value = Arc::new(value);
        let for_encode = value.clone();
        Payload::Typed {
            tag: tag.into(),
            value,
            encode: Arc::new(move || codec::encode_payload(&*for_encode)),
        }
    }

    pub fn binary(tag: impl Into<String>, bytes: Vec<u8>) -> Self {
        Payload::Binary {
            tag: tag.into(),
            bytes,
        }
    }

    /// The payload type tag, present in both representations.
    pub fn tag(&self) -> &str {
        match self {
            Payload::Typed { tag, .. } => tag,
            Payload::Binary { tag, .. } => tag,
        }
    }

    /// Serialized form of the payload; encodes typed payloads on demand.
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        match self {
            Payload::Typed { encode, .. } => encode(),
            Payload::Binary { bytes, .. } => Ok(bytes.clone()),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Typed { tag, .. } => f.debug_struct("Typed").field("tag", tag).finish(),
            Payload::Binary { tag, bytes } => f
                .debug_struct("Binary")
                .field("tag", tag)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

/// A message moving through the forwarding loop.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub from: EndpointName,
    pub to: EndpointName,
    pub current: Stagepoint,
    pub payload: Payload,
}

impl BusMessage {
    /// Rehydrate a message that arrived from a channel.
    pub fn from_wire(msg: SendMsg) -> Self {
        Self {
            from: msg.from,
            to: msg.to,
            current: Stagepoint::new(msg.stage, msg.endpoint),
            payload: Payload::binary(msg.payload_type, msg.payload),
        }
    }

    /// Flatten this message for transmission; the single point where a
    /// typed payload is serialized.
    pub fn to_wire(&self) -> CodecResult<SendMsg> {
        Ok(SendMsg {
            from: self.from.clone(),
            to: self.to.clone(),
            stage: self.current.stage().to_string(),
            endpoint: self.current.endpoint().clone(),
            payload_type: self.payload.tag().to_string(),
            payload: self.payload.to_bytes()?,
        })
    }
}
