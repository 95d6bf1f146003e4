//! Payload Type Descriptor Registry
//!
//! Maps payload type tags to decode functions so typed subscribers can
//! receive messages that arrived from the wire as bytes. Tags are strings
//! because they must survive serialization; `TypeId` values do not.
//!
//! This is the third, narrowest guarded resource of the core; its lock is
//! independent of the binding registry and topology store locks.

use crate::error::{BusError, Result};
use codec::CodecError;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type DecodeFn =
    Arc<dyn Fn(&[u8]) -> std::result::Result<Arc<dyn Any + Send + Sync>, CodecError> + Send + Sync>;

/// Registry of known payload type descriptors.
#[derive(Default)]
pub struct TypeRegistry {
    decoders: RwLock<HashMap<String, DecodeFn>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` as the Rust type behind a payload tag. Re-registering
    /// the same tag replaces the descriptor, which is harmless as long as
    /// the type stays the same.
    pub fn register<T>(&self, tag: impl Into<String>)
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let tag = tag.into();
        debug!(tag = %tag, "registering payload type descriptor");
        let decode: DecodeFn = Arc::new(|bytes| {
            codec::decode_payload::<T>(bytes).map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>)
        });
        self.decoders.write().insert(tag, decode);
    }

    /// Decode wire bytes tagged `tag` into the registered Rust type.
    pub fn decode(&self, tag: &str, bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>> {
        let decode = self
            .decoders
            .read()
            .get(tag)
            .cloned()
            .ok_or_else(|| BusError::UnknownPayloadType {
                payload_type: tag.to_string(),
            })?;
        decode(bytes).map_err(BusError::from)
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.decoders.read().contains_key(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Tick(u64);

    #[test]
    fn registered_type_decodes() {
        let registry = TypeRegistry::new();
        registry.register::<Tick>("demo.Tick");

        let bytes = codec::encode_payload(&Tick(7)).unwrap();
        let value = registry.decode("demo.Tick", &bytes).unwrap();
        assert_eq!(value.downcast_ref::<Tick>(), Some(&Tick(7)));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let registry = TypeRegistry::new();
        let err = registry.decode("nope", &[]).unwrap_err();
        assert!(matches!(err, BusError::UnknownPayloadType { .. }));
    }

    #[test]
    fn malformed_bytes_surface_codec_error() {
        let registry = TypeRegistry::new();
        registry.register::<Tick>("demo.Tick");
        assert!(matches!(
            registry.decode("demo.Tick", &[1]),
            Err(BusError::Codec(_))
        ));
    }
}
