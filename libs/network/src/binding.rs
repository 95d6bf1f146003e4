//! Binding Registry
//!
//! Local consumers, keyed by stagepoint. At most one binding per
//! stagepoint, and a binding's consumer kind is fixed by its first
//! subscription: either a set of typed handlers keyed by payload type, or
//! one binary handler that takes every payload as raw bytes.
//!
//! Lock order: the registry lock is always taken before the topology lock.
//! The forwarding loop holds a recursive read guard for its whole run, so
//! a handler may publish again on the same thread without deadlocking;
//! mutating calls (bind/subscribe) must not be made from inside a handler.

use crate::dispatch::Dispatcher;
use crate::error::{BusError, Result};
use crate::message::{BusMessage, Payload};
use crate::types_registry::TypeRegistry;
use parking_lot::{RwLock, RwLockReadGuard};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use types::Stagepoint;

/// Handler for one payload type; receives the decoded value.
pub type TypedHandler = Arc<dyn Fn(Arc<dyn Any + Send + Sync>) + Send + Sync>;

/// Handler that takes any payload as (type tag, serialized bytes).
pub type BinaryHandler = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// Typed subscriptions are keyed by payload type plus an opaque holder
/// discriminator, so several holders can each take the same payload type
/// while an accidental double-registration of one holder still fails.
type TypedKey = (String, u64);

enum Consumer {
    /// Bound, never subscribed. Does not consume messages; the kind is
    /// still open.
    Vacant,
    /// The first subscription fixes the kind for the binding's lifetime.
    /// An emptied map stays `Typed`; only unbinding clears the kind.
    Typed(HashMap<TypedKey, TypedHandler>),
    Binary(Option<BinaryHandler>),
}

/// The consumer table itself. Callers go through [`BindingRegistry`]; the
/// forwarding loop borrows the table through a held read guard.
#[derive(Default)]
pub struct BindingTable {
    consumers: HashMap<Stagepoint, Consumer>,
}

impl BindingTable {
    /// Offer a message to the consumer at its current stagepoint, if any.
    ///
    /// `Ok(true)` means a handler took it (the callback runs on the
    /// dispatcher). `Ok(false)` means nothing here consumes it and the
    /// walk continues. Decode failures are errors; the message dies.
    pub fn try_accept(
        &self,
        msg: &BusMessage,
        types: &TypeRegistry,
        dispatcher: &dyn Dispatcher,
    ) -> Result<bool> {
        let Some(consumer) = self.consumers.get(&msg.current) else {
            return Ok(false);
        };
        match consumer {
            Consumer::Vacant => Ok(false),
            Consumer::Typed(handlers) => {
                let matching: Vec<TypedHandler> = handlers
                    .iter()
                    .filter(|((tag, _), _)| tag == msg.payload.tag())
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect();
                if matching.is_empty() {
                    return Ok(false);
                }
                let value = match &msg.payload {
                    Payload::Typed { value, .. } => Arc::clone(value),
                    Payload::Binary { tag, bytes } => types.decode(tag, bytes)?,
                };
                for handler in matching {
                    let value = Arc::clone(&value);
                    dispatcher.dispatch(Box::new(move || handler(value)));
                }
                Ok(true)
            }
            Consumer::Binary(None) => Ok(false),
            Consumer::Binary(Some(handler)) => {
                let tag = msg.payload.tag().to_string();
                let bytes = msg.payload.to_bytes()?;
                let handler = Arc::clone(handler);
                dispatcher.dispatch(Box::new(move || handler(tag, bytes)));
                Ok(true)
            }
        }
    }

    pub fn is_bound(&self, stage: &Stagepoint) -> bool {
        self.consumers.contains_key(stage)
    }
}

/// Shared, locked binding table.
pub struct BindingRegistry {
    inner: RwLock<BindingTable>,
}

impl Default for BindingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BindingTable::default()),
        }
    }

    /// Recursive read guard for the forwarding loop. Recursive so a
    /// handler publishing on the same thread can re-enter.
    pub fn read(&self) -> RwLockReadGuard<'_, BindingTable> {
        self.inner.read_recursive()
    }

    /// Claim a stagepoint. Fails if someone already holds it.
    pub fn bind(&self, stage: Stagepoint) -> Result<()> {
        let mut table = self.inner.write();
        if table.consumers.contains_key(&stage) {
            return Err(BusError::StagepointAlreadyBound {
                stage: stage.to_string(),
            });
        }
        debug!(%stage, "bound stagepoint");
        table.consumers.insert(stage, Consumer::Vacant);
        Ok(())
    }

    /// Release a stagepoint and drop its handlers.
    pub fn unbind(&self, stage: &Stagepoint) -> Result<()> {
        let mut table = self.inner.write();
        if table.consumers.remove(stage).is_none() {
            return Err(BusError::BindingNotFound {
                stage: stage.to_string(),
            });
        }
        debug!(%stage, "unbound stagepoint");
        Ok(())
    }

    pub fn subscribe_typed(
        &self,
        stage: &Stagepoint,
        tag: impl Into<String>,
        holder: u64,
        handler: TypedHandler,
    ) -> Result<()> {
        let key = (tag.into(), holder);
        let mut table = self.inner.write();
        let consumer = table.consumers.get_mut(stage).ok_or_else(|| {
            BusError::BindingNotFound {
                stage: stage.to_string(),
            }
        })?;
        match consumer {
            Consumer::Vacant => {
                let mut handlers = HashMap::new();
                handlers.insert(key, handler);
                *consumer = Consumer::Typed(handlers);
                Ok(())
            }
            Consumer::Typed(handlers) => {
                if handlers.contains_key(&key) {
                    return Err(BusError::DuplicateSubscription { payload_type: key.0 });
                }
                handlers.insert(key, handler);
                Ok(())
            }
            Consumer::Binary(_) => Err(BusError::IncompatibleSubscriptionKind {
                stage: stage.to_string(),
            }),
        }
    }

    pub fn subscribe_binary(&self, stage: &Stagepoint, handler: BinaryHandler) -> Result<()> {
        let mut table = self.inner.write();
        let consumer = table.consumers.get_mut(stage).ok_or_else(|| {
            BusError::BindingNotFound {
                stage: stage.to_string(),
            }
        })?;
        match consumer {
            Consumer::Vacant | Consumer::Binary(None) => {
                *consumer = Consumer::Binary(Some(handler));
                Ok(())
            }
            Consumer::Binary(Some(_)) => Err(BusError::DuplicateSubscription {
                payload_type: "*".to_string(),
            }),
            Consumer::Typed(_) => Err(BusError::IncompatibleSubscriptionKind {
                stage: stage.to_string(),
            }),
        }
    }

    /// Remove one typed handler. The binding keeps its typed kind even
    /// when the last handler goes; only [`unbind`](Self::unbind) clears it.
    pub fn unsubscribe_typed(&self, stage: &Stagepoint, tag: &str, holder: u64) -> Result<()> {
        let mut table = self.inner.write();
        let consumer = table.consumers.get_mut(stage).ok_or_else(|| {
            BusError::BindingNotFound {
                stage: stage.to_string(),
            }
        })?;
        if let Consumer::Typed(handlers) = consumer {
            handlers.remove(&(tag.to_string(), holder));
        }
        Ok(())
    }

    /// Drop the binary handler. The binding stays binary-kinded, so a
    /// later typed subscription is still refused.
    pub fn unsubscribe_binary(&self, stage: &Stagepoint) -> Result<()> {
        let mut table = self.inner.write();
        let consumer = table.consumers.get_mut(stage).ok_or_else(|| {
            BusError::BindingNotFound {
                stage: stage.to_string(),
            }
        })?;
        if matches!(consumer, Consumer::Binary(_)) {
            *consumer = Consumer::Binary(None);
        }
        Ok(())
    }

    pub fn is_bound(&self, stage: &Stagepoint) -> bool {
        self.inner.read().is_bound(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InlineDispatcher;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use types::EndpointName;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Quote {
        price: u64,
    }

    fn msg_typed(current: Stagepoint, tag: &str, value: Quote) -> BusMessage {
        BusMessage {
            from: EndpointName::new("src"),
            to: current.endpoint().clone(),
            current,
            payload: Payload::typed(tag, value),
        }
    }

    fn msg_binary(current: Stagepoint, tag: &str, value: &Quote) -> BusMessage {
        let bytes = codec::encode_payload(value).unwrap();
        BusMessage {
            from: EndpointName::new("src"),
            to: current.endpoint().clone(),
            current,
            payload: Payload::binary(tag, bytes),
        }
    }

    #[test]
    fn double_bind_is_rejected() {
        let reg = BindingRegistry::new();
        let stage = Stagepoint::terminal("quotes");
        reg.bind(stage.clone()).unwrap();
        assert!(matches!(
            reg.bind(stage),
            Err(BusError::StagepointAlreadyBound { .. })
        ));
    }

    #[test]
    fn consumer_kind_is_exclusive() {
        let reg = BindingRegistry::new();
        let stage = Stagepoint::terminal("quotes");
        reg.bind(stage.clone()).unwrap();
        reg.subscribe_typed(&stage, "quote", 0, Arc::new(|_| {})).unwrap();

        assert!(matches!(
            reg.subscribe_binary(&stage, Arc::new(|_, _| {})),
            Err(BusError::IncompatibleSubscriptionKind { .. })
        ));
    }

    #[test]
    fn duplicate_typed_subscription_is_rejected() {
        let reg = BindingRegistry::new();
        let stage = Stagepoint::terminal("quotes");
        reg.bind(stage.clone()).unwrap();
        reg.subscribe_typed(&stage, "quote", 0, Arc::new(|_| {})).unwrap();

        assert!(matches!(
            reg.subscribe_typed(&stage, "quote", 0, Arc::new(|_| {})),
            Err(BusError::DuplicateSubscription { .. })
        ));
    }

    #[test]
    fn typed_handler_gets_value_decoded_from_wire_bytes() {
        let reg = BindingRegistry::new();
        let types = TypeRegistry::new();
        types.register::<Quote>("quote");
        let stage = Stagepoint::terminal("quotes");
        reg.bind(stage.clone()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reg.subscribe_typed(
            &stage,
            "quote",
            0,
            Arc::new(move |value| {
                let quote = value.downcast_ref::<Quote>().unwrap().clone();
                sink.lock().push(quote);
            }),
        )
        .unwrap();

        let msg = msg_binary(stage, "quote", &Quote { price: 42 });
        let accepted = reg.read().try_accept(&msg, &types, &InlineDispatcher).unwrap();

        assert!(accepted);
        assert_eq!(seen.lock().as_slice(), [Quote { price: 42 }]);
    }

    #[test]
    fn binary_handler_gets_bytes_from_typed_payload() {
        let reg = BindingRegistry::new();
        let types = TypeRegistry::new();
        let stage = Stagepoint::terminal("quotes");
        reg.bind(stage.clone()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reg.subscribe_binary(
            &stage,
            Arc::new(move |tag, bytes| {
                sink.lock().push((tag, bytes));
            }),
        )
        .unwrap();

        let msg = msg_typed(stage, "quote", Quote { price: 7 });
        let accepted = reg.read().try_accept(&msg, &types, &InlineDispatcher).unwrap();

        assert!(accepted);
        let got = seen.lock();
        assert_eq!(got[0].0, "quote");
        assert_eq!(
            codec::decode_payload::<Quote>(&got[0].1).unwrap(),
            Quote { price: 7 }
        );
    }

    #[test]
    fn vacant_binding_and_unknown_tag_do_not_consume() {
        let reg = BindingRegistry::new();
        let types = TypeRegistry::new();
        let stage = Stagepoint::terminal("quotes");
        reg.bind(stage.clone()).unwrap();

        let msg = msg_typed(stage.clone(), "quote", Quote { price: 1 });
        assert!(!reg.read().try_accept(&msg, &types, &InlineDispatcher).unwrap());

        reg.subscribe_typed(&stage, "other", 0, Arc::new(|_| {})).unwrap();
        assert!(!reg.read().try_accept(&msg, &types, &InlineDispatcher).unwrap());
    }

    #[test]
    fn missing_decoder_is_an_error() {
        let reg = BindingRegistry::new();
        let types = TypeRegistry::new();
        let stage = Stagepoint::terminal("quotes");
        reg.bind(stage.clone()).unwrap();
        reg.subscribe_typed(&stage, "quote", 0, Arc::new(|_| {})).unwrap();

        let msg = msg_binary(stage, "quote", &Quote { price: 3 });
        assert!(matches!(
            reg.read().try_accept(&msg, &types, &InlineDispatcher),
            Err(BusError::UnknownPayloadType { .. })
        ));
    }

    #[test]
    fn distinct_holders_each_receive_the_payload() {
        let reg = BindingRegistry::new();
        let types = TypeRegistry::new();
        let stage = Stagepoint::terminal("quotes");
        reg.bind(stage.clone()).unwrap();

        let hits = Arc::new(Mutex::new(0u32));
        for holder in [1u64, 2] {
            let h = hits.clone();
            reg.subscribe_typed(&stage, "quote", holder, Arc::new(move |_| *h.lock() += 1))
                .unwrap();
        }

        let msg = msg_typed(stage, "quote", Quote { price: 5 });
        assert!(reg.read().try_accept(&msg, &types, &InlineDispatcher).unwrap());
        assert_eq!(*hits.lock(), 2);
    }

    #[test]
    fn typed_kind_survives_removing_the_last_handler() {
        let reg = BindingRegistry::new();
        let stage = Stagepoint::terminal("quotes");
        reg.bind(stage.clone()).unwrap();
        reg.subscribe_typed(&stage, "quote", 0, Arc::new(|_| {})).unwrap();
        reg.unsubscribe_typed(&stage, "quote", 0).unwrap();

        assert!(matches!(
            reg.subscribe_binary(&stage, Arc::new(|_, _| {})),
            Err(BusError::IncompatibleSubscriptionKind { .. })
        ));
        // Typed subscriptions are still welcome.
        reg.subscribe_typed(&stage, "quote", 0, Arc::new(|_| {})).unwrap();
    }

    #[test]
    fn binary_kind_survives_unsubscribing() {
        let reg = BindingRegistry::new();
        let types = TypeRegistry::new();
        let stage = Stagepoint::terminal("quotes");
        reg.bind(stage.clone()).unwrap();
        reg.subscribe_binary(&stage, Arc::new(|_, _| {})).unwrap();
        reg.unsubscribe_binary(&stage).unwrap();

        assert!(matches!(
            reg.subscribe_typed(&stage, "quote", 0, Arc::new(|_| {})),
            Err(BusError::IncompatibleSubscriptionKind { .. })
        ));
        // No handler left, so nothing consumes.
        let msg = msg_typed(stage.clone(), "quote", Quote { price: 9 });
        assert!(!reg.read().try_accept(&msg, &types, &InlineDispatcher).unwrap());
        // Re-subscribing the same kind works.
        reg.subscribe_binary(&stage, Arc::new(|_, _| {})).unwrap();
    }
}
