//! Message Bus Facade
//!
//! [`MessageBus`] is the per-node entry point: applications create
//! bindings, bindings publish and subscribe, and the hosting process
//! plugs physical links in as byte channels and drives them by calling
//! [`MessageBus::on_channel_readable`] plus the periodic
//! [`MessageBus::broadcast_sync`] / [`MessageBus::check_liveness`] ticks.
//!
//! Lock order is registry-before-topology and never a lock across a
//! network write: the forwarding loop runs under the binding registry's
//! recursive read guard, takes the topology lock per step, and any frame
//! destined for a channel is written only after both are released.

use crate::binding::{BindingRegistry, BinaryHandler, TypedHandler};
use crate::channel::{Channel, ChannelRegistry, ChannelRole, ChannelSettings};
use crate::config::BusConfig;
use crate::dispatch::{Dispatcher, InlineDispatcher};
use crate::error::{BusError, Result};
use crate::message::{BusMessage, Payload};
use crate::routing::{self, RouteOutcome};
use crate::topology::TopologyHandle;
use crate::transport::ByteChannel;
use crate::types_registry::TypeRegistry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, info, warn};
use types::{ChannelId, EndpointName, NodeId, StageChain, Stagepoint};

struct BusInner {
    config: BusConfig,
    node_id: NodeId,
    topology: TopologyHandle,
    bindings: BindingRegistry,
    types: TypeRegistry,
    channels: ChannelRegistry,
    dispatcher: Arc<dyn Dispatcher>,
}

/// One node's bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Bus with the inline dispatcher: handlers run on the thread that
    /// routed the message.
    pub fn new(config: BusConfig) -> Result<Self> {
        Self::with_dispatcher(config, Arc::new(InlineDispatcher))
    }

    pub fn with_dispatcher(config: BusConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        config.validate()?;
        let node_id = NodeId::new(config.node_id.clone());
        info!(node = %node_id, "message bus starting");
        Ok(Self {
            inner: Arc::new(BusInner {
                node_id: node_id.clone(),
                topology: TopologyHandle::new(node_id),
                bindings: BindingRegistry::new(),
                types: TypeRegistry::new(),
                channels: ChannelRegistry::new(),
                dispatcher,
                config,
            }),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn topology(&self) -> &TopologyHandle {
        &self.inner.topology
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Host an endpoint here, advertising its stage chain. The returned
    /// binding sits at the endpoint's terminal stagepoint.
    pub fn create_endpoint_bind(&self, chain: StageChain) -> Result<Binding> {
        if chain.has_duplicate_stages() {
            return Err(BusError::configuration(
                "stage names within a chain must be unique",
                Some("stage_chain"),
            ));
        }
        let stage = chain.terminal();
        self.inner.bindings.bind(stage.clone())?;
        if let Err(err) = self
            .inner
            .topology
            .write(|store| store.add_local_endpoint(chain))
        {
            // Roll the claim back so the name is not half-registered.
            let _ = self.inner.bindings.unbind(&stage);
            return Err(err);
        }
        Ok(Binding {
            bus: self.clone(),
            stage,
        })
    }

    /// Host one intermediate stage of some endpoint's chain here.
    pub fn create_stagepoint_bind(&self, stage: Stagepoint) -> Result<Binding> {
        self.inner.bindings.bind(stage.clone())?;
        if let Err(err) = self
            .inner
            .topology
            .write(|store| store.add_local_stagepoint(stage.clone()))
        {
            let _ = self.inner.bindings.unbind(&stage);
            return Err(err);
        }
        Ok(Binding {
            bus: self.clone(),
            stage,
        })
    }

    /// Adopt a connected byte stream as a channel. Initiators greet the
    /// peer immediately; acceptors wait for the peer's handshake (or for
    /// an explicit [`MessageBus::initiate_handshake`]).
    pub fn register_channel(&self, io: Box<dyn ByteChannel>, role: ChannelRole) -> ChannelId {
        let mut channel = Channel::new(role, io, ChannelSettings::from_config(&self.inner.config));
        if role == ChannelRole::Initiator {
            channel.start_handshake();
        }
        let id = self.inner.channels.insert(channel);
        info!(channel = %id, ?role, "channel registered");
        id
    }

    /// Send our handshake on a channel that has not spoken yet. Returns
    /// false if the channel is gone.
    pub fn initiate_handshake(&self, id: ChannelId) -> bool {
        match self.inner.channels.get(id) {
            Some(handle) => {
                handle.lock().start_handshake();
                true
            }
            None => false,
        }
    }

    pub fn remove_channel(&self, id: ChannelId) {
        self.inner.channels.remove(id, &self.inner.topology);
    }

    /// Drain and process everything buffered on a channel. The hosting
    /// process calls this whenever the underlying stream has new bytes.
    ///
    /// A protocol violation tears the channel down and is returned; the
    /// other channels are unaffected.
    pub fn on_channel_readable(&self, id: ChannelId) -> Result<()> {
        let Some(handle) = self.inner.channels.get(id) else {
            return Ok(());
        };
        let pumped = handle.lock().pump(&self.inner.topology);
        let inbound = match pumped {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(channel = %id, error = %err, "protocol violation, closing channel");
                self.inner.channels.remove(id, &self.inner.topology);
                return Err(err);
            }
        };
        for wire in inbound {
            // A message that cannot be routed dies alone; the channel and
            // the rest of the batch carry on.
            if let Err(err) = self.route(BusMessage::from_wire(wire)) {
                warn!(channel = %id, error = %err, "dropping unroutable inbound message");
            }
        }
        Ok(())
    }

    /// Periodic tick: advertise the current topology to every neighbor.
    pub fn broadcast_sync(&self) {
        self.inner.channels.broadcast_sync(&self.inner.topology);
    }

    /// Periodic tick: probe idle channels and reap dead ones.
    pub fn check_liveness(&self) -> Vec<ChannelId> {
        self.inner
            .channels
            .check_liveness(&self.inner.topology, self.inner.config.liveness_timeout)
    }

    pub fn shutdown(&self) {
        info!(node = %self.inner.node_id, "message bus shutting down");
        self.inner.channels.close_all(&self.inner.topology);
    }

    /// Inject a message at `origin` and walk it to wherever it goes.
    /// The first step leaves the origin stagepoint before any delivery is
    /// attempted, so a sender never consumes its own message.
    fn send_message(&self, origin: &Stagepoint, to: EndpointName, payload: Payload) -> Result<()> {
        let from = origin.endpoint().clone();
        let first = self
            .inner
            .topology
            .read(|store| store.advance(&from, &to, origin));
        let Some(current) = first else {
            debug!(%from, %to, "no first hop, dropping message");
            return Ok(());
        };
        self.route(BusMessage {
            from,
            to,
            current,
            payload,
        })
    }

    fn route(&self, msg: BusMessage) -> Result<()> {
        let outcome = {
            let table = self.inner.bindings.read();
            routing::route(
                &table,
                &self.inner.topology,
                &self.inner.types,
                self.inner.dispatcher.as_ref(),
                msg,
            )?
        };
        if let RouteOutcome::Forward { channel, wire } = outcome {
            self.inner.channels.send_data(channel, wire);
        }
        Ok(())
    }

    fn release_binding(&self, stage: &Stagepoint) -> Result<()> {
        self.inner.bindings.unbind(stage)?;
        self.inner.topology.write(|store| {
            if stage.is_endpoint() {
                store.remove_local_endpoint(stage.endpoint());
            } else {
                store.remove_local_stagepoint(stage);
            }
        });
        Ok(())
    }
}

/// A claim on one stagepoint: the application's handle for publishing
/// from, and subscribing at, that point in the mesh.
///
/// Release explicitly with [`Binding::release`]; a binding dropped
/// without release keeps its stagepoint claimed.
pub struct Binding {
    bus: MessageBus,
    stage: Stagepoint,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding").field("stage", &self.stage).finish_non_exhaustive()
    }
}

impl Binding {
    pub fn stagepoint(&self) -> &Stagepoint {
        &self.stage
    }

    /// Publish a typed value to `to`. Serialization happens only if the
    /// message actually leaves this node.
    pub fn send<T>(&self, to: impl Into<EndpointName>, tag: &str, value: T) -> Result<()>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.bus
            .send_message(&self.stage, to.into(), Payload::typed(tag, value))
    }

    /// Publish pre-serialized bytes to `to`.
    pub fn send_binary(
        &self,
        to: impl Into<EndpointName>,
        tag: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.bus
            .send_message(&self.stage, to.into(), Payload::binary(tag, bytes))
    }

    /// Subscribe to one payload type, decoded. Registers the decoder for
    /// `tag` as a side effect so remote senders of the same type work.
    pub fn subscribe_typed<T, F>(&self, tag: &str, handler: F) -> Result<()>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_typed_as(tag, 0, handler)
    }

    /// Like [`Binding::subscribe_typed`], under an explicit holder
    /// discriminator so several holders can take the same payload type.
    pub fn subscribe_typed_as<T, F>(&self, tag: &str, holder: u64, handler: F) -> Result<()>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.bus.inner.types.register::<T>(tag);
        let tag_owned = tag.to_string();
        let wrapped: TypedHandler = Arc::new(move |value: Arc<dyn Any + Send + Sync>| {
            match value.downcast::<T>() {
                Ok(value) => handler(&value),
                Err(_) => warn!(tag = %tag_owned, "payload type mismatch, discarding"),
            }
        });
        self.bus
            .inner
            .bindings
            .subscribe_typed(&self.stage, tag, holder, wrapped)
    }

    /// Subscribe to every payload as (type tag, serialized bytes).
    pub fn subscribe_binary<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        let wrapped: BinaryHandler = Arc::new(move |tag, bytes| handler(&tag, &bytes));
        self.bus.inner.bindings.subscribe_binary(&self.stage, wrapped)
    }

    pub fn unsubscribe_typed(&self, tag: &str, holder: u64) -> Result<()> {
        self.bus
            .inner
            .bindings
            .unsubscribe_typed(&self.stage, tag, holder)
    }

    pub fn unsubscribe_binary(&self) -> Result<()> {
        self.bus.inner.bindings.unsubscribe_binary(&self.stage)
    }

    /// Give the stagepoint back: the binding, its handlers, and the local
    /// topology row all go.
    pub fn release(self) -> Result<()> {
        self.bus.release_binding(&self.stage)
    }
}
