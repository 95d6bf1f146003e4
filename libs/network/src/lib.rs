//! Stagewire Bus Core
//!
//! The topology synchronization and message routing layer of the Stagewire
//! message bus. Application code on one node publishes named endpoints and
//! intermediate stagepoints; messages addressed to an endpoint are routed,
//! possibly through several processing stages and across several physical
//! links, to wherever that endpoint currently lives.
//!
//! Module map, leaves first:
//!
//! - [`transport`]: the transactional byte-channel seam to the external
//!   stream transport, plus an in-memory implementation for tests.
//! - [`dispatch`]: the seam to the external mailbox runtime that executes
//!   subscriber callbacks.
//! - [`topology`]: per-node tables of reachable endpoints/stagepoints with
//!   hop distances and per-channel ownership bookkeeping.
//! - [`routing`]: stage-chain traversal and the hop-by-hop forwarding loop.
//! - [`binding`]: local subscriptions - at most one consumer per stagepoint,
//!   typed or binary.
//! - [`channel`]: the per-channel handshake/framing/liveness state machine
//!   and the registry of active channels.
//! - [`bus`]: the node facade tying all of the above together.

pub mod binding;
pub mod bus;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod routing;
pub mod topology;
pub mod transport;
pub mod types_registry;

pub use binding::BindingRegistry;
pub use bus::{Binding, MessageBus};
pub use channel::{Channel, ChannelRegistry, ChannelRole, HandshakeState};
pub use config::BusConfig;
pub use dispatch::{Dispatcher, InlineDispatcher};
pub use error::{BusError, Result};
pub use message::{BusMessage, Payload};
pub use topology::{AvailableEndpoint, AvailableStagepoint, TopologyHandle, TopologyStore};
pub use transport::{ByteChannel, MemoryChannel};
pub use types_registry::TypeRegistry;
