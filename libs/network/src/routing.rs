//! Routing Engine
//!
//! A message travels backward through its origin endpoint's stage chain,
//! crosses over, then forward through its destination endpoint's stage
//! chain and finally to the destination terminal. [`advance`] computes one
//! step of that walk; [`route`] repeats it, attempting local delivery at
//! every stop and handing off to a channel as soon as the current
//! stagepoint resolves to a remote owner.
//!
//! `route` never serializes a message unless it actually leaves the node,
//! and it serializes at most once.

use crate::binding::BindingTable;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::message::BusMessage;
use crate::topology::TopologyHandle;
use crate::types_registry::TypeRegistry;
use tracing::debug;
use types::messages::SendMsg;
use types::{ChannelId, StageChain, Stagepoint};

/// Where a message ended up after the forwarding loop.
#[derive(Debug)]
pub enum RouteOutcome {
    /// A local consumer took it.
    Delivered,
    /// The current stagepoint lives behind `channel`; the caller must put
    /// `wire` on that channel (outside any routing locks).
    Forward { channel: ChannelId, wire: SendMsg },
    /// Ran off the end of the walk with no consumer anywhere. Dropping is
    /// normal during topology churn; the sender is not told.
    Dropped,
}

/// One step of the stage walk.
///
/// While the message sits on its origin's chain it moves backward, from
/// the last stage toward the first, then jumps to the destination chain's
/// entry. On the destination's chain it moves forward, ending at the
/// destination terminal. A current stagepoint on neither chain has been
/// orphaned by a topology change and goes nowhere.
pub fn advance(
    from_chain: &StageChain,
    to_chain: &StageChain,
    current: &Stagepoint,
) -> Option<Stagepoint> {
    if current.endpoint() == to_chain.endpoint() {
        if current.is_endpoint() {
            return None;
        }
        return match to_chain.position(current.stage()) {
            Some(i) if i + 1 < to_chain.len() => Some(to_chain.stagepoint_at(i + 1)),
            Some(_) => Some(to_chain.terminal()),
            None => None,
        };
    }
    if current.endpoint() == from_chain.endpoint() {
        if current.is_endpoint() {
            return match from_chain.stages().last() {
                Some(stage) => Some(Stagepoint::new(stage.clone(), from_chain.endpoint().clone())),
                None => Some(to_chain.entry_stage()),
            };
        }
        return match from_chain.position(current.stage()) {
            Some(0) => Some(to_chain.entry_stage()),
            Some(i) => Some(from_chain.stagepoint_at(i - 1)),
            None => None,
        };
    }
    None
}

/// Drive a message until it is consumed locally, leaves the node, or dies.
///
/// The caller holds the binding registry read lock for the whole loop and
/// passes in the table; the topology lock is taken briefly per step. On
/// `Forward`, sending is the caller's job so no lock spans the I/O.
pub fn route(
    bindings: &BindingTable,
    topology: &TopologyHandle,
    types: &TypeRegistry,
    dispatcher: &dyn Dispatcher,
    mut msg: BusMessage,
) -> Result<RouteOutcome> {
    loop {
        if bindings.try_accept(&msg, types, dispatcher)? {
            debug!(current = %msg.current, "delivered locally");
            return Ok(RouteOutcome::Delivered);
        }
        if let Some(channel) = topology.read(|t| t.resolve_next_hop(&msg.current)) {
            let wire = msg.to_wire()?;
            return Ok(RouteOutcome::Forward { channel, wire });
        }
        if msg.current.is_endpoint() {
            // End of the walk with no consumer and no route. Normal during
            // topology churn, so quiet.
            debug!(from = %msg.from, to = %msg.to, "no consumer for destination, dropping");
            return Ok(RouteOutcome::Dropped);
        }
        match topology.read(|t| t.advance(&msg.from, &msg.to, &msg.current)) {
            // A chain with a repeated stage name makes the walk stand
            // still; treat no progress as a dead end rather than spin.
            Some(next) if next != msg.current => {
                debug!(from = %msg.current, to = %next, "advancing stage");
                msg.current = next;
            }
            Some(_) => {
                debug!(current = %msg.current, to = %msg.to, "stage walk stalled, dropping");
                return Ok(RouteOutcome::Dropped);
            }
            None => {
                debug!(current = %msg.current, to = %msg.to, "stage walk dead-ended, dropping");
                return Ok(RouteOutcome::Dropped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InlineDispatcher;
    use crate::message::Payload;
    use types::{EndpointName, NodeId};

    fn sp(stage: &str, endpoint: &str) -> Stagepoint {
        Stagepoint::new(stage, endpoint)
    }

    #[test]
    fn walks_destination_chain_forward_to_terminal() {
        let from = StageChain::direct("src");
        let to = StageChain::new("dst", vec!["s1".into(), "s2".into()]);

        assert_eq!(advance(&from, &to, &sp("s1", "dst")), Some(sp("s2", "dst")));
        assert_eq!(
            advance(&from, &to, &sp("s2", "dst")),
            Some(Stagepoint::terminal("dst"))
        );
        assert_eq!(advance(&from, &to, &Stagepoint::terminal("dst")), None);
    }

    #[test]
    fn walks_origin_chain_backward_then_crosses_over() {
        let from = StageChain::new("src", vec!["a".into(), "b".into()]);
        let to = StageChain::new("dst", vec!["s1".into()]);

        // Origin terminal first, then stages in reverse.
        assert_eq!(
            advance(&from, &to, &Stagepoint::terminal("src")),
            Some(sp("b", "src"))
        );
        assert_eq!(advance(&from, &to, &sp("b", "src")), Some(sp("a", "src")));
        // Front of the origin chain jumps to the destination chain's entry.
        assert_eq!(advance(&from, &to, &sp("a", "src")), Some(sp("s1", "dst")));
    }

    #[test]
    fn stageless_endpoints_go_terminal_to_terminal() {
        let from = StageChain::direct("src");
        let to = StageChain::direct("dst");

        assert_eq!(
            advance(&from, &to, &Stagepoint::terminal("src")),
            Some(Stagepoint::terminal("dst"))
        );
    }

    #[test]
    fn origin_with_empty_chain_enters_destination_chain() {
        let from = StageChain::direct("src");
        let to = StageChain::new("dst", vec!["s1".into(), "s2".into()]);

        assert_eq!(
            advance(&from, &to, &Stagepoint::terminal("src")),
            Some(sp("s1", "dst"))
        );
    }

    #[test]
    fn repeated_stage_name_drops_instead_of_spinning() {
        // Local binds refuse such chains, but a peer can still advertise
        // one; the walk must terminate on it.
        let bindings = BindingTable::default();
        let topology = TopologyHandle::new(NodeId::new("here"));
        topology
            .write(|t| {
                t.add_local_endpoint(StageChain::new("dst", vec!["s1".into(), "s1".into()]))
            })
            .unwrap();
        let types = TypeRegistry::new();

        let msg = BusMessage {
            from: EndpointName::new("src"),
            to: EndpointName::new("dst"),
            current: sp("s1", "dst"),
            payload: Payload::typed("tick", 7u64),
        };
        let outcome = route(&bindings, &topology, &types, &InlineDispatcher, msg).unwrap();
        assert!(matches!(outcome, RouteOutcome::Dropped));
    }

    #[test]
    fn orphaned_stage_goes_nowhere() {
        let from = StageChain::new("src", vec!["a".into()]);
        let to = StageChain::new("dst", vec!["s1".into()]);

        // Stage not on its own endpoint's chain anymore.
        assert_eq!(advance(&from, &to, &sp("stale", "dst")), None);
        assert_eq!(advance(&from, &to, &sp("stale", "src")), None);
        // Endpoint on neither chain.
        assert_eq!(advance(&from, &to, &sp("a", "elsewhere")), None);
    }
}
