//! Identifier Value Types
//!
//! Names for the entities the bus routes between: endpoints (final message
//! destinations), stagepoints (steps in an endpoint's processing pipeline),
//! stage chains, physical channels and nodes. All of these are plain values
//! with equality, ordering and serde support; none of them carry behavior
//! beyond a few structural accessors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Name of a message destination published somewhere in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointName(String);

impl EndpointName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for EndpointName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// One point in an endpoint's processing pipeline.
///
/// A stagepoint whose stage name equals its owning endpoint's name denotes
/// the endpoint itself: the terminal point of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stagepoint {
    stage: String,
    endpoint: EndpointName,
}

impl Stagepoint {
    pub fn new(stage: impl Into<String>, endpoint: impl Into<EndpointName>) -> Self {
        Self {
            stage: stage.into(),
            endpoint: endpoint.into(),
        }
    }

    /// The terminal stagepoint denoting the endpoint itself.
    pub fn terminal(endpoint: impl Into<EndpointName>) -> Self {
        let endpoint = endpoint.into();
        Self {
            stage: endpoint.as_str().to_string(),
            endpoint,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn endpoint(&self) -> &EndpointName {
        &self.endpoint
    }

    /// True iff this stagepoint denotes its owning endpoint (terminal).
    pub fn is_endpoint(&self) -> bool {
        self.stage == self.endpoint.as_str()
    }
}

impl fmt::Display for Stagepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_endpoint() {
            write!(f, "{}", self.endpoint)
        } else {
            write!(f, "{}@{}", self.stage, self.endpoint)
        }
    }
}

/// Ordered list of intermediate stage names under one endpoint.
///
/// The chain may be empty: messages then pass straight to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageChain {
    endpoint: EndpointName,
    stages: Vec<String>,
}

impl StageChain {
    pub fn new(endpoint: impl Into<EndpointName>, stages: Vec<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            stages,
        }
    }

    /// A chain with no intermediate stages.
    pub fn direct(endpoint: impl Into<EndpointName>) -> Self {
        Self {
            endpoint: endpoint.into(),
            stages: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &EndpointName {
        &self.endpoint
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Index of a stage name within the chain, if present.
    pub fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    /// Whether any stage name appears more than once. Stage walks locate
    /// stages by name, so a repeated name makes the chain ambiguous.
    pub fn has_duplicate_stages(&self) -> bool {
        self.stages
            .iter()
            .enumerate()
            .any(|(i, stage)| self.stages[..i].contains(stage))
    }

    pub fn stagepoint_at(&self, index: usize) -> Stagepoint {
        Stagepoint::new(self.stages[index].clone(), self.endpoint.clone())
    }

    /// The terminal stagepoint of the owning endpoint.
    pub fn terminal(&self) -> Stagepoint {
        Stagepoint::terminal(self.endpoint.clone())
    }

    /// Where a message enters this endpoint's pipeline: the first stage, or
    /// the endpoint itself when the chain is empty.
    pub fn entry_stage(&self) -> Stagepoint {
        if self.stages.is_empty() {
            self.terminal()
        } else {
            self.stagepoint_at(0)
        }
    }
}

/// Identity of a physical link to a neighboring node.
///
/// Ids are process-local and generated from an atomic counter. Id `0` is the
/// `LOCAL` sentinel marking locally hosted topology rows; it is never handed
/// out for a real channel and never appears in remote-learned entries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ChannelId(u64);

static CHANNEL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl ChannelId {
    /// Sentinel for locally hosted entries.
    pub const LOCAL: ChannelId = ChannelId(0);

    /// Allocate the next process-unique channel id.
    pub fn next() -> Self {
        Self(CHANNEL_ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn is_local(&self) -> bool {
        *self == Self::LOCAL
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            f.write_str("local")
        } else {
            write!(f, "ch-{}", self.0)
        }
    }
}

/// Identity of a node in the mesh, stable for the node's process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_stagepoint_is_endpoint() {
        let sp = Stagepoint::terminal("quotes");
        assert!(sp.is_endpoint());
        assert_eq!(sp.stage(), "quotes");
        assert_eq!(sp.endpoint().as_str(), "quotes");
    }

    #[test]
    fn intermediate_stagepoint_is_not_endpoint() {
        let sp = Stagepoint::new("validate", "quotes");
        assert!(!sp.is_endpoint());
        assert_eq!(sp.to_string(), "validate@quotes");
    }

    #[test]
    fn empty_chain_enters_at_terminal() {
        let chain = StageChain::direct("quotes");
        assert!(chain.is_empty());
        assert_eq!(chain.entry_stage(), Stagepoint::terminal("quotes"));
    }

    #[test]
    fn chain_positions_and_stagepoints() {
        let chain = StageChain::new("quotes", vec!["s1".into(), "s2".into()]);
        assert_eq!(chain.position("s1"), Some(0));
        assert_eq!(chain.position("s2"), Some(1));
        assert_eq!(chain.position("s3"), None);
        assert_eq!(chain.stagepoint_at(1), Stagepoint::new("s2", "quotes"));
        assert_eq!(chain.entry_stage(), Stagepoint::new("s1", "quotes"));
    }

    #[test]
    fn repeated_stage_names_are_detected() {
        let clean = StageChain::new("quotes", vec!["s1".into(), "s2".into()]);
        assert!(!clean.has_duplicate_stages());
        let repeated = StageChain::new("quotes", vec!["s1".into(), "s1".into()]);
        assert!(repeated.has_duplicate_stages());
    }

    #[test]
    fn channel_ids_are_unique_and_never_local() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
        assert!(!a.is_local());
        assert!(ChannelId::LOCAL.is_local());
    }
}
