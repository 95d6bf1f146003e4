//! Topology Store
//!
//! Per-node tables of reachable endpoints and stagepoints. Every row is
//! tagged with its origin node, its hop distance from this node, and the
//! channel that owns it - `ChannelId::LOCAL` for rows backed by a local
//! binding (distance 0), a real channel id for rows learned from a
//! neighbor's snapshot.
//!
//! Ownership is exclusive: a name appears in at most one channel's
//! owned-set at a time, and that set exactly mirrors the rows whose current
//! winning entry came from that channel. Merging preserves a deliberate
//! tie-break: a row is replaced when the new distance is strictly smaller,
//! or when the update comes from the channel that already owns the row -
//! fresh data from the owning neighbor is authoritative even at equal or
//! larger distance. Equal-distance updates from other channels are
//! discarded so ownership does not flap between equally good paths.

use crate::error::{BusError, Result};
use crate::routing;
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use types::messages::{EndpointRow, StagepointRow, SyncTables};
use types::{ChannelId, EndpointName, NodeId, StageChain, Stagepoint};

/// One row of the endpoint table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableEndpoint {
    pub node_id: NodeId,
    pub distance: u32,
    pub channel: ChannelId,
    pub chain: StageChain,
}

/// One row of the stagepoint table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableStagepoint {
    pub node_id: NodeId,
    pub distance: u32,
    pub channel: ChannelId,
}

/// Per-channel bookkeeping: the neighbor behind the channel and the names
/// whose winning rows it currently owns.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub node_id: NodeId,
    pub owned_endpoints: HashSet<EndpointName>,
    pub owned_stagepoints: HashSet<Stagepoint>,
}

impl ChannelInfo {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            owned_endpoints: HashSet::new(),
            owned_stagepoints: HashSet::new(),
        }
    }
}

/// The distance-vector tables of one node.
#[derive(Debug)]
pub struct TopologyStore {
    node_id: NodeId,
    endpoints: HashMap<EndpointName, AvailableEndpoint>,
    stagepoints: HashMap<Stagepoint, AvailableStagepoint>,
    channels: HashMap<ChannelId, ChannelInfo>,
}

impl TopologyStore {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            endpoints: HashMap::new(),
            stagepoints: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Register a locally hosted endpoint (distance 0, owned by `LOCAL`).
    ///
    /// A local row always beats a remote one; a second *local* row for the
    /// same name is a caller bug and fails with `DuplicateLocalEntry`.
    pub fn add_local_endpoint(&mut self, chain: StageChain) -> Result<()> {
        let name = chain.endpoint().clone();
        if let Some(existing) = self.endpoints.get(&name) {
            if existing.distance == 0 {
                return Err(BusError::DuplicateLocalEntry {
                    name: name.to_string(),
                });
            }
        }
        let row = AvailableEndpoint {
            node_id: self.node_id.clone(),
            distance: 0,
            channel: ChannelId::LOCAL,
            chain,
        };
        if let Some(prev) = self.endpoints.insert(name.clone(), row) {
            self.detach_endpoint_owner(prev.channel, &name);
        }
        debug!(endpoint = %name, "registered local endpoint");
        Ok(())
    }

    /// Register a locally hosted stagepoint (distance 0, owned by `LOCAL`).
    pub fn add_local_stagepoint(&mut self, stage: Stagepoint) -> Result<()> {
        if let Some(existing) = self.stagepoints.get(&stage) {
            if existing.distance == 0 {
                return Err(BusError::DuplicateLocalEntry {
                    name: stage.to_string(),
                });
            }
        }
        let row = AvailableStagepoint {
            node_id: self.node_id.clone(),
            distance: 0,
            channel: ChannelId::LOCAL,
        };
        if let Some(prev) = self.stagepoints.insert(stage.clone(), row) {
            self.detach_stagepoint_owner(prev.channel, &stage);
        }
        debug!(stage = %stage, "registered local stagepoint");
        Ok(())
    }

    /// Drop a locally hosted endpoint row. Remote rows are untouched.
    pub fn remove_local_endpoint(&mut self, name: &EndpointName) {
        if self.endpoints.get(name).is_some_and(|r| r.distance == 0) {
            self.endpoints.remove(name);
            debug!(endpoint = %name, "removed local endpoint");
        }
    }

    /// Drop a locally hosted stagepoint row. Remote rows are untouched.
    pub fn remove_local_stagepoint(&mut self, stage: &Stagepoint) {
        if self.stagepoints.get(stage).is_some_and(|r| r.distance == 0) {
            self.stagepoints.remove(stage);
            debug!(stage = %stage, "removed local stagepoint");
        }
    }

    /// Merge a topology snapshot received from the neighbor behind
    /// `channel`. Snapshot distances are the sender's; one hop is added
    /// here.
    pub fn update_channel(
        &mut self,
        channel: ChannelId,
        neighbor: NodeId,
        endpoints: Vec<EndpointRow>,
        stagepoints: Vec<StagepointRow>,
    ) {
        debug_assert!(!channel.is_local());
        {
            let info = self
                .channels
                .entry(channel)
                .or_insert_with(|| ChannelInfo::new(neighbor.clone()));
            info.node_id = neighbor;
        }

        // Names this channel owned that are absent from the new snapshot are
        // no longer reachable through it. Ownership is exclusive, so they
        // are gone entirely; no other path is assumed.
        let present: HashSet<&EndpointName> = endpoints.iter().map(|r| &r.name).collect();
        let gone: Vec<EndpointName> = match self.channels.get(&channel) {
            Some(info) => info
                .owned_endpoints
                .iter()
                .filter(|n| !present.contains(*n))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        for name in gone {
            self.endpoints.remove(&name);
            self.detach_endpoint_owner(channel, &name);
            debug!(endpoint = %name, %channel, "endpoint vanished from snapshot");
        }

        let present: HashSet<Stagepoint> = stagepoints
            .iter()
            .map(|r| Stagepoint::new(r.stage.clone(), r.endpoint.clone()))
            .collect();
        let gone: Vec<Stagepoint> = match self.channels.get(&channel) {
            Some(info) => info
                .owned_stagepoints
                .iter()
                .filter(|s| !present.contains(*s))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        for stage in gone {
            self.stagepoints.remove(&stage);
            self.detach_stagepoint_owner(channel, &stage);
            debug!(stage = %stage, %channel, "stagepoint vanished from snapshot");
        }

        for row in endpoints {
            let distance = row.distance.saturating_add(1);
            let replace = match self.endpoints.get(&row.name) {
                None => true,
                Some(existing) => distance < existing.distance || existing.channel == channel,
            };
            if !replace {
                continue;
            }
            let name = row.name.clone();
            let incoming = AvailableEndpoint {
                node_id: row.node_id,
                distance,
                channel,
                chain: StageChain::new(name.clone(), row.stage_chain),
            };
            if let Some(prev) = self.endpoints.insert(name.clone(), incoming) {
                if prev.channel != channel {
                    self.detach_endpoint_owner(prev.channel, &name);
                }
            }
            if let Some(info) = self.channels.get_mut(&channel) {
                info.owned_endpoints.insert(name);
            }
        }

        for row in stagepoints {
            let distance = row.distance.saturating_add(1);
            let stage = Stagepoint::new(row.stage, row.endpoint);
            let replace = match self.stagepoints.get(&stage) {
                None => true,
                Some(existing) => distance < existing.distance || existing.channel == channel,
            };
            if !replace {
                continue;
            }
            let incoming = AvailableStagepoint {
                node_id: row.node_id,
                distance,
                channel,
            };
            if let Some(prev) = self.stagepoints.insert(stage.clone(), incoming) {
                if prev.channel != channel {
                    self.detach_stagepoint_owner(prev.channel, &stage);
                }
            }
            if let Some(info) = self.channels.get_mut(&channel) {
                info.owned_stagepoints.insert(stage);
            }
        }
    }

    /// Remove every row a closing channel owned, then drop its bookkeeping.
    pub fn delete_channel(&mut self, channel: ChannelId) {
        if let Some(info) = self.channels.remove(&channel) {
            info!(
                %channel,
                endpoints = info.owned_endpoints.len(),
                stagepoints = info.owned_stagepoints.len(),
                "dropping topology owned by closed channel"
            );
            for name in info.owned_endpoints {
                self.endpoints.remove(&name);
            }
            for stage in info.owned_stagepoints {
                self.stagepoints.remove(&stage);
            }
        }
    }

    /// Immutable snapshot of both tables, in wire-row form, for forwarding
    /// decisions and for re-advertising to neighbors.
    pub fn snapshot(&self) -> SyncTables {
        SyncTables {
            endpoints: self
                .endpoints
                .iter()
                .map(|(name, row)| EndpointRow {
                    name: name.clone(),
                    node_id: row.node_id.clone(),
                    distance: row.distance,
                    stage_chain: row.chain.stages().to_vec(),
                })
                .collect(),
            stagepoints: self
                .stagepoints
                .iter()
                .map(|(stage, row)| StagepointRow {
                    stage: stage.stage().to_string(),
                    endpoint: stage.endpoint().clone(),
                    node_id: row.node_id.clone(),
                    distance: row.distance,
                })
                .collect(),
        }
    }

    /// The channel that owns a stagepoint, when it is remote.
    ///
    /// Terminal stagepoints resolve through the endpoint table. Locally
    /// hosted names yield `None`: there is no hop to take.
    pub fn resolve_next_hop(&self, stage: &Stagepoint) -> Option<ChannelId> {
        let channel = if stage.is_endpoint() {
            self.endpoints.get(stage.endpoint())?.channel
        } else {
            self.stagepoints.get(stage)?.channel
        };
        (!channel.is_local()).then_some(channel)
    }

    /// The stage chain advertised for an endpoint, if known.
    pub fn chain_of(&self, name: &EndpointName) -> Option<&StageChain> {
        self.endpoints.get(name).map(|row| &row.chain)
    }

    /// Next stagepoint a message must visit, given its origin and
    /// destination endpoints and its current stage. Unknown endpoints are
    /// treated as having no intermediate stages.
    pub fn advance(
        &self,
        from: &EndpointName,
        to: &EndpointName,
        current: &Stagepoint,
    ) -> Option<Stagepoint> {
        let from_chain = self
            .chain_of(from)
            .cloned()
            .unwrap_or_else(|| StageChain::direct(from.clone()));
        let to_chain = self
            .chain_of(to)
            .cloned()
            .unwrap_or_else(|| StageChain::direct(to.clone()));
        routing::advance(&from_chain, &to_chain, current)
    }

    pub fn endpoint(&self, name: &EndpointName) -> Option<&AvailableEndpoint> {
        self.endpoints.get(name)
    }

    pub fn stagepoint(&self, stage: &Stagepoint) -> Option<&AvailableStagepoint> {
        self.stagepoints.get(stage)
    }

    pub fn channel_info(&self, channel: ChannelId) -> Option<&ChannelInfo> {
        self.channels.get(&channel)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (&EndpointName, &AvailableEndpoint)> {
        self.endpoints.iter()
    }

    pub fn stagepoints(&self) -> impl Iterator<Item = (&Stagepoint, &AvailableStagepoint)> {
        self.stagepoints.iter()
    }

    pub fn channels(&self) -> impl Iterator<Item = (&ChannelId, &ChannelInfo)> {
        self.channels.iter()
    }

    fn detach_endpoint_owner(&mut self, channel: ChannelId, name: &EndpointName) {
        if channel.is_local() {
            return;
        }
        if let Some(info) = self.channels.get_mut(&channel) {
            info.owned_endpoints.remove(name);
        }
    }

    fn detach_stagepoint_owner(&mut self, channel: ChannelId, stage: &Stagepoint) {
        if channel.is_local() {
            return;
        }
        if let Some(info) = self.channels.get_mut(&channel) {
            info.owned_stagepoints.remove(stage);
        }
    }
}

/// Lock-scoped access to the topology store.
///
/// This lock is acquired *after* the binding registry lock whenever both
/// are needed, and it is never held across a hand-off to a subscriber
/// callback; the forwarding loop takes it per lookup.
pub struct TopologyHandle {
    inner: RwLock<TopologyStore>,
}

impl TopologyHandle {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            inner: RwLock::new(TopologyStore::new(node_id)),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&TopologyStore) -> R) -> R {
        f(&self.inner.read())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut TopologyStore) -> R) -> R {
        f(&mut self.inner.write())
    }

    /// Plain read guard for call sites that want to hold the lock across a
    /// few related lookups. Not used while delivering to subscribers.
    pub fn read_guard(&self) -> RwLockReadGuard<'_, TopologyStore> {
        self.inner.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(n: &str) -> NodeId {
        NodeId::new(n)
    }

    fn ep_row(name: &str, origin: &str, distance: u32) -> EndpointRow {
        EndpointRow {
            name: name.into(),
            node_id: node(origin),
            distance,
            stage_chain: vec![],
        }
    }

    fn sp_row(stage: &str, endpoint: &str, origin: &str, distance: u32) -> StagepointRow {
        StagepointRow {
            stage: stage.into(),
            endpoint: endpoint.into(),
            node_id: node(origin),
            distance,
        }
    }

    /// Every row's owning channel must list the row's name in its owned
    /// set, and vice versa.
    fn assert_ownership_consistent(store: &TopologyStore) {
        for (name, row) in store.endpoints() {
            if row.channel.is_local() {
                continue;
            }
            let info = store.channel_info(row.channel).expect("owner info");
            assert!(info.owned_endpoints.contains(name), "row without owner");
        }
        for (stage, row) in store.stagepoints() {
            if row.channel.is_local() {
                continue;
            }
            let info = store.channel_info(row.channel).expect("owner info");
            assert!(info.owned_stagepoints.contains(stage), "row without owner");
        }
        for (channel, info) in store.channels() {
            for name in &info.owned_endpoints {
                let row = store.endpoint(name).expect("owned set points at row");
                assert_eq!(row.channel, *channel, "stale owned-set entry");
            }
            for stage in &info.owned_stagepoints {
                let row = store.stagepoint(stage).expect("owned set points at row");
                assert_eq!(row.channel, *channel, "stale owned-set entry");
            }
        }
    }

    #[test]
    fn local_rows_have_distance_zero_and_local_owner() {
        let mut store = TopologyStore::new(node("a"));
        store
            .add_local_endpoint(StageChain::direct("quotes"))
            .unwrap();
        let row = store.endpoint(&"quotes".into()).unwrap();
        assert_eq!(row.distance, 0);
        assert!(row.channel.is_local());
    }

    #[test]
    fn duplicate_local_entry_fails() {
        let mut store = TopologyStore::new(node("a"));
        store
            .add_local_endpoint(StageChain::direct("quotes"))
            .unwrap();
        let err = store
            .add_local_endpoint(StageChain::direct("quotes"))
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateLocalEntry { .. }));
    }

    #[test]
    fn merge_adds_one_hop() {
        let mut store = TopologyStore::new(node("a"));
        let ch = ChannelId::next();
        store.update_channel(ch, node("b"), vec![ep_row("quotes", "b", 0)], vec![]);
        assert_eq!(store.endpoint(&"quotes".into()).unwrap().distance, 1);
        assert_ownership_consistent(&store);
    }

    #[test]
    fn strictly_shorter_distance_wins_across_channels() {
        let mut store = TopologyStore::new(node("a"));
        let far = ChannelId::next();
        let near = ChannelId::next();
        store.update_channel(far, node("c"), vec![ep_row("quotes", "z", 3)], vec![]);
        store.update_channel(near, node("b"), vec![ep_row("quotes", "z", 1)], vec![]);

        let row = store.endpoint(&"quotes".into()).unwrap();
        assert_eq!(row.distance, 2);
        assert_eq!(row.channel, near);
        assert_ownership_consistent(&store);
    }

    #[test]
    fn longer_path_does_not_displace_shorter_entry() {
        let mut store = TopologyStore::new(node("a"));
        let near = ChannelId::next();
        let far = ChannelId::next();
        store.update_channel(near, node("b"), vec![ep_row("quotes", "z", 1)], vec![]);
        store.update_channel(far, node("c"), vec![ep_row("quotes", "z", 3)], vec![]);

        let row = store.endpoint(&"quotes".into()).unwrap();
        assert_eq!(row.distance, 2);
        assert_eq!(row.channel, near);
        assert_ownership_consistent(&store);
    }

    #[test]
    fn equal_distance_from_other_channel_does_not_churn_ownership() {
        let mut store = TopologyStore::new(node("a"));
        let first = ChannelId::next();
        let second = ChannelId::next();
        store.update_channel(first, node("b"), vec![ep_row("quotes", "z", 2)], vec![]);
        store.update_channel(second, node("c"), vec![ep_row("quotes", "z", 2)], vec![]);

        assert_eq!(store.endpoint(&"quotes".into()).unwrap().channel, first);
        assert_ownership_consistent(&store);
    }

    #[test]
    fn owning_channel_refresh_supersedes_even_at_larger_distance() {
        let mut store = TopologyStore::new(node("a"));
        let ch = ChannelId::next();
        store.update_channel(ch, node("b"), vec![ep_row("quotes", "z", 1)], vec![]);
        // Same source, worse distance and new chain contents: still taken.
        store.update_channel(
            ch,
            node("b"),
            vec![EndpointRow {
                name: "quotes".into(),
                node_id: node("z"),
                distance: 4,
                stage_chain: vec!["validate".into()],
            }],
            vec![],
        );

        let row = store.endpoint(&"quotes".into()).unwrap();
        assert_eq!(row.distance, 5);
        assert_eq!(row.chain.stages(), ["validate".to_string()]);
        assert_ownership_consistent(&store);
    }

    #[test]
    fn local_row_never_loses_to_remote() {
        let mut store = TopologyStore::new(node("a"));
        store
            .add_local_endpoint(StageChain::direct("quotes"))
            .unwrap();
        let ch = ChannelId::next();
        store.update_channel(ch, node("b"), vec![ep_row("quotes", "b", 0)], vec![]);

        let row = store.endpoint(&"quotes".into()).unwrap();
        assert_eq!(row.distance, 0);
        assert!(row.channel.is_local());
        assert_ownership_consistent(&store);
    }

    #[test]
    fn absent_names_are_pruned_from_owner() {
        let mut store = TopologyStore::new(node("a"));
        let ch = ChannelId::next();
        store.update_channel(
            ch,
            node("b"),
            vec![ep_row("quotes", "b", 0), ep_row("orders", "b", 0)],
            vec![sp_row("validate", "quotes", "b", 0)],
        );
        // Next snapshot no longer mentions "orders" or the stagepoint.
        store.update_channel(ch, node("b"), vec![ep_row("quotes", "b", 0)], vec![]);

        assert!(store.endpoint(&"orders".into()).is_none());
        assert!(store
            .stagepoint(&Stagepoint::new("validate", "quotes"))
            .is_none());
        assert!(store.endpoint(&"quotes".into()).is_some());
        assert_ownership_consistent(&store);
    }

    #[test]
    fn replaying_a_snapshot_is_idempotent() {
        let mut store = TopologyStore::new(node("a"));
        let ch = ChannelId::next();
        let eps = vec![ep_row("quotes", "b", 1), ep_row("orders", "c", 2)];
        let sps = vec![sp_row("validate", "quotes", "b", 1)];

        store.update_channel(ch, node("b"), eps.clone(), sps.clone());
        let first = store.snapshot();
        store.update_channel(ch, node("b"), eps, sps);
        let second = store.snapshot();

        let sort = |mut t: SyncTables| {
            t.endpoints.sort_by(|a, b| a.name.cmp(&b.name));
            t.stagepoints.sort_by(|a, b| a.stage.cmp(&b.stage));
            t
        };
        assert_eq!(sort(first), sort(second));
        assert_ownership_consistent(&store);
    }

    #[test]
    fn delete_channel_removes_only_its_rows() {
        let mut store = TopologyStore::new(node("a"));
        let doomed = ChannelId::next();
        let survivor = ChannelId::next();
        store.update_channel(
            doomed,
            node("b"),
            vec![ep_row("ep1", "b", 0)],
            vec![sp_row("sp1", "ep1", "b", 0)],
        );
        store.update_channel(survivor, node("c"), vec![ep_row("ep2", "c", 0)], vec![]);

        store.delete_channel(doomed);

        assert!(store.endpoint(&"ep1".into()).is_none());
        assert!(store.resolve_next_hop(&Stagepoint::new("sp1", "ep1")).is_none());
        assert_eq!(store.endpoint(&"ep2".into()).unwrap().channel, survivor);
        assert!(store.channel_info(doomed).is_none());
        assert_ownership_consistent(&store);
    }

    #[test]
    fn resolve_next_hop_uses_endpoint_table_for_terminals() {
        let mut store = TopologyStore::new(node("a"));
        let ch = ChannelId::next();
        store.update_channel(ch, node("b"), vec![ep_row("quotes", "b", 0)], vec![]);

        assert_eq!(
            store.resolve_next_hop(&Stagepoint::terminal("quotes")),
            Some(ch)
        );
    }

    #[test]
    fn local_rows_resolve_to_no_hop() {
        let mut store = TopologyStore::new(node("a"));
        store
            .add_local_endpoint(StageChain::direct("quotes"))
            .unwrap();
        assert_eq!(store.resolve_next_hop(&Stagepoint::terminal("quotes")), None);
    }

    proptest! {
        /// Arbitrary interleavings of snapshots from three channels keep the
        /// owned-sets and tables mutually consistent, with each name owned
        /// by exactly one channel.
        #[test]
        fn ownership_stays_exclusive(
            updates in proptest::collection::vec(
                (0usize..3, proptest::collection::vec((0usize..5, 0u32..4), 0..5)),
                1..20,
            )
        ) {
            let names = ["e0", "e1", "e2", "e3", "e4"];
            let mut store = TopologyStore::new(node("a"));
            let channels = [ChannelId::next(), ChannelId::next(), ChannelId::next()];
            let peers = [node("p0"), node("p1"), node("p2")];

            for (ch_idx, rows) in updates {
                let eps: Vec<EndpointRow> = rows
                    .iter()
                    .map(|(n, d)| ep_row(names[*n], "origin", *d))
                    .collect();
                // A name may appear twice in one snapshot; that is fine, the
                // merge just runs twice with the same channel.
                store.update_channel(channels[ch_idx], peers[ch_idx].clone(), eps, vec![]);
                assert_ownership_consistent(&store);
            }
        }
    }
}
