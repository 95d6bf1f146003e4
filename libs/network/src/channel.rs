//! Channel Protocol State Machine
//!
//! One [`Channel`] per physical link to a neighbor node. The channel owns
//! the byte stream, runs the handshake, frames and unframes protocol
//! records, merges inbound topology snapshots, and tracks liveness.
//!
//! Framing is transactional: a frame is consumed from the stream only once
//! header *and* body are fully present, so a pump interrupted by a partial
//! frame leaves the stream exactly as it found it. Header and body are
//! written as two writes so the transport can coalesce or split as it
//! pleases.
//!
//! Handshake frames always travel uncompressed; the negotiated transform
//! takes effect from the first post-handshake frame, and its magic value
//! is checked on every inbound header from then on.
//!
//! Write failures are logged, not escalated: a link that cannot be written
//! usually cannot be read either, and the liveness sweep reaps it within
//! one timeout.

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::topology::TopologyHandle;
use crate::transport::ByteChannel;
use codec::{FrameHeader, PayloadTransform, HEADER_SIZE};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use types::messages::{
    Compression, Handshake, HandshakeResp, Ping, PingResp, SendMsg, SendMsgResp, SyncTablesResp,
    WireMessage,
};
use types::{ChannelId, NodeId};

/// Which side of the link we are. Both sides run the same state machine;
/// the role only decides who is *expected* to send the first handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Initiator,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingHandshake,
    Handshaked,
}

/// The slice of [`BusConfig`] a channel needs.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub node_id: NodeId,
    pub offered_compression: Option<Compression>,
    pub allowed_compression: Vec<Compression>,
    pub max_body_bytes: usize,
}

impl ChannelSettings {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            node_id: NodeId::new(config.node_id.clone()),
            offered_compression: config.offered_compression,
            allowed_compression: config.allowed_compression.clone(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// Protocol state for one link.
pub struct Channel {
    id: ChannelId,
    role: ChannelRole,
    state: HandshakeState,
    /// Whether we already sent our `Handshake`. Normally the initiator's
    /// doing, but an acceptor may open the conversation too and the peer
    /// answers all the same.
    initiated: bool,
    peer: Option<NodeId>,
    transform: PayloadTransform,
    io: Box<dyn ByteChannel>,
    last_rx: Instant,
    settings: ChannelSettings,
}

impl Channel {
    pub fn new(role: ChannelRole, io: Box<dyn ByteChannel>, settings: ChannelSettings) -> Self {
        Self {
            id: ChannelId::next(),
            role,
            state: HandshakeState::AwaitingHandshake,
            initiated: false,
            peer: None,
            transform: PayloadTransform::identity(),
            io,
            last_rx: Instant::now(),
            settings,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn peer(&self) -> Option<&NodeId> {
        self.peer.as_ref()
    }

    pub fn is_handshaked(&self) -> bool {
        self.state == HandshakeState::Handshaked
    }

    pub fn compression(&self) -> Option<Compression> {
        self.transform.algorithm()
    }

    pub fn is_inactive(&self, timeout: Duration) -> bool {
        self.last_rx.elapsed() > timeout
    }

    fn idle_for(&self) -> Duration {
        self.last_rx.elapsed()
    }

    /// Open the conversation: introduce ourselves and offer compression.
    pub fn start_handshake(&mut self) {
        let offer = self.settings.offered_compression;
        self.initiated = true;
        self.send_logged(&WireMessage::Handshake(Handshake {
            node_id: self.settings.node_id.clone(),
            offered_compression: offer,
        }));
    }

    /// Drain every complete frame currently buffered on the stream.
    ///
    /// Protocol replies (handshake responses, acks, pongs) go out inline;
    /// topology snapshots are merged inline. Application messages are
    /// returned so the caller can route them after this channel's lock is
    /// released - routing may need to deliver locally or write to *other*
    /// channels.
    ///
    /// An error here means the peer broke the protocol and the channel
    /// must be torn down.
    pub fn pump(&mut self, topology: &TopologyHandle) -> Result<Vec<SendMsg>> {
        let mut inbound = Vec::new();
        loop {
            let mut head = [0u8; HEADER_SIZE];
            if self.io.peek(&mut head) < HEADER_SIZE {
                break;
            }
            let Some(header) = FrameHeader::parse(&head) else {
                break;
            };
            if header.magic != self.transform.magic() {
                return Err(BusError::protocol(format!(
                    "unexpected frame magic {:#010x} on channel {}",
                    header.magic, self.id
                )));
            }
            let body_len = header.body_len as usize;
            if body_len > self.settings.max_body_bytes {
                return Err(BusError::protocol(format!(
                    "frame body of {body_len} bytes exceeds limit on channel {}",
                    self.id
                )));
            }
            let total = HEADER_SIZE + body_len;
            if self.io.readable() < total {
                // Partial frame: leave the stream untouched for next time.
                break;
            }
            let mut frame = vec![0u8; total];
            if self.io.peek(&mut frame) < total {
                break;
            }
            self.io.consume(total);
            self.last_rx = Instant::now();

            let body = self.transform.decode(&frame[HEADER_SIZE..])?;
            let msg = codec::decode_message(&body)?;
            self.handle(msg, topology, &mut inbound)?;
        }
        Ok(inbound)
    }

    fn handle(
        &mut self,
        msg: WireMessage,
        topology: &TopologyHandle,
        inbound: &mut Vec<SendMsg>,
    ) -> Result<()> {
        match msg {
            WireMessage::Handshake(hs) if self.state == HandshakeState::AwaitingHandshake => {
                let chosen = hs
                    .offered_compression
                    .filter(|c| self.settings.allowed_compression.contains(c));
                info!(
                    channel = %self.id,
                    peer = %hs.node_id,
                    ?chosen,
                    "handshake accepted"
                );
                self.peer = Some(hs.node_id);
                // The response still travels uncompressed; everything after
                // it uses the negotiated transform.
                self.send_logged(&WireMessage::HandshakeResp(HandshakeResp {
                    node_id: self.settings.node_id.clone(),
                    chosen_compression: chosen,
                }));
                self.transform = PayloadTransform::new(chosen);
                self.state = HandshakeState::Handshaked;
                self.send_sync(topology);
                Ok(())
            }
            WireMessage::HandshakeResp(resp)
                if self.state == HandshakeState::AwaitingHandshake && self.initiated =>
            {
                if let Some(chosen) = resp.chosen_compression {
                    if self.settings.offered_compression != Some(chosen) {
                        return Err(BusError::protocol(format!(
                            "peer chose {chosen:?} which was never offered on channel {}",
                            self.id
                        )));
                    }
                }
                info!(
                    channel = %self.id,
                    peer = %resp.node_id,
                    chosen = ?resp.chosen_compression,
                    "handshake completed"
                );
                self.peer = Some(resp.node_id);
                self.transform = PayloadTransform::new(resp.chosen_compression);
                self.state = HandshakeState::Handshaked;
                self.send_sync(topology);
                Ok(())
            }
            WireMessage::SyncTables(tables) if self.is_handshaked() => {
                let Some(peer) = self.peer.clone() else {
                    return Ok(());
                };
                topology.write(|store| {
                    store.update_channel(self.id, peer, tables.endpoints, tables.stagepoints)
                });
                self.send_logged(&WireMessage::SyncTablesResp(SyncTablesResp::default()));
                Ok(())
            }
            WireMessage::SendMsg(msg) if self.is_handshaked() => {
                self.send_logged(&WireMessage::SendMsgResp(SendMsgResp::ok()));
                inbound.push(msg);
                Ok(())
            }
            WireMessage::SendMsgResp(resp) => {
                if resp.code != 0 {
                    warn!(channel = %self.id, code = resp.code, text = %resp.text, "peer reported delivery failure");
                }
                Ok(())
            }
            WireMessage::Ping(_) if self.is_handshaked() => {
                self.send_logged(&WireMessage::PingResp(PingResp::default()));
                Ok(())
            }
            WireMessage::PingResp(_) | WireMessage::SyncTablesResp(_) => Ok(()),
            WireMessage::Unknown { request_id } => {
                debug!(channel = %self.id, request_id, "ignoring unrecognized request id");
                Ok(())
            }
            // Anything else is legal wire data arriving in the wrong state:
            // dropped, the channel stays up.
            other => {
                warn!(
                    channel = %self.id,
                    kind = other.kind_name(),
                    state = ?self.state,
                    "ignoring message illegal in current state"
                );
                Ok(())
            }
        }
    }

    /// Frame and write one protocol message.
    pub fn send(&mut self, msg: &WireMessage) -> Result<()> {
        let record = codec::encode_message(msg)?;
        let body = self.transform.encode(&record)?;
        let header = FrameHeader::new(self.transform.magic(), body.len() as u32);
        self.io.write(&header.encode()).map_err(|e| BusError::io(&e))?;
        self.io.write(&body).map_err(|e| BusError::io(&e))?;
        Ok(())
    }

    fn send_logged(&mut self, msg: &WireMessage) {
        let kind = msg.kind_name();
        if let Err(err) = self.send(msg) {
            warn!(channel = %self.id, kind, error = %err, "channel write failed");
        }
    }

    fn send_sync(&mut self, topology: &TopologyHandle) {
        let snapshot = topology.read(|store| store.snapshot());
        self.send_logged(&WireMessage::SyncTables(snapshot));
    }
}

/// All live channels of one node.
///
/// Channels sit behind `Arc<Mutex<..>>` so a caller can clone a handle out
/// of the map and drop the map shard before locking; nothing ever locks a
/// channel while holding a shard guard.
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, Arc<Mutex<Channel>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn insert(&self, channel: Channel) -> ChannelId {
        let id = channel.id();
        self.channels.insert(id, Arc::new(Mutex::new(channel)));
        id
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<Mutex<Channel>>> {
        self.channels.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// Tear a channel down and drop every topology row it owned.
    pub fn remove(&self, id: ChannelId, topology: &TopologyHandle) {
        if self.channels.remove(&id).is_some() {
            topology.write(|store| store.delete_channel(id));
            info!(channel = %id, "channel removed");
        }
    }

    pub fn close_all(&self, topology: &TopologyHandle) {
        let ids: Vec<ChannelId> = self.channels.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.remove(id, topology);
        }
    }

    /// Push the current topology snapshot to every handshaked neighbor.
    /// The snapshot is taken once, before any channel lock is held.
    pub fn broadcast_sync(&self, topology: &TopologyHandle) {
        let snapshot = topology.read(|store| store.snapshot());
        let handles: Vec<Arc<Mutex<Channel>>> =
            self.channels.iter().map(|entry| Arc::clone(&entry)).collect();
        for handle in handles {
            let mut channel = handle.lock();
            if channel.is_handshaked() {
                channel.send_logged(&WireMessage::SyncTables(snapshot.clone()));
            }
        }
    }

    /// Reap channels that have been silent past `timeout`; probe handshaked
    /// channels that are more than halfway there. Returns the reaped ids.
    pub fn check_liveness(&self, topology: &TopologyHandle, timeout: Duration) -> Vec<ChannelId> {
        let handles: Vec<(ChannelId, Arc<Mutex<Channel>>)> = self
            .channels
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(&entry)))
            .collect();
        let mut dead = Vec::new();
        for (id, handle) in handles {
            let mut channel = handle.lock();
            if channel.is_inactive(timeout) {
                dead.push(id);
            } else if channel.is_handshaked() && channel.idle_for() > timeout / 2 {
                channel.send_logged(&WireMessage::Ping(Ping::default()));
            }
        }
        for id in &dead {
            warn!(channel = %id, "channel silent past liveness timeout, closing");
            self.remove(*id, topology);
        }
        dead
    }

    /// Hand an application message to a specific channel. A vanished
    /// channel means topology churn won the race; the message is dropped.
    pub fn send_data(&self, id: ChannelId, msg: SendMsg) {
        match self.get(id) {
            Some(handle) => {
                handle.lock().send_logged(&WireMessage::SendMsg(msg));
            }
            None => {
                warn!(channel = %id, "channel gone before forward, dropping message");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryChannel;
    use codec::transform::MAGIC_IDENTITY;
    use types::messages::{EndpointRow, SyncTables};
    use types::EndpointName;

    fn settings(node: &str, offered: Option<Compression>) -> ChannelSettings {
        ChannelSettings {
            node_id: NodeId::new(node),
            offered_compression: offered,
            allowed_compression: vec![Compression::Lz4, Compression::Snappy],
            max_body_bytes: 1 << 20,
        }
    }

    fn topo(node: &str) -> TopologyHandle {
        TopologyHandle::new(NodeId::new(node))
    }

    /// An identity-transform frame, as a raw byte sequence.
    fn raw_frame(msg: &WireMessage) -> Vec<u8> {
        let record = codec::encode_message(msg).unwrap();
        let mut out = FrameHeader::new(MAGIC_IDENTITY, record.len() as u32)
            .encode()
            .to_vec();
        out.extend_from_slice(&record);
        out
    }

    fn linked_pair(
        left_offer: Option<Compression>,
    ) -> (Channel, Channel, TopologyHandle, TopologyHandle) {
        let (a, b) = MemoryChannel::pair();
        let left = Channel::new(ChannelRole::Initiator, Box::new(a), settings("left", left_offer));
        let right = Channel::new(ChannelRole::Acceptor, Box::new(b), settings("right", None));
        (left, right, topo("left"), topo("right"))
    }

    #[test]
    fn handshake_completes_and_negotiates_compression() {
        let (mut left, mut right, topo_l, topo_r) = linked_pair(Some(Compression::Lz4));

        left.start_handshake();
        right.pump(&topo_r).unwrap();
        left.pump(&topo_l).unwrap();

        assert!(left.is_handshaked());
        assert!(right.is_handshaked());
        assert_eq!(left.peer().unwrap().as_str(), "right");
        assert_eq!(right.peer().unwrap().as_str(), "left");
        assert_eq!(left.compression(), Some(Compression::Lz4));
        assert_eq!(right.compression(), Some(Compression::Lz4));
    }

    #[test]
    fn acceptor_refuses_offer_outside_its_allowed_list() {
        let (a, b) = MemoryChannel::pair();
        let mut left = Channel::new(
            ChannelRole::Initiator,
            Box::new(a),
            settings("left", Some(Compression::Lz4)),
        );
        let mut acceptor_settings = settings("right", None);
        acceptor_settings.allowed_compression = vec![Compression::Snappy];
        let mut right = Channel::new(ChannelRole::Acceptor, Box::new(b), acceptor_settings);

        left.start_handshake();
        right.pump(&topo("right")).unwrap();
        left.pump(&topo("left")).unwrap();

        assert!(left.is_handshaked());
        assert_eq!(left.compression(), None);
        assert_eq!(right.compression(), None);
    }

    #[test]
    fn initiator_rejects_compression_it_never_offered() {
        let (a, b) = MemoryChannel::pair();
        let mut left = Channel::new(ChannelRole::Initiator, Box::new(a), settings("left", None));
        let mut injector = b;

        left.start_handshake();
        let resp = WireMessage::HandshakeResp(HandshakeResp {
            node_id: NodeId::new("right"),
            chosen_compression: Some(Compression::Lz4),
        });
        injector.write(&raw_frame(&resp)).unwrap();

        let err = left.pump(&topo("left")).unwrap_err();
        assert!(matches!(err, BusError::Protocol { .. }));
    }

    #[test]
    fn partial_frame_leaves_stream_untouched() {
        let (a, b) = MemoryChannel::pair();
        let mut right = Channel::new(ChannelRole::Acceptor, Box::new(b), settings("right", None));
        let mut injector = a;

        let frame = raw_frame(&WireMessage::Handshake(Handshake {
            node_id: NodeId::new("left"),
            offered_compression: None,
        }));
        // Everything but the last two bytes.
        injector.write(&frame[..frame.len() - 2]).unwrap();

        right.pump(&topo("right")).unwrap();
        assert!(!right.is_handshaked());

        injector.write(&frame[frame.len() - 2..]).unwrap();
        right.pump(&topo("right")).unwrap();
        assert!(right.is_handshaked());
    }

    #[test]
    fn bad_magic_is_a_protocol_error() {
        let (a, b) = MemoryChannel::pair();
        let mut right = Channel::new(ChannelRole::Acceptor, Box::new(b), settings("right", None));
        let mut injector = a;

        let mut frame = raw_frame(&WireMessage::Ping(Ping::default()));
        frame[0] ^= 0xFF;
        injector.write(&frame).unwrap();

        let err = right.pump(&topo("right")).unwrap_err();
        assert!(matches!(err, BusError::Protocol { .. }));
    }

    #[test]
    fn application_data_before_handshake_is_ignored() {
        let (a, b) = MemoryChannel::pair();
        let mut right = Channel::new(ChannelRole::Acceptor, Box::new(b), settings("right", None));
        let mut injector = a;

        let msg = WireMessage::SendMsg(SendMsg {
            from: EndpointName::new("src"),
            to: EndpointName::new("dst"),
            stage: "dst".into(),
            endpoint: EndpointName::new("dst"),
            payload_type: "quote".into(),
            payload: vec![1, 2, 3],
        });
        injector.write(&raw_frame(&msg)).unwrap();

        let inbound = right.pump(&topo("right")).unwrap();
        assert!(inbound.is_empty());
        assert!(!right.is_handshaked());
    }

    #[test]
    fn ping_before_handshake_draws_no_reply() {
        let (a, b) = MemoryChannel::pair();
        let mut right = Channel::new(ChannelRole::Acceptor, Box::new(b), settings("right", None));
        let mut injector = a;

        injector.write(&raw_frame(&WireMessage::Ping(Ping::default()))).unwrap();

        right.pump(&topo("right")).unwrap();
        assert_eq!(injector.readable(), 0);
        assert!(!right.is_handshaked());
    }

    #[test]
    fn sync_tables_merge_with_one_added_hop() {
        let (mut left, mut right, topo_l, topo_r) = linked_pair(None);
        left.start_handshake();
        right.pump(&topo_r).unwrap();
        left.pump(&topo_l).unwrap();
        // Drain the handshake-time snapshots.
        right.pump(&topo_r).unwrap();
        left.pump(&topo_l).unwrap();

        left.send(&WireMessage::SyncTables(SyncTables {
            endpoints: vec![EndpointRow {
                name: "quotes".into(),
                node_id: NodeId::new("left"),
                distance: 0,
                stage_chain: vec![],
            }],
            stagepoints: vec![],
        }))
        .unwrap();
        right.pump(&topo_r).unwrap();

        topo_r.read(|store| {
            let row = store.endpoint(&"quotes".into()).unwrap();
            assert_eq!(row.distance, 1);
            assert_eq!(row.channel, right.id());
        });
    }

    #[test]
    fn handshaked_channels_exchange_application_data() {
        let (mut left, mut right, topo_l, topo_r) = linked_pair(Some(Compression::Snappy));
        left.start_handshake();
        right.pump(&topo_r).unwrap();
        left.pump(&topo_l).unwrap();
        right.pump(&topo_r).unwrap();

        let wire = SendMsg {
            from: EndpointName::new("src"),
            to: EndpointName::new("dst"),
            stage: "dst".into(),
            endpoint: EndpointName::new("dst"),
            payload_type: "quote".into(),
            payload: vec![9, 9, 9],
        };
        left.send(&WireMessage::SendMsg(wire.clone())).unwrap();

        let inbound = right.pump(&topo_r).unwrap();
        assert_eq!(inbound, vec![wire]);
        // The ack comes back compressed and parses cleanly.
        left.pump(&topo_l).unwrap();
    }

    #[test]
    fn registry_remove_drops_owned_topology() {
        let (a, _b) = MemoryChannel::pair();
        let registry = ChannelRegistry::new();
        let topo = topo("node");
        let channel = Channel::new(ChannelRole::Acceptor, Box::new(a), settings("node", None));
        let id = registry.insert(channel);

        topo.write(|store| {
            store.update_channel(
                id,
                NodeId::new("peer"),
                vec![EndpointRow {
                    name: "quotes".into(),
                    node_id: NodeId::new("peer"),
                    distance: 0,
                    stage_chain: vec![],
                }],
                vec![],
            )
        });

        registry.remove(id, &topo);
        assert!(registry.get(id).is_none());
        topo.read(|store| assert!(store.endpoint(&"quotes".into()).is_none()));
    }

    #[test]
    fn write_failure_does_not_kill_the_pump() {
        let (a, b) = MemoryChannel::pair();
        b.fail_writes(true);
        let mut right = Channel::new(ChannelRole::Acceptor, Box::new(b), settings("right", None));
        let mut injector = a;

        let frame = raw_frame(&WireMessage::Handshake(Handshake {
            node_id: NodeId::new("left"),
            offered_compression: None,
        }));
        injector.write(&frame).unwrap();

        // The response and snapshot writes fail; the handshake state still
        // advances and the error stays local.
        right.pump(&topo("right")).unwrap();
        assert!(right.is_handshaked());
    }
}
