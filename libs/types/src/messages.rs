//! Wire Protocol Records
//!
//! The message kinds two neighboring nodes exchange over a channel. Each
//! record is a plain serde struct; on the wire a record travels inside a
//! framed packet, prefixed by its request id (see `codec::record`).
//!
//! Request/response pairs: `Handshake`/`HandshakeResp` establish peer
//! identity and compression, `SyncTables`/`SyncTablesResp` carry topology
//! snapshots, `SendMsg`/`SendMsgResp` carry application payloads, and
//! `Ping`/`PingResp` probe liveness.

use crate::identifiers::{EndpointName, NodeId};
use serde::{Deserialize, Serialize};

/// Compression algorithm negotiable during the channel handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    /// LZ4 block compression - fast, moderate ratio
    Lz4,
    /// Snappy - fast, slightly different trade-off
    Snappy,
}

/// Handshake request: the initiating side introduces itself and may offer
/// a compression algorithm if its local policy allows one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: NodeId,
    pub offered_compression: Option<Compression>,
}

/// Handshake response: the accepting side introduces itself and names the
/// algorithm both sides agreed on, or `None` to stay uncompressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResp {
    pub node_id: NodeId,
    pub chosen_compression: Option<Compression>,
}

/// One endpoint row of a topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRow {
    pub name: EndpointName,
    pub node_id: NodeId,
    pub distance: u32,
    pub stage_chain: Vec<String>,
}

/// One stagepoint row of a topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagepointRow {
    pub stage: String,
    pub endpoint: EndpointName,
    pub node_id: NodeId,
    pub distance: u32,
}

/// Periodic topology exchange: the sender's full view of reachable
/// endpoints and stagepoints, with the sender's own stored distances.
/// The receiver adds one hop while merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncTables {
    pub endpoints: Vec<EndpointRow>,
    pub stagepoints: Vec<StagepointRow>,
}

/// Acknowledgement of a `SyncTables` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncTablesResp {}

/// An application message in transit between nodes.
///
/// `stage`/`endpoint` name the stagepoint the message must visit next on
/// the receiving node; `payload_type` tags the serialized payload so typed
/// subscribers can decode it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMsg {
    pub from: EndpointName,
    pub to: EndpointName,
    pub stage: String,
    pub endpoint: EndpointName,
    pub payload_type: String,
    pub payload: Vec<u8>,
}

/// Delivery acknowledgement for a `SendMsg` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMsgResp {
    pub code: u32,
    pub text: String,
}

impl SendMsgResp {
    pub fn ok() -> Self {
        Self {
            code: 0,
            text: String::new(),
        }
    }
}

/// Liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ping {}

/// Liveness probe reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PingResp {}

/// A decoded protocol message, discriminated by the request id that leads
/// the packet body.
///
/// `Unknown` marks a well-formed packet whose request id this layer does
/// not recognize; the channel state machine ignores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Handshake(Handshake),
    HandshakeResp(HandshakeResp),
    SyncTables(SyncTables),
    SyncTablesResp(SyncTablesResp),
    SendMsg(SendMsg),
    SendMsgResp(SendMsgResp),
    Ping(Ping),
    PingResp(PingResp),
    Unknown { request_id: u32 },
}

/// Request ids as they appear on the wire.
pub mod request_id {
    pub const HANDSHAKE: u32 = 1;
    pub const HANDSHAKE_RESP: u32 = 2;
    pub const SYNC_TABLES: u32 = 3;
    pub const SYNC_TABLES_RESP: u32 = 4;
    pub const SEND_MSG: u32 = 5;
    pub const SEND_MSG_RESP: u32 = 6;
    pub const PING: u32 = 7;
    pub const PING_RESP: u32 = 8;
}

impl WireMessage {
    /// The request id used to encode this message.
    pub fn request_id(&self) -> u32 {
        match self {
            WireMessage::Handshake(_) => request_id::HANDSHAKE,
            WireMessage::HandshakeResp(_) => request_id::HANDSHAKE_RESP,
            WireMessage::SyncTables(_) => request_id::SYNC_TABLES,
            WireMessage::SyncTablesResp(_) => request_id::SYNC_TABLES_RESP,
            WireMessage::SendMsg(_) => request_id::SEND_MSG,
            WireMessage::SendMsgResp(_) => request_id::SEND_MSG_RESP,
            WireMessage::Ping(_) => request_id::PING,
            WireMessage::PingResp(_) => request_id::PING_RESP,
            WireMessage::Unknown { request_id } => *request_id,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            WireMessage::Handshake(_) => "Handshake",
            WireMessage::HandshakeResp(_) => "HandshakeResp",
            WireMessage::SyncTables(_) => "SyncTables",
            WireMessage::SyncTablesResp(_) => "SyncTablesResp",
            WireMessage::SendMsg(_) => "SendMsg",
            WireMessage::SendMsgResp(_) => "SendMsgResp",
            WireMessage::Ping(_) => "Ping",
            WireMessage::PingResp(_) => "PingResp",
            WireMessage::Unknown { .. } => "Unknown",
        }
    }
}
