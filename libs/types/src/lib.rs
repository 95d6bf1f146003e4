//! Stagewire Type System
//!
//! Pure data definitions shared by every Stagewire crate: the identifier
//! value types that name endpoints, stagepoints and channels, and the wire
//! protocol records exchanged between neighboring nodes.
//!
//! This crate deliberately contains no behavior beyond construction,
//! equality/ordering and serialization. Protocol encoding rules live in
//! `codec`; routing and channel state live in `network`.

pub mod identifiers;
pub mod messages;

pub use identifiers::{ChannelId, EndpointName, NodeId, StageChain, Stagepoint};
pub use messages::{
    Compression, EndpointRow, Handshake, HandshakeResp, Ping, PingResp, SendMsg, SendMsgResp,
    StagepointRow, SyncTables, SyncTablesResp, WireMessage,
};
