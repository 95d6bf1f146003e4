//! Record Encoding
//!
//! A packet body is a `u32` request id (little-endian) followed by the
//! bincode encoding of the corresponding record. A body whose request id
//! this layer does not recognize decodes to [`WireMessage::Unknown`] so the
//! channel state machine can ignore it instead of tearing the channel down.
//!
//! The same bincode configuration also serializes application payloads via
//! [`encode_payload`]/[`decode_payload`]; typed subscribers go through these
//! so the payload format matches what travels inside `SendMsg` records.

use crate::error::{CodecError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;
use types::messages::{request_id, WireMessage};

/// Encode one protocol message into a packet body.
///
/// `Unknown` is a decode-side marker only and cannot be encoded.
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>> {
    let record = match msg {
        WireMessage::Handshake(m) => encode_record(m),
        WireMessage::HandshakeResp(m) => encode_record(m),
        WireMessage::SyncTables(m) => encode_record(m),
        WireMessage::SyncTablesResp(m) => encode_record(m),
        WireMessage::SendMsg(m) => encode_record(m),
        WireMessage::SendMsgResp(m) => encode_record(m),
        WireMessage::Ping(m) => encode_record(m),
        WireMessage::PingResp(m) => encode_record(m),
        WireMessage::Unknown { request_id } => {
            return Err(CodecError::record_encode(format!(
                "cannot encode unknown request id {request_id}"
            )))
        }
    }?;

    let mut body = Vec::with_capacity(4 + record.len());
    let mut id = [0u8; 4];
    LittleEndian::write_u32(&mut id, msg.request_id());
    body.extend_from_slice(&id);
    body.extend_from_slice(&record);
    Ok(body)
}

/// Decode one packet body into a protocol message.
pub fn decode_message(body: &[u8]) -> Result<WireMessage> {
    if body.len() < 4 {
        return Err(CodecError::record_decode(format!(
            "body too short for request id: {} bytes",
            body.len()
        )));
    }
    let id = LittleEndian::read_u32(&body[0..4]);
    let record = &body[4..];

    let msg = match id {
        request_id::HANDSHAKE => WireMessage::Handshake(decode_record(record)?),
        request_id::HANDSHAKE_RESP => WireMessage::HandshakeResp(decode_record(record)?),
        request_id::SYNC_TABLES => WireMessage::SyncTables(decode_record(record)?),
        request_id::SYNC_TABLES_RESP => WireMessage::SyncTablesResp(decode_record(record)?),
        request_id::SEND_MSG => WireMessage::SendMsg(decode_record(record)?),
        request_id::SEND_MSG_RESP => WireMessage::SendMsgResp(decode_record(record)?),
        request_id::PING => WireMessage::Ping(decode_record(record)?),
        request_id::PING_RESP => WireMessage::PingResp(decode_record(record)?),
        other => WireMessage::Unknown { request_id: other },
    };
    Ok(msg)
}

/// Serialize an application payload the way `SendMsg` carries it.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    encode_record(value)
}

/// Deserialize an application payload received inside a `SendMsg`.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    decode_record(bytes)
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| CodecError::record_encode(e.to_string()))
}

fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| CodecError::record_decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::messages::{
        Compression, EndpointRow, Handshake, HandshakeResp, Ping, PingResp, SendMsg, SendMsgResp,
        StagepointRow, SyncTables, SyncTablesResp,
    };
    use types::NodeId;

    fn sample_messages() -> Vec<WireMessage> {
        vec![
            WireMessage::Handshake(Handshake {
                node_id: NodeId::new("node-a"),
                offered_compression: Some(Compression::Lz4),
            }),
            WireMessage::HandshakeResp(HandshakeResp {
                node_id: NodeId::new("node-b"),
                chosen_compression: None,
            }),
            WireMessage::SyncTables(SyncTables {
                endpoints: vec![EndpointRow {
                    name: "quotes".into(),
                    node_id: NodeId::new("node-a"),
                    distance: 1,
                    stage_chain: vec!["validate".into(), "enrich".into()],
                }],
                stagepoints: vec![StagepointRow {
                    stage: "validate".into(),
                    endpoint: "quotes".into(),
                    node_id: NodeId::new("node-a"),
                    distance: 0,
                }],
            }),
            WireMessage::SyncTablesResp(SyncTablesResp::default()),
            WireMessage::SendMsg(SendMsg {
                from: "orders".into(),
                to: "quotes".into(),
                stage: "validate".into(),
                endpoint: "quotes".into(),
                payload_type: "demo.Quote".into(),
                payload: vec![1, 2, 3, 4],
            }),
            WireMessage::SendMsgResp(SendMsgResp::ok()),
            WireMessage::Ping(Ping::default()),
            WireMessage::PingResp(PingResp::default()),
        ]
    }

    #[test]
    fn every_message_kind_roundtrips() {
        for msg in sample_messages() {
            let body = encode_message(&msg).unwrap();
            let decoded = decode_message(&body).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn unknown_request_id_is_preserved_not_rejected() {
        let mut body = Vec::new();
        let mut id = [0u8; 4];
        LittleEndian::write_u32(&mut id, 999);
        body.extend_from_slice(&id);
        body.extend_from_slice(b"whatever");
        assert_eq!(
            decode_message(&body).unwrap(),
            WireMessage::Unknown { request_id: 999 }
        );
    }

    #[test]
    fn unknown_cannot_be_encoded() {
        assert!(encode_message(&WireMessage::Unknown { request_id: 42 }).is_err());
    }

    #[test]
    fn truncated_body_is_a_decode_error() {
        assert!(decode_message(&[1, 0]).is_err());
    }

    #[test]
    fn payload_roundtrip() {
        let value = ("quote".to_string(), 42u64);
        let bytes = encode_payload(&value).unwrap();
        let back: (String, u64) = decode_payload(&bytes).unwrap();
        assert_eq!(back, value);
    }
}
