//! Stagewire Protocol Codec
//!
//! The "rules" layer between the pure data structures in `types` and the
//! channel state machines in `network`:
//!
//! - **Framing** (`frame`): the fixed 8-byte packet header carrying a magic
//!   value and the body length. Short input is not an error; the parser just
//!   reports that more bytes are needed.
//! - **Payload transforms** (`transform`): identity or one of the negotiated
//!   compression algorithms. Each transform stamps its own magic value into
//!   the header so a foreign or corrupt stream is detected on the first
//!   packet.
//! - **Record encoding** (`record`): request-id-prefixed bincode encoding of
//!   protocol messages and application payloads.
//!
//! This crate contains no transport logic and no routing decisions.

pub mod error;
pub mod frame;
pub mod record;
pub mod transform;

pub use error::{CodecError, Result};
pub use frame::{FrameHeader, HEADER_SIZE};
pub use record::{decode_message, decode_payload, encode_message, encode_payload};
pub use transform::PayloadTransform;
