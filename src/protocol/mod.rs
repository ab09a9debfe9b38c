//! JSON hub wire protocol: record framing, message kinds, handshake.

pub mod framing;
pub mod messages;

pub use framing::{
    encode_invocation, encode_ping, handshake_request, parse_frames, parse_handshake_response,
    split_records,
};
pub use messages::{Frame, MessageKind};
