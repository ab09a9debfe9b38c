//! Record-separator framing for the JSON hub protocol.
//!
//! Every record on the wire is one JSON object terminated by `0x1E`:
//!
//! ```text
//! {"type":1,"target":"Notify","arguments":[...]}\x1e{"type":6}\x1e
//! ```
//!
//! A single socket message may carry zero or more records. Decoding is
//! all-or-nothing per message: one undecodable record fails the batch.

use serde_json::Value;

use super::messages::{
    Frame, HandshakeRequest, HandshakeResponse, InvocationMessage, MessageKind, RawFrame,
};
use crate::constants::{PROTOCOL_NAME, PROTOCOL_VERSION, RECORD_SEPARATOR};
use crate::error::{HubError, Result};

/// Split a socket message into its records.
///
/// Empty segments (including the one after a trailing separator) are
/// skipped. An unterminated final segment is returned as a record.
pub fn split_records(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    buf.split(|b| *b == RECORD_SEPARATOR)
        .filter(|segment| !segment.iter().all(u8::is_ascii_whitespace))
}

/// Decode every record in a socket message, preserving wire order.
pub fn parse_frames(buf: &[u8]) -> Result<Vec<Frame>> {
    split_records(buf)
        .map(|record| {
            let raw: RawFrame = serde_json::from_slice(record)?;
            Ok(Frame::from(raw))
        })
        .collect()
}

/// Append the record separator to a serialized record.
fn terminate(mut record: String) -> String {
    record.push(char::from(RECORD_SEPARATOR));
    record
}

/// Encode an invocation record.
///
/// `invocation_id` is `None` for non-blocking invocations that expect no
/// completion.
pub fn encode_invocation(
    invocation_id: Option<&str>,
    target: &str,
    arguments: &[Value],
) -> Result<String> {
    let message = InvocationMessage {
        kind: MessageKind::Invocation.code(),
        invocation_id,
        target,
        arguments,
    };
    Ok(terminate(serde_json::to_string(&message)?))
}

/// Encode a ping record.
pub fn encode_ping() -> String {
    terminate(format!(r#"{{"type":{}}}"#, MessageKind::Ping.code()))
}

/// The handshake record sent right after the socket opens.
pub fn handshake_request() -> Result<String> {
    let request = HandshakeRequest {
        protocol: PROTOCOL_NAME,
        version: PROTOCOL_VERSION,
    };
    Ok(terminate(serde_json::to_string(&request)?))
}

/// Validate the server's handshake acknowledgment.
///
/// Returns whatever follows the acknowledgment in the same message; the
/// server may batch ordinary records behind it.
pub fn parse_handshake_response(buf: &[u8]) -> Result<&[u8]> {
    let Some(end) = buf.iter().position(|b| *b == RECORD_SEPARATOR) else {
        return Err(HubError::Handshake(
            "acknowledgment is missing its record separator".to_string(),
        ));
    };

    let response: HandshakeResponse = serde_json::from_slice(&buf[..end])
        .map_err(|e| HubError::Handshake(format!("malformed acknowledgment: {e}")))?;
    if let Some(error) = response.error {
        return Err(HubError::Handshake(error));
    }

    Ok(&buf[end + 1..])
}
