//! Hub protocol message types.
//!
//! Inbound records are decoded into [`Frame`]; outbound records are built
//! from the borrowed serialization structs at the bottom of this file.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kind carried in the `type` field of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Remote call or pushed event (`1`).
    Invocation,
    /// Streamed item (`2`), not acted on by this client.
    StreamItem,
    /// Result of a prior invocation (`3`).
    Completion,
    /// Streaming invocation (`4`), not acted on by this client.
    StreamInvocation,
    /// Cancellation of a stream (`5`), not acted on by this client.
    CancelInvocation,
    /// Liveness heartbeat (`6`).
    Ping,
    /// Server-initiated close (`7`).
    Close,
    /// Any kind this client does not know.
    Unknown(u64),
}

impl MessageKind {
    /// Numeric value used on the wire.
    #[must_use]
    pub fn code(self) -> u64 {
        match self {
            Self::Invocation => 1,
            Self::StreamItem => 2,
            Self::Completion => 3,
            Self::StreamInvocation => 4,
            Self::CancelInvocation => 5,
            Self::Ping => 6,
            Self::Close => 7,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u64> for MessageKind {
    fn from(code: u64) -> Self {
        match code {
            1 => Self::Invocation,
            2 => Self::StreamItem,
            3 => Self::Completion,
            4 => Self::StreamInvocation,
            5 => Self::CancelInvocation,
            6 => Self::Ping,
            7 => Self::Close,
            other => Self::Unknown(other),
        }
    }
}

/// One decoded wire record.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Server-pushed event or call.
    Invocation {
        /// Correlation id; `None` for non-blocking invocations.
        invocation_id: Option<String>,
        /// Target (event or method) name.
        target: String,
        /// Opaque argument payloads, in order.
        arguments: Vec<Value>,
    },
    /// Result of an invocation this client issued.
    Completion {
        /// Correlation id of the invocation being completed.
        invocation_id: String,
        /// Result payload, if the call succeeded with a value.
        result: Option<Value>,
        /// Failure message reported by the server.
        error: Option<String>,
    },
    /// Liveness heartbeat.
    Ping,
    /// The server is closing the connection.
    Close {
        /// Reason reported by the server.
        error: Option<String>,
        /// Whether the server permits reconnecting.
        allow_reconnect: bool,
    },
    /// A recognized record kind this client does not act on.
    Ignored(MessageKind),
    /// A record of a known kind missing a required field.
    Malformed {
        /// Kind declared by the record.
        kind: MessageKind,
        /// What was wrong with it.
        reason: &'static str,
    },
}

/// Wire shape shared by every inbound record kind.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawFrame {
    #[serde(rename = "type")]
    pub kind: u64,
    #[serde(default)]
    pub invocation_id: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub allow_reconnect: bool,
}

impl From<RawFrame> for Frame {
    fn from(raw: RawFrame) -> Self {
        let kind = MessageKind::from(raw.kind);
        match kind {
            MessageKind::Invocation => match raw.target {
                Some(target) if !target.is_empty() => Frame::Invocation {
                    invocation_id: raw.invocation_id.filter(|id| !id.is_empty()),
                    target,
                    arguments: raw.arguments,
                },
                _ => Frame::Malformed {
                    kind,
                    reason: "invocation without a target",
                },
            },
            MessageKind::Completion => match raw.invocation_id {
                Some(invocation_id) if !invocation_id.is_empty() => Frame::Completion {
                    invocation_id,
                    result: raw.result,
                    error: raw.error,
                },
                _ => Frame::Malformed {
                    kind,
                    reason: "completion without an invocation id",
                },
            },
            MessageKind::Ping => Frame::Ping,
            MessageKind::Close => Frame::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect,
            },
            other => Frame::Ignored(other),
        }
    }
}

/// Handshake request sent right after the socket opens.
#[derive(Debug, Serialize)]
pub(crate) struct HandshakeRequest<'a> {
    pub protocol: &'a str,
    pub version: u32,
}

/// Handshake acknowledgment; any object without `error` is a success.
#[derive(Debug, Deserialize)]
pub(crate) struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

/// Outbound invocation record.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InvocationMessage<'a> {
    #[serde(rename = "type")]
    pub kind: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<&'a str>,
    pub target: &'a str,
    pub arguments: &'a [Value],
}
