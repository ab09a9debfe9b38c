//! Error type shared by every hubwire component.
//!
//! Variants follow the failure taxonomy of the hub client: configuration,
//! negotiation, handshake and transport failures affect a whole connection
//! attempt, while protocol and invocation failures stay scoped to a single
//! frame or call.

/// Errors produced by the hub client and its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Invalid base URL, header, or client option.
    Config(String),
    /// The negotiate request failed or returned an unusable body.
    Negotiation(String),
    /// The WebSocket could not be opened.
    ConnectionFailed(String),
    /// The protocol handshake was rejected, malformed, or timed out.
    Handshake(String),
    /// The socket closed or failed after it was established.
    Transport(String),
    /// No connection is ready to carry the call.
    NotConnected,
    /// The connection was lost before the call completed.
    Disconnected,
    /// The client was closed.
    Closed,
    /// The outbound queue is full.
    SendQueueFull,
    /// A frame or reply did not match the protocol.
    Protocol(String),
    /// The server reported a failed invocation.
    Invocation {
        /// Server-specific error code, if any.
        code: Option<i64>,
        /// Human-readable failure message, if any.
        message: Option<String>,
    },
    /// The operation timed out.
    Timeout,
}

impl HubError {
    /// Returns `true` when the error means the call never reached, or never
    /// heard back from, a live connection.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Disconnected | Self::Closed | Self::Transport(_)
        )
    }
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "Invalid configuration: {msg}"),
            Self::Negotiation(msg) => write!(f, "Negotiation failed: {msg}"),
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::Handshake(msg) => write!(f, "Handshake failed: {msg}"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::Disconnected => write!(f, "Disconnected before completion"),
            Self::Closed => write!(f, "Client closed"),
            Self::SendQueueFull => write!(f, "Send queue full"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Invocation { code, message } => match (message, code) {
                (Some(message), _) => write!(f, "Invocation failed: {message}"),
                (None, Some(code)) => write!(f, "Invocation failed: unknown error {code}"),
                (None, None) => write!(f, "Invocation failed"),
            },
            Self::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for HubError {}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = HubError> = std::result::Result<T, E>;
