//! Protocol and runtime constants for hubwire.
//!
//! Centralizes wire-format values, timeouts, and intervals so the
//! transport, negotiator, and hub client agree on them.
//!
//! # Categories
//!
//! - **Wire format**: record delimiter and handshake values
//! - **Timeouts**: network and handshake timeouts
//! - **Reconnection**: backoff bounds
//! - **Liveness**: ping cadence and expected reply

use std::time::Duration;

// ============================================================================
// Wire format
// ============================================================================

/// ASCII record separator terminating every record on the wire.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Wire sub-protocol declared in the handshake record.
pub const PROTOCOL_NAME: &str = "json";

/// Wire sub-protocol version declared in the handshake record.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version requested from the negotiate endpoint.
pub const NEGOTIATE_VERSION: u32 = 1;

/// Transport name a negotiate response must offer when it lists any.
pub const WEBSOCKETS_TRANSPORT: &str = "WebSockets";

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP request timeout for the negotiate call.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the server's handshake acknowledgment.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Outbound records buffered per socket before `send` reports a full queue.
pub const SEND_QUEUE_CAPACITY: usize = 128;

// ============================================================================
// Reconnection
// ============================================================================

/// First reconnection delay after a connection is lost.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the reconnection delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

// ============================================================================
// Liveness
// ============================================================================

/// Interval between liveness invocations.
pub const PING_INTERVAL: Duration = Duration::from_secs(60);

/// How long a liveness invocation may stay unanswered.
pub const PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Hub method invoked for liveness.
pub const PING_TARGET: &str = "ping";

/// Literal reply expected from [`PING_TARGET`].
pub const PING_REPLY: &str = "pong";
