//! hubwire - persistent RPC-over-WebSocket hub client.
//!
//! A hub exposes named remote targets that can be invoked with correlated
//! completions, and pushes named events back, all multiplexed over one
//! WebSocket carrying `0x1E`-delimited JSON records.
//!
//! # Architecture
//!
//! - **Protocol** - record framing and message kinds
//! - **Transport** - one WebSocket with a serialized send queue
//! - **Invocation** - id allocation and completion correlation
//! - **Negotiate** - the pre-connect HTTP step
//! - **Hub** - connection state machine, reconnection, dispatch, liveness
//! - **Realtime** - authorized session and subscriptions on top of a hub
//!
//! # Modules
//!
//! - [`hub`] - [`HubClient`] and its builder
//! - [`realtime`] - [`RealtimeSession`]
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod hub;
pub mod invocation;
pub mod negotiate;
pub mod protocol;
pub mod realtime;
pub mod transport;

pub mod config;
pub mod constants;
pub mod error;

// Re-export commonly used types
pub use config::Config;
pub use error::{HubError, Result};
pub use hub::{Backoff, ConnectionState, HubClient, HubClientBuilder};
pub use invocation::PendingInvocation;
pub use realtime::{RealtimeSession, SessionState};
