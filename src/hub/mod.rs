//! Hub client: connection lifecycle, invocation, and event dispatch.
//!
//! A [`HubClient`] owns one logical hub session over a sequence of physical
//! WebSocket connections:
//!
//! ```text
//! connect() ─► Negotiating ─► SocketOpen ─► HandshakeSent ─► Ready
//!                                                             │ read failure
//!                  ┌───────────── Reconnecting{attempt} ◄─────┘
//!                  └─► (backoff) ─► Negotiating ─► ... ─► Ready
//! ```
//!
//! The first [`HubClient::connect`] runs in the caller's task and returns
//! its error. After that a supervisor task reconnects with exponential
//! backoff until [`HubClient::close`] (or the parent cancellation token)
//! stops it for good.
//!
//! # Example
//!
//! ```ignore
//! let client = HubClient::builder("https://example.com/hubs/core")
//!     .header("X-Server-Select", "node-1")
//!     .build()?;
//! client.on("Notify", |_target, args| println!("{args:?}"));
//! client.connect().await?;
//! let reply = client.invoke("echo", &[json!("hi")])?.await?;
//! client.close();
//! ```

// Rust guideline compliant 2026-02

mod backoff;
mod connection;
mod dispatch;
mod liveness;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use backoff::Backoff;
pub use dispatch::{Handler, HandlerRegistry};

use crate::constants::{HANDSHAKE_TIMEOUT, PING_INTERVAL, SEND_QUEUE_CAPACITY};
use crate::error::{HubError, Result};
use crate::invocation::PendingInvocation;
use crate::negotiate::{self, Negotiator};
use connection::{Inner, Options};

/// Callback run after every successful reconnection.
pub type ReconnectHook = Arc<dyn Fn(&HubClient) + Send + Sync>;

/// Connection state of a hub client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, and none being attempted right now.
    #[default]
    Disconnected,
    /// Waiting on the negotiate endpoint.
    Negotiating,
    /// WebSocket open, handshake not yet sent.
    SocketOpen,
    /// Handshake sent, waiting for the acknowledgment.
    HandshakeSent,
    /// Handshake acknowledged; invocations may be sent.
    Ready,
    /// Waiting to retry after a lost connection.
    Reconnecting {
        /// Current reconnection attempt number (1-based).
        attempt: u32,
        /// Milliseconds until this attempt starts.
        next_retry_ms: u64,
    },
}

/// Client for one hub endpoint.
///
/// Cheap to clone; clones share the connection. Background tasks keep the
/// client alive, so call [`HubClient::close`] when done.
#[derive(Debug, Clone)]
pub struct HubClient {
    inner: Arc<Inner>,
}

impl HubClient {
    /// Start building a client for the hub at `url` (`http` or `https`).
    pub fn builder(url: impl Into<String>) -> HubClientBuilder {
        HubClientBuilder::new(url)
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Connect to the hub.
    ///
    /// The first call performs one negotiate/dial/handshake attempt and
    /// returns its outcome. Once connected, later calls return `Ok(())`
    /// without doing anything; lost connections are re-established in the
    /// background.
    ///
    /// # Errors
    ///
    /// The first attempt's [`HubError`], or [`HubError::Closed`] after
    /// [`HubClient::close`].
    pub async fn connect(&self) -> Result<()> {
        let mut started = self.inner.started.lock().await;
        if self.inner.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }
        if *started {
            return Ok(());
        }

        log::info!("[Hub] Connecting to {}", self.inner.negotiator.base_url());
        let link = self.inner.connect_once().await?;
        *started = true;
        drop(started);
        log::info!("[Hub] Connected");

        tokio::spawn(connection::supervise(Arc::clone(&self.inner), link));
        if let Some(interval) = self.inner.options.ping_interval {
            tokio::spawn(liveness::run(Arc::clone(&self.inner), interval));
        }
        Ok(())
    }

    /// Stop reconnecting and close the current connection, if any.
    ///
    /// Pending invocations fail with [`HubError::Closed`]. Safe to call any
    /// number of times from any state.
    pub fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            log::info!("[Hub] Closing");
        }
        self.inner.shutdown.cancel();
        self.inner.teardown(&HubError::Closed);
    }

    /// Invoke `target` and return a future for its completion.
    ///
    /// Fails immediately unless the client is [`ConnectionState::Ready`];
    /// nothing is queued while disconnected. Dropping the returned future
    /// abandons the call and releases its slot.
    ///
    /// # Errors
    ///
    /// [`HubError::NotConnected`], [`HubError::Closed`],
    /// [`HubError::SendQueueFull`], or a serialization error.
    pub fn invoke(&self, target: &str, arguments: &[Value]) -> Result<PendingInvocation> {
        self.inner.invoke(target, arguments)
    }

    /// Invoke `target` and deserialize its result into `T`.
    ///
    /// # Errors
    ///
    /// Anything [`HubClient::invoke`] or the completion reports, or
    /// [`HubError::Protocol`] when the result does not fit `T`.
    pub async fn call<T: DeserializeOwned>(&self, target: &str, arguments: &[Value]) -> Result<T> {
        let value = self.invoke(target, arguments)?.await?;
        serde_json::from_value(value)
            .map_err(|e| HubError::Protocol(format!("unexpected result for {target}: {e}")))
    }

    /// Invoke `target` without asking for a completion.
    ///
    /// # Errors
    ///
    /// Same as [`HubClient::invoke`].
    pub fn send(&self, target: &str, arguments: &[Value]) -> Result<()> {
        self.inner.send(target, arguments)
    }

    /// Perform one liveness round-trip.
    ///
    /// # Errors
    ///
    /// [`HubError::Protocol`] on any reply other than `"pong"`,
    /// [`HubError::Timeout`] when no reply arrives in time.
    pub async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    /// Register `handler` for invocations of `target` (case-sensitive).
    pub fn on<F>(&self, target: impl Into<String>, handler: F)
    where
        F: Fn(&str, &[Value]) + Send + Sync + 'static,
    {
        self.inner.registry.on(target, Arc::new(handler));
    }

    /// Remove the handler for `target`.
    pub fn off(&self, target: &str) -> bool {
        self.inner.registry.off(target)
    }

    /// Set the handler that sees every inbound invocation, before any
    /// target-specific handler.
    pub fn set_default_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &[Value]) + Send + Sync + 'static,
    {
        self.inner.registry.set_default(Some(Arc::new(handler)));
    }

    /// Remove the default handler.
    pub fn clear_default_handler(&self) {
        self.inner.registry.set_default(None);
    }

    /// Replace the hook run after each successful reconnection.
    pub fn set_on_reconnect<F>(&self, hook: F)
    where
        F: Fn(&HubClient) + Send + Sync + 'static,
    {
        self.inner.set_reconnect_hook(Some(Arc::new(hook)));
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.watch_state()
    }

    /// Whether invocations can be sent right now.
    pub fn is_connected(&self) -> bool {
        self.inner.is_ready()
    }

    /// Whether [`HubClient::close`] ran or the parent token was cancelled.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of invocations awaiting a completion.
    pub fn pending_invocations(&self) -> usize {
        self.inner.invocations.pending_count()
    }
}

/// Builder for [`HubClient`].
#[derive(Default)]
pub struct HubClientBuilder {
    url: String,
    headers: Vec<(String, String)>,
    http_client: Option<reqwest::Client>,
    backoff: Backoff,
    ping_interval: Option<Option<Duration>>,
    handshake_timeout: Option<Duration>,
    send_queue_capacity: Option<usize>,
    default_handler: Option<Handler>,
    on_reconnect: Option<ReconnectHook>,
    cancellation_token: Option<CancellationToken>,
}

impl std::fmt::Debug for HubClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("HubClientBuilder")
            .field("url", &self.url)
            .field("headers", &header_names)
            .field("backoff", &self.backoff)
            .field("ping_interval", &self.ping_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("send_queue_capacity", &self.send_queue_capacity)
            .field("default_handler", &self.default_handler.is_some())
            .field("on_reconnect", &self.on_reconnect.is_some())
            .finish_non_exhaustive()
    }
}

impl HubClientBuilder {
    /// Create a builder for the hub at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Add a header sent on the negotiate request and the socket upgrade.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add several headers.
    #[must_use]
    pub fn headers<I, N, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(n, v)| (n.into(), v.into())));
        self
    }

    /// Use a preconfigured HTTP client for negotiation.
    #[must_use]
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Reconnection backoff schedule (default 1 s doubling to 30 s).
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Liveness ping interval; `None` disables the ping loop (default 60 s).
    #[must_use]
    pub fn ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// How long to wait for the handshake acknowledgment (default 15 s).
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Outbound records buffered per connection (default 128).
    #[must_use]
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = Some(capacity);
        self
    }

    /// Handler that sees every inbound invocation.
    #[must_use]
    pub fn default_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &[Value]) + Send + Sync + 'static,
    {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    /// Hook run after each successful reconnection.
    #[must_use]
    pub fn on_reconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HubClient) + Send + Sync + 'static,
    {
        self.on_reconnect = Some(Arc::new(hook));
        self
    }

    /// Tie the client's lifetime to `token`: cancelling it stops
    /// reconnection as [`HubClient::close`] does.
    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Validate the configuration and build the client. Does not connect.
    ///
    /// # Errors
    ///
    /// [`HubError::Config`] for a URL that is not `http`/`https`, an
    /// invalid header, or a zero queue capacity.
    pub fn build(self) -> Result<HubClient> {
        let base_url = Url::parse(&self.url)
            .map_err(|e| HubError::Config(format!("invalid hub URL {:?}: {e}", self.url)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(HubError::Config(format!(
                "unsupported URL scheme {:?}, expected http or https",
                base_url.scheme()
            )));
        }

        for (name, value) in &self.headers {
            reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HubError::Config(format!("invalid header name {name:?}: {e}")))?;
            reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| HubError::Config(format!("invalid header value for {name}: {e}")))?;
        }

        let send_queue_capacity = self.send_queue_capacity.unwrap_or(SEND_QUEUE_CAPACITY);
        if send_queue_capacity == 0 {
            return Err(HubError::Config(
                "send queue capacity must be at least 1".to_string(),
            ));
        }

        let http = match self.http_client {
            Some(client) => client,
            None => negotiate::default_http_client()?,
        };

        let registry = HandlerRegistry::default();
        registry.set_default(self.default_handler);

        let shutdown = self
            .cancellation_token
            .map_or_else(CancellationToken::new, |parent| parent.child_token());

        let options = Options {
            headers: self.headers.clone(),
            backoff: self.backoff,
            ping_interval: self.ping_interval.unwrap_or(Some(PING_INTERVAL)),
            handshake_timeout: self.handshake_timeout.unwrap_or(HANDSHAKE_TIMEOUT),
            send_queue_capacity,
        };
        let negotiator = Negotiator::new(http, base_url, self.headers);

        Ok(HubClient {
            inner: Arc::new(Inner::new(
                options,
                negotiator,
                registry,
                shutdown,
                self.on_reconnect,
            )),
        })
    }
}
