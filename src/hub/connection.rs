//! Connection lifecycle: connect attempts, the read loop, and the
//! reconnect supervisor.
//!
//! Each physical connection is a disposable [`Transport`] tagged with a
//! generation number. The handler registry, dispatcher and invocation
//! tracker live on [`Inner`] and survive every reconnect; a read loop only
//! ever tears down the generation it was started for.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::dispatch::{Dispatcher, HandlerRegistry};
use super::{ConnectionState, HubClient, ReconnectHook};
use crate::constants::{PING_REPLY, PING_TARGET, PING_TIMEOUT};
use crate::error::{HubError, Result};
use crate::invocation::{InvocationTracker, PendingInvocation};
use crate::negotiate::Negotiator;
use crate::protocol::{self, Frame};
use crate::transport::Transport;

/// Per-client settings fixed at build time.
#[derive(Debug, Clone)]
pub(crate) struct Options {
    pub headers: Vec<(String, String)>,
    pub backoff: Backoff,
    pub ping_interval: Option<Duration>,
    pub handshake_timeout: Duration,
    pub send_queue_capacity: usize,
}

/// The live connection, if any.
#[derive(Debug)]
struct Connection {
    generation: u64,
    transport: Arc<Transport>,
}

/// Handle the supervisor keeps on the current connection.
#[derive(Debug)]
pub(crate) struct Link {
    pub generation: u64,
    /// Fires once with the reason the read loop ended.
    pub lost: oneshot::Receiver<HubError>,
}

/// State shared by a [`HubClient`] and its background tasks.
pub(crate) struct Inner {
    pub options: Options,
    pub negotiator: Negotiator,
    pub registry: HandlerRegistry,
    pub dispatcher: Dispatcher,
    pub invocations: InvocationTracker,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    /// Held across the first connect; `true` once the supervisor runs.
    pub started: tokio::sync::Mutex<bool>,
    pub shutdown: CancellationToken,
    on_reconnect: RwLock<Option<ReconnectHook>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("base_url", &self.negotiator.base_url().as_str())
            .field("state", &*self.state.borrow())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("pending", &self.invocations.pending_count())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Inner {
    pub fn new(
        options: Options,
        negotiator: Negotiator,
        registry: HandlerRegistry,
        shutdown: CancellationToken,
        on_reconnect: Option<ReconnectHook>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            options,
            negotiator,
            registry,
            dispatcher: Dispatcher::default(),
            invocations: InvocationTracker::new(),
            connection: Mutex::new(None),
            generation: AtomicU64::new(0),
            state,
            started: tokio::sync::Mutex::new(false),
            shutdown,
            on_reconnect: RwLock::new(on_reconnect),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            log::debug!("[Hub] State {previous:?} -> {next:?}");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn set_reconnect_hook(&self, hook: Option<ReconnectHook>) {
        *self
            .on_reconnect
            .write()
            .unwrap_or_else(PoisonError::into_inner) = hook;
    }

    /// The transport of a `Ready` connection.
    fn ready_transport(&self) -> Result<Arc<Transport>> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }
        match self.slot().as_ref() {
            Some(conn) if !conn.transport.is_closed() => Ok(Arc::clone(&conn.transport)),
            _ => Err(HubError::NotConnected),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_transport().is_ok() && self.state() == ConnectionState::Ready
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send an invocation that expects a completion.
    pub fn invoke(&self, target: &str, arguments: &[Value]) -> Result<PendingInvocation> {
        let transport = self.ready_transport()?;
        let (id, pending) = self.invocations.begin();
        let sent = protocol::encode_invocation(Some(&id), target, arguments)
            .and_then(|record| transport.send(record));
        if let Err(e) = sent {
            self.invocations.discard(&id);
            return Err(e);
        }
        log::trace!("[Hub] Invoked {target} as {id}");
        Ok(pending)
    }

    /// Send an invocation that expects no completion.
    pub fn send(&self, target: &str, arguments: &[Value]) -> Result<()> {
        let transport = self.ready_transport()?;
        let record = protocol::encode_invocation(None, target, arguments)?;
        transport.send(record)
    }

    /// One liveness round-trip.
    pub async fn ping(&self) -> Result<()> {
        let pending = self.invoke(PING_TARGET, &[Value::Bool(true)])?;
        // A timed-out wait drops `pending`, which frees its slot.
        let reply = tokio::time::timeout(PING_TIMEOUT, pending)
            .await
            .map_err(|e| {
                log::debug!("[Liveness] No reply: {e}");
                HubError::Timeout
            })??;
        if reply.as_str() == Some(PING_REPLY) {
            Ok(())
        } else {
            Err(HubError::Protocol(format!(
                "unexpected liveness reply {reply}, expected {PING_REPLY:?}"
            )))
        }
    }

    // ------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------

    /// Negotiate, dial and handshake once, then start the read loop.
    pub async fn connect_once(self: &Arc<Self>) -> Result<Link> {
        self.set_state(ConnectionState::Negotiating);

        let (transport, leftover) = match self.open().await {
            Ok(opened) => opened,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut slot = self.slot();
            if self.shutdown.is_cancelled() {
                transport.close();
                self.set_state(ConnectionState::Disconnected);
                return Err(HubError::Closed);
            }
            *slot = Some(Connection {
                generation,
                transport: Arc::clone(&transport),
            });
            self.set_state(ConnectionState::Ready);
        }

        let (lost_tx, lost) = oneshot::channel();
        tokio::spawn(read_loop(
            Arc::clone(self),
            generation,
            transport,
            leftover,
            lost_tx,
        ));
        Ok(Link { generation, lost })
    }

    async fn open(&self) -> Result<(Arc<Transport>, Bytes)> {
        let negotiation = self.negotiator.negotiate().await?;
        let transport = Transport::dial(
            negotiation.websocket_url.as_str(),
            &self.options.headers,
            self.options.send_queue_capacity,
        )
        .await?;
        self.set_state(ConnectionState::SocketOpen);

        let transport = Arc::new(transport);
        let leftover = self.handshake(&transport).await?;
        Ok((transport, leftover))
    }

    /// Send the handshake record and validate the acknowledgment.
    ///
    /// Returns any records the server sent behind the acknowledgment.
    async fn handshake(&self, transport: &Transport) -> Result<Bytes> {
        transport.send(protocol::handshake_request()?)?;
        self.set_state(ConnectionState::HandshakeSent);

        let message = match tokio::time::timeout(self.options.handshake_timeout, transport.read())
            .await
        {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                return Err(HubError::Handshake(format!(
                    "connection lost before acknowledgment: {e}"
                )))
            }
            Err(_) => {
                transport.close();
                return Err(HubError::Handshake(format!(
                    "no acknowledgment within {:?}",
                    self.options.handshake_timeout
                )));
            }
        };

        let consumed = message.len() - protocol::parse_handshake_response(&message)?.len();
        Ok(message.slice(consumed..))
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Act on one socket message. Returns a reason when the server closed.
    fn handle_message(&self, message: &[u8]) -> Option<HubError> {
        let frames = match protocol::parse_frames(message) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("[Hub] Dropping undecodable message: {e}");
                return None;
            }
        };

        for frame in frames {
            match frame {
                Frame::Completion {
                    invocation_id,
                    result,
                    error,
                } => {
                    let outcome = match error {
                        Some(message) => Err(HubError::Invocation {
                            code: None,
                            message: Some(message),
                        }),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    self.invocations.resolve(&invocation_id, outcome);
                }
                Frame::Invocation {
                    invocation_id,
                    target,
                    arguments,
                } => {
                    if let Some(id) = invocation_id {
                        log::trace!("[Hub] {target} expects a completion ({id}); none is sent");
                    }
                    self.dispatcher.dispatch(&self.registry, target, arguments);
                }
                Frame::Ping => log::trace!("[Hub] Ping"),
                Frame::Close {
                    error,
                    allow_reconnect,
                } => {
                    let reason = error.unwrap_or_else(|| "no reason given".to_string());
                    log::info!("[Hub] Server closed the connection: {reason} (allowReconnect={allow_reconnect})");
                    return Some(HubError::Transport(format!("server closed: {reason}")));
                }
                Frame::Ignored(kind) => log::trace!("[Hub] Ignoring {kind:?} record"),
                Frame::Malformed { kind, reason } => {
                    log::warn!("[Hub] Dropping malformed {kind:?} record: {reason}");
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Tear down `generation` if it is still current.
    fn drop_connection(&self, generation: u64) -> bool {
        let mut slot = self.slot();
        let Some(conn) = slot.take_if(|conn| conn.generation == generation) else {
            return false;
        };
        conn.transport.close();
        self.invocations.cancel_all(&HubError::Disconnected);
        self.set_state(ConnectionState::Disconnected);
        true
    }

    /// Tear down whatever connection exists and fail pending calls.
    pub fn teardown(&self, reason: &HubError) {
        let mut slot = self.slot();
        if let Some(conn) = slot.take() {
            conn.transport.close();
        }
        self.invocations.cancel_all(reason);
        self.set_state(ConnectionState::Disconnected);
    }

    fn run_reconnect_hook(self: &Arc<Self>) {
        let hook = self
            .on_reconnect
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            let client = HubClient::from_inner(Arc::clone(self));
            if catch_unwind(AssertUnwindSafe(|| hook(&client))).is_err() {
                log::error!("[Hub] Reconnect hook panicked");
            }
        }
    }
}

/// Read and handle messages until the socket fails or the server closes.
async fn read_loop(
    inner: Arc<Inner>,
    generation: u64,
    transport: Arc<Transport>,
    leftover: Bytes,
    lost: oneshot::Sender<HubError>,
) {
    let mut buffered = (!leftover.is_empty()).then_some(leftover);
    let reason = loop {
        let message = match buffered.take() {
            Some(message) => message,
            None => match transport.read().await {
                Ok(message) => message,
                Err(e) => break e,
            },
        };
        if let Some(reason) = inner.handle_message(&message) {
            break reason;
        }
    };

    if reason == HubError::Closed {
        log::debug!("[Hub] Read loop {generation} stopped");
    } else {
        log::warn!("[Hub] Connection {generation} lost: {reason}");
    }
    inner.drop_connection(generation);
    let _ = lost.send(reason);
}

/// Watch the current connection and reconnect until shutdown.
pub(crate) async fn supervise(inner: Arc<Inner>, mut link: Link) {
    loop {
        let reason = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => break,
            lost = &mut link.lost => lost.unwrap_or(HubError::Disconnected),
        };
        log::debug!("[Hub] Supervisor saw generation {} end: {reason}", link.generation);

        match reconnect(&inner).await {
            Some(next) => link = next,
            None => break,
        }
    }

    inner.teardown(&HubError::Closed);
    log::info!("[Hub] Supervisor stopped");
}

/// Retry connecting with backoff. `None` means shutdown was requested.
async fn reconnect(inner: &Arc<Inner>) -> Option<Link> {
    let mut attempt: u32 = 0;
    loop {
        if inner.shutdown.is_cancelled() {
            return None;
        }
        let delay = inner.options.backoff.delay(attempt);
        let number = attempt.saturating_add(1);
        inner.set_state(ConnectionState::Reconnecting {
            attempt: number,
            next_retry_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        log::info!("[Hub] Reconnecting in {delay:?} (attempt {number})");

        tokio::select! {
            () = inner.shutdown.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }

        let result = tokio::select! {
            () = inner.shutdown.cancelled() => return None,
            result = inner.connect_once() => result,
        };

        match result {
            Ok(link) => {
                log::info!("[Hub] Reconnected after {number} attempt(s)");
                inner.run_reconnect_hook();
                return Some(link);
            }
            Err(HubError::Closed) => return None,
            Err(e) => {
                log::warn!("[Hub] Reconnect attempt {number} failed: {e}");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
