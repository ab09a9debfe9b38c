//! Authorized realtime session on top of a [`HubClient`].
//!
//! The core hub exposes a small set of session methods (`Authorize`,
//! `JoinUser`, `JoinPlanet`/`LeavePlanet`, `JoinChannel`/`LeaveChannel`),
//! each answering with `{"Success":bool,"Message":string?,"ErrorCode":int?}`.
//! [`RealtimeSession`] wraps those calls, remembers what was joined, and
//! replays authorization plus every join after the hub client reconnects.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{HubError, Result};
use crate::hub::HubClient;

/// Event targets pushed by the core hub.
pub mod events {
    /// Channel read state changed.
    pub const CHANNEL_STATE: &str = "Channel-State";
    /// The authorized user was updated.
    pub const USER_UPDATE: &str = "User-Update";
    /// A message was posted in a joined channel.
    pub const MESSAGE_CREATE: &str = "Relay";
    /// A message was edited.
    pub const MESSAGE_EDIT: &str = "RelayEdit";
    /// A message was deleted.
    pub const MESSAGE_DELETE: &str = "DeleteMessage";
    /// Users watching a channel changed.
    pub const CHANNEL_WATCHING_UPDATE: &str = "Channel-Watching-Update";
    /// Users typing in a channel changed.
    pub const CHANNEL_TYPING_UPDATE: &str = "Channel-CurrentlyTyping-Update";
    /// A planet member was updated.
    pub const PLANET_MEMBER_UPDATE: &str = "PlanetMember-Update";
    /// A reaction was added to a message.
    pub const MESSAGE_REACTION_ADD: &str = "MessageReactionAdd";
    /// A reaction was removed from a message.
    pub const MESSAGE_REACTION_REMOVE: &str = "MessageReactionRemove";

    /// Every target above.
    pub const ALL: [&str; 10] = [
        CHANNEL_STATE,
        USER_UPDATE,
        MESSAGE_CREATE,
        MESSAGE_EDIT,
        MESSAGE_DELETE,
        CHANNEL_WATCHING_UPDATE,
        CHANNEL_TYPING_UPDATE,
        PLANET_MEMBER_UPDATE,
        MESSAGE_REACTION_ADD,
        MESSAGE_REACTION_REMOVE,
    ];
}

/// Reply shape shared by the session methods.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HubResponse {
    /// Whether the call succeeded.
    #[serde(rename = "Success")]
    pub success: bool,
    /// Failure description.
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
    /// Failure code.
    #[serde(rename = "ErrorCode", default)]
    pub error_code: Option<i64>,
}

impl HubResponse {
    /// `Ok(())` on success, otherwise [`HubError::Invocation`].
    pub fn into_result(self) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(HubError::Invocation {
                code: self.error_code,
                message: self.message,
            })
        }
    }
}

/// Authorization state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// The hub client is not connected.
    #[default]
    Disconnected,
    /// Connected, authorization not yet attempted.
    Connected,
    /// The hub rejected the token.
    Unauthorized,
    /// The token was accepted.
    Authorized,
}

#[derive(Debug)]
struct Shared {
    token: String,
    state: Mutex<SessionState>,
    planets: Mutex<BTreeSet<u64>>,
    channels: Mutex<BTreeSet<u64>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *locked(&self.state) = state;
    }

    async fn authorize(&self, client: &HubClient) -> Result<()> {
        match checked_call(client, "Authorize", &[Value::from(self.token.as_str())]).await {
            Ok(()) => {
                self.set_state(SessionState::Authorized);
                log::info!("[Realtime] Authorized");
                Ok(())
            }
            Err(e) => {
                if matches!(e, HubError::Invocation { .. }) {
                    self.set_state(SessionState::Unauthorized);
                }
                Err(e)
            }
        }
    }

    /// Re-authorize and re-join everything after a reconnect.
    async fn restore(&self, client: &HubClient) -> Result<()> {
        self.set_state(SessionState::Connected);
        self.authorize(client).await?;
        checked_call(client, "JoinUser", &[Value::Bool(true)]).await?;

        let planets: Vec<u64> = locked(&self.planets).iter().copied().collect();
        for planet in planets {
            checked_call(client, "JoinPlanet", &[Value::from(planet)]).await?;
        }
        let channels: Vec<u64> = locked(&self.channels).iter().copied().collect();
        for channel in channels {
            checked_call(client, "JoinChannel", &[Value::from(channel)]).await?;
        }
        Ok(())
    }
}

/// Invoke a session method and decode its [`HubResponse`].
async fn checked_call(client: &HubClient, target: &str, arguments: &[Value]) -> Result<()> {
    let response: HubResponse = client.call(target, arguments).await?;
    response.into_result()
}

/// An authorized session with the core hub.
///
/// Dropping the session closes its hub client.
#[derive(Debug)]
pub struct RealtimeSession {
    client: HubClient,
    shared: Arc<Shared>,
}

impl RealtimeSession {
    /// Connect `client`, authorize with `token` and join the user's feed.
    ///
    /// # Errors
    ///
    /// Connection errors from [`HubClient::connect`], or the hub's refusal as
    /// [`HubError::Invocation`]. The client is closed on failure.
    pub async fn open(client: HubClient, token: impl Into<String>) -> Result<Self> {
        let session = Self {
            client,
            shared: Arc::new(Shared {
                token: token.into(),
                state: Mutex::new(SessionState::Disconnected),
                planets: Mutex::new(BTreeSet::new()),
                channels: Mutex::new(BTreeSet::new()),
            }),
        };

        let shared = Arc::clone(&session.shared);
        session.client.set_on_reconnect(move |client| {
            let client = client.clone();
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                match shared.restore(&client).await {
                    Ok(()) => log::info!("[Realtime] Session restored after reconnect"),
                    Err(e) => log::warn!("[Realtime] Failed to restore session: {e}"),
                }
            });
        });

        session.client.connect().await?;
        session.shared.set_state(SessionState::Connected);
        session.shared.authorize(&session.client).await?;
        session.join_user().await?;

        Ok(session)
    }

    /// The underlying hub client.
    pub fn client(&self) -> &HubClient {
        &self.client
    }

    /// Current authorization state.
    pub fn state(&self) -> SessionState {
        if !self.client.is_connected() {
            return SessionState::Disconnected;
        }
        *locked(&self.shared.state)
    }

    /// Subscribe to updates about the authorized user.
    ///
    /// # Errors
    ///
    /// Invocation or connection errors.
    pub async fn join_user(&self) -> Result<()> {
        checked_call(&self.client, "JoinUser", &[Value::Bool(true)]).await
    }

    /// Subscribe to updates for `planet`.
    ///
    /// # Errors
    ///
    /// Invocation or connection errors.
    pub async fn join_planet(&self, planet: u64) -> Result<()> {
        checked_call(&self.client, "JoinPlanet", &[Value::from(planet)]).await?;
        locked(&self.shared.planets).insert(planet);
        Ok(())
    }

    /// Drop the subscription for `planet`.
    ///
    /// # Errors
    ///
    /// Invocation or connection errors.
    pub async fn leave_planet(&self, planet: u64) -> Result<()> {
        checked_call(&self.client, "LeavePlanet", &[Value::from(planet)]).await?;
        locked(&self.shared.planets).remove(&planet);
        Ok(())
    }

    /// Subscribe to messages and updates for `channel`.
    ///
    /// # Errors
    ///
    /// Invocation or connection errors.
    pub async fn join_channel(&self, channel: u64) -> Result<()> {
        checked_call(&self.client, "JoinChannel", &[Value::from(channel)]).await?;
        locked(&self.shared.channels).insert(channel);
        Ok(())
    }

    /// Drop the subscription for `channel`.
    ///
    /// # Errors
    ///
    /// Invocation or connection errors.
    pub async fn leave_channel(&self, channel: u64) -> Result<()> {
        checked_call(&self.client, "LeaveChannel", &[Value::from(channel)]).await?;
        locked(&self.shared.channels).remove(&channel);
        Ok(())
    }

    /// Planets currently joined, in ascending order.
    pub fn joined_planets(&self) -> Vec<u64> {
        locked(&self.shared.planets).iter().copied().collect()
    }

    /// Channels currently joined, in ascending order.
    pub fn joined_channels(&self) -> Vec<u64> {
        locked(&self.shared.channels).iter().copied().collect()
    }

    /// One liveness round-trip.
    ///
    /// # Errors
    ///
    /// See [`HubClient::ping`].
    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }

    /// Decode the first argument of every `target` event into `T`.
    ///
    /// Events that fail to decode are logged and skipped.
    pub fn on_event<T, F>(&self, target: &str, handler: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.client.on(target, move |target: &str, args: &[Value]| {
            let Some(first) = args.first() else {
                log::warn!("[Realtime] {target} event without arguments");
                return;
            };
            match T::deserialize(first) {
                Ok(event) => handler(event),
                Err(e) => log::warn!("[Realtime] Failed to decode {target} event: {e}"),
            }
        });
    }

    /// Close the hub client.
    pub fn close(&self) {
        self.client.close();
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.client.close();
    }
}
