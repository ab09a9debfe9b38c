//! Pre-connect negotiation.
//!
//! `POST {base}/negotiate?negotiateVersion=1` yields a connection token; the
//! socket URL is the base URL with its scheme swapped to `ws`/`wss` and the
//! token attached as `id`. Negotiation never retries on its own; the hub
//! client's reconnect loop decides when to try again.

use reqwest::Url;
use serde::Deserialize;

use crate::constants::{HTTP_REQUEST_TIMEOUT, NEGOTIATE_VERSION, WEBSOCKETS_TRANSPORT};
use crate::error::{HubError, Result};

/// One transport offered by the negotiate endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    /// Transport name, e.g. `"WebSockets"`.
    pub transport: String,
    /// Transfer formats supported on that transport.
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

/// Body returned by the negotiate endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    /// Token to present on the socket URL (negotiate version 1).
    #[serde(default)]
    pub connection_token: Option<String>,
    /// Connection id; doubles as the token for version 0 servers.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Negotiate version the server answered with.
    #[serde(default)]
    pub negotiate_version: Option<u32>,
    /// Transports the server is willing to use.
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
    /// Server-side refusal.
    #[serde(default)]
    pub error: Option<String>,
}

impl NegotiateResponse {
    /// Whether the server accepts a WebSocket. An empty list is taken as yes.
    pub fn offers_websockets(&self) -> bool {
        self.available_transports.is_empty()
            || self
                .available_transports
                .iter()
                .any(|t| t.transport == WEBSOCKETS_TRANSPORT)
    }

    /// The token to use, preferring `connectionToken` over `connectionId`.
    pub fn token(&self) -> Option<&str> {
        self.connection_token
            .as_deref()
            .or(self.connection_id.as_deref())
            .filter(|token| !token.is_empty())
    }
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    /// Token issued by the server.
    pub connection_token: String,
    /// URL to open the WebSocket on.
    pub websocket_url: Url,
}

/// Performs the negotiate call against one hub base URL.
#[derive(Debug, Clone)]
pub struct Negotiator {
    http: reqwest::Client,
    base_url: Url,
    headers: Vec<(String, String)>,
}

impl Negotiator {
    /// Create a negotiator for `base_url`, sending `headers` on every request.
    pub fn new(http: reqwest::Client, base_url: Url, headers: Vec<(String, String)>) -> Self {
        Self {
            http,
            base_url,
            headers,
        }
    }

    /// The hub base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/negotiate?negotiateVersion=1`, keeping any existing query.
    pub fn negotiate_url(&self) -> Url {
        let mut url = self.base_url.clone();
        let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_fragment(None);
        url.query_pairs_mut()
            .append_pair("negotiateVersion", &NEGOTIATE_VERSION.to_string());
        url
    }

    /// Run one negotiate round-trip.
    ///
    /// # Errors
    ///
    /// [`HubError::Negotiation`] on network failure, a non-2xx status, a
    /// malformed body, a body `error`, no WebSocket transport, or no token.
    pub async fn negotiate(&self) -> Result<Negotiation> {
        let url = self.negotiate_url();
        log::debug!("[Negotiate] POST {url}");

        let mut request = self.http.post(url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| HubError::Negotiation(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HubError::Negotiation(format!("server returned {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| HubError::Negotiation(format!("failed to read body: {e}")))?;
        let parsed: NegotiateResponse = serde_json::from_slice(&body)
            .map_err(|e| HubError::Negotiation(format!("malformed response: {e}")))?;

        let negotiation = self.accept(&parsed)?;
        log::debug!("[Negotiate] Socket URL {}", negotiation.websocket_url);
        Ok(negotiation)
    }

    fn accept(&self, response: &NegotiateResponse) -> Result<Negotiation> {
        if let Some(error) = &response.error {
            return Err(HubError::Negotiation(error.clone()));
        }
        if !response.offers_websockets() {
            return Err(HubError::Negotiation(
                "server does not offer a WebSocket transport".to_string(),
            ));
        }
        let token = response
            .token()
            .ok_or_else(|| HubError::Negotiation("response has no connection token".to_string()))?;

        Ok(Negotiation {
            connection_token: token.to_string(),
            websocket_url: websocket_url(&self.base_url, token)?,
        })
    }
}

/// Build a client for the negotiate call with the default request timeout.
///
/// # Errors
///
/// [`HubError::Config`] if the TLS backend cannot be initialised.
pub fn default_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| HubError::Config(format!("failed to build HTTP client: {e}")))
}

/// Derive the socket URL from the base URL: `http`→`ws`, `https`→`wss`, plus
/// `id=<token>`.
///
/// # Errors
///
/// [`HubError::Config`] for any base scheme other than `http`/`https`.
pub fn websocket_url(base: &Url, token: &str) -> Result<Url> {
    let scheme = match base.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(HubError::Config(format!(
                "unsupported URL scheme {other:?}, expected http or https"
            )))
        }
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|()| HubError::Config(format!("cannot use {scheme} for {base}")))?;
    url.set_fragment(None);
    url.query_pairs_mut().append_pair("id", token);
    Ok(url)
}
