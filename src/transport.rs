//! WebSocket transport for one physical hub connection.
//!
//! Wraps `tokio-tungstenite` the same way for every connection attempt:
//! [`Transport::dial`] builds the request (URL plus headers), opens the
//! socket and splits it. The write half is owned by a background drain task
//! fed through a bounded queue, so concurrent senders never interleave
//! records on the wire. The read half stays behind [`Transport::read`].
//!
//! Write errors on the drain task are logged, not returned to senders. A
//! broken socket is reported through the read side instead.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, Result};

/// Concrete WebSocket stream type.
type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// One open WebSocket with a serialized send queue.
#[derive(Debug)]
pub struct Transport {
    outbound: mpsc::Sender<String>,
    inbound: Mutex<WsSource>,
    closed: CancellationToken,
    close_started: AtomicBool,
}

impl Transport {
    /// Open a WebSocket to `url`, sending `headers` with the upgrade request.
    ///
    /// `capacity` bounds the number of records queued for the drain task.
    ///
    /// # Errors
    ///
    /// [`HubError::Config`] for an unusable URL or header,
    /// [`HubError::ConnectionFailed`] when the socket cannot be opened.
    pub async fn dial(url: &str, headers: &[(String, String)], capacity: usize) -> Result<Self> {
        use tungstenite::client::IntoClientRequest;

        let mut request = url
            .into_client_request()
            .map_err(|e| HubError::Config(format!("invalid WebSocket URL {url}: {e}")))?;

        for (name, value) in headers {
            let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HubError::Config(format!("invalid header name {name}: {e}")))?;
            let header_value = tungstenite::http::HeaderValue::from_str(value)
                .map_err(|e| HubError::Config(format!("invalid header value for {name}: {e}")))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| HubError::ConnectionFailed(e.to_string()))?;
        log::debug!("[Transport] Socket open");

        let (sink, stream) = ws_stream.split();
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        tokio::spawn(drain_outbound(sink, rx, closed.clone()));

        Ok(Self {
            outbound,
            inbound: Mutex::new(stream),
            closed,
            close_started: AtomicBool::new(false),
        })
    }

    /// Queue one already-terminated record for writing.
    ///
    /// Returns as soon as the record is queued; it never waits on the socket.
    ///
    /// # Errors
    ///
    /// [`HubError::SendQueueFull`] when the queue is at capacity,
    /// [`HubError::NotConnected`] once the transport is closed.
    pub fn send(&self, record: String) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(HubError::NotConnected);
        }
        self.outbound.try_send(record).map_err(|e| match e {
            TrySendError::Full(_) => HubError::SendQueueFull,
            TrySendError::Closed(_) => HubError::NotConnected,
        })
    }

    /// Wait for the next data message (which may hold several records).
    ///
    /// Control frames are skipped. Any terminal condition closes the
    /// transport, so later reads report [`HubError::Closed`].
    ///
    /// # Errors
    ///
    /// [`HubError::Transport`] when the peer closes or the socket fails,
    /// [`HubError::Closed`] after [`Transport::close`].
    pub async fn read(&self) -> Result<Bytes> {
        let mut inbound = self.inbound.lock().await;
        loop {
            let next = tokio::select! {
                biased;
                () = self.closed.cancelled() => return Err(HubError::Closed),
                next = inbound.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => return Ok(Bytes::from(text)),
                Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map_or_else(
                        || "no reason".to_string(),
                        |f| format!("{} {}", u16::from(f.code), f.reason),
                    );
                    self.close();
                    return Err(HubError::Transport(format!("closed by peer ({reason})")));
                }
                Some(Err(e)) => {
                    self.close();
                    return Err(HubError::Transport(e.to_string()));
                }
                None => {
                    self.close();
                    return Err(HubError::Transport("stream ended".to_string()));
                }
            }
        }
    }

    /// Close the transport. Only the first call has any effect.
    ///
    /// Returns `true` for that first call.
    pub fn close(&self) -> bool {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return false;
        }
        log::debug!("[Transport] Closing");
        self.closed.cancel();
        true
    }

    /// Whether [`Transport::close`] has run, explicitly or after a failure.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drain the outbound queue onto the socket until the transport closes.
async fn drain_outbound(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<String>,
    closed: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        if let Err(e) = sink.send(Message::Text(record)).await {
            log::error!("[Transport] Write failed: {e}");
        }
    }

    if let Err(e) = sink.send(Message::Close(None)).await {
        log::trace!("[Transport] Close frame not sent: {e}");
    }
    if let Err(e) = sink.close().await {
        log::trace!("[Transport] Sink close failed: {e}");
    }
    log::debug!("[Transport] Drain task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Accept one WebSocket and hand back the server-side stream.
    async fn listen() -> (String, tokio::task::JoinHandle<tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/hub", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(tcp).await.unwrap()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_dial_invalid_url_is_config_error() {
        let result = Transport::dial("not-a-url", &[], 8).await;
        assert!(matches!(result, Err(HubError::Config(_))));
    }

    #[tokio::test]
    async fn test_dial_invalid_header_is_config_error() {
        let headers = vec![("bad header".to_string(), "x".to_string())];
        let result = Transport::dial("ws://127.0.0.1:1/hub", &headers, 8).await;
        assert!(matches!(result, Err(HubError::Config(_))));
    }

    #[tokio::test]
    async fn test_dial_unreachable_host_fails() {
        let result = Transport::dial("ws://127.0.0.1:1/hub", &[], 8).await;
        assert!(matches!(result, Err(HubError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_records_arrive_in_send_order() {
        let (url, server) = listen().await;
        let transport = Transport::dial(&url, &[], 64).await.unwrap();
        let mut server = server.await.unwrap();

        for i in 0..20 {
            transport.send(format!("{i}\u{1e}")).unwrap();
        }
        for i in 0..20 {
            let msg = tokio::time::timeout(Duration::from_secs(5), server.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(msg, Message::Text(format!("{i}\u{1e}")));
        }
    }

    #[tokio::test]
    async fn test_read_returns_text_payload() {
        let (url, server) = listen().await;
        let transport = Transport::dial(&url, &[], 8).await.unwrap();
        let mut server = server.await.unwrap();

        server
            .send(Message::Text("{\"type\":6}\u{1e}".to_string()))
            .await
            .unwrap();
        let bytes = transport.read().await.unwrap();
        assert_eq!(&bytes[..], b"{\"type\":6}\x1e");
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_as_transport_error() {
        let (url, server) = listen().await;
        let transport = Transport::dial(&url, &[], 8).await.unwrap();
        let mut server = server.await.unwrap();

        server.close(None).await.unwrap();
        let err = transport.read().await.unwrap_err();
        assert!(matches!(err, HubError::Transport(_)));
        assert!(transport.is_closed());
        assert_eq!(transport.read().await.unwrap_err(), HubError::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (url, server) = listen().await;
        let transport = Transport::dial(&url, &[], 8).await.unwrap();
        let _server = server.await.unwrap();

        assert!(transport.close());
        assert!(!transport.close());
        assert!(transport.is_closed());
        assert_eq!(transport.send("x".to_string()), Err(HubError::NotConnected));
        assert_eq!(transport.read().await.unwrap_err(), HubError::Closed);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_send() {
        let (url, server) = listen().await;
        let transport = Transport::dial(&url, &[], 1).await.unwrap();
        let _server = server.await.unwrap();

        // The drain task may pick one record up immediately; keep pushing
        // until the single slot is occupied.
        let mut saw_full = false;
        for _ in 0..10_000 {
            if transport.send("x".repeat(1024)) == Err(HubError::SendQueueFull) {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);
    }
}
