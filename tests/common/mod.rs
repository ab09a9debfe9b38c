//! In-process hub for integration tests.
//!
//! Listens on 127.0.0.1 and serves both halves of a hub connection on one
//! port: the negotiate `POST` gets a canned JSON answer, and any other
//! request is upgraded to a WebSocket, handshaken, and handed to the test as
//! a [`HubConn`].

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// How long any single wait in a test may take.
pub const WAIT: Duration = Duration::from_secs(5);

/// Handshake acknowledgment the hub sends by default.
pub const HANDSHAKE_OK: &str = "{}\u{1e}";

/// Knobs for [`TestHub::start_with`].
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// HTTP status for negotiate requests.
    pub negotiate_status: u16,
    /// Raw text sent after the client's handshake; empty sends nothing.
    pub handshake_reply: String,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            negotiate_status: 200,
            handshake_reply: HANDSHAKE_OK.to_string(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    negotiate_status: AtomicU16,
    handshake_reply: Mutex<String>,
    negotiate_count: AtomicUsize,
    negotiate_requests: Mutex<Vec<String>>,
}

/// A running test hub.
#[derive(Debug)]
pub struct TestHub {
    addr: SocketAddr,
    shared: Arc<Shared>,
    conns: mpsc::UnboundedReceiver<HubConn>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestHub {
    /// Start a hub with default options.
    pub async fn start() -> Self {
        Self::start_with(HubOptions::default()).await
    }

    /// Start a hub with `options`.
    pub async fn start_with(options: HubOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            negotiate_status: AtomicU16::new(options.negotiate_status),
            handshake_reply: Mutex::new(options.handshake_reply),
            negotiate_count: AtomicUsize::new(0),
            negotiate_requests: Mutex::new(Vec::new()),
        });
        let (tx, conns) = mpsc::unbounded_channel();

        let task = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    tokio::spawn(serve(stream, Arc::clone(&shared), tx.clone()));
                }
            }
        });

        Self {
            addr,
            shared,
            conns,
            task,
        }
    }

    /// Hub base URL for the client.
    pub fn url(&self) -> String {
        format!("http://{}/hubs/core", self.addr)
    }

    /// Wait for the next handshaken WebSocket connection.
    pub async fn accept(&mut self) -> HubConn {
        tokio::time::timeout(WAIT, self.conns.recv())
            .await
            .expect("timed out waiting for a hub connection")
            .expect("hub stopped")
    }

    /// Whether a connection arrives within `within`.
    pub async fn try_accept(&mut self, within: Duration) -> Option<HubConn> {
        tokio::time::timeout(within, self.conns.recv()).await.ok().flatten()
    }

    /// Number of negotiate requests served so far.
    pub fn negotiate_count(&self) -> usize {
        self.shared.negotiate_count.load(Ordering::SeqCst)
    }

    /// Raw request heads of every negotiate request.
    pub fn negotiate_requests(&self) -> Vec<String> {
        self.shared.negotiate_requests.lock().unwrap().clone()
    }

    /// Change the negotiate status for later requests.
    pub fn set_negotiate_status(&self, status: u16) {
        self.shared.negotiate_status.store(status, Ordering::SeqCst);
    }

    /// Change the handshake reply for later connections.
    pub fn set_handshake_reply(&self, reply: &str) {
        *self.shared.handshake_reply.lock().unwrap() = reply.to_string();
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>, conns: mpsc::UnboundedSender<HubConn>) {
    let mut head = [0u8; 4];
    for _ in 0..200 {
        match stream.peek(&mut head).await {
            Ok(n) if n >= 4 => break,
            Ok(0) | Err(_) => return,
            Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }

    if &head == b"POST" {
        serve_negotiate(stream, &shared).await;
    } else {
        serve_socket(stream, &shared, conns).await;
    }
}

async fn serve_negotiate(mut stream: TcpStream, shared: &Shared) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    shared.negotiate_count.fetch_add(1, Ordering::SeqCst);
    shared
        .negotiate_requests
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&head).into_owned());

    let status = shared.negotiate_status.load(Ordering::SeqCst);
    let response = if status == 200 {
        let body = json!({
            "negotiateVersion": 1,
            "connectionId": "cid",
            "connectionToken": "abc",
            "availableTransports": [
                {"transport": "WebSockets", "transferFormats": ["Text", "Binary"]}
            ]
        })
        .to_string();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    } else {
        format!("HTTP/1.1 {status} Test Failure\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
    };
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn serve_socket(stream: TcpStream, shared: &Shared, conns: mpsc::UnboundedSender<HubConn>) {
    let captured: Arc<Mutex<(Option<String>, Vec<(String, String)>)>> =
        Arc::new(Mutex::new((None, Vec::new())));
    let sink = Arc::clone(&captured);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let headers = request
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        *sink.lock().unwrap() = (request.uri().query().map(ToString::to_string), headers);
        Ok(response)
    };

    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    let handshake = match tokio::time::timeout(WAIT, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        _ => return,
    };

    let reply = shared.handshake_reply.lock().unwrap().clone();
    if !reply.is_empty() && ws.send(Message::Text(reply)).await.is_err() {
        return;
    }

    let (query, headers) = captured.lock().unwrap().clone();
    let _ = conns.send(HubConn {
        ws,
        query,
        headers,
        handshake,
        buffered: VecDeque::new(),
    });
}

/// Server side of one client connection.
#[derive(Debug)]
pub struct HubConn {
    ws: WebSocketStream<TcpStream>,
    /// Query string of the upgrade request.
    pub query: Option<String>,
    /// Upgrade request headers, names lowercased.
    pub headers: Vec<(String, String)>,
    /// Raw handshake text the client sent.
    pub handshake: String,
    buffered: VecDeque<Value>,
}

impl HubConn {
    /// Value of upgrade header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Next text message from the client.
    pub async fn recv_text(&mut self) -> String {
        loop {
            let msg = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a client message")
                .expect("client closed the socket")
                .expect("socket error");
            match msg {
                Message::Text(text) => return text,
                Message::Binary(data) => return String::from_utf8(data).unwrap(),
                Message::Close(_) => panic!("client sent close"),
                _ => {}
            }
        }
    }

    /// Next record from the client, decoded.
    pub async fn recv_record(&mut self) -> Value {
        while self.buffered.is_empty() {
            let text = self.recv_text().await;
            for record in text.split('\u{1e}').filter(|r| !r.is_empty()) {
                self.buffered.push_back(serde_json::from_str(record).unwrap());
            }
        }
        self.buffered.pop_front().unwrap()
    }

    /// Next invocation record: `(invocationId, target, arguments)`.
    pub async fn recv_invocation(&mut self) -> (Option<String>, String, Vec<Value>) {
        let record = self.recv_record().await;
        assert_eq!(record["type"], 1, "expected an invocation, got {record}");
        let id = record
            .get("invocationId")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let target = record["target"].as_str().unwrap().to_string();
        let args = record["arguments"].as_array().cloned().unwrap_or_default();
        (id, target, args)
    }

    /// Whether the client closed the socket within `within`.
    pub async fn closed_within(&mut self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return false,
                Ok(None | Some(Err(_) | Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Send raw text as one message.
    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// Send several records batched into one message.
    pub async fn send_records(&mut self, records: &[Value]) {
        let mut text = String::new();
        for record in records {
            text.push_str(&record.to_string());
            text.push('\u{1e}');
        }
        self.send_raw(&text).await;
    }

    /// Complete invocation `id` with `result`.
    pub async fn complete(&mut self, id: &str, result: Value) {
        self.send_records(&[json!({"type": 3, "invocationId": id, "result": result})])
            .await;
    }

    /// Push an event invocation to the client.
    pub async fn push(&mut self, target: &str, arguments: Value) {
        self.send_records(&[json!({"type": 1, "target": target, "arguments": arguments})])
            .await;
    }

    /// Send a WebSocket close frame.
    pub async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Poll `condition` every 10 ms until it holds or [`WAIT`] passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
