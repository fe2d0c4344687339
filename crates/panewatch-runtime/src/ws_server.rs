use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use panewatch_tmux::TmuxCommandRunner;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcaster, ClientId};
use crate::control::Controller;
use crate::messages::{ClientRequest, OutboundMessage};
use crate::reconciler::Reconciler;

// ─── Origin validation ────────────────────────────────────────────

/// Allowed: `tauri://…`, `http://localhost…`, `http://127.0.0.1…`, `null`,
/// or no `Origin` header at all (native clients). Anything else gets 403.
fn validate_origin(req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    if let Some(origin) = req.headers().get("origin") {
        let origin_str = origin.to_str().unwrap_or("");
        if origin_str == "null"
            || origin_str.starts_with("tauri://")
            || origin_str.starts_with("http://localhost")
            || origin_str.starts_with("http://127.0.0.1")
        {
            return Ok(resp);
        }
        tracing::warn!(origin = %origin_str, "ws: rejected connection from disallowed origin");
        let err_resp = http::Response::builder()
            .status(http::StatusCode::FORBIDDEN)
            .body(Some("Origin not allowed".into()))
            .expect("building error response");
        return Err(err_resp);
    }
    Ok(resp)
}

// ─── WsServer ─────────────────────────────────────────────────────

pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Everything a client connection needs.
pub struct ClientHub<R> {
    pub reconciler: Arc<Reconciler>,
    pub broadcaster: Arc<Broadcaster>,
    pub controller: Arc<Controller<R>>,
}

impl<R> Clone for ClientHub<R> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            broadcaster: Arc::clone(&self.broadcaster),
            controller: Arc::clone(&self.controller),
        }
    }
}

pub struct WsServer<R> {
    addr: SocketAddr,
    hub: ClientHub<R>,
    cancel: CancellationToken,
    max_connections: usize,
}

impl<R: TmuxCommandRunner + 'static> WsServer<R> {
    pub fn new(addr: SocketAddr, hub: ClientHub<R>, cancel: CancellationToken) -> Self {
        Self {
            addr,
            hub,
            cancel,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Bind to the configured address and return the actual local address.
    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, max_connections = self.max_connections, "ws server bound");
        Ok((listener, local_addr))
    }

    /// Accept loop on a pre-bound listener, until cancelled.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let permit = match semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    tracing::warn!(
                                        peer = %peer,
                                        max = self.max_connections,
                                        "ws: connection limit reached, rejecting"
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };
                            tracing::debug!(peer = %peer, "ws: TCP connection accepted");
                            let hub = self.hub.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                match tokio_tungstenite::accept_hdr_async(stream, validate_origin).await {
                                    Ok(ws_stream) => {
                                        if let Err(e) = handle_ws_client(ws_stream, hub, cancel).await {
                                            tracing::debug!(peer = %peer, error = %e, "ws client handler finished with error");
                                        }
                                    }
                                    Err(e) => {
                                        tracing::debug!(peer = %peer, error = %e, "ws handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "ws: TCP accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("ws server: cancellation requested, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

// ─── Per-client handler ───────────────────────────────────────────

async fn handle_ws_client<R: TmuxCommandRunner + 'static>(
    ws_stream: WebSocketStream<TcpStream>,
    hub: ClientHub<R>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (client, mut out) = hub.broadcaster.register_deferred();
    let result = client_loop(ws_stream, &hub, client, &mut out, cancel).await;
    hub.broadcaster.unregister(client);
    result
}

async fn client_loop<R: TmuxCommandRunner + 'static>(
    ws_stream: WebSocketStream<TcpStream>,
    hub: &ClientHub<R>,
    client: ClientId,
    out: &mut crate::broadcast::ClientReceiver,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    tracing::debug!(client, clients = hub.broadcaster.client_count(), "ws client connected");

    let hello = OutboundMessage::Hello {
        version: env!("CARGO_PKG_VERSION"),
        windows: hub.reconciler.windows().await,
        sessions: hub.reconciler.sessions().await,
    };
    hub.broadcaster.start(client, &hello);

    loop {
        tokio::select! {
            frame = out.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                let len = frame.len();
                ws_tx.send(Message::Text(frame)).await?;
                out.ack(len);
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::debug!(client, error = %e, "ws read error, dropping client");
                        return Err(e.into());
                    }
                    None => {
                        tracing::debug!(client, "ws client disconnected (stream ended)");
                        return Ok(());
                    }
                };
                match msg {
                    Message::Text(text) => handle_request(hub, client, &text),
                    Message::Ping(data) => ws_tx.send(Message::Pong(data)).await?,
                    Message::Close(_) => {
                        tracing::debug!(client, "ws client sent close frame");
                        return Ok(());
                    }
                    _ => {}
                }
            }
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Parse and dispatch one request. The operation runs on its own task so a
/// slow tmux call never holds up the client's outbound frames.
fn handle_request<R: TmuxCommandRunner + 'static>(hub: &ClientHub<R>, client: ClientId, text: &str) {
    let req: ClientRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            let id = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get("id").cloned())
                .unwrap_or(Value::Null);
            hub.broadcaster.send_to(
                client,
                &OutboundMessage::Error {
                    id,
                    category: "invalid_request".into(),
                    message: format!("parse error: {e}"),
                },
            );
            return;
        }
    };
    tracing::debug!(client, op = req.op.name(), id = %req.id, "ws: request received");

    let controller = Arc::clone(&hub.controller);
    let broadcaster = Arc::clone(&hub.broadcaster);
    tokio::spawn(async move {
        let reply = match controller.execute(client, req.op).await {
            Ok(result) => OutboundMessage::Ack { id: req.id, result },
            Err(e) => OutboundMessage::Error {
                id: req.id,
                category: e.category,
                message: e.message,
            },
        };
        broadcaster.send_to(client, &reply);
    });
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture_scheduler::CaptureHints;
    use crate::config::{BackpressureConfig, DaemonConfig};
    use panewatch_core::{PatternRegistry, SessionState};
    use panewatch_tmux::{Pane, TmuxError, Window};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_tungstenite::MaybeTlsStream;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct NoTmux;

    impl TmuxCommandRunner for NoTmux {
        fn run(&self, _args: &[&str], _timeout: Duration) -> Result<String, TmuxError> {
            Err(TmuxError::from_stderr("no server running on /tmp/tmux-0/default", Some(1)))
        }
    }

    struct TestServer {
        addr: SocketAddr,
        hub: ClientHub<NoTmux>,
        cancel: CancellationToken,
        _handle: tokio::task::JoinHandle<std::io::Result<()>>,
    }

    async fn start_test_server(max_connections: Option<usize>) -> TestServer {
        let broadcaster = Arc::new(Broadcaster::new(BackpressureConfig::default()));
        let reconciler = Arc::new(Reconciler::new(
            &DaemonConfig::default(),
            Arc::new(PatternRegistry::builtin()),
            Arc::clone(&broadcaster),
        ));
        reconciler
            .set_windows(vec![Window {
                id: "@1".into(),
                name: "dev".into(),
                panes: vec![Pane {
                    id: "%1".into(),
                    target: "main:1.0".into(),
                    ..Pane::default()
                }],
                ..Window::default()
            }])
            .await;
        let controller = Arc::new(Controller::new(
            Arc::new(NoTmux),
            Arc::clone(&broadcaster),
            Arc::new(CaptureHints::default()),
            Arc::new(Notify::new()),
        ));
        let hub = ClientHub {
            reconciler,
            broadcaster,
            controller,
        };
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let mut server = WsServer::new(addr, hub.clone(), cancel.clone());
        if let Some(max) = max_connections {
            server = server.with_max_connections(max);
        }
        let (listener, local_addr) = server.bind().await.expect("bind");
        let handle = tokio::spawn(async move { server.serve(listener).await });
        TestServer {
            addr: local_addr,
            hub,
            cancel,
            _handle: handle,
        }
    }

    impl TestServer {
        fn ws_url(&self) -> String {
            format!("ws://127.0.0.1:{}", self.addr.port())
        }

        async fn connect(&self) -> Client {
            let (ws, _) = tokio_tungstenite::connect_async(&self.ws_url()).await.expect("connect");
            ws
        }

        async fn connect_with_origin(&self, origin: &str) -> Result<Client, tokio_tungstenite::tungstenite::Error> {
            let mut req =
                tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(&self.ws_url())
                    .expect("request");
            req.headers_mut().insert("Origin", origin.parse().expect("header"));
            let (ws, _) = tokio_tungstenite::connect_async(req).await?;
            Ok(ws)
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn recv_json(ws: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timeout waiting for frame")
                .expect("stream ended")
                .expect("read error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).expect("json frame");
            }
        }
    }

    /// Skip frames until one of type `kind` arrives.
    async fn recv_type(ws: &mut Client, kind: &str) -> Value {
        loop {
            let v = recv_json(ws).await;
            if v["type"] == kind {
                return v;
            }
        }
    }

    async fn request(ws: &mut Client, body: Value) {
        ws.send(Message::Text(body.to_string())).await.expect("send");
    }

    #[tokio::test]
    async fn hello_is_a_full_snapshot() {
        let server = start_test_server(None).await;
        let mut ws = server.connect().await;
        let hello = recv_json(&mut ws).await;
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["priority"], "normal");
        assert_eq!(hello["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(hello["windows"][0]["panes"][0]["id"], "%1");
        assert_eq!(hello["sessions"], Value::Array(vec![]));
    }

    #[tokio::test]
    async fn broadcasts_reach_connected_clients() {
        let server = start_test_server(None).await;
        let mut ws = server.connect().await;
        recv_type(&mut ws, "hello").await;

        let now = chrono::Utc::now();
        server.hub.broadcaster.broadcast(&OutboundMessage::Session {
            session: SessionState::new("%1", now),
        });
        server.hub.broadcaster.broadcast(&OutboundMessage::PaneRemoved { pane_id: "%1".into() });

        let session = recv_json(&mut ws).await;
        assert_eq!(session["type"], "session");
        assert_eq!(session["session"]["pane_id"], "%1");
        let removed = recv_json(&mut ws).await;
        assert_eq!(removed["type"], "pane_removed");
        assert_eq!(removed["priority"], "high");
    }

    #[tokio::test]
    async fn requests_are_answered_by_id() {
        let server = start_test_server(None).await;
        let mut ws = server.connect().await;
        recv_type(&mut ws, "hello").await;

        request(&mut ws, serde_json::json!({"id": "a", "op": "subscribe_terminal", "pane_id": "%1"})).await;
        let ack = recv_type(&mut ws, "ack").await;
        assert_eq!(ack["id"], "a");
        assert!(server.hub.broadcaster.has_terminal_subscribers("%1"));

        request(&mut ws, serde_json::json!({"id": 2, "op": "send_text", "pane_id": "%1", "text": "y"})).await;
        let err = recv_type(&mut ws, "error").await;
        assert_eq!(err["id"], 2);
        assert_eq!(err["category"], "multiplexer_unreachable");
        assert!(!err["message"].as_str().unwrap_or_default().contains("no server running"));

        request(&mut ws, serde_json::json!({"id": 3, "op": "reboot"})).await;
        let err = recv_type(&mut ws, "error").await;
        assert_eq!(err["id"], 3);
        assert_eq!(err["category"], "invalid_request");
    }

    #[tokio::test]
    async fn terminal_frames_only_after_subscribe() {
        let server = start_test_server(None).await;
        let mut ws = server.connect().await;
        recv_type(&mut ws, "hello").await;

        let terminal = |content: &str| OutboundMessage::Terminal {
            pane_id: "%1".into(),
            fingerprint: "0000000000000001".into(),
            content: content.into(),
        };
        server.hub.broadcaster.broadcast(&terminal("before"));
        request(&mut ws, serde_json::json!({"id": 1, "op": "subscribe_terminal", "pane_id": "%1"})).await;
        recv_type(&mut ws, "ack").await;
        server.hub.broadcaster.broadcast(&terminal("after"));

        let frame = recv_type(&mut ws, "terminal").await;
        assert_eq!(frame["content"], "after");
    }

    #[tokio::test]
    async fn disconnect_unregisters_client() {
        let server = start_test_server(None).await;
        let mut ws = server.connect().await;
        recv_type(&mut ws, "hello").await;
        assert_eq!(server.hub.broadcaster.client_count(), 1);

        ws.close(None).await.expect("close");
        drop(ws);
        for _ in 0..100 {
            if server.hub.broadcaster.client_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.hub.broadcaster.client_count(), 0);
    }

    #[tokio::test]
    async fn origin_check() {
        let server = start_test_server(None).await;
        assert!(server.connect_with_origin("http://localhost:5173").await.is_ok());
        assert!(server.connect_with_origin("tauri://localhost").await.is_ok());
        assert!(server.connect_with_origin("null").await.is_ok());
        assert!(server.connect_with_origin("https://evil.example").await.is_err());
    }

    #[tokio::test]
    async fn connection_limit_rejects_excess_clients() {
        let server = start_test_server(Some(1)).await;
        let mut first = server.connect().await;
        recv_type(&mut first, "hello").await;

        let second = tokio::time::timeout(
            Duration::from_secs(5),
            tokio_tungstenite::connect_async(&server.ws_url()),
        )
        .await
        .expect("handshake attempt finishes");
        assert!(second.is_err());
    }
}
