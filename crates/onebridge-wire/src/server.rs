//! Reverse WebSocket transport: the bot implementation connects to us.
//!
//! Binds a TCP listener and upgrades every accepted connection to a
//! WebSocket. Each bot identifies itself with the `X-Self-ID` handshake
//! header (or, failing that, with the `self_id` of its first event). When an
//! access token is configured, the handshake must present it either as an
//! `Authorization: Bearer <token>` header or an `access_token` query
//! parameter.

use crate::connection::{ConnectionHub, SharedSink, WsSink};
use crate::event::WireEvent;
use crate::tasks::TaskSet;
use crate::transport::{EventStream, Transport, WireError};
use async_trait::async_trait;
use futures::StreamExt;
use onebridge_types::config::BridgeConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// How long `shutdown_server` waits for the accept loop to drop the listener.
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the inbound event channel.
const EVENT_BUFFER: usize = 256;

/// Reverse WebSocket server transport.
pub struct ReverseWsServer {
    listen_addr: String,
    /// SECURITY: Access token is zeroized on drop.
    access_token: Option<Arc<Zeroizing<String>>>,
    hub: ConnectionHub,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
    stopped_tx: Arc<watch::Sender<bool>>,
}

impl ReverseWsServer {
    pub fn new(listen_addr: String, access_token: Option<String>, api_timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);
        Self {
            listen_addr,
            access_token: access_token
                .filter(|t| !t.is_empty())
                .map(|t| Arc::new(Zeroizing::new(t))),
            hub: ConnectionHub::new(api_timeout),
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            shutdown_tx,
            stopped_tx: Arc::new(stopped_tx),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.listen_addr(),
            config.access_token.as_deref().cloned(),
            config.api_timeout(),
        )
    }

    /// The bound address, once started. Useful when binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Self ids of the bots currently connected.
    pub fn connected_bots(&self) -> Vec<i64> {
        self.hub.connected_bots()
    }

    /// Accepted sockets, including ones whose bot has not identified yet.
    pub fn open_connections(&self) -> usize {
        self.hub.open_sockets()
    }
}

/// Check the handshake credentials against the configured token.
fn authorized(req: &Request, expected: &str) -> bool {
    let header_ok = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let v = v.trim();
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("Token "))
                .unwrap_or(v)
                .trim()
                == expected
        })
        .unwrap_or(false);
    if header_ok {
        return true;
    }
    req.uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .any(|(k, v)| k == "access_token" && v == expected)
        })
        .unwrap_or(false)
}

async fn handle_peer(
    stream: TcpStream,
    peer: SocketAddr,
    hub: ConnectionHub,
    token: Option<Arc<Zeroizing<String>>>,
    events: mpsc::Sender<WireEvent>,
) {
    let mut header_self_id: Option<i64> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if let Some(expected) = token.as_deref() {
            if !authorized(req, expected.as_str()) {
                let mut err = ErrorResponse::new(Some("invalid access token".to_string()));
                *err.status_mut() = StatusCode::UNAUTHORIZED;
                return Err(err);
            }
        }
        header_self_id = req
            .headers()
            .get("X-Self-ID")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        Ok(resp)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket handshake rejected");
            return;
        }
    };
    info!(peer = %peer, self_id = ?header_self_id, "Bot connected to reverse WebSocket");

    let (sink, stream) = ws.split();
    let sink: SharedSink = Arc::new(AsyncMutex::new(Box::new(sink) as WsSink));
    hub.read_loop(stream, sink, header_self_id, events).await;
    debug!(peer = %peer, "Peer read loop finished");
}

#[async_trait]
impl Transport for ReverseWsServer {
    fn name(&self) -> &str {
        "reverse-ws"
    }

    async fn start(&self, tasks: &TaskSet) -> Result<EventStream, WireError> {
        let listener =
            TcpListener::bind(&self.listen_addr)
                .await
                .map_err(|e| WireError::Bind {
                    addr: self.listen_addr.clone(),
                    reason: e.to_string(),
                })?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local);
        info!(addr = %local, "Reverse WebSocket server listening");

        let (tx, rx) = mpsc::channel::<WireEvent>(EVENT_BUFFER);
        let hub = self.hub.clone();
        let token = self.access_token.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stopped_tx = Arc::clone(&self.stopped_tx);
        let peer_tasks = tasks.clone();

        let spawned = tasks.spawn("reverse-ws-accept", async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Accepted TCP connection");
                            peer_tasks.spawn(
                                format!("reverse-ws-peer-{peer}"),
                                handle_peer(stream, peer, hub.clone(), token.clone(), tx.clone()),
                            );
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
            }
            drop(listener);
            stopped_tx.send_replace(true);
            info!("Reverse WebSocket server stopped accepting connections");
        });
        if !spawned {
            return Err(WireError::ConnectionClosed);
        }

        self.started.store(true, Ordering::SeqCst);
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn call_action(
        &self,
        self_id: i64,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, WireError> {
        self.hub.call(self_id, action, params).await
    }

    async fn shutdown_server(&self) -> Result<(), WireError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown_tx.send_replace(true);
        let mut stopped_rx = self.stopped_tx.subscribe();
        if tokio::time::timeout(LISTENER_STOP_TIMEOUT, stopped_rx.wait_for(|stopped| *stopped))
            .await
            .is_err()
        {
            warn!("Accept loop did not release the listener in time");
        }

        let closed = self.hub.close_all().await;
        info!(closed, "Closed bot connections");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut req = uri.into_client_request().unwrap();
        if let Some(auth) = auth {
            req.headers_mut()
                .insert("Authorization", auth.parse().unwrap());
        }
        req
    }

    #[test]
    fn test_authorized_bearer_header() {
        assert!(authorized(
            &request("ws://127.0.0.1:8080/", Some("Bearer secret")),
            "secret"
        ));
        assert!(authorized(
            &request("ws://127.0.0.1:8080/", Some("Token secret")),
            "secret"
        ));
        assert!(!authorized(
            &request("ws://127.0.0.1:8080/", Some("Bearer wrong")),
            "secret"
        ));
    }

    #[test]
    fn test_authorized_query_param() {
        assert!(authorized(
            &request("ws://127.0.0.1:8080/?access_token=secret", None),
            "secret"
        ));
        assert!(!authorized(&request("ws://127.0.0.1:8080/", None), "secret"));
    }

    #[test]
    fn test_empty_token_disables_auth() {
        let server = ReverseWsServer::new(
            "127.0.0.1:0".to_string(),
            Some(String::new()),
            Duration::from_secs(1),
        );
        assert!(server.access_token.is_none());
        assert_eq!(server.name(), "reverse-ws");
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let tasks = TaskSet::new();
        let first = ReverseWsServer::new(
            "127.0.0.1:0".to_string(),
            None,
            Duration::from_secs(1),
        );
        let _events = first.start(&tasks).await.unwrap();
        let addr = first.local_addr().unwrap();

        let second = ReverseWsServer::new(addr.to_string(), None, Duration::from_secs(1));
        let err = second.start(&tasks).await.err().unwrap();
        assert!(matches!(err, WireError::Bind { .. }));

        first.shutdown_server().await.unwrap();
        tasks.cancel_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_call_without_connection_fails() {
        let server = ReverseWsServer::new(
            "127.0.0.1:0".to_string(),
            None,
            Duration::from_secs(1),
        );
        let err = server
            .call_action(42, "send_msg", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::NotConnected(42)));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let server = ReverseWsServer::new(
            "127.0.0.1:0".to_string(),
            None,
            Duration::from_secs(1),
        );
        assert!(server.shutdown_server().await.is_ok());
    }
}
