//! Forward WebSocket transport: we connect to the bot implementation.
//!
//! The first connection attempt happens inside `start` so a bad URL or an
//! unreachable endpoint fails startup. After that, a dropped connection is
//! re-established with exponential backoff until `close_connection`.

use crate::connection::{ConnectionHub, SharedSink, WsSink};
use crate::event::WireEvent;
use crate::tasks::TaskSet;
use crate::transport::{EventStream, Transport, WireError};
use async_trait::async_trait;
use futures::StreamExt;
use onebridge_types::config::BridgeConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Maximum backoff between reconnection attempts.
const MAX_BACKOFF_SECS: u64 = 60;

/// Capacity of the inbound event channel.
const EVENT_BUFFER: usize = 256;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Forward WebSocket client transport.
pub struct ForwardWsClient {
    url: String,
    /// SECURITY: Access token is zeroized on drop.
    access_token: Option<Arc<Zeroizing<String>>>,
    hub: ConnectionHub,
    connected: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl ForwardWsClient {
    pub fn new(url: String, access_token: Option<String>, api_timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            url,
            access_token: access_token
                .filter(|t| !t.is_empty())
                .map(|t| Arc::new(Zeroizing::new(t))),
            hub: ConnectionHub::new(api_timeout),
            connected: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.url.clone().unwrap_or_default(),
            config.access_token.as_deref().cloned(),
            config.api_timeout(),
        )
    }

    /// Self ids of the bots seen on the current connection.
    pub fn connected_bots(&self) -> Vec<i64> {
        self.hub.connected_bots()
    }
}

/// Validate the endpoint URL. Only `ws` and `wss` are accepted.
fn parse_endpoint(raw: &str) -> Result<url::Url, WireError> {
    let parsed = url::Url::parse(raw).map_err(|e| WireError::InvalidUrl(format!("{raw}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(WireError::InvalidUrl(format!(
            "{raw}: unsupported scheme '{other}'"
        ))),
    }
}

async fn connect(
    endpoint: &url::Url,
    token: Option<&Zeroizing<String>>,
) -> Result<ClientStream, WireError> {
    let mut request = endpoint.as_str().into_client_request()?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
            .map_err(|e| WireError::WebSocket(format!("invalid access token header: {e}")))?;
        request.headers_mut().insert("Authorization", value);
    }
    let (stream, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

fn into_shared(stream: ClientStream) -> (SharedSink, futures::stream::SplitStream<ClientStream>) {
    let (sink, stream) = stream.split();
    (Arc::new(AsyncMutex::new(Box::new(sink) as WsSink)), stream)
}

#[async_trait]
impl Transport for ForwardWsClient {
    fn name(&self) -> &str {
        "forward-ws"
    }

    async fn start(&self, tasks: &TaskSet) -> Result<EventStream, WireError> {
        let endpoint = parse_endpoint(&self.url)?;
        let first = connect(&endpoint, self.access_token.as_deref()).await?;
        info!(url = %endpoint, "Forward WebSocket connected");

        let (tx, rx) = mpsc::channel::<WireEvent>(EVENT_BUFFER);
        let hub = self.hub.clone();
        let token = self.access_token.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let spawned = tasks.spawn("forward-ws-reader", async move {
            let mut backoff = Duration::from_secs(1);
            let mut current = Some(first);

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let stream = match current.take() {
                    Some(stream) => stream,
                    None => match connect(&endpoint, token.as_deref()).await {
                        Ok(stream) => {
                            info!(url = %endpoint, "Forward WebSocket reconnected");
                            backoff = Duration::from_secs(1);
                            stream
                        }
                        Err(e) => {
                            warn!(error = %e, "Forward WebSocket connection failed");
                            tokio::select! {
                                changed = shutdown_rx.changed() => {
                                    if changed.is_err() {
                                        break;
                                    }
                                }
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
                            continue;
                        }
                    },
                };

                let (sink, stream) = into_shared(stream);
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = hub.read_loop(stream, sink, None, tx.clone()) => {}
                }
                if tx.is_closed() || *shutdown_rx.borrow() {
                    break;
                }

                warn!(
                    "Forward WebSocket disconnected, reconnecting in {}s",
                    backoff.as_secs()
                );
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
            }

            info!("Forward WebSocket loop stopped");
        });
        if !spawned {
            return Err(WireError::ConnectionClosed);
        }

        self.connected.store(true, Ordering::SeqCst);
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

    async fn close_connection(&self) -> Result<(), WireError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // Stop reconnecting before the socket goes away.
        self.shutdown_tx.send_replace(true);
        let closed = self.hub.close_all().await;
        info!(closed, "Forward WebSocket closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert!(parse_endpoint("ws://127.0.0.1:3001").is_ok());
        assert!(parse_endpoint("wss://bot.example.com/onebot").is_ok());
        assert!(matches!(
            parse_endpoint("http://127.0.0.1:3001"),
            Err(WireError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_endpoint("not a url"),
            Err(WireError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_start_with_invalid_url_fails() {
        let client = ForwardWsClient::new("".to_string(), None, Duration::from_secs(1));
        let tasks = TaskSet::new();
        let err = client.start(&tasks).await.err().unwrap();
        assert!(matches!(err, WireError::InvalidUrl(_)));
        assert_eq!(tasks.active(), 0);
    }

    #[tokio::test]
    async fn test_start_with_unreachable_endpoint_fails() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ForwardWsClient::new(format!("ws://{addr}"), None, Duration::from_secs(1));
        let tasks = TaskSet::new();
        let err = client.start(&tasks).await.err().unwrap();
        assert!(matches!(err, WireError::WebSocket(_)));
    }

    #[tokio::test]
    async fn test_close_before_start_is_noop() {
        let client = ForwardWsClient::new(
            "ws://127.0.0.1:1".to_string(),
            Some("t".to_string()),
            Duration::from_secs(1),
        );
        assert_eq!(client.name(), "forward-ws");
        assert!(client.close_connection().await.is_ok());
        assert!(client.connected_bots().is_empty());
    }
}
