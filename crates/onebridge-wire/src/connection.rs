//! Per-socket plumbing shared by the server and client transports.
//!
//! A [`ConnectionHub`] tracks every open socket, maps bot self ids to their
//! socket, and correlates action responses with the pending caller by
//! `echo`.

use crate::event::{parse_frame, ActionResponse, Frame, WireEvent};
use crate::transport::WireError;
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info, warn};

pub(crate) type WsSink = Box<dyn Sink<WsMessage, Error = WsError> + Send + Unpin>;
pub(crate) type SharedSink = Arc<AsyncMutex<WsSink>>;

#[derive(Serialize)]
struct ActionRequest<'a> {
    action: &'a str,
    params: serde_json::Value,
    echo: &'a str,
}

#[derive(Clone)]
pub(crate) struct ConnectionHub {
    /// Every open socket, keyed by a local serial.
    sockets: Arc<DashMap<u64, SharedSink>>,
    /// Socket of each identified bot.
    bots: Arc<DashMap<i64, SharedSink>>,
    /// Callers awaiting a response, with the socket the request went out on.
    pending: Arc<DashMap<String, (SharedSink, oneshot::Sender<ActionResponse>)>>,
    next_serial: Arc<AtomicU64>,
    api_timeout: Duration,
}

impl ConnectionHub {
    pub(crate) fn new(api_timeout: Duration) -> Self {
        Self {
            sockets: Arc::new(DashMap::new()),
            bots: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            next_serial: Arc::new(AtomicU64::new(1)),
            api_timeout,
        }
    }

    pub(crate) fn connected_bots(&self) -> Vec<i64> {
        self.bots.iter().map(|e| *e.key()).collect()
    }

    pub(crate) fn open_sockets(&self) -> usize {
        self.sockets.len()
    }

    fn bind_bot(&self, self_id: i64, sink: &SharedSink) {
        let previous = self.bots.insert(self_id, sink.clone());
        if previous.is_none() {
            info!(self_id, "Bot connection registered");
        }
    }

    /// Pump frames from one socket until it closes or the event receiver
    /// goes away. `self_id` is known up front when the handshake carried it.
    pub(crate) async fn read_loop<S>(
        &self,
        mut stream: S,
        sink: SharedSink,
        mut self_id: Option<i64>,
        events: mpsc::Sender<WireEvent>,
    ) where
        S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
    {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        self.sockets.insert(serial, sink.clone());
        if let Some(id) = self_id {
            self.bind_bot(id, &sink);
        }

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    if !self.handle_text(&text, &sink, &mut self_id, &events).await {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Err(e) => {
                    warn!(error = %e, "WebSocket read error");
                    break;
                }
                _ => {} // Binary, Ping, Pong
            }
        }

        self.sockets.remove(&serial);
        if let Some(id) = self_id {
            self.bots.remove_if(&id, |_, s| Arc::ptr_eq(s, &sink));
            info!(self_id = id, "Bot connection closed");
        }
        // Dropping the senders wakes callers on this socket with ConnectionClosed.
        let before = self.pending.len();
        self.pending.retain(|_, (s, _)| !Arc::ptr_eq(s, &sink));
        let failed = before.saturating_sub(self.pending.len());
        if failed > 0 {
            debug!(failed, "Failed pending calls on closed socket");
        }
    }

    /// Returns `false` once nobody is listening for events.
    async fn handle_text(
        &self,
        text: &str,
        sink: &SharedSink,
        self_id: &mut Option<i64>,
        events: &mpsc::Sender<WireEvent>,
    ) -> bool {
        match parse_frame(text) {
            Ok(Frame::Response(resp)) => {
                match self.pending.remove(&resp.echo) {
                    Some((_, (_, tx))) => {
                        let _ = tx.send(resp);
                    }
                    None => debug!(echo = %resp.echo, "Response with no pending caller"),
                }
                true
            }
            Ok(Frame::Event(event)) => {
                let id = event.self_id();
                if *self_id != Some(id) {
                    if let Some(old) = self_id.replace(id) {
                        self.bots.remove_if(&old, |_, s| Arc::ptr_eq(s, sink));
                    }
                    self.bind_bot(id, sink);
                }
                events.send(event).await.is_ok()
            }
            Ok(Frame::Unknown(value)) => {
                debug!(frame = %value, "Ignoring unrecognized frame");
                true
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                true
            }
        }
    }

    /// Send an action on the socket of `self_id` and wait for its response.
    pub(crate) async fn call(
        &self,
        self_id: i64,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, WireError> {
        let sink = self
            .bots
            .get(&self_id)
            .map(|e| e.value().clone())
            .ok_or(WireError::NotConnected(self_id))?;

        let echo = uuid::Uuid::new_v4().to_string();
        let frame = serde_json::to_string(&ActionRequest {
            action,
            params,
            echo: &echo,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(echo.clone(), (sink.clone(), tx));

        let sent = sink.lock().await.send(WsMessage::Text(frame)).await;
        if let Err(e) = sent {
            self.pending.remove(&echo);
            return Err(e.into());
        }
        debug!(self_id, action, echo = %echo, "Action sent");

        match tokio::time::timeout(self.api_timeout, rx).await {
            Ok(Ok(resp)) if resp.is_ok() => Ok(resp.data),
            Ok(Ok(resp)) => Err(WireError::ActionFailed {
                action: action.to_string(),
                retcode: resp.retcode,
                message: resp.message.unwrap_or(resp.status),
            }),
            Ok(Err(_)) => Err(WireError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&echo);
                Err(WireError::Timeout {
                    action: action.to_string(),
                })
            }
        }
    }

    /// Close every open socket and fail every pending call.
    pub(crate) async fn close_all(&self) -> usize {
        let sockets: Vec<SharedSink> = self.sockets.iter().map(|e| e.value().clone()).collect();
        self.sockets.clear();
        self.bots.clear();
        // Dropping the senders wakes callers with ConnectionClosed.
        self.pending.clear();

        for sink in &sockets {
            if let Err(e) = sink.lock().await.close().await {
                debug!(error = %e, "Error closing socket");
            }
        }
        sockets.len()
    }
}
