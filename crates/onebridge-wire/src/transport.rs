//! The transport contract the adapter drives.

use crate::event::WireEvent;
use crate::tasks::TaskSet;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

/// Errors from the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("No open connection for bot {0}")]
    NotConnected(i64),
    #[error("Action '{action}' timed out")]
    Timeout { action: String },
    #[error("Action '{action}' failed (retcode={retcode}): {message}")]
    ActionFailed {
        action: String,
        retcode: i64,
        message: String,
    },
    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for WireError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}

/// Stream of typed inbound events, in arrival order per connection.
pub type EventStream = Pin<Box<dyn Stream<Item = WireEvent> + Send>>;

/// A connection to one or more bot implementations.
///
/// Implementations own the socket handling and handshake. The adapter only
/// consumes the event stream, issues actions and drives teardown.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name.
    fn name(&self) -> &str;

    /// Bind/connect and start delivering events. Background tasks must be
    /// spawned into `tasks` so the adapter can cancel them on shutdown.
    async fn start(&self, tasks: &TaskSet) -> Result<EventStream, WireError>;

    /// Issue an action on the connection of bot `self_id` and wait for its
    /// response `data`.
    async fn call_action(
        &self,
        self_id: i64,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, WireError>;

    /// Close the outbound connection, if this transport has one.
    async fn close_connection(&self) -> Result<(), WireError> {
        Ok(())
    }

    /// Stop accepting new connections, then close the accepted ones, if this
    /// transport hosts a listener.
    async fn shutdown_server(&self) -> Result<(), WireError> {
        Ok(())
    }
}
