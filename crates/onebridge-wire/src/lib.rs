//! OneBot v11 wire protocol and transports.
//!
//! Inbound frames are parsed into typed [`event::WireEvent`]s; outbound
//! platform calls are `{action, params, echo}` frames whose responses are
//! correlated by `echo`. Two [`transport::Transport`] implementations are
//! provided: a reverse WebSocket server (the bot implementation connects to
//! us) and a forward WebSocket client.

pub mod api;
pub mod client;
mod connection;
pub mod event;
pub mod server;
pub mod tasks;
pub mod transport;

pub use transport::{EventStream, Transport, WireError};
