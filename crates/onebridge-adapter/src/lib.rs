//! OneBot v11 bridge core.
//!
//! Inbound wire events pass the [`filter`], are translated by [`translator`]
//! and handed to a [`dispatch::Dispatcher`]. Lifecycle and heartbeat events
//! feed the [`heartbeat`] monitor. Outbound sends and admin operations run
//! through the [`executor`]. [`adapter::OneBotAdapter`] ties it together and
//! owns the [`shutdown`] sequence.

pub mod adapter;
pub mod dispatch;
pub mod executor;
pub mod filter;
pub mod heartbeat;
pub mod shutdown;
pub mod translator;

pub use adapter::{AdapterState, OneBotAdapter};
pub use dispatch::Dispatcher;
pub use executor::AdminOperation;
pub use heartbeat::{LiveConnection, LivenessEvent};
pub use shutdown::{ShutdownPhase, ShutdownReport};
