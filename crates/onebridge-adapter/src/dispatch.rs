//! The dispatch collaborator that consumes translated messages.

use crate::adapter::OneBotAdapter;
use async_trait::async_trait;
use onebridge_types::message::UnifiedMessage;

/// Receives every inbound message that passed the filter.
///
/// Errors and panics are caught by the adapter and logged; they never stop
/// the dispatch loop. Messages from one connection arrive in order.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, adapter: OneBotAdapter, message: UnifiedMessage)
        -> Result<(), String>;
}
