//! Acknowledgement chain. Layers share one two-operation contract and
//! compose by explicit wrapping:
//!
//! `FleetAcker` (HTTP) → `Retrier` (background re-send) → `LazyAcker`
//! (batching) → `StateStoreAcker` (persist-then-ack for policy state).
//!
//! Duplicates toward the server are acceptable; losses are not.

use async_trait::async_trait;

use warden_protocol::Action;

use crate::errors::AgentError;

mod fleet;
mod lazy;
mod retrier;
mod store;

pub use fleet::FleetAcker;
pub use lazy::LazyAcker;
pub use retrier::Retrier;
pub use store::StateStoreAcker;

/// Two-operation acknowledgement contract shared by every layer.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Queue an acknowledgement for one action.
    async fn ack(&self, action: &Action) -> Result<(), AgentError>;
    /// Flush whatever `ack` queued.
    async fn commit(&self) -> Result<(), AgentError>;
}

/// Batch send used by the lazy acker and the retrier underneath it.
#[async_trait]
pub trait BatchAcker: Send + Sync {
    async fn ack_batch(&self, actions: &[Action]) -> Result<(), AgentError>;
}
