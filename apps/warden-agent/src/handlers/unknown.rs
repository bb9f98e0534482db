//! Fallback for action kinds this build does not understand. Logged and
//! acknowledged so the server stops re-delivering them.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use warden_protocol::Action;

use crate::acker::Acker;
use crate::dispatcher::ActionHandler;
use crate::errors::AgentError;

#[derive(Default)]
pub struct UnknownHandler;

#[async_trait]
impl ActionHandler for UnknownHandler {
    async fn handle(
        &self,
        _token: &CancellationToken,
        action: &mut Action,
        _acker: &dyn Acker,
    ) -> Result<(), AgentError> {
        warn!(action_id = %action.id, action_type = %action.type_str(),
              "received action of unknown type; acknowledging without effect");
        Ok(())
    }
}
