//! POLICY_REASSIGN: the server moves this agent to another policy; the
//! new policy document arrives as its own action, so there is nothing to
//! do here beyond acknowledging receipt.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use warden_protocol::{Action, ActionPayload};

use crate::acker::Acker;
use crate::dispatcher::ActionHandler;
use crate::errors::AgentError;

#[derive(Default)]
pub struct PolicyReassignHandler;

#[async_trait]
impl ActionHandler for PolicyReassignHandler {
    async fn handle(
        &self,
        _token: &CancellationToken,
        action: &mut Action,
        _acker: &dyn Acker,
    ) -> Result<(), AgentError> {
        if let ActionPayload::PolicyReassign { policy_id } = &action.payload {
            info!(action_id = %action.id, %policy_id, "agent reassigned to policy");
        }
        Ok(())
    }
}
