//! POLICY_CHANGE: hand the new policy to the emitter. Persistence rides
//! on the acknowledgement through the state-store acker layer, so the
//! persist-before-ack ordering holds without this handler touching disk.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use warden_protocol::{Action, ActionPayload};

use crate::acker::Acker;
use crate::dispatcher::ActionHandler;
use crate::emitter::Emitter;
use crate::errors::AgentError;

pub struct PolicyChangeHandler {
    emitter: Arc<Emitter>,
}

impl PolicyChangeHandler {
    pub fn new(emitter: Arc<Emitter>) -> Self {
        Self { emitter }
    }
}

#[async_trait]
impl ActionHandler for PolicyChangeHandler {
    async fn handle(
        &self,
        _token: &CancellationToken,
        action: &mut Action,
        _acker: &dyn Acker,
    ) -> Result<(), AgentError> {
        let ActionPayload::PolicyChange { policy } = &action.payload else {
            return Err(AgentError::for_action(
                "expected a POLICY_CHANGE payload",
                action.id.clone(),
            ));
        };
        info!(action_id = %action.id, "applying policy change");
        self.emitter.emit(policy).await
    }
}
