//! SETTINGS: update the persisted log level and restart so the new
//! level takes effect. The ack is flushed before the restart is
//! requested so it is on the wire even if the drain window is cut short.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warden_protocol::{Action, ActionPayload};

use crate::acker::Acker;
use crate::agent_info::AgentInfo;
use crate::dispatcher::ActionHandler;
use crate::errors::AgentError;
use crate::reexec::ReexecManager;

pub struct SettingsHandler {
    agent_info: AgentInfo,
    reexec: Arc<ReexecManager>,
}

impl SettingsHandler {
    pub fn new(agent_info: AgentInfo, reexec: Arc<ReexecManager>) -> Self {
        Self { agent_info, reexec }
    }
}

#[async_trait]
impl ActionHandler for SettingsHandler {
    async fn handle(
        &self,
        _token: &CancellationToken,
        action: &mut Action,
        acker: &dyn Acker,
    ) -> Result<(), AgentError> {
        let ActionPayload::Settings { log_level } = &action.payload else {
            return Err(AgentError::for_action(
                "expected a SETTINGS payload",
                action.id.clone(),
            ));
        };

        // Validation happens here; an unsupported level leaves the
        // action unacked so the server sees the failure and re-delivers.
        self.agent_info.set_log_level(log_level)?;
        info!(action_id = %action.id, %log_level, "log level updated; restart pending");

        if let Err(err) = acker.ack(action).await {
            warn!(action_id = %action.id, %err, "failed to acknowledge settings action");
        } else if let Err(err) = acker.commit().await {
            warn!(action_id = %action.id, %err, "failed to commit settings acknowledgement");
        }

        self.reexec.trigger();
        Ok(())
    }
}
