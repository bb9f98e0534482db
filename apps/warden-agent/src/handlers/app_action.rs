//! APP_ACTION: forward a server-side request to a supervised worker via
//! the app bridge and record the outcome in the action's response slot.
//! The action is acknowledged either way; a bridge failure travels to
//! the server inside the ack payload, not as a withheld ack.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warden_protocol::{Action, ActionPayload};

use crate::acker::Acker;
use crate::dispatcher::ActionHandler;
use crate::errors::AgentError;
use crate::util::env_u64;

/// External collaborator: the gRPC surface a worker answers app actions
/// on.
#[async_trait]
pub trait AppBridge: Send + Sync {
    async fn perform(&self, input_type: &str, data: &Value) -> Result<Value, AgentError>;
}

/// Stand-in bridge for hosts with no worker gRPC surface: every app
/// action completes with an error recorded in its response slot.
#[derive(Default)]
pub struct NoopAppBridge;

#[async_trait]
impl AppBridge for NoopAppBridge {
    async fn perform(&self, input_type: &str, _data: &Value) -> Result<Value, AgentError> {
        Err(AgentError::unexpected(format!(
            "no application is registered to handle '{input_type}' actions"
        )))
    }
}

pub struct AppActionHandler {
    bridge: Arc<dyn AppBridge>,
    timeout: Duration,
}

impl AppActionHandler {
    pub fn new(bridge: Arc<dyn AppBridge>) -> Self {
        Self {
            bridge,
            timeout: Duration::from_secs(env_u64("WARDEN_APP_ACTION_TIMEOUT_SECS", 60).max(1)),
        }
    }
}

fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl ActionHandler for AppActionHandler {
    async fn handle(
        &self,
        token: &CancellationToken,
        action: &mut Action,
        _acker: &dyn Acker,
    ) -> Result<(), AgentError> {
        let ActionPayload::App(app) = &mut action.payload else {
            return Err(AgentError::for_action(
                "expected an APP_ACTION payload",
                action.id.clone(),
            ));
        };

        app.started_at = Some(now_str());
        debug!(action_id = %action.id, input_type = %app.input_type, "forwarding app action");

        let outcome = tokio::select! {
            _ = token.cancelled() => Err(AgentError::cancelled("app action interrupted by shutdown")),
            res = tokio::time::timeout(self.timeout, self.bridge.perform(&app.input_type, &app.data)) => {
                match res {
                    Ok(inner) => inner,
                    Err(_) => Err(AgentError::unexpected(format!(
                        "app action timed out after {:?}",
                        self.timeout
                    ))),
                }
            }
        };

        match outcome {
            Ok(response) => {
                app.response = Some(response);
            }
            Err(err) => {
                warn!(action_id = %action.id, %err, "app action failed");
                app.error = Some(err.to_string());
            }
        }
        app.completed_at = Some(now_str());
        Ok(())
    }
}
