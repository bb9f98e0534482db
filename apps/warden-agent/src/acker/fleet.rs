//! HTTP layer of the acker chain: converts actions into `ACTION_RESULT /
//! ACKNOWLEDGED` events and posts them. Failures surface to the caller;
//! nothing is retained here.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use warden_protocol::{AckEvent, AckRequest, Action};

use super::{Acker, BatchAcker};
use crate::agent_info::AgentInfo;
use crate::errors::AgentError;
use crate::fleet_client::{request_timeout, FleetClient};

pub struct FleetAcker {
    client: FleetClient,
    agent_info: AgentInfo,
}

impl FleetAcker {
    pub fn new(client: FleetClient, agent_info: AgentInfo) -> Self {
        Self { client, agent_info }
    }

    async fn send(&self, events: Vec<AckEvent>) -> Result<(), AgentError> {
        if events.is_empty() {
            return Ok(());
        }
        let agent_id = self.agent_info.agent_id();
        let req = AckRequest { events };
        let resp = self
            .client
            .ack(&agent_id, &req, request_timeout())
            .await?;
        if resp.errors {
            return Err(AgentError::network("fleet rejected one or more ack events"));
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for FleetAcker {
    async fn ack(&self, action: &Action) -> Result<(), AgentError> {
        let agent_id = self.agent_info.agent_id();
        let event = AckEvent::acknowledged(action, &agent_id, Utc::now());
        self.send(vec![event]).await?;
        debug!(action_id = %action.id, "action acknowledged");
        Ok(())
    }

    async fn commit(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

#[async_trait]
impl BatchAcker for FleetAcker {
    async fn ack_batch(&self, actions: &[Action]) -> Result<(), AgentError> {
        let agent_id = self.agent_info.agent_id();
        let now = Utc::now();
        let events: Vec<AckEvent> = actions
            .iter()
            .map(|a| AckEvent::acknowledged(a, &agent_id, now))
            .collect();
        let ids: Vec<&str> = actions.iter().map(|a| a.id.as_str()).collect();
        debug!(count = ids.len(), ids = ids.join(",") , "acknowledging batch");
        self.send(events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn agent_info(dir: &std::path::Path) -> AgentInfo {
        AgentInfo::load_or_create(dir.join("agent_info.json"), "info").unwrap()
    }

    fn unenroll(id: &str) -> Action {
        serde_json::from_value(json!({"id": id, "type": "UNENROLL"})).unwrap()
    }

    #[tokio::test]
    async fn batch_posts_one_request_with_ordered_events() {
        let tmp = tempdir().unwrap();
        let info = agent_info(tmp.path());
        let agent_id = info.agent_id();

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(format!("/api/fleet/agents/{agent_id}/acks"))
                    .json_body_partial(
                        json!({
                            "events": [
                                {"action_id": "a1", "sub_type": "ACKNOWLEDGED"},
                                {"action_id": "a2", "sub_type": "ACKNOWLEDGED"}
                            ]
                        })
                        .to_string(),
                    );
                then.status(200).json_body(json!({"action": "acks", "errors": false}));
            })
            .await;

        let acker = FleetAcker::new(FleetClient::new(&server.base_url(), ""), info);
        acker
            .ack_batch(&[unenroll("a1"), unenroll("a2")])
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn network_failure_surfaces_without_retention() {
        let tmp = tempdir().unwrap();
        let info = agent_info(tmp.path());
        let acker = FleetAcker::new(FleetClient::new("http://127.0.0.1:9", ""), info);
        let err = acker.ack(&unenroll("a1")).await.unwrap_err();
        assert_eq!(err.kind(), "network");
    }
}
