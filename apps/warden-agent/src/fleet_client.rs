//! HTTP client for the fleet control service: check-in and acks.
//!
//! One shared reqwest client with harmonized connection defaults;
//! per-call deadlines come from the caller so the gateway and the acker
//! can pick their own limits.

use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::debug;

use warden_protocol::{AckRequest, AckResponse, CheckinRequest, CheckinResponse};

use crate::errors::AgentError;
use crate::release;
use crate::util::env_u64;

fn connect_timeout() -> Duration {
    Duration::from_secs(env_u64("WARDEN_HTTP_CONNECT_TIMEOUT_SECS", 5).max(1))
}

fn keepalive() -> Duration {
    Duration::from_secs(env_u64("WARDEN_HTTP_TCP_KEEPALIVE_SECS", 60).max(1))
}

fn user_agent() -> String {
    format!("{}/{}", crate::paths::AGENT_NAME, release::version())
}

/// Default per-request deadline when the caller does not pick one.
pub fn request_timeout() -> Duration {
    Duration::from_secs(env_u64("WARDEN_HTTP_TIMEOUT_SECS", 30).max(1))
}

fn shared() -> &'static reqwest::Client {
    static CLIENT: OnceCell<reqwest::Client> = OnceCell::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent(user_agent())
            .connect_timeout(connect_timeout())
            .tcp_keepalive(keepalive())
            .build()
            .expect("http client")
    })
}

#[derive(Clone)]
pub struct FleetClient {
    base: String,
    api_key: String,
    headers: std::collections::BTreeMap<String, String>,
}

impl FleetClient {
    pub fn new(host: &str, api_key: &str) -> Self {
        Self {
            base: host.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            headers: Default::default(),
        }
    }

    /// Extra headers sent on every request (enrollment-scoped metadata).
    pub fn with_headers(mut self, headers: std::collections::BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if self.api_key.is_empty() {
            req
        } else {
            req.header(reqwest::header::AUTHORIZATION, format!("ApiKey {}", self.api_key))
        }
    }

    pub async fn checkin(
        &self,
        agent_id: &str,
        req: &CheckinRequest,
        timeout: Duration,
    ) -> Result<CheckinResponse, AgentError> {
        let url = format!("{}/api/fleet/agents/{}/checkin", self.base, agent_id);
        debug!(%url, ack_token = ?req.ack_token, "fleet checkin");
        let resp = self
            .auth(shared().post(&url))
            .timeout(timeout)
            .json(req)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AgentError::network_at(
                format!("checkin returned status {status}"),
                url,
            ));
        }
        Ok(resp.json::<CheckinResponse>().await?)
    }

    pub async fn ack(
        &self,
        agent_id: &str,
        req: &AckRequest,
        timeout: Duration,
    ) -> Result<AckResponse, AgentError> {
        let url = format!("{}/api/fleet/agents/{}/acks", self.base, agent_id);
        debug!(%url, events = req.events.len(), "fleet ack");
        let resp = self
            .auth(shared().post(&url))
            .timeout(timeout)
            .json(req)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AgentError::network_at(
                format!("acks returned status {status}"),
                url,
            ));
        }
        Ok(resp.json::<AckResponse>().await?)
    }

    /// Liveness probe used by the local-fleet-server gateway before the
    /// first real check-in.
    pub async fn reachable(&self, timeout: Duration) -> bool {
        let url = format!("{}/api/status", self.base);
        match shared().get(&url).timeout(timeout).send().await {
            Ok(resp) => !resp.status().is_server_error(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn checkin_parses_actions_and_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/fleet/agents/agent-1/checkin")
                    .header("authorization", "ApiKey k-1");
                then.status(200).json_body(json!({
                    "ack_token": "t-1",
                    "actions": [
                        {"id": "a", "type": "UNENROLL"}
                    ]
                }));
            })
            .await;

        let client = FleetClient::new(&server.base_url(), "k-1");
        let req = CheckinRequest {
            ack_token: None,
            status: "online".into(),
            local_metadata: Default::default(),
        };
        let resp = client
            .checkin("agent-1", &req, Duration::from_secs(5))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(resp.ack_token.as_deref(), Some("t-1"));
        assert_eq!(resp.actions.len(), 1);
    }

    #[tokio::test]
    async fn non_2xx_is_a_network_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/fleet/agents/agent-1/acks");
                then.status(503);
            })
            .await;

        let client = FleetClient::new(&server.base_url(), "");
        let err = client
            .ack("agent-1", &AckRequest::default(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "network");
    }
}
