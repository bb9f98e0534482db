//! Fleet check-in loop: exchange local state for a batch of actions on
//! a jittered period, store the new ack token before dispatching, back
//! off on transient failures, and flip Degraded after enough of them.
//!
//! The local-fleet-server wrapper defers the first real check-in until
//! a co-located control server answers, avoiding the bootstrap deadlock
//! where the agent that supervises the server waits on it.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_events::{topics, Bus};
use warden_protocol::{CheckinRequest, CheckinResponse, LocalMetadata};

use crate::acker::Acker;
use crate::agent_info::AgentInfo;
use crate::backoff::ExpBackoff;
use crate::dispatcher::Dispatcher;
use crate::errors::AgentError;
use crate::fleet_client::FleetClient;
use crate::state_store::StateStore;
use crate::status::{AgentStatus, StatusController};
use crate::util::env_u64;
use crate::release;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub period: Duration,
    pub jitter: Duration,
    /// Consecutive failures before the agent reports Degraded.
    pub degraded_threshold: u32,
    pub backoff_init: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
}

impl GatewaySettings {
    pub fn from_env() -> Self {
        Self {
            period: Duration::from_secs(env_u64("WARDEN_CHECKIN_PERIOD_SECS", 30).max(1)),
            jitter: Duration::from_secs(env_u64("WARDEN_CHECKIN_JITTER_SECS", 5)),
            degraded_threshold: env_u64("WARDEN_CHECKIN_DEGRADED_AFTER", 3).max(1) as u32,
            backoff_init: Duration::from_secs(env_u64("WARDEN_CHECKIN_BACKOFF_INIT_SECS", 1).max(1)),
            backoff_max: Duration::from_secs(env_u64("WARDEN_CHECKIN_BACKOFF_MAX_SECS", 60).max(1)),
            request_timeout: crate::fleet_client::request_timeout(),
        }
    }
}

pub struct FleetGateway {
    client: FleetClient,
    agent_info: AgentInfo,
    dispatcher: Arc<Dispatcher>,
    acker: Arc<dyn Acker>,
    store: Arc<StateStore>,
    status: StatusController,
    bus: Bus,
    settings: GatewaySettings,
}

impl FleetGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: FleetClient,
        agent_info: AgentInfo,
        dispatcher: Arc<Dispatcher>,
        acker: Arc<dyn Acker>,
        store: Arc<StateStore>,
        status: StatusController,
        bus: Bus,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            client,
            agent_info,
            dispatcher,
            acker,
            store,
            status,
            bus,
            settings,
        }
    }

    /// The check-in loop. Returns when the token is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut backoff = ExpBackoff::new(self.settings.backoff_init, self.settings.backoff_max);
        let mut consecutive_failures = 0u32;
        info!(period = ?self.settings.period, "fleet gateway started");

        loop {
            if token.is_cancelled() {
                break;
            }
            let sleep = match self.execute(&token).await {
                Ok(response) => {
                    consecutive_failures = 0;
                    backoff.reset();
                    // Only clear a degradation this loop caused; a
                    // Failed upgrade report must not be masked.
                    if matches!(self.status.status(), AgentStatus::Degraded { .. }) {
                        self.status.set_healthy();
                    }
                    self.bus.publish(
                        topics::TOPIC_CHECKIN_OK,
                        &json!({"actions": response.actions.len()}),
                    );
                    self.jittered_period()
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(%err, consecutive_failures, "fleet check-in failed");
                    if consecutive_failures >= self.settings.degraded_threshold {
                        self.status.set_degraded(format!(
                            "{consecutive_failures} consecutive check-in failures: {err}"
                        ));
                        self.bus.publish(
                            topics::TOPIC_CHECKIN_DEGRADED,
                            &json!({"failures": consecutive_failures}),
                        );
                    }
                    ExpBackoff::jittered(backoff.next_delay())
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        info!("fleet gateway stopped");
    }

    /// One check-in: send, store the new ack token, dispatch the batch.
    async fn execute(&self, token: &CancellationToken) -> Result<CheckinResponse, AgentError> {
        let snapshot = self.agent_info.snapshot();
        let ack_token = match self.store.ack_token() {
            t if t.is_empty() => None,
            t => Some(t),
        };
        let request = CheckinRequest {
            ack_token,
            status: self.status.status().as_checkin_str().to_string(),
            local_metadata: local_metadata(&snapshot),
        };

        let response = self
            .client
            .checkin(&snapshot.agent_id, &request, self.settings.request_timeout)
            .await?;

        // The new token is durable before any action from this batch
        // runs, so a crash mid-batch re-fetches the same batch.
        if let Some(new_token) = &response.ack_token {
            if !new_token.is_empty() {
                self.store.set_ack_token(new_token);
                self.store.save()?;
            }
        }

        if response.actions.is_empty() {
            debug!("check-in returned no actions");
        } else {
            info!(count = response.actions.len(), "check-in returned actions");
            self.dispatcher
                .dispatch(token, response.actions.clone(), self.acker.as_ref())
                .await?;
        }
        Ok(response)
    }

    fn jittered_period(&self) -> Duration {
        let jitter_ms = self.settings.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.settings.period;
        }
        self.settings.period + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

fn local_metadata(snapshot: &crate::agent_info::AgentSnapshot) -> LocalMetadata {
    LocalMetadata {
        host: json!({
            "hostname": std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        }),
        agent: json!({
            "id": snapshot.agent_id,
            "version": snapshot.version,
            "snapshot": snapshot.snapshot_build,
            "log_level": snapshot.log_level,
            "build_commit": release::short_commit(),
        }),
    }
}

/// Wraps the gateway when the control server runs on this same host.
pub struct LocalFleetServerGateway {
    inner: FleetGateway,
    probe: FleetClient,
    local_server: bool,
}

impl LocalFleetServerGateway {
    pub fn new(inner: FleetGateway, probe: FleetClient, local_server: bool) -> Self {
        Self {
            inner,
            probe,
            local_server,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        if self.local_server {
            info!("co-located fleet server configured; deferring first check-in");
            let poll = Duration::from_secs(env_u64("WARDEN_LOCAL_SERVER_POLL_SECS", 2).max(1));
            loop {
                if token.is_cancelled() {
                    return;
                }
                if self.probe.reachable(Duration::from_secs(5)).await {
                    info!("local fleet server is reachable; starting check-ins");
                    break;
                }
                debug!("local fleet server not reachable yet");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
        self.inner.run(token).await;
    }
}
