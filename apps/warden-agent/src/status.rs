//! Local status controller: the single place that knows whether the
//! agent is healthy, degraded (check-ins failing), or failed (upgrade
//! error). Transitions are published on the bus.

use std::sync::{Arc, RwLock};

use serde_json::json;

use warden_events::{topics, Bus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStatus {
    Healthy,
    Updating { message: String },
    Degraded { message: String },
    Failed { message: String },
}

impl AgentStatus {
    /// Status string reported on check-in.
    pub fn as_checkin_str(&self) -> &'static str {
        match self {
            AgentStatus::Healthy => "online",
            AgentStatus::Updating { .. } => "updating",
            AgentStatus::Degraded { .. } => "degraded",
            AgentStatus::Failed { .. } => "error",
        }
    }
}

#[derive(Clone)]
pub struct StatusController {
    state: Arc<RwLock<AgentStatus>>,
    bus: Bus,
}

impl StatusController {
    pub fn new(bus: Bus) -> Self {
        Self {
            state: Arc::new(RwLock::new(AgentStatus::Healthy)),
            bus,
        }
    }

    pub fn status(&self) -> AgentStatus {
        self.state.read().expect("status lock").clone()
    }

    pub fn set_healthy(&self) {
        self.transition(AgentStatus::Healthy);
    }

    pub fn set_updating(&self, message: impl Into<String>) {
        self.transition(AgentStatus::Updating {
            message: message.into(),
        });
    }

    pub fn set_degraded(&self, message: impl Into<String>) {
        self.transition(AgentStatus::Degraded {
            message: message.into(),
        });
    }

    pub fn set_failed(&self, message: impl Into<String>) {
        self.transition(AgentStatus::Failed {
            message: message.into(),
        });
    }

    fn transition(&self, next: AgentStatus) {
        let changed = {
            let mut guard = self.state.write().expect("status lock");
            let changed = *guard != next;
            *guard = next.clone();
            changed
        };
        if changed {
            let message = match &next {
                AgentStatus::Healthy => String::new(),
                AgentStatus::Updating { message }
                | AgentStatus::Degraded { message }
                | AgentStatus::Failed { message } => message.clone(),
            };
            self.bus.publish(
                topics::TOPIC_SERVICE_STATUS,
                &json!({
                    "status": next.as_checkin_str(),
                    "message": message,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_publish_once() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        let ctrl = StatusController::new(bus);
        assert_eq!(ctrl.status(), AgentStatus::Healthy);

        ctrl.set_degraded("checkin failed 3 times");
        ctrl.set_degraded("checkin failed 3 times");
        ctrl.set_healthy();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload["status"], "degraded");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload["status"], "online");
        assert!(rx.try_recv().is_err());
    }
}
