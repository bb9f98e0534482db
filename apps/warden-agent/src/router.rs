//! Hands per-worker configurations to the external process supervisor
//! and remembers which routes are live so reconfigurations and shutdown
//! can diff against them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::AgentError;

/// External collaborator: the per-worker process supervisor.
#[async_trait]
pub trait WorkerSupervisor: Send + Sync {
    /// Start or reconfigure the worker behind `route` with `config`.
    async fn configure(&self, route: &str, config: &Value) -> Result<(), AgentError>;
    /// Stop the worker behind `route`.
    async fn stop(&self, route: &str) -> Result<(), AgentError>;
}

pub struct Router {
    supervisor: Arc<dyn WorkerSupervisor>,
    routes: Mutex<BTreeMap<String, Value>>,
}

impl Router {
    pub fn new(supervisor: Arc<dyn WorkerSupervisor>) -> Self {
        Self {
            supervisor,
            routes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Apply a full set of per-worker configurations. Routes that
    /// disappeared are stopped; unchanged routes are left alone.
    pub async fn route(&self, configs: BTreeMap<String, Value>) -> Result<(), AgentError> {
        let mut routes = self.routes.lock().await;

        let stale: Vec<String> = routes
            .keys()
            .filter(|k| !configs.contains_key(*k))
            .cloned()
            .collect();
        for route in stale {
            info!(%route, "stopping removed worker route");
            if let Err(err) = self.supervisor.stop(&route).await {
                warn!(%route, %err, "failed to stop removed route");
            }
            routes.remove(&route);
        }

        for (route, config) in configs {
            if routes.get(&route) == Some(&config) {
                debug!(%route, "route unchanged");
                continue;
            }
            self.supervisor.configure(&route, &config).await?;
            routes.insert(route, config);
        }
        Ok(())
    }

    pub async fn routes(&self) -> Vec<String> {
        self.routes.lock().await.keys().cloned().collect()
    }

    /// Stop every live route. Used by unenroll and final shutdown.
    pub async fn shutdown(&self) {
        let mut routes = self.routes.lock().await;
        for route in routes.keys() {
            if let Err(err) = self.supervisor.stop(route).await {
                warn!(%route, %err, "failed to stop route during shutdown");
            }
        }
        routes.clear();
    }
}

/// Default supervisor used until a real process runtime is wired in:
/// logs the configuration hand-offs and keeps the route table honest.
#[derive(Default)]
pub struct LoggingSupervisor;

#[async_trait]
impl WorkerSupervisor for LoggingSupervisor {
    async fn configure(&self, route: &str, config: &Value) -> Result<(), AgentError> {
        let inputs = config
            .get("inputs")
            .and_then(|i| i.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        info!(%route, inputs, "worker configuration received");
        Ok(())
    }

    async fn stop(&self, route: &str) -> Result<(), AgentError> {
        info!(%route, "worker stop requested");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records configure/stop calls for handler and emitter tests.
    #[derive(Default)]
    pub struct RecordingSupervisor {
        pub configured: StdMutex<Vec<(String, Value)>>,
        pub stopped: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkerSupervisor for RecordingSupervisor {
        async fn configure(&self, route: &str, config: &Value) -> Result<(), AgentError> {
            self.configured
                .lock()
                .unwrap()
                .push((route.to_string(), config.clone()));
            Ok(())
        }

        async fn stop(&self, route: &str) -> Result<(), AgentError> {
            self.stopped.lock().unwrap().push(route.to_string());
            Ok(())
        }
    }
}
