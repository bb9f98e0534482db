//! UNENROLL: persist the unenroll marker, flush the acknowledgement
//! while the network path is still up, shut the router down, and only
//! then cancel the long-running tasks. The next startup sees the marker
//! and never contacts the server again.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warden_events::{topics, Bus};
use warden_protocol::Action;

use crate::acker::Acker;
use crate::dispatcher::ActionHandler;
use crate::errors::AgentError;
use crate::router::Router;
use crate::state_store::StateStore;

pub struct UnenrollHandler {
    store: Arc<StateStore>,
    router: Arc<Router>,
    bus: Bus,
    closers: Vec<CancellationToken>,
}

impl UnenrollHandler {
    pub fn new(
        store: Arc<StateStore>,
        router: Arc<Router>,
        bus: Bus,
        closers: Vec<CancellationToken>,
    ) -> Self {
        Self {
            store,
            router,
            bus,
            closers,
        }
    }
}

#[async_trait]
impl ActionHandler for UnenrollHandler {
    async fn handle(
        &self,
        _token: &CancellationToken,
        action: &mut Action,
        acker: &dyn Acker,
    ) -> Result<(), AgentError> {
        info!(action_id = %action.id, "unenrolling agent");

        // Persist first so a crash after this point still short-circuits
        // the next startup.
        self.store.add(action.clone());
        self.store.save()?;

        // Flush the ack now; once the closers fire the gateway and
        // retrier are gone.
        if let Err(err) = acker.ack(action).await {
            warn!(action_id = %action.id, %err, "failed to acknowledge unenroll");
        } else if let Err(err) = acker.commit().await {
            warn!(action_id = %action.id, %err, "failed to commit unenroll acknowledgement");
        }

        let live_routes = self.router.routes().await;
        info!(routes = live_routes.len(), "stopping worker routes");
        self.router.shutdown().await;
        self.bus
            .publish(topics::TOPIC_UNENROLLED, &serde_json::json!({"action_id": action.id}));

        for closer in &self.closers {
            closer.cancel();
        }
        Ok(())
    }
}
