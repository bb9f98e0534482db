//! CANCEL: remove the target from the scheduled queue. A target that is
//! not queued (already ran, never arrived yet, or unknown) is a no-op
//! that is still acknowledged; the queue remembers the id so a late
//! delivery of the target stays suppressed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use warden_protocol::{Action, ActionPayload};

use crate::acker::Acker;
use crate::dispatcher::ActionHandler;
use crate::errors::AgentError;
use crate::queue::SharedQueue;
use crate::state_store::StateStore;

pub struct CancelHandler {
    queue: Arc<SharedQueue>,
    store: Arc<StateStore>,
}

impl CancelHandler {
    pub fn new(queue: Arc<SharedQueue>, store: Arc<StateStore>) -> Self {
        Self { queue, store }
    }
}

#[async_trait]
impl ActionHandler for CancelHandler {
    async fn handle(
        &self,
        _token: &CancellationToken,
        action: &mut Action,
        _acker: &dyn Acker,
    ) -> Result<(), AgentError> {
        let ActionPayload::Cancel { target_id } = &action.payload else {
            return Err(AgentError::for_action(
                "expected a CANCEL payload",
                action.id.clone(),
            ));
        };
        let removed = self.queue.cancel(target_id);
        info!(action_id = %action.id, %target_id, removed, "cancel applied");
        if removed > 0 {
            self.store.set_queue(self.queue.snapshot());
            self.store.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acker::testutil::RecordingAcker;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn cancel_of_absent_target_is_ok() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(
            StateStore::load_with_migration(
                tmp.path().join("state.json"),
                tmp.path().join("action_store.yml"),
            )
            .unwrap(),
        );
        let queue = Arc::new(SharedQueue::new(Vec::new()));
        let handler = CancelHandler::new(queue, store);

        let mut action: Action = serde_json::from_value(json!({
            "id": "c1", "type": "CANCEL", "data": {"target_id": "ghost"}
        }))
        .unwrap();
        let acker = RecordingAcker::default();
        let token = CancellationToken::new();
        handler.handle(&token, &mut action, &acker).await.unwrap();
    }
}
