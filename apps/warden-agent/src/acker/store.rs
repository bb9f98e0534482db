//! Persist-then-ack layer: a policy-affecting action is written to the
//! state store and committed to disk before its acknowledgement is
//! allowed to travel. A persistence failure suppresses the ack so the
//! server re-delivers.

use std::sync::Arc;

use async_trait::async_trait;

use warden_protocol::Action;

use super::Acker;
use crate::errors::AgentError;
use crate::state_store::StateStore;

pub struct StateStoreAcker {
    inner: Arc<dyn Acker>,
    store: Arc<StateStore>,
}

impl StateStoreAcker {
    pub fn new(inner: Arc<dyn Acker>, store: Arc<StateStore>) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl Acker for StateStoreAcker {
    async fn ack(&self, action: &Action) -> Result<(), AgentError> {
        // A scheduled action acknowledged at enqueue time is not yet the
        // effective policy; only a due action is retained.
        if action.due(chrono::Utc::now()) {
            self.store.add(action.clone());
            self.store.save()?;
        }
        self.inner.ack(action).await
    }

    async fn commit(&self) -> Result<(), AgentError> {
        self.inner.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acker::testutil::RecordingAcker;
    use serde_json::json;
    use tempfile::tempdir;

    fn policy(id: &str) -> Action {
        serde_json::from_value(json!({
            "id": id, "type": "POLICY_CHANGE", "data": {"policy": {"rev": 1}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn persists_before_forwarding() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(
            StateStore::load_with_migration(
                tmp.path().join("state.json"),
                tmp.path().join("action_store.yml"),
            )
            .unwrap(),
        );
        let recording = Arc::new(RecordingAcker::default());
        let acker = StateStoreAcker::new(recording.clone(), store.clone());

        acker.ack(&policy("p1")).await.unwrap();

        // The policy is on disk at the moment the inner ack ran.
        let reloaded = StateStore::load_with_migration(
            tmp.path().join("state.json"),
            tmp.path().join("action_store.yml"),
        )
        .unwrap();
        assert_eq!(reloaded.actions()[0].id, "p1");
        assert_eq!(recording.acked_ids(), vec!["p1"]);
    }

    #[tokio::test]
    async fn persistence_failure_suppresses_the_ack() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(
            StateStore::load_with_migration(
                tmp.path().join("state.json"),
                tmp.path().join("action_store.yml"),
            )
            .unwrap(),
        );
        // Occupy the state path with a directory so the rename in save()
        // cannot land.
        std::fs::create_dir(tmp.path().join("state.json")).unwrap();

        let recording = Arc::new(RecordingAcker::default());
        let acker = StateStoreAcker::new(recording.clone(), store);
        assert!(acker.ack(&policy("p2")).await.is_err());
        assert!(recording.acked_ids().is_empty());
    }
}
