//! Durable action store: the server ack token, the last retained
//! policy-affecting action, and the scheduled-action queue.
//!
//! Saves are atomic (temp + fsync + rename), so a crash mid-save leaves
//! either the previous committed state or the new one on disk. Callers
//! must hold the data-directory lock before loading; that lock is what
//! keeps the one-shot legacy migration single-writer.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use warden_protocol::{Action, ActionKind};

use crate::errors::AgentError;
use crate::util;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    ack_token: String,
    /// At most one action is retained: the newest policy change, or the
    /// unenroll that superseded it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<Action>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    queue: Vec<Action>,
}

/// Pre-queue store layout: a single YAML document holding the last
/// policy action. Read once, converted, then removed.
#[derive(Debug, Deserialize)]
struct LegacyStore {
    #[serde(default)]
    action: Option<serde_json::Value>,
}

pub struct StateStore {
    path: PathBuf,
    inner: Mutex<PersistedState>,
}

impl StateStore {
    /// Load the store, migrating a legacy YAML file if it is all that
    /// exists. Migration order is read → write new → delete legacy, so a
    /// crash in between leaves a loadable store either way.
    pub fn load_with_migration(
        path: PathBuf,
        legacy_path: PathBuf,
    ) -> Result<Self, AgentError> {
        match std::fs::read(&path) {
            Ok(bytes) => {
                let state: PersistedState = serde_json::from_slice(&bytes).map_err(|e| {
                    AgentError::Config {
                        message: format!("state store is not valid JSON: {e}"),
                        path: Some(path.clone()),
                    }
                })?;
                return Ok(Self {
                    path,
                    inner: Mutex::new(state),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AgentError::io("reading state store", &path, e)),
        }

        let mut state = PersistedState::default();
        match std::fs::read(&legacy_path) {
            Ok(bytes) => {
                let legacy: LegacyStore = serde_yaml::from_slice(&bytes).map_err(|e| {
                    AgentError::Config {
                        message: format!("legacy action store is not valid YAML: {e}"),
                        path: Some(legacy_path.clone()),
                    }
                })?;
                if let Some(raw) = legacy.action {
                    match serde_json::from_value::<Action>(raw) {
                        Ok(action) => state.action = Some(action),
                        Err(e) => {
                            warn!(path = %legacy_path.display(), %e, "dropping unreadable legacy action");
                        }
                    }
                }
                let store = Self {
                    path,
                    inner: Mutex::new(state),
                };
                store.save()?;
                if let Err(e) = std::fs::remove_file(&legacy_path) {
                    warn!(path = %legacy_path.display(), %e, "failed to remove legacy action store");
                } else {
                    info!(path = %legacy_path.display(), "migrated legacy action store");
                }
                Ok(store)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self {
                path,
                inner: Mutex::new(state),
            }),
            Err(e) => Err(AgentError::io("reading legacy action store", &legacy_path, e)),
        }
    }

    /// Record an action. Only policy-affecting kinds are retained: a new
    /// policy replaces the previous one, and an unenroll replaces
    /// whatever was there so restart detection stays a single read.
    pub fn add(&self, action: Action) {
        match action.kind() {
            ActionKind::PolicyChange | ActionKind::Unenroll => {
                self.inner.lock().expect("state store lock").action = Some(action);
            }
            _ => {}
        }
    }

    /// The retained action, if any (zero or one element).
    pub fn actions(&self) -> Vec<Action> {
        self.inner
            .lock()
            .expect("state store lock")
            .action
            .clone()
            .into_iter()
            .collect()
    }

    pub fn queue(&self) -> Vec<Action> {
        self.inner.lock().expect("state store lock").queue.clone()
    }

    pub fn set_queue(&self, queue: Vec<Action>) {
        self.inner.lock().expect("state store lock").queue = queue;
    }

    pub fn ack_token(&self) -> String {
        self.inner.lock().expect("state store lock").ack_token.clone()
    }

    pub fn set_ack_token(&self, token: &str) {
        self.inner.lock().expect("state store lock").ack_token = token.to_string();
    }

    /// Commit the current state to disk.
    pub fn save(&self) -> Result<(), AgentError> {
        let guard = self.inner.lock().expect("state store lock");
        let bytes = serde_json::to_vec_pretty(&*guard)
            .map_err(|e| AgentError::unexpected(format!("serializing state store: {e}")))?;
        util::atomic_write(&self.path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use warden_protocol::ActionPayload;

    fn policy_action(id: &str, rev: u64) -> Action {
        serde_json::from_value(json!({
            "id": id,
            "type": "POLICY_CHANGE",
            "data": {"policy": {"revision": rev}}
        }))
        .unwrap()
    }

    fn unenroll_action(id: &str) -> Action {
        serde_json::from_value(json!({"id": id, "type": "UNENROLL"})).unwrap()
    }

    #[test]
    fn newest_policy_wins() {
        let tmp = tempdir().unwrap();
        let store = StateStore::load_with_migration(
            tmp.path().join("state.json"),
            tmp.path().join("action_store.yml"),
        )
        .unwrap();
        store.add(policy_action("p1", 1));
        store.add(policy_action("p2", 2));
        let actions = store.actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].id, "p2");
    }

    #[test]
    fn unenroll_replaces_policy() {
        let tmp = tempdir().unwrap();
        let store = StateStore::load_with_migration(
            tmp.path().join("state.json"),
            tmp.path().join("action_store.yml"),
        )
        .unwrap();
        store.add(policy_action("p1", 1));
        store.add(unenroll_action("u1"));
        let actions = store.actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), ActionKind::Unenroll);
    }

    #[test]
    fn non_policy_kinds_are_not_retained() {
        let tmp = tempdir().unwrap();
        let store = StateStore::load_with_migration(
            tmp.path().join("state.json"),
            tmp.path().join("action_store.yml"),
        )
        .unwrap();
        let settings: Action = serde_json::from_value(json!({
            "id": "s1", "type": "SETTINGS", "data": {"log_level": "debug"}
        }))
        .unwrap();
        store.add(settings);
        assert!(store.actions().is_empty());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let legacy = tmp.path().join("action_store.yml");
        {
            let store = StateStore::load_with_migration(path.clone(), legacy.clone()).unwrap();
            store.set_ack_token("tok-9");
            store.add(policy_action("p7", 7));
            store.set_queue(vec![policy_action("later", 8)]);
            store.save().unwrap();
        }
        let store = StateStore::load_with_migration(path, legacy).unwrap();
        assert_eq!(store.ack_token(), "tok-9");
        assert_eq!(store.actions()[0].id, "p7");
        assert_eq!(store.queue().len(), 1);
    }

    #[test]
    fn legacy_yaml_is_migrated_once() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let legacy = tmp.path().join("action_store.yml");
        std::fs::write(
            &legacy,
            "action:\n  id: old-1\n  type: POLICY_CHANGE\n  data:\n    policy:\n      revision: 3\n",
        )
        .unwrap();

        let store = StateStore::load_with_migration(path.clone(), legacy.clone()).unwrap();
        let actions = store.actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].id, "old-1");
        match &actions[0].payload {
            ActionPayload::PolicyChange { policy } => {
                assert_eq!(policy["revision"], 3);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(!legacy.exists());
        assert!(path.exists());
    }
}
