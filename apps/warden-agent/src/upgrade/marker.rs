//! Upgrade marker: written just before re-exec, consulted by the next
//! startup (deferred acknowledgement) and by the watchdog (rollback
//! target), removed once the new version is declared stable.

use std::path::Path;

use serde::{Deserialize, Serialize};

use warden_protocol::Action;

use crate::errors::AgentError;
use crate::util;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeMarker {
    /// Short hash of the install we upgraded away from.
    pub prev_hash: String,
    /// Short hash of the install we swapped in.
    pub new_hash: String,
    /// The fleet action that triggered this upgrade; `None` for manual
    /// upgrades, which need no acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default)]
    pub acked: bool,
}

impl UpgradeMarker {
    pub fn load(path: &Path) -> Result<Option<Self>, AgentError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let marker = serde_json::from_slice(&bytes).map_err(|e| AgentError::Config {
                    message: format!("upgrade marker is not valid JSON: {e}"),
                    path: Some(path.to_path_buf()),
                })?;
                Ok(Some(marker))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::io("reading upgrade marker", path, e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), AgentError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| AgentError::unexpected(format!("serializing upgrade marker: {e}")))?;
        util::atomic_write(path, &bytes)
    }

    pub fn remove(path: &Path) -> Result<(), AgentError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::io("removing upgrade marker", path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_with_action() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join(".update_marker.json");
        let action: Action = serde_json::from_value(json!({
            "id": "up-1", "type": "UPGRADE",
            "data": {"version": "0.7.0"}
        }))
        .unwrap();
        let marker = UpgradeMarker {
            prev_hash: "aaaaaa".into(),
            new_hash: "bbbbbb".into(),
            action: Some(action),
            acked: false,
        };
        marker.save(&path).unwrap();

        let loaded = UpgradeMarker::load(&path).unwrap().unwrap();
        assert_eq!(loaded.prev_hash, "aaaaaa");
        assert_eq!(loaded.new_hash, "bbbbbb");
        assert!(!loaded.acked);
        assert_eq!(loaded.action.unwrap().id, "up-1");

        UpgradeMarker::remove(&path).unwrap();
        assert!(UpgradeMarker::load(&path).unwrap().is_none());
        // Removing twice is fine.
        UpgradeMarker::remove(&path).unwrap();
    }
}
