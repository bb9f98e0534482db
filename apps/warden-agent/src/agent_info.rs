//! Process-wide agent identity. The id is minted on first start; the log
//! level is mutable only through the fleet Settings action. Readers get
//! an immutable snapshot, writers replace the whole record.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::AgentError;
use crate::{release, util};

pub const SUPPORTED_LOG_LEVELS: [&str; 4] = ["debug", "info", "warning", "error"];

pub fn is_supported_log_level(level: &str) -> bool {
    SUPPORTED_LOG_LEVELS.contains(&level)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedInfo {
    agent_id: String,
    #[serde(default)]
    log_level: Option<String>,
}

/// Immutable view handed to the gateway, ackers, and handlers.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub version: String,
    pub snapshot_build: bool,
    pub log_level: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct AgentInfo {
    path: PathBuf,
    inner: Arc<RwLock<AgentSnapshot>>,
}

impl AgentInfo {
    /// Load the persisted identity, minting an agent id on first run.
    pub fn load_or_create(path: PathBuf, default_log_level: &str) -> Result<Self, AgentError> {
        let persisted: Option<PersistedInfo> = match std::fs::read(&path) {
            Ok(bytes) => Some(serde_json::from_slice(&bytes).map_err(|e| {
                AgentError::Config {
                    message: format!("agent info file is not valid JSON: {e}"),
                    path: Some(path.clone()),
                }
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(AgentError::io("reading agent info", &path, e)),
        };

        let (agent_id, log_level, fresh) = match persisted {
            Some(p) => (
                p.agent_id,
                p.log_level.unwrap_or_else(|| default_log_level.to_string()),
                false,
            ),
            None => (
                uuid::Uuid::new_v4().to_string(),
                default_log_level.to_string(),
                true,
            ),
        };

        let mut headers = BTreeMap::new();
        headers.insert("User-Agent".to_string(), format!("{}/{}", crate::paths::AGENT_NAME, release::version()));

        let info = Self {
            path,
            inner: Arc::new(RwLock::new(AgentSnapshot {
                agent_id,
                version: release::version().to_string(),
                snapshot_build: release::snapshot(),
                log_level,
                headers,
            })),
        };
        if fresh {
            info.save()?;
            info!(agent_id = %info.snapshot().agent_id, "generated new agent id");
        }
        Ok(info)
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.inner.read().expect("agent info lock").clone()
    }

    pub fn agent_id(&self) -> String {
        self.inner.read().expect("agent info lock").agent_id.clone()
    }

    pub fn log_level(&self) -> String {
        self.inner.read().expect("agent info lock").log_level.clone()
    }

    /// Persist a new log level and replace the in-memory snapshot. The
    /// new level takes effect after re-exec.
    pub fn set_log_level(&self, level: &str) -> Result<(), AgentError> {
        if !is_supported_log_level(level) {
            return Err(AgentError::config(format!(
                "invalid log level, expected debug|info|warning|error and received '{level}'"
            )));
        }
        {
            let mut guard = self.inner.write().expect("agent info lock");
            let mut next = guard.clone();
            next.log_level = level.to_string();
            *guard = next;
        }
        self.save()
    }

    fn save(&self) -> Result<(), AgentError> {
        let snap = self.snapshot();
        let record = PersistedInfo {
            agent_id: snap.agent_id,
            log_level: Some(snap.log_level),
        };
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|e| AgentError::unexpected(format!("serializing agent info: {e}")))?;
        util::atomic_write(&self.path, &bytes)
    }
}
