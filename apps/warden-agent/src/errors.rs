//! Typed agent errors: a kind plus the structured metadata (path, uri,
//! action id, app name) that the dispatcher and status reporter log.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("network error: {message}{}", meta_suffix(.uri, "uri"))]
    Network {
        message: String,
        uri: Option<String>,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("filesystem error: {message}{}", path_suffix(.path))]
    Filesystem {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("configuration error: {message}{}", path_suffix(.path))]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("verification error: {message}{}", meta_suffix(.uri, "uri"))]
    Crypto {
        message: String,
        uri: Option<String>,
    },

    #[error("blocked by policy: {message}")]
    PolicyBlocked { message: String },

    #[error("process spawn failed: {message}{}", meta_suffix(.app_name, "app"))]
    ProcessSpawn {
        message: String,
        app_name: Option<String>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("cancelled: {message}")]
    Cancelled { message: String },

    #[error("{message}{}", meta_suffix(.action_id, "action_id"))]
    Unexpected {
        message: String,
        action_id: Option<String>,
    },
}

fn meta_suffix(value: &Option<String>, key: &str) -> String {
    match value {
        Some(v) => format!(" ({key}={v})"),
        None => String::new(),
    }
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" (path={})", p.display()),
        None => String::new(),
    }
}

impl AgentError {
    pub fn network(message: impl Into<String>) -> Self {
        AgentError::Network {
            message: message.into(),
            uri: None,
            source: None,
        }
    }

    pub fn network_at(message: impl Into<String>, uri: impl Into<String>) -> Self {
        AgentError::Network {
            message: message.into(),
            uri: Some(uri.into()),
            source: None,
        }
    }

    pub fn filesystem(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        AgentError::Filesystem {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    pub fn io(message: impl Into<String>, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        AgentError::Filesystem {
            message: message.into(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        AgentError::Config {
            message: message.into(),
            path: None,
        }
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        AgentError::Crypto {
            message: message.into(),
            uri: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        AgentError::Cancelled {
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        AgentError::Unexpected {
            message: message.into(),
            action_id: None,
        }
    }

    pub fn for_action(message: impl Into<String>, action_id: impl Into<String>) -> Self {
        AgentError::Unexpected {
            message: message.into(),
            action_id: Some(action_id.into()),
        }
    }

    /// Short kind tag used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Network { .. } => "network",
            AgentError::Filesystem { .. } => "filesystem",
            AgentError::Config { .. } => "config",
            AgentError::Crypto { .. } => "crypto",
            AgentError::PolicyBlocked { .. } => "policy_blocked",
            AgentError::ProcessSpawn { .. } => "process_spawn",
            AgentError::Cancelled { .. } => "cancelled",
            AgentError::Unexpected { .. } => "unexpected",
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        let uri = err.url().map(|u| u.to_string());
        AgentError::Network {
            message: err.to_string(),
            uri,
            source: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_metadata() {
        let err = AgentError::filesystem("store save failed", "/tmp/state.json");
        let text = err.to_string();
        assert!(text.contains("store save failed"));
        assert!(text.contains("/tmp/state.json"));
        assert_eq!(err.kind(), "filesystem");
    }

    #[test]
    fn action_metadata_is_rendered() {
        let err = AgentError::for_action("handler panicked", "act-9");
        assert!(err.to_string().contains("act-9"));
    }
}
