//! Filesystem layout of an installed agent. Every location is
//! env-overridable so tests and packaging can relocate the tree.
//!
//! ```text
//! <top>/warden-agent                     stable executable symlink
//! <top>/data/                            versioned installs + shared state
//! <top>/data/warden-agent-<hash>/        one install tree per commit
//! <top>/data/downloads/                  fetched upgrade archives
//! ```

use std::path::PathBuf;

pub const AGENT_NAME: &str = "warden-agent";

/// File names inside the config directory.
pub const STATE_FILE: &str = "state.json";
pub const LEGACY_ACTION_STORE_FILE: &str = "action_store.yml";
pub const AGENT_INFO_FILE: &str = "agent_info.json";
pub const FLEET_CONFIG_FILE: &str = "fleet.yml";

/// File names inside the data directory.
pub const LOCK_FILE: &str = "warden-agent.lock";
pub const MARKER_FILE: &str = ".update_marker.json";
pub const COMMIT_FILE: &str = "warden-agent.active.commit";

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Installation root: the directory holding the stable symlink.
pub fn top() -> PathBuf {
    if let Some(p) = env_path("WARDEN_PATH_HOME") {
        return p;
    }
    // Derive from the running executable: either <top>/warden-agent or
    // <top>/data/warden-agent-<hash>/warden-agent.
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if dir.file_name().map_or(false, |n| {
                n.to_string_lossy().starts_with(&format!("{AGENT_NAME}-"))
            }) {
                if let Some(data) = dir.parent() {
                    if let Some(top) = data.parent() {
                        return top.to_path_buf();
                    }
                }
            }
            return dir.to_path_buf();
        }
    }
    PathBuf::from(".")
}

pub fn data() -> PathBuf {
    env_path("WARDEN_PATH_DATA").unwrap_or_else(|| top().join("data"))
}

pub fn config() -> PathBuf {
    env_path("WARDEN_PATH_CONFIG").unwrap_or_else(top)
}

pub fn downloads() -> PathBuf {
    env_path("WARDEN_PATH_DOWNLOADS").unwrap_or_else(|| data().join("downloads"))
}

/// Directory new installs are unpacked into.
pub fn install_base() -> PathBuf {
    env_path("WARDEN_PATH_INSTALL").unwrap_or_else(data)
}

/// Versioned home of a given commit hash.
pub fn versioned_home(short_hash: &str) -> PathBuf {
    install_base().join(format!("{AGENT_NAME}-{short_hash}"))
}

pub fn logs() -> PathBuf {
    env_path("WARDEN_PATH_LOGS").unwrap_or_else(|| data().join("logs"))
}

/// The stable executable symlink the service manager runs.
pub fn symlink() -> PathBuf {
    top().join(AGENT_NAME)
}

pub fn state_file() -> PathBuf {
    config().join(STATE_FILE)
}

pub fn legacy_action_store_file() -> PathBuf {
    config().join(LEGACY_ACTION_STORE_FILE)
}

pub fn agent_info_file() -> PathBuf {
    config().join(AGENT_INFO_FILE)
}

pub fn fleet_config_file() -> PathBuf {
    config().join(FLEET_CONFIG_FILE)
}

pub fn lock_file() -> PathBuf {
    data().join(LOCK_FILE)
}

pub fn marker_file() -> PathBuf {
    data().join(MARKER_FILE)
}

pub fn active_commit_file() -> PathBuf {
    data().join(COMMIT_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_home_under_install_base() {
        let home = versioned_home("abc123");
        assert!(home
            .to_string_lossy()
            .ends_with(&format!("{AGENT_NAME}-abc123")));
    }
}
