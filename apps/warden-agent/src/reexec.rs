//! Re-exec orchestration: a handler or signal requests a restart, the
//! main loop drains in-flight work within a bounded window, then the
//! process image is replaced in place. Everything that must survive is
//! already on disk; nothing in memory is expected to.

use std::path::PathBuf;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::info;

use crate::errors::AgentError;

/// How long the main loop waits for tasks to drain before exec'ing
/// regardless.
pub fn drain_window() -> std::time::Duration {
    std::time::Duration::from_secs(crate::util::env_u64("WARDEN_REEXEC_DRAIN_SECS", 10).max(1))
}

pub struct ReexecManager {
    exec_path: PathBuf,
    tx: mpsc::UnboundedSender<()>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl ReexecManager {
    /// `exec_path` should be the stable symlink so a swapped install is
    /// picked up on restart; callers fall back to the current executable
    /// when no symlink exists.
    pub fn new(exec_path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            exec_path,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// The receiver the main loop selects on. Taken once.
    pub fn take_trigger(&self) -> mpsc::UnboundedReceiver<()> {
        self.rx
            .lock()
            .expect("reexec trigger lock")
            .take()
            .expect("reexec trigger already taken")
    }

    /// Request a restart. The main loop finishes the current batch,
    /// flushes acknowledgements, and then calls [`exec`].
    pub fn trigger(&self) {
        info!(path = %self.exec_path.display(), "re-exec requested");
        let _ = self.tx.send(());
    }

    /// Replace the current process image. Only returns on failure.
    #[cfg(unix)]
    pub fn exec(&self) -> AgentError {
        use std::os::unix::process::CommandExt as _;
        let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();
        info!(path = %self.exec_path.display(), "replacing process image");
        let err = std::process::Command::new(&self.exec_path).args(args).exec();
        AgentError::ProcessSpawn {
            message: format!("exec of {} failed", self.exec_path.display()),
            app_name: Some(crate::paths::AGENT_NAME.to_string()),
            source: Some(err),
        }
    }

    #[cfg(not(unix))]
    pub fn exec(&self) -> AgentError {
        AgentError::ProcessSpawn {
            message: "re-exec is only supported on unix hosts".to_string(),
            app_name: Some(crate::paths::AGENT_NAME.to_string()),
            source: None,
        }
    }
}

/// Resolve what to exec on restart: the stable symlink when it exists,
/// the current executable otherwise.
pub fn reexec_path() -> PathBuf {
    let symlink = crate::paths::symlink();
    if symlink.exists() {
        return symlink;
    }
    std::env::current_exe().unwrap_or(symlink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_the_receiver() {
        let mgr = ReexecManager::new(PathBuf::from("/usr/bin/true"));
        let mut rx = mgr.take_trigger();
        mgr.trigger();
        assert!(rx.recv().await.is_some());
    }
}
