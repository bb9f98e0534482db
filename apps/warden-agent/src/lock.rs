//! Exclusive data-directory lock. Two supervisors sharing one data dir
//! would race the state store and the install symlink, so acquisition
//! failure is fatal at startup.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use fs2::FileExt as _;

use crate::errors::AgentError;

pub struct AppLocker {
    path: PathBuf,
    file: Option<File>,
}

impl AppLocker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Acquire the lock or fail immediately with the holder left intact.
    pub fn try_lock(&mut self) -> Result<(), AgentError> {
        if self.file.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::io("creating lock directory", parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| AgentError::io("opening lock file", &self.path, e))?;
        file.try_lock_exclusive().map_err(|_| {
            AgentError::filesystem(
                "another warden-agent already holds the data directory lock",
                &self.path,
            )
        })?;
        // Owner pid is informational only; the flock is the authority.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        self.file = Some(file);
        Ok(())
    }

    pub fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

impl Drop for AppLocker {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Probe used by the upgrade watchdog: true when no process holds the
/// lock (the agent is down or never started).
pub fn lock_is_free(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        // No lock file yet: nothing is running.
        return true;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = fs2::FileExt::unlock(&file);
            true
        }
        Err(_) => false,
    }
}
