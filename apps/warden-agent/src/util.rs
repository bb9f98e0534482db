//! Small shared helpers: env tunables and crash-safe file writes.

use std::fs;
use std::io::Write as _;
use std::path::Path;

use crate::errors::AgentError;

pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

pub fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename over. A reader never observes a torn file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), AgentError> {
    let dir = path
        .parent()
        .ok_or_else(|| AgentError::filesystem("path has no parent directory", path))?;
    fs::create_dir_all(dir).map_err(|e| AgentError::io("creating state directory", dir, e))?;

    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string())
    ));
    let mut file =
        fs::File::create(&tmp).map_err(|e| AgentError::io("creating temp file", &tmp, e))?;
    file.write_all(bytes)
        .map_err(|e| AgentError::io("writing temp file", &tmp, e))?;
    file.sync_all()
        .map_err(|e| AgentError::io("syncing temp file", &tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| AgentError::io("committing file", path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_contents() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        // No temp residue left behind.
        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
