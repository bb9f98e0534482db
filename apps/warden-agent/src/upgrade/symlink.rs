//! Atomic swap of the stable executable symlink. The link is created at
//! a temporary name and renamed over, so any reader sees the old target
//! or the new one, never a missing link.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::AgentError;
use crate::paths;

/// Repoint `<top>/warden-agent` at the install for `new_hash`. Returns
/// the previous target for rollback, if there was one.
pub fn change_symlink(new_hash: &str) -> Result<Option<PathBuf>, AgentError> {
    let link = paths::symlink();
    let target = paths::versioned_home(new_hash).join(paths::AGENT_NAME);
    let prev = match std::fs::read_link(&link) {
        Ok(prev) => Some(prev),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(AgentError::io("reading current symlink", &link, e)),
    };
    replace_symlink(&link, &target)?;
    debug!(link = %link.display(), target = %target.display(), "symlink swapped");
    Ok(prev)
}

/// Point the stable symlink back at an explicit target (rollback path).
pub fn restore_symlink(target: &Path) -> Result<(), AgentError> {
    replace_symlink(&paths::symlink(), target)
}

#[cfg(unix)]
fn replace_symlink(link: &Path, target: &Path) -> Result<(), AgentError> {
    let dir = link
        .parent()
        .ok_or_else(|| AgentError::filesystem("symlink has no parent directory", link))?;
    std::fs::create_dir_all(dir).map_err(|e| AgentError::io("creating top directory", dir, e))?;
    let tmp = dir.join(format!(
        ".{}.new.{}",
        paths::AGENT_NAME,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(target, &tmp)
        .map_err(|e| AgentError::io("creating replacement symlink", &tmp, e))?;
    std::fs::rename(&tmp, link).map_err(|e| AgentError::io("renaming symlink over", link, e))
}

#[cfg(not(unix))]
fn replace_symlink(link: &Path, _target: &Path) -> Result<(), AgentError> {
    Err(AgentError::filesystem(
        "symlink swap is only supported on unix hosts",
        link,
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support;
    use tempfile::tempdir;

    #[test]
    fn swap_records_previous_target() {
        let tmp = tempdir().unwrap();
        let mut guard = test_support::env_guard();
        test_support::scoped_paths(&mut guard, tmp.path());

        let first = change_symlink("aaaaaa").unwrap();
        assert!(first.is_none());

        let prev = change_symlink("bbbbbb").unwrap().unwrap();
        assert!(prev.to_string_lossy().contains("warden-agent-aaaaaa"));

        let current = std::fs::read_link(paths::symlink()).unwrap();
        assert!(current.to_string_lossy().contains("warden-agent-bbbbbb"));

        restore_symlink(&prev).unwrap();
        let restored = std::fs::read_link(paths::symlink()).unwrap();
        assert_eq!(restored, prev);
    }
}
