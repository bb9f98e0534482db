//! Archive extraction into a content-addressed install directory. The
//! archive carries its commit identifier in a well-known file; the
//! install lands at `<data>/warden-agent-<shorthash>/`.

use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, info};

use crate::errors::AgentError;
use crate::{paths, release};

/// Commit identifier file embedded at the root of every release archive.
pub const ARCHIVE_COMMIT_FILE: &str = ".warden-agent.active.commit";

/// Extract `archive` and return the full commit hash it carries. The
/// top-level directory inside the archive is stripped; an install that
/// already exists for the same hash is left untouched.
pub fn unpack(archive: &Path) -> Result<String, AgentError> {
    let file =
        std::fs::File::open(archive).map_err(|e| AgentError::io("opening archive", archive, e))?;
    let mut tar = Archive::new(GzDecoder::new(file));

    let staging = paths::install_base().join(format!(".unpack-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&staging)
        .map_err(|e| AgentError::io("creating staging directory", &staging, e))?;

    let result = extract_into(&mut tar, &staging).and_then(|()| finalize(archive, &staging));
    if result.is_err() {
        let _ = std::fs::remove_dir_all(&staging);
    }
    result
}

fn extract_into(
    tar: &mut Archive<GzDecoder<std::fs::File>>,
    staging: &Path,
) -> Result<(), AgentError> {
    let entries = tar
        .entries()
        .map_err(|e| AgentError::io("reading archive entries", staging, e))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| AgentError::io("reading archive entry", staging, e))?;
        let path = entry
            .path()
            .map_err(|e| AgentError::io("reading archive entry path", staging, e))?
            .into_owned();
        // Strip the archive's top-level directory.
        let rel: PathBuf = path.components().skip(1).collect();
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = staging.join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::io("creating install subdirectory", parent, e))?;
        }
        entry
            .unpack(&dest)
            .map_err(|e| AgentError::io("unpacking archive entry", &dest, e))?;
        debug!(path = %rel.display(), "unpacked");
    }
    Ok(())
}

fn finalize(archive: &Path, staging: &Path) -> Result<String, AgentError> {
    let commit_path = staging.join(ARCHIVE_COMMIT_FILE);
    let commit = std::fs::read_to_string(&commit_path)
        .map_err(|e| AgentError::io("reading archive commit file", &commit_path, e))?
        .trim()
        .to_string();
    if commit.is_empty() {
        return Err(AgentError::unexpected(
            "archive commit identifier is empty",
        ));
    }

    let short = release::trim_commit(&commit);
    let install = paths::versioned_home(&short);
    if install.exists() {
        info!(install = %install.display(), "install for this hash already present");
        std::fs::remove_dir_all(staging)
            .map_err(|e| AgentError::io("removing staging directory", staging, e))?;
        return Ok(commit);
    }
    std::fs::rename(staging, &install)
        .map_err(|e| AgentError::io("committing install directory", &install, e))?;
    info!(archive = %archive.display(), install = %install.display(), "archive unpacked");
    Ok(commit)
}
