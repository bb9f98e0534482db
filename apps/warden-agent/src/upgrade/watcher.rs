//! Upgrade watchdog. A separately-spawned `warden-agent watch` process
//! observes the freshly re-exec'd supervisor for a grace period; if the
//! new binary cannot hold the data-directory lock, the watcher restores
//! the previous symlink, drops the broken install, and starts the old
//! agent again.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{error, info, warn};

use warden_events::{topics, Bus};

use crate::errors::AgentError;
use crate::util::env_u64;
use crate::{lock, paths, reexec};

use super::marker::UpgradeMarker;
use super::symlink::change_symlink;

fn grace_period() -> Duration {
    Duration::from_secs(env_u64("WARDEN_UPGRADE_GRACE_SECS", 600).max(10))
}

fn poll_interval() -> Duration {
    Duration::from_secs(env_u64("WARDEN_WATCH_POLL_SECS", 10).max(1))
}

fn startup_delay() -> Duration {
    Duration::from_secs(env_u64("WARDEN_WATCH_STARTUP_DELAY_SECS", 15))
}

/// Consecutive free-lock probes before the agent is declared dead.
const DEAD_PROBES: u32 = 3;

/// Spawn the watchdog as a detached child. Called right after an
/// upgrade swap, and again on every agent startup so a freshly swapped
/// binary is always monitored.
pub fn invoke_watcher() -> Result<(), AgentError> {
    let exe = reexec::reexec_path();
    let child = Command::new(&exe)
        .arg("watch")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| AgentError::ProcessSpawn {
            message: format!("spawning upgrade watcher via {}", exe.display()),
            app_name: Some(paths::AGENT_NAME.to_string()),
            source: Some(e),
        })?;
    info!(pid = child.id(), "upgrade watcher started");
    Ok(())
}

/// Body of the `watch` subcommand.
pub async fn run_watch(bus: Bus) -> Result<(), AgentError> {
    let marker_path = paths::marker_file();
    let Some(marker) = UpgradeMarker::load(&marker_path)? else {
        info!("no upgrade marker; nothing to watch");
        return Ok(());
    };

    info!(prev = %marker.prev_hash, new = %marker.new_hash, "watching upgraded agent");
    tokio::time::sleep(startup_delay()).await;

    let stable = observe_stability(
        &paths::lock_file(),
        grace_period(),
        poll_interval(),
        DEAD_PROBES,
    )
    .await;

    if !stable {
        warn!(new = %marker.new_hash, "upgraded agent failed to stabilize; rolling back");
        bus.publish(
            topics::TOPIC_UPGRADE_ROLLBACK,
            &serde_json::json!({"prev": marker.prev_hash, "new": marker.new_hash}),
        );
        rollback(&marker)?;
        respawn_agent();
        return Ok(());
    }

    // Stable. The marker is only removed once its deferred ack went out;
    // otherwise the agent's cleaner retires it after acking.
    match UpgradeMarker::load(&marker_path)? {
        Some(current) if current.acked => {
            UpgradeMarker::remove(&marker_path)?;
            info!(new = %marker.new_hash, "upgrade declared stable");
        }
        Some(_) => {
            info!(new = %marker.new_hash, "upgrade stable but ack still pending; leaving marker");
        }
        None => {}
    }
    bus.publish(
        topics::TOPIC_UPGRADE_COMPLETED,
        &serde_json::json!({"new": marker.new_hash}),
    );
    Ok(())
}

/// Probe the data-dir lock for the grace period. Returns false as soon
/// as `dead_probes` consecutive probes find the lock free.
pub async fn observe_stability(
    lock_path: &Path,
    grace: Duration,
    poll: Duration,
    dead_probes: u32,
) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    let mut free_streak = 0u32;
    while tokio::time::Instant::now() < deadline {
        if lock::lock_is_free(lock_path) {
            free_streak += 1;
            if free_streak >= dead_probes {
                return false;
            }
        } else {
            free_streak = 0;
        }
        tokio::time::sleep(poll).await;
    }
    true
}

/// Restore the previous install: symlink back, drop the new tree,
/// retire the marker.
pub fn rollback(marker: &UpgradeMarker) -> Result<(), AgentError> {
    change_symlink(&marker.prev_hash)?;
    super::record_active_commit(&marker.prev_hash);
    let new_install = paths::versioned_home(&marker.new_hash);
    if let Err(err) = std::fs::remove_dir_all(&new_install) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %new_install.display(), %err, "failed to remove rolled-back install");
        }
    }
    UpgradeMarker::remove(&paths::marker_file())
}

fn respawn_agent() {
    let exe = paths::symlink();
    match Command::new(&exe)
        .arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => info!(pid = child.id(), "previous agent restarted"),
        Err(err) => error!(%err, path = %exe.display(), "failed to restart previous agent"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::AppLocker;
    use crate::test_support;
    use tempfile::tempdir;

    #[tokio::test(start_paused = true)]
    async fn held_lock_means_stable() {
        let tmp = tempdir().unwrap();
        let lock_path = tmp.path().join("agent.lock");
        let mut locker = AppLocker::new(&lock_path);
        locker.try_lock().unwrap();

        let stable = observe_stability(
            &lock_path,
            Duration::from_secs(60),
            Duration::from_secs(5),
            3,
        )
        .await;
        assert!(stable);
    }

    #[tokio::test(start_paused = true)]
    async fn free_lock_triggers_rollback_verdict() {
        let tmp = tempdir().unwrap();
        let lock_path = tmp.path().join("agent.lock");

        let stable = observe_stability(
            &lock_path,
            Duration::from_secs(600),
            Duration::from_secs(5),
            3,
        )
        .await;
        assert!(!stable);
    }

    #[test]
    fn rollback_restores_symlink_and_removes_install() {
        let tmp = tempdir().unwrap();
        let mut guard = test_support::env_guard();
        test_support::scoped_paths(&mut guard, tmp.path());

        // Two installs; symlink currently at the new one.
        let old = paths::versioned_home("aaaaaa");
        let new = paths::versioned_home("bbbbbb");
        std::fs::create_dir_all(&old).unwrap();
        std::fs::create_dir_all(&new).unwrap();
        change_symlink("bbbbbb").unwrap();

        let marker = UpgradeMarker {
            prev_hash: "aaaaaa".into(),
            new_hash: "bbbbbb".into(),
            action: None,
            acked: false,
        };
        marker.save(&paths::marker_file()).unwrap();

        rollback(&marker).unwrap();

        let target = std::fs::read_link(paths::symlink()).unwrap();
        assert!(target.to_string_lossy().contains("warden-agent-aaaaaa"));
        assert!(!new.exists());
        assert!(old.exists());
        assert!(UpgradeMarker::load(&paths::marker_file()).unwrap().is_none());
    }
}
