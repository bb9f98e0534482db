//! Self-upgrade state machine:
//!
//! clean downloads → capability check → report updating → download →
//! verify → unpack → hash compare → copy state → swap symlink → write
//! marker → invoke watcher → re-exec. Any failure after the swap rolls
//! the symlink back and removes the new tree; every failure is reported
//! as Failed and the triggering action is acknowledged so the server
//! does not re-deliver it in a loop.

pub mod download;
pub mod marker;
pub mod symlink;
pub mod unpack;
pub mod verify;
pub mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use warden_events::{topics, Bus};
use warden_protocol::{Action, ActionPayload};

use crate::acker::Acker;
use crate::errors::AgentError;
use crate::reexec::ReexecManager;
use crate::status::StatusController;
use crate::util::env_flag;
use crate::{paths, release};

use download::{clean_downloads, ComposedDownloader, DownloadSettings};
use marker::UpgradeMarker;
use symlink::{change_symlink, restore_symlink};
use verify::ArtifactVerifier;

pub struct Upgrader {
    settings: DownloadSettings,
    acker: Arc<dyn Acker>,
    status: StatusController,
    bus: Bus,
    reexec: Arc<ReexecManager>,
}

impl Upgrader {
    pub fn new(
        settings: DownloadSettings,
        acker: Arc<dyn Acker>,
        status: StatusController,
        bus: Bus,
        reexec: Arc<ReexecManager>,
    ) -> Self {
        Self {
            settings,
            acker,
            status,
            bus,
            reexec,
        }
    }

    /// Upgrades only make sense for an installed agent running behind
    /// the stable symlink; the override exists for development.
    pub fn is_upgradeable() -> bool {
        env_flag("WARDEN_FORCE_UPGRADEABLE") || paths::symlink().exists()
    }

    /// Run the upgrade for a fleet action. On failure the action is
    /// acknowledged and Failed is reported, then the error propagates to
    /// the dispatcher for logging.
    pub async fn upgrade(
        &self,
        token: &CancellationToken,
        action: &Action,
        reexec_now: bool,
    ) -> Result<(), AgentError> {
        let ActionPayload::Upgrade {
            version,
            source_uri,
        } = &action.payload
        else {
            return Err(AgentError::for_action(
                "expected an UPGRADE payload",
                action.id.clone(),
            ));
        };

        let result = self
            .run(token, action, version, source_uri.as_deref(), reexec_now)
            .await;
        if let Err(err) = &result {
            error!(action_id = %action.id, %version, %err, "upgrade failed");
            self.report_failure(action, err).await;
        }
        result
    }

    async fn run(
        &self,
        token: &CancellationToken,
        action: &Action,
        version: &str,
        source_uri: Option<&str>,
        reexec_now: bool,
    ) -> Result<(), AgentError> {
        info!(%version, ?source_uri, "upgrading agent");

        if !Self::is_upgradeable() {
            return Err(AgentError::PolicyBlocked {
                message: "agent cannot be upgraded; it is not running from an installed symlink"
                    .to_string(),
            });
        }

        if let Err(err) = clean_downloads(release::version()) {
            warn!(%err, "unable to clean downloads before upgrade");
        }

        if env_flag("WARDEN_UPGRADE_DISABLED") {
            // Blocked by policy: acknowledged so it is not re-delivered,
            // and nothing on disk changes.
            info!(action_id = %action.id, "upgrade blocked by policy; acknowledging");
            self.ack_action(action).await;
            return Ok(());
        }

        self.status
            .set_updating(format!("upgrade to {version} started"));
        self.bus.publish(
            topics::TOPIC_UPGRADE_STARTED,
            &serde_json::json!({"version": version}),
        );

        let settings = self.settings.clone().with_source_override(source_uri);
        let sources = ComposedDownloader::for_version(&settings, version);
        let verifier = ArtifactVerifier::from_release();
        let archive = sources.fetch_verified(token, version, &verifier).await?;
        self.bus.publish(
            topics::TOPIC_UPGRADE_DOWNLOADED,
            &serde_json::json!({"version": version, "archive": archive.display().to_string()}),
        );

        if token.is_cancelled() {
            return Err(AgentError::cancelled("upgrade interrupted after download"));
        }

        let unpack_from = archive.clone();
        let new_commit = tokio::task::spawn_blocking(move || unpack::unpack(&unpack_from))
            .await
            .map_err(|e| AgentError::unexpected(format!("unpack task failed: {e}")))??;
        let new_short = release::trim_commit(&new_commit);

        if new_commit == release::commit() {
            warn!(commit = %new_short, "upgrading to same version; nothing to do");
            self.ack_action(action).await;
            self.status.set_healthy();
            self.remove_downloads();
            return Ok(());
        }

        copy_state_files(&new_short)?;

        let prev_link = change_symlink(&new_short)?;
        record_active_commit(&new_commit);

        let marker = UpgradeMarker {
            prev_hash: release::short_commit(),
            new_hash: new_short.clone(),
            action: Some(action.clone()),
            acked: false,
        };
        if let Err(err) = marker.save(&paths::marker_file()) {
            warn!(%err, "rolling back: writing upgrade marker failed");
            self.rollback(prev_link, &new_short);
            return Err(err);
        }

        if let Err(err) = watcher::invoke_watcher() {
            warn!(%err, "rolling back: starting upgrade watcher failed");
            let _ = UpgradeMarker::remove(&paths::marker_file());
            self.rollback(prev_link, &new_short);
            return Err(err);
        }

        if reexec_now {
            self.remove_downloads();
            info!(prev = %release::short_commit(), new = %new_short, "restarting into new version");
            self.reexec.trigger();
        }
        Ok(())
    }

    /// Deferred acknowledgement: on startup after a swap, ack the
    /// marker's action once and flip the bit.
    pub async fn ack_pending(&self) -> Result<(), AgentError> {
        let path = paths::marker_file();
        let Some(mut marker) = UpgradeMarker::load(&path)? else {
            return Ok(());
        };
        if marker.acked {
            return Ok(());
        }
        if let Some(action) = &marker.action {
            self.acker.ack(action).await?;
            self.acker.commit().await?;
            info!(action_id = %action.id, "upgrade acknowledged after restart");
        }
        marker.acked = true;
        marker.save(&path)
    }

    fn rollback(&self, prev_link: Option<PathBuf>, new_short: &str) {
        self.bus.publish(
            topics::TOPIC_UPGRADE_ROLLBACK,
            &serde_json::json!({"new": new_short}),
        );
        match prev_link {
            Some(prev) => {
                if let Err(err) = restore_symlink(&prev) {
                    error!(%err, "rollback could not restore previous symlink");
                }
            }
            None => {
                // There was no symlink before this attempt.
                let _ = std::fs::remove_file(paths::symlink());
            }
        }
        let new_install = paths::versioned_home(new_short);
        if let Err(err) = std::fs::remove_dir_all(&new_install) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %new_install.display(), %err, "rollback could not remove new install");
            }
        }
    }

    async fn ack_action(&self, action: &Action) {
        if let Err(err) = self.acker.ack(action).await {
            warn!(action_id = %action.id, %err, "failed to acknowledge upgrade action");
        } else if let Err(err) = self.acker.commit().await {
            warn!(action_id = %action.id, %err, "failed to commit upgrade acknowledgement");
        }
    }

    async fn report_failure(&self, action: &Action, err: &AgentError) {
        // Acked so the server does not re-deliver the same failing
        // upgrade forever; the Failed status carries the story.
        self.ack_action(action).await;
        self.status.set_failed(err.to_string());
    }

    fn remove_downloads(&self) {
        let downloads = paths::downloads();
        if let Err(err) = std::fs::remove_dir_all(&downloads) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %downloads.display(), %err, "unable to clean downloads after upgrade");
            }
        }
    }
}

/// Record the hash the stable symlink currently points at. Informational
/// for operators and the uninstaller; the symlink is the authority.
pub(crate) fn record_active_commit(commit: &str) {
    let path = paths::active_commit_file();
    if let Err(err) = crate::util::atomic_write(&path, commit.as_bytes()) {
        warn!(%err, "failed to record active commit");
    }
}

/// Copy the shared state files into the new install's home so the new
/// version starts from the same view of the world.
fn copy_state_files(new_short: &str) -> Result<(), AgentError> {
    let new_home = paths::versioned_home(new_short);
    for src in [
        paths::state_file(),
        paths::agent_info_file(),
        paths::fleet_config_file(),
    ] {
        let Some(name) = src.file_name() else { continue };
        let dest = new_home.join(name);
        match std::fs::copy(&src, &dest) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(AgentError::io("copying state into new install", &src, e)),
        }
    }
    Ok(())
}
