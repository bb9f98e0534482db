//! Artifact fetching. Sources are composed in order — local drop
//! directory, then the HTTP repositories — and the first archive that
//! both downloads and verifies wins. Each failure is logged and the
//! next source attempted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::paths;
use crate::util::env_u64;

use super::verify::ArtifactVerifier;

/// Download tunables, env-first with clamped defaults.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub source_uri: String,
    pub snapshot_uri: String,
    pub drop_path: Option<PathBuf>,
    /// Overall deadline for one download attempt.
    pub timeout: Duration,
    /// Stall detector: no bytes for this long aborts the attempt.
    pub idle_timeout: Option<Duration>,
    pub retries: u32,
    pub retry_backoff: Duration,
}

impl DownloadSettings {
    pub fn from_env() -> Self {
        let idle = env_u64("WARDEN_DL_IDLE_TIMEOUT_SECS", 300);
        Self {
            source_uri: std::env::var("WARDEN_DOWNLOAD_SOURCE_URI")
                .unwrap_or_else(|_| "https://artifacts.warden.sh/downloads".to_string()),
            snapshot_uri: std::env::var("WARDEN_DOWNLOAD_SNAPSHOT_URI")
                .unwrap_or_else(|_| "https://snapshots.warden.sh/downloads".to_string()),
            drop_path: std::env::var_os("WARDEN_DOWNLOAD_DROP_PATH")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            timeout: Duration::from_secs(env_u64("WARDEN_DL_TIMEOUT_SECS", 600).max(10)),
            idle_timeout: match idle {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            retries: env_u64("WARDEN_DL_SEND_RETRIES", 2) as u32,
            retry_backoff: Duration::from_millis(
                env_u64("WARDEN_DL_RETRY_BACKOFF_MS", 500).clamp(50, 60_000),
            ),
        }
    }

    /// Apply the action's source uri: `file://` paths move the drop
    /// directory, anything else replaces the release repository.
    pub fn with_source_override(mut self, source_uri: Option<&str>) -> Self {
        if let Some(uri) = source_uri.filter(|u| !u.is_empty()) {
            if let Some(path) = uri.strip_prefix("file://") {
                self.drop_path = Some(PathBuf::from(path));
            } else {
                self.source_uri = uri.trim_end_matches('/').to_string();
            }
        }
        self
    }
}

pub fn archive_name(version: &str) -> String {
    format!(
        "{}-{}-{}-{}.tar.gz",
        paths::AGENT_NAME,
        version,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

#[async_trait]
pub trait Downloader: Send + Sync {
    fn name(&self) -> &'static str;
    /// Fetch the archive (and its detached signature when available)
    /// into the downloads directory; returns the archive path.
    async fn fetch(&self, token: &CancellationToken, version: &str)
        -> Result<PathBuf, AgentError>;
}

/// Local drop directory: archives placed next to the agent (air-gapped
/// installs, `file://` source overrides).
pub struct FsDownloader {
    drop_path: PathBuf,
}

impl FsDownloader {
    pub fn new(drop_path: PathBuf) -> Self {
        Self { drop_path }
    }
}

#[async_trait]
impl Downloader for FsDownloader {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn fetch(
        &self,
        _token: &CancellationToken,
        version: &str,
    ) -> Result<PathBuf, AgentError> {
        let name = archive_name(version);
        let src = self.drop_path.join(&name);
        let downloads = paths::downloads();
        tokio::fs::create_dir_all(&downloads)
            .await
            .map_err(|e| AgentError::io("creating downloads directory", &downloads, e))?;
        let dest = downloads.join(&name);
        tokio::fs::copy(&src, &dest)
            .await
            .map_err(|e| AgentError::io("copying archive from drop path", &src, e))?;

        let sig_src = ArtifactVerifier::sig_path(&src);
        if tokio::fs::metadata(&sig_src).await.is_ok() {
            let sig_dest = ArtifactVerifier::sig_path(&dest);
            tokio::fs::copy(&sig_src, &sig_dest)
                .await
                .map_err(|e| AgentError::io("copying signature from drop path", &sig_src, e))?;
        }
        Ok(dest)
    }
}

/// HTTP repository downloader with retries, an overall deadline, and a
/// stall detector on the byte stream.
pub struct HttpDownloader {
    label: &'static str,
    base_uri: String,
    settings: DownloadSettings,
}

impl HttpDownloader {
    pub fn release(settings: &DownloadSettings) -> Self {
        Self {
            label: "http",
            base_uri: settings.source_uri.trim_end_matches('/').to_string(),
            settings: settings.clone(),
        }
    }

    pub fn snapshot(settings: &DownloadSettings) -> Self {
        Self {
            label: "snapshot",
            base_uri: settings.snapshot_uri.trim_end_matches('/').to_string(),
            settings: settings.clone(),
        }
    }

    async fn fetch_once(
        &self,
        token: &CancellationToken,
        url: &str,
        dest: &Path,
    ) -> Result<(), AgentError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(AgentError::from)?;
        let resp = client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AgentError::network_at(
                format!("artifact request returned status {status}"),
                url,
            ));
        }

        let tmp = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| AgentError::io("creating download file", &tmp, e))?;

        let mut resp = resp;
        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(AgentError::cancelled("download interrupted"));
                }
                chunk = read_chunk(&mut resp, self.settings.idle_timeout) => chunk?,
            };
            let Some(bytes) = chunk else { break };
            tokio::io::AsyncWriteExt::write_all(&mut file, &bytes)
                .await
                .map_err(|e| AgentError::io("writing download file", &tmp, e))?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file)
            .await
            .map_err(|e| AgentError::io("flushing download file", &tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| AgentError::io("committing download file", dest, e))?;
        Ok(())
    }

    async fn fetch_signature(&self, url: String, dest: &Path) {
        let sig_url = format!("{url}.sig");
        match reqwest::get(&sig_url).await {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(bytes) => {
                    let sig_dest = ArtifactVerifier::sig_path(dest);
                    if let Err(err) = tokio::fs::write(&sig_dest, &bytes).await {
                        warn!(%err, path = %sig_dest.display(), "failed to write signature file");
                    }
                }
                Err(err) => debug!(%err, %sig_url, "signature body unavailable"),
            },
            Ok(resp) => debug!(status = %resp.status(), %sig_url, "no detached signature published"),
            Err(err) => debug!(%err, %sig_url, "signature fetch failed"),
        }
    }
}

async fn read_chunk(
    resp: &mut reqwest::Response,
    idle: Option<Duration>,
) -> Result<Option<bytes::Bytes>, AgentError> {
    match idle {
        Some(window) => tokio::time::timeout(window, resp.chunk())
            .await
            .map_err(|_| {
                AgentError::network(format!("download stalled for {}s", window.as_secs()))
            })?
            .map_err(AgentError::from),
        None => resp.chunk().await.map_err(AgentError::from),
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn fetch(
        &self,
        token: &CancellationToken,
        version: &str,
    ) -> Result<PathBuf, AgentError> {
        let name = archive_name(version);
        let url = format!("{}/{}", self.base_uri, name);
        let downloads = paths::downloads();
        tokio::fs::create_dir_all(&downloads)
            .await
            .map_err(|e| AgentError::io("creating downloads directory", &downloads, e))?;
        let dest = downloads.join(&name);

        let mut last_err = AgentError::network_at("artifact download never attempted", &url);
        for attempt in 0..=self.settings.retries {
            if attempt > 0 {
                tokio::time::sleep(self.settings.retry_backoff * attempt).await;
            }
            let outcome = tokio::time::timeout(
                self.settings.timeout,
                self.fetch_once(token, &url, &dest),
            )
            .await
            .unwrap_or_else(|_| {
                Err(AgentError::network_at(
                    format!(
                        "download exceeded overall deadline of {}s",
                        self.settings.timeout.as_secs()
                    ),
                    &url,
                ))
            });
            match outcome {
                Ok(()) => {
                    self.fetch_signature(url.clone(), &dest).await;
                    return Ok(dest);
                }
                Err(err @ AgentError::Cancelled { .. }) => return Err(err),
                Err(err) => {
                    warn!(%url, attempt, %err, "artifact download attempt failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

/// Ordered source list; first archive that downloads *and* verifies
/// wins.
pub struct ComposedDownloader {
    sources: Vec<Box<dyn Downloader>>,
}

impl ComposedDownloader {
    /// Release builds try the drop directory then the release
    /// repository; snapshot builds slot the snapshot repository in
    /// between.
    pub fn for_version(settings: &DownloadSettings, version: &str) -> Self {
        let mut sources: Vec<Box<dyn Downloader>> = Vec::new();
        if let Some(drop) = &settings.drop_path {
            sources.push(Box::new(FsDownloader::new(drop.clone())));
        }
        if version.ends_with("-SNAPSHOT") {
            sources.push(Box::new(HttpDownloader::snapshot(settings)));
        }
        sources.push(Box::new(HttpDownloader::release(settings)));
        Self { sources }
    }

    pub fn from_sources(sources: Vec<Box<dyn Downloader>>) -> Self {
        Self { sources }
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Download and verify from the first source that can deliver.
    pub async fn fetch_verified(
        &self,
        token: &CancellationToken,
        version: &str,
        verifier: &ArtifactVerifier,
    ) -> Result<PathBuf, AgentError> {
        debug!(sources = ?self.source_names(), %version, "trying artifact sources in order");
        let mut last_err = AgentError::config("no artifact sources configured");
        for source in &self.sources {
            match source.fetch(token, version).await {
                Ok(path) => match verifier.verify(&path) {
                    Ok(()) => {
                        info!(source = source.name(), path = %path.display(),
                              "artifact downloaded and verified");
                        return Ok(path);
                    }
                    Err(err) => {
                        warn!(source = source.name(), %err,
                              "artifact failed verification; trying next source");
                        let _ = std::fs::remove_file(&path);
                        let _ = std::fs::remove_file(ArtifactVerifier::sig_path(&path));
                        last_err = err;
                    }
                },
                Err(err @ AgentError::Cancelled { .. }) => return Err(err),
                Err(err) => {
                    warn!(source = source.name(), %err,
                          "artifact download failed; trying next source");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

/// Drop stale archives from the downloads directory; anything that does
/// not belong to `keep_version` is fair game.
pub fn clean_downloads(keep_version: &str) -> Result<(), AgentError> {
    let downloads = paths::downloads();
    let entries = match std::fs::read_dir(&downloads) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(AgentError::io("reading downloads directory", &downloads, e)),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains(keep_version) {
            continue;
        }
        debug!(file = %name, "removing stale download");
        if let Err(err) = std::fs::remove_file(entry.path()) {
            warn!(file = %name, %err, "failed to remove stale download");
        }
    }
    Ok(())
}
