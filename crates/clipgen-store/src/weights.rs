//! First-use weight downloads.
//!
//! Every worker replica needs the same weight files. Only one replica per
//! shared volume fetches them (under the `download` pod lock); the rest wait
//! for the files to appear. Each file lands under a temporary name and is
//! renamed into place only once complete, so the completion predicate (every
//! file exists) never sees a half-written file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use clipgen_types::config::CoordinatorConfig;
use clipgen_types::model::ModelFile;

use crate::coordinator::{self, CoordinationOutcome, PodWork};
use crate::error::{Result, StoreError};

pub const DOWNLOAD_LOCK: &str = "download";

// ── Fetchers ──────────────────────────────────────────────────────────────────

/// Source of weight files (model hub client, object store, shared mirror).
#[async_trait]
pub trait WeightFetcher: Send + Sync {
    /// Write `file`'s full contents to `dest`.
    async fn fetch(&self, file: &ModelFile, dest: &Path) -> anyhow::Result<()>;
}

/// Copies weights from a mounted mirror laid out as `<root>/<file_name>`.
pub struct LocalMirrorFetcher {
    root: PathBuf,
}

impl LocalMirrorFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl WeightFetcher for LocalMirrorFetcher {
    async fn fetch(&self, file: &ModelFile, dest: &Path) -> anyhow::Result<()> {
        let src = self.root.join(&file.file_name);
        let bytes = tokio::fs::copy(&src, dest)
            .await
            .map_err(|e| anyhow::anyhow!("copy {} from mirror: {e}", src.display()))?;
        info!(file = %file.file_name, repo = %file.repo_id, bytes, "copied from mirror");
        Ok(())
    }
}

// ── Weight set ────────────────────────────────────────────────────────────────

/// The weight files a pipeline needs, and where they live locally.
#[derive(Debug, Clone)]
pub struct WeightSet {
    dir: PathBuf,
    files: Vec<ModelFile>,
}

impl WeightSet {
    pub fn new(dir: impl Into<PathBuf>, files: Vec<ModelFile>) -> Self {
        Self { dir: dir.into(), files }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files(&self) -> &[ModelFile] {
        &self.files
    }

    pub fn path_of(&self, file: &ModelFile) -> PathBuf {
        self.dir.join(&file.file_name)
    }

    fn partial_path_of(&self, file: &ModelFile) -> PathBuf {
        self.dir.join(format!(".{}.partial", file.file_name))
    }

    pub fn missing(&self) -> Vec<&ModelFile> {
        self.files.iter().filter(|f| !self.path_of(f).exists()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.files.iter().all(|f| self.path_of(f).exists())
    }

    /// Fetch every missing file. A failed fetch removes its partial file
    /// before the error propagates; files fetched earlier are kept.
    pub async fn fetch_missing(&self, fetcher: &dyn WeightFetcher) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        for file in self.missing() {
            let partial = self.partial_path_of(file);
            let dest = self.path_of(file);
            info!(file = %file.file_name, repo = %file.repo_id, "fetching weights");

            if let Err(e) = fetcher.fetch(file, &partial).await {
                discard_partial(&partial).await;
                return Err(StoreError::SetupFailed {
                    work: format!("download of {}", file.file_name),
                    reason: format!("{e:#}"),
                });
            }
            if let Err(e) = tokio::fs::rename(&partial, &dest).await {
                discard_partial(&partial).await;
                return Err(e.into());
            }
            info!(file = %file.file_name, path = %dest.display(), "weights in place");
        }
        Ok(())
    }

    /// Download missing files under the `download` pod lock.
    pub async fn ensure(
        &self,
        fetcher: &dyn WeightFetcher,
        config: &CoordinatorConfig,
    ) -> Result<CoordinationOutcome> {
        let work = PodWork::new(&self.dir, DOWNLOAD_LOCK)
            .description("model downloads")
            .max_wait(config.download_max_wait)
            .poll_interval(config.poll_interval);

        coordinator::coordinate_with_retry(
            &work,
            config.max_attempts,
            || self.is_complete(),
            move || async move { self.fetch_missing(fetcher).await },
        )
        .await
    }
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => warn!(path = %path.display(), "removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial download"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
