// Download session: opens or resumes a manifest, runs one segment task per unit and
// assembles the result.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use reqwest::header::ACCEPT_RANGES;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::DownloaderConfig;
use crate::connection::{ConnectRequest, open_following_redirects};
use crate::coordinator::ManifestCoordinator;
use crate::error::DownloadError;
use crate::events::{DownloadListener, TaskId};
use crate::manifest::{BlockConfig, Manifest, ManifestKind};
use crate::playlist::load_media_playlist;
use crate::progress::ProgressAccumulator;
use crate::request::DownloadRequest;
use crate::retry::RetryPolicyFactory;
use crate::runner::{CancelSignal, TaskHandle, TaskOutcome, TaskRunner};
use crate::store::{
    ResumeStore, load_block_config, load_manifest, purge_download, purge_session,
    save_block_config, save_manifest,
};
use crate::task::{SegmentDownloadTask, resource_path};

/// How every task of a session ended.
#[derive(Debug, Default)]
pub struct SessionReport {
    pub completed: Vec<TaskId>,
    pub failed: Vec<(TaskId, String)>,
    pub cancelled: Vec<TaskId>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }
}

pub struct DownloadSession {
    request: Arc<DownloadRequest>,
    store: Arc<dyn ResumeStore>,
    coordinator: Arc<ManifestCoordinator>,
    runner: TaskRunner,
    retry: RetryPolicyFactory,
    progress: Vec<Arc<ProgressAccumulator>>,
    handles: parking_lot::Mutex<Vec<Arc<TaskHandle>>>,
    resumed: bool,
}

impl DownloadSession {
    /// Opens a single-file download, reusing persisted state when there is any.
    ///
    /// A fresh download probes the server once: when it reports a length and accepts byte
    /// ranges, and the file is large enough, the file is split into `block_count` blocks.
    pub async fn open_file(
        request: DownloadRequest,
        config: &DownloaderConfig,
        store: Arc<dyn ResumeStore>,
        listener: Arc<dyn DownloadListener>,
    ) -> Result<Self, DownloadError> {
        config.validate()?;
        let session = request.session_id();

        let (manifest, resumed) = match load_manifest(store.as_ref(), &session).await? {
            Some(manifest) => (manifest, true),
            None => match load_block_config(store.as_ref(), &session).await? {
                Some(blocks) => {
                    let manifest = Manifest::blocks(request.url.clone(), &blocks);
                    save_manifest(store.as_ref(), &session, &manifest).await?;
                    (manifest, true)
                }
                None => (plan_file(&request, config, store.as_ref(), &session).await?, false),
            },
        };

        Ok(Self::from_manifest(
            request, config, store, listener, manifest, resumed,
        ))
    }

    /// Opens an HLS download from a master or media playlist URL.
    pub async fn open_playlist(
        request: DownloadRequest,
        config: &DownloaderConfig,
        store: Arc<dyn ResumeStore>,
        listener: Arc<dyn DownloadListener>,
    ) -> Result<Self, DownloadError> {
        config.validate()?;
        let session = request.session_id();

        let (manifest, resumed) = match load_manifest(store.as_ref(), &session).await? {
            Some(manifest) => (manifest, true),
            None => {
                let (base, playlist) = load_media_playlist(
                    request.connector.as_ref(),
                    &request.url,
                    request.max_redirects,
                )
                .await?;
                let manifest = Manifest::from_media_playlist(&base, &playlist)?;
                save_manifest(store.as_ref(), &session, &manifest).await?;
                (manifest, false)
            }
        };

        Ok(Self::from_manifest(
            request, config, store, listener, manifest, resumed,
        ))
    }

    fn from_manifest(
        request: DownloadRequest,
        config: &DownloaderConfig,
        store: Arc<dyn ResumeStore>,
        listener: Arc<dyn DownloadListener>,
        manifest: Manifest,
        resumed: bool,
    ) -> Self {
        let session = request.session_id();
        info!(
            tag = %request.tag,
            session = %session,
            kind = ?manifest.kind,
            units = manifest.units.len(),
            resumed,
            "Download session opened"
        );

        let progress = (0..manifest.units.len())
            .map(|_| Arc::new(ProgressAccumulator::new()))
            .collect();
        let coordinator = Arc::new(ManifestCoordinator::new(
            session,
            manifest,
            Arc::clone(&store),
            listener,
        ));

        Self {
            request: Arc::new(request),
            store,
            coordinator,
            runner: TaskRunner::new(config.max_concurrent_tasks),
            retry: config.retry.factory(),
            progress,
            handles: parking_lot::Mutex::new(Vec::new()),
            resumed,
        }
    }

    /// Replaces the retry policy used by tasks started afterwards.
    pub fn with_retry_policy(mut self, retry: RetryPolicyFactory) -> Self {
        self.retry = retry;
        self
    }

    pub fn session_id(&self) -> &str {
        self.coordinator.session_id()
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    /// Whether persisted state was found when the session was opened.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn unit_count(&self) -> usize {
        self.progress.len()
    }

    pub async fn manifest(&self) -> Manifest {
        self.coordinator.snapshot().await
    }

    /// Submits one task per unit. Returns the number of tasks submitted.
    pub fn start(&self) -> Result<usize, DownloadError> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Err(DownloadError::configuration("session already started"));
        }

        for (index, progress) in self.progress.iter().enumerate() {
            let id = TaskId(index);
            let signal = Arc::new(CancelSignal::new());
            let task = SegmentDownloadTask::new(
                id,
                Arc::clone(&self.request),
                Arc::clone(&self.coordinator),
                Arc::clone(progress),
                Arc::clone(&signal),
                (self.retry)(),
            );
            self.coordinator.track(id);
            handles.push(Arc::new(self.runner.submit(id, signal, task.run())));
        }

        debug!(tasks = handles.len(), "Segment tasks submitted");
        Ok(handles.len())
    }

    /// Waits for every submitted task.
    pub async fn wait(&self) -> SessionReport {
        let handles: Vec<_> = self.handles.lock().clone();
        let outcomes = join_all(handles.iter().map(|handle| handle.join())).await;

        let mut report = SessionReport::default();
        for (handle, outcome) in handles.iter().zip(outcomes) {
            match outcome {
                TaskOutcome::Completed => report.completed.push(handle.id()),
                TaskOutcome::Failed(e) => report.failed.push((handle.id(), e.to_string())),
                TaskOutcome::Cancelled => report.cancelled.push(handle.id()),
            }
        }
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            "Download session finished running"
        );
        report
    }

    pub async fn run(&self) -> Result<SessionReport, DownloadError> {
        self.start()?;
        Ok(self.wait().await)
    }

    /// Cancels every unfinished task. Returns how many were still running.
    pub fn cancel(&self, interrupt: bool) -> usize {
        let cancelled = self
            .handles
            .lock()
            .iter()
            .filter(|handle| handle.cancel(interrupt))
            .count();
        info!(cancelled, interrupt, "Download session cancelled");
        cancelled
    }

    /// Bytes on disk across all units, approximately.
    pub fn block_so_far(&self) -> u64 {
        self.progress.iter().map(|p| p.block_so_far()).sum()
    }

    pub fn task_progress(&self, task: TaskId) -> Option<u64> {
        self.progress.get(task.0).map(|p| p.block_so_far())
    }

    /// Tasks that have not completed, including failed and cancelled ones.
    pub fn in_flight(&self) -> Vec<TaskId> {
        self.coordinator.in_flight()
    }

    /// Assembles the downloaded units into the output file and drops the resume state.
    ///
    /// Returns the path holding the result. Encrypted HLS segments are not decrypted: they
    /// stay in the temp directory, which is returned instead.
    pub async fn finish(&self) -> Result<PathBuf, DownloadError> {
        let manifest = self.coordinator.snapshot().await;
        self.verify_complete(&manifest).await?;

        let save_path = self.request.save_path().to_path_buf();
        let output = match manifest.kind {
            ManifestKind::SingleFile => {
                let unit = manifest
                    .units
                    .first()
                    .ok_or_else(|| DownloadError::manifest("single-file manifest has no unit"))?;
                let part = resource_path(&self.request, &unit.payload);
                move_into_place(&part, &save_path).await?;
                save_path
            }
            ManifestKind::Blocks => {
                let parts: Vec<_> = manifest
                    .units
                    .iter()
                    .map(|unit| resource_path(&self.request, &unit.payload))
                    .collect();
                concat(&parts, &save_path).await?;
                save_path
            }
            ManifestKind::Hls if manifest.has_keys() => {
                warn!(
                    dir = %self.request.temp_dir.display(),
                    "Segments are encrypted, leaving them unmerged"
                );
                self.request.temp_dir.clone()
            }
            ManifestKind::Hls => {
                let mut parts = Vec::with_capacity(manifest.units.len() + 1);
                let mut last_init = None;
                for unit in &manifest.units {
                    if let Some(init) = &unit.init_segment {
                        let identity = (&init.url, init.range);
                        if last_init != Some(identity) {
                            parts.push(resource_path(&self.request, init));
                            last_init = Some(identity);
                        }
                    }
                    parts.push(resource_path(&self.request, &unit.payload));
                }
                concat(&parts, &save_path).await?;
                save_path
            }
        };

        if output == self.request.temp_dir {
            purge_session(self.store.as_ref(), self.session_id()).await?;
        } else {
            purge_download(self.store.as_ref(), &self.request).await?;
        }
        info!(output = %output.display(), "Download finished");
        Ok(output)
    }

    /// Deletes the resume state and every downloaded unit.
    pub async fn purge(&self) -> Result<(), DownloadError> {
        purge_download(self.store.as_ref(), &self.request).await?;
        info!(session = %self.session_id(), "Download state purged");
        Ok(())
    }

    async fn verify_complete(&self, manifest: &Manifest) -> Result<(), DownloadError> {
        for unit in &manifest.units {
            let resources = unit.init_segment.iter().chain(std::iter::once(&unit.payload));
            for resource in resources {
                let path = resource_path(&self.request, resource);
                let size = match fs::metadata(&path).await {
                    Ok(meta) => meta.len(),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        return Err(DownloadError::manifest(format!(
                            "unit {} is missing {}",
                            unit.index, resource.file_name
                        )));
                    }
                    Err(e) => return Err(e.into()),
                };
                if let Some(expected) = resource.length
                    && size != expected
                {
                    return Err(DownloadError::manifest(format!(
                        "unit {} is incomplete: {} has {size} of {expected} bytes",
                        unit.index, resource.file_name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Looks at a fresh single-file target and decides between one unit and a block split.
async fn plan_file(
    request: &DownloadRequest,
    config: &DownloaderConfig,
    store: &dyn ResumeStore,
    session: &str,
) -> Result<Manifest, DownloadError> {
    let probe = ConnectRequest::new(request.url.clone()).identity();
    let mut connection =
        open_following_redirects(request.connector.as_ref(), &probe, request.max_redirects)
            .await?;
    let status = connection.status();
    if !status.is_success() {
        let body = connection.error_body().await;
        return Err(DownloadError::http_status(
            status,
            request.url.as_str(),
            "probe",
            body,
        ));
    }

    let length = connection.content_length().filter(|len| *len > 0);
    let accepts_ranges = connection
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
    drop(connection);

    let manifest = match length {
        Some(total)
            if accepts_ranges
                && config.block_count > 1
                && total > 1
                && total >= config.min_block_size.saturating_mul(2) =>
        {
            let blocks = BlockConfig::split(total, config.block_count);
            save_block_config(store, session, &blocks).await?;
            info!(total, blocks = blocks.count, "Splitting download into blocks");
            Manifest::blocks(request.url.clone(), &blocks)
        }
        length => {
            debug!(?length, accepts_ranges, "Downloading as a single unit");
            Manifest::single_file(request.url.clone(), length)
        }
    };
    save_manifest(store, session, &manifest).await?;
    Ok(manifest)
}

async fn concat(parts: &[PathBuf], output: &Path) -> Result<u64, DownloadError> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut out = File::create(output).await?;
    let mut total = 0;
    for part in parts {
        let mut input = File::open(part).await?;
        total += tokio::io::copy(&mut input, &mut out).await?;
    }
    out.flush().await?;
    debug!(parts = parts.len(), bytes = total, output = %output.display(), "Parts merged");
    Ok(total)
}

async fn move_into_place(from: &Path, to: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::rename(from, to).await.is_err() {
        // Different filesystems.
        fs::copy(from, to).await?;
        fs::remove_file(from).await?;
    }
    Ok(())
}
