// Manifest coordinator: the single writer of shared manifest state and the fan-out point
// for task lifecycle events.

use std::collections::BTreeSet;
use std::sync::Arc;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DownloadError;
use crate::events::{DownloadListener, TaskId};
use crate::manifest::{LengthSlot, Manifest, Unit};
use crate::store::{ResumeStore, save_manifest};

pub struct ManifestCoordinator {
    session_id: String,
    manifest: Mutex<Manifest>,
    store: Arc<dyn ResumeStore>,
    listener: Arc<dyn DownloadListener>,
    in_flight: parking_lot::Mutex<BTreeSet<TaskId>>,
}

impl ManifestCoordinator {
    pub fn new(
        session_id: impl Into<String>,
        manifest: Manifest,
        store: Arc<dyn ResumeStore>,
        listener: Arc<dyn DownloadListener>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            manifest: Mutex::new(manifest),
            store,
            listener,
            in_flight: parking_lot::Mutex::new(BTreeSet::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Records a discovered length and persists the manifest, under the manifest lock.
    ///
    /// The first writer of a slot wins: if the slot already holds a length, that frozen value
    /// is returned and nothing is written. If persisting fails the in-memory write is rolled
    /// back, so memory never runs ahead of the store.
    pub async fn discover_length(
        &self,
        index: usize,
        slot: LengthSlot,
        length: u64,
    ) -> Result<u64, DownloadError> {
        let mut manifest = self.manifest.lock().await;
        if let Some(frozen) = manifest.length(index, slot) {
            debug!(unit = index, ?slot, frozen, "Length already known");
            return Ok(frozen);
        }

        manifest.set_length(index, slot, Some(length))?;
        if let Err(e) = save_manifest(self.store.as_ref(), &self.session_id, &manifest).await {
            manifest.set_length(index, slot, None)?;
            return Err(e);
        }

        info!(unit = index, ?slot, length, "Discovered length persisted");
        Ok(length)
    }

    pub async fn unit(&self, index: usize) -> Option<Unit> {
        self.manifest.lock().await.unit(index).cloned()
    }

    pub async fn snapshot(&self) -> Manifest {
        self.manifest.lock().await.clone()
    }

    pub fn track(&self, task: TaskId) {
        self.in_flight.lock().insert(task);
    }

    /// Drops a task from the in-flight set; `false` if it was not there.
    pub fn remove(&self, task: TaskId) -> bool {
        self.in_flight.lock().remove(&task)
    }

    pub fn in_flight(&self) -> Vec<TaskId> {
        self.in_flight.lock().iter().copied().collect()
    }

    pub fn on_connecting(&self, task: TaskId, headers: &HeaderMap) {
        self.listener.on_connecting(task, headers);
    }

    pub fn on_progress(&self, task: TaskId, delta: u64) {
        self.listener.on_progress(task, delta);
    }

    pub fn on_request_error(&self, task: TaskId, status: StatusCode, body: &str) {
        self.listener.on_request_error(task, status, body);
    }

    /// Completion is the only transition that leaves the in-flight set.
    pub fn on_complete(&self, task: TaskId) {
        self.remove(task);
        self.listener.on_complete(task);
    }

    pub fn on_retry(&self, task: TaskId) {
        self.listener.on_retry(task);
    }

    pub fn on_failure(&self, task: TaskId, error: &DownloadError) {
        self.listener.on_failure(task, error);
    }

    pub fn on_cancel(&self, task: TaskId) {
        self.listener.on_cancel(task);
    }
}
