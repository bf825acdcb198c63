//! Per-unit download state machine.
//!
//! A [`SegmentDownloadTask`] walks its unit's phases in order (key, init segment, payload).
//! Each fetching phase first makes sure the resource length is known, then compares it with
//! what is already on disk, then streams the missing bytes. A failure re-enters only the
//! phase that failed, after the retry policy agrees.

mod discovery;
mod fetch;
mod resume;

use std::fmt;
use std::sync::Arc;

use tracing::{Instrument, debug, error, info_span, trace, warn};

use crate::coordinator::ManifestCoordinator;
use crate::error::DownloadError;
use crate::events::TaskId;
use crate::manifest::{LengthSlot, Resource, Unit};
use crate::progress::{Phase, ProgressAccumulator};
use crate::request::DownloadRequest;
use crate::retry::{AttemptContext, RetryPolicy};
use crate::runner::{CancelSignal, TaskOutcome};

use self::resume::ResumeDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    KeyFetch,
    InitSegmentFetch,
    LengthDiscovery(Phase),
    PayloadFetch,
    Retrying(Phase),
    Complete,
    Cancelled,
    Failed,
}

impl TaskState {
    fn fetching(phase: Phase) -> Self {
        match phase {
            Phase::Key => TaskState::KeyFetch,
            Phase::InitSegment => TaskState::InitSegmentFetch,
            Phase::Payload => TaskState::PayloadFetch,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::LengthDiscovery(phase) => write!(f, "length-discovery({phase})"),
            TaskState::Retrying(phase) => write!(f, "retrying({phase})"),
            other => write!(f, "{other:?}"),
        }
    }
}

pub struct SegmentDownloadTask {
    id: TaskId,
    request: Arc<DownloadRequest>,
    coordinator: Arc<ManifestCoordinator>,
    progress: Arc<ProgressAccumulator>,
    signal: Arc<CancelSignal>,
    retry: Box<dyn RetryPolicy>,
    state: TaskState,
}

impl SegmentDownloadTask {
    pub fn new(
        id: TaskId,
        request: Arc<DownloadRequest>,
        coordinator: Arc<ManifestCoordinator>,
        progress: Arc<ProgressAccumulator>,
        signal: Arc<CancelSignal>,
        retry: Box<dyn RetryPolicy>,
    ) -> Self {
        Self {
            id,
            request,
            coordinator,
            progress,
            signal,
            retry,
            state: TaskState::Init,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Drives the state machine to a terminal state. Exactly one of `on_complete`,
    /// `on_failure` or `on_cancel` is reported.
    pub async fn run(mut self) -> TaskOutcome {
        let span = info_span!("segment", tag = %self.request.tag, unit = self.id.0);
        self.drive().instrument(span).await
    }

    async fn drive(&mut self) -> TaskOutcome {
        self.transition(TaskState::Init);
        self.progress.reset();

        let Some(unit) = self.coordinator.unit(self.id.0).await else {
            let err = DownloadError::manifest(format!("no unit {} in manifest", self.id.0));
            return self.fail(err);
        };
        let phases = phases_of(&unit);

        let mut attempt = 0u32;
        let mut next = 0;
        while let Some(&phase) = phases.get(next) {
            match self.run_phase(phase).await {
                Ok(()) => next += 1,
                Err(DownloadError::Cancelled) => return self.cancelled(),
                Err(err) => {
                    attempt += 1;
                    let ctx = AttemptContext {
                        attempt,
                        phase,
                        error: &err,
                    };
                    if !self.retry.should_retry(&ctx) {
                        return self.fail(err);
                    }

                    warn!(
                        %phase,
                        attempt,
                        remaining = self.retry.remaining_attempts(),
                        error = %err,
                        "Phase failed, retrying"
                    );
                    self.transition(TaskState::Retrying(phase));
                    self.coordinator.on_retry(self.id);

                    let delay = self.retry.backoff(attempt);
                    if !delay.is_zero() {
                        let signal = Arc::clone(&self.signal);
                        let interrupted = tokio::select! {
                            biased;
                            _ = signal.interrupted() => true,
                            _ = tokio::time::sleep(delay) => false,
                        };
                        if interrupted {
                            return self.cancelled();
                        }
                    }
                }
            }
        }

        self.transition(TaskState::Complete);
        debug!(bytes = self.progress.block_so_far(), "Unit complete");
        self.coordinator.on_complete(self.id);
        TaskOutcome::Completed
    }

    async fn run_phase(&mut self, phase: Phase) -> Result<(), DownloadError> {
        self.signal.check()?;
        let counter = phase.counter();
        self.progress.set(counter, 0);

        let unit = self
            .coordinator
            .unit(self.id.0)
            .await
            .ok_or_else(|| DownloadError::manifest(format!("no unit {}", self.id.0)))?;

        let slot = match phase {
            Phase::Key => {
                let key = unit
                    .key
                    .ok_or_else(|| DownloadError::internal("key phase without key"))?;
                self.transition(TaskState::KeyFetch);
                return self.fetch(phase, &key, 0, 0).await;
            }
            Phase::InitSegment => LengthSlot::InitSegment,
            Phase::Payload => LengthSlot::Payload,
        };
        let resource = unit
            .resource(slot)
            .cloned()
            .ok_or_else(|| DownloadError::internal(format!("{phase} phase without resource")))?;

        let expected = match resource.length {
            Some(length) => length,
            None => {
                self.transition(TaskState::LengthDiscovery(phase));
                let discovered = self.discover_length(&resource).await?;
                if discovered > 0 {
                    self.coordinator
                        .discover_length(self.id.0, slot, discovered)
                        .await?
                } else {
                    debug!(%phase, "Length still unknown after discovery");
                    0
                }
            }
        };

        let path = resource_path(&self.request, &resource);
        match resume::decide(&path, expected).await? {
            ResumeDecision::AlreadyComplete => {
                debug!(%phase, expected, "Already on disk, skipping");
                self.progress.set(counter, expected);
                Ok(())
            }
            ResumeDecision::FetchFrom(start) => {
                self.progress.set(counter, start);
                self.transition(TaskState::fetching(phase));
                self.fetch(phase, &resource, start, expected).await
            }
        }
    }

    fn transition(&mut self, next: TaskState) {
        trace!(from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    fn cancelled(&mut self) -> TaskOutcome {
        self.transition(TaskState::Cancelled);
        debug!(bytes = self.progress.block_so_far(), "Unit cancelled");
        self.coordinator.on_cancel(self.id);
        TaskOutcome::Cancelled
    }

    fn fail(&mut self, err: DownloadError) -> TaskOutcome {
        self.transition(TaskState::Failed);
        error!(error = %err, "Unit failed");
        self.coordinator.on_failure(self.id, &err);
        TaskOutcome::Failed(err)
    }
}

fn phases_of(unit: &Unit) -> Vec<Phase> {
    let mut phases = Vec::with_capacity(3);
    if unit.key.is_some() {
        phases.push(Phase::Key);
    }
    if unit.init_segment.is_some() {
        phases.push(Phase::InitSegment);
    }
    phases.push(Phase::Payload);
    phases
}

/// The path a resource's bytes land in.
pub(crate) fn resource_path(request: &DownloadRequest, resource: &Resource) -> std::path::PathBuf {
    request.temp_path(&resource.file_name)
}

#[cfg(test)]
mod tests;
