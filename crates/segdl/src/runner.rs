use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use crate::error::DownloadError;
use crate::events::TaskId;

/// Cancellation state of one task: a polled flag plus a token that interrupts pending awaits.
#[derive(Debug, Default)]
pub struct CancelSignal {
    flag: AtomicBool,
    interrupt: CancellationToken,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag; with `interrupt`, also wakes any await raced against [`interrupted`].
    ///
    /// [`interrupted`]: Self::interrupted
    pub fn cancel(&self, interrupt: bool) {
        self.flag.store(true, Ordering::SeqCst);
        if interrupt {
            self.interrupt.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn interrupted(&self) -> WaitForCancellationFuture<'_> {
        self.interrupt.cancelled()
    }

    pub fn check(&self) -> Result<(), DownloadError> {
        if self.is_cancelled() {
            Err(DownloadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// How a task ended.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed,
    Failed(DownloadError),
    Cancelled,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

/// Runs tasks on the tokio runtime, at most `limit` at a time.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    semaphore: Arc<Semaphore>,
}

impl TaskRunner {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Spawns `task` once a permit is free.
    ///
    /// A task cancelled while still queued is started without a permit so that it can
    /// observe its signal and report the cancellation itself.
    pub fn submit<F>(&self, id: TaskId, signal: Arc<CancelSignal>, task: F) -> TaskHandle
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let finished = Arc::new(AtomicBool::new(false));
        let wait_signal = Arc::clone(&signal);
        let done = Arc::clone(&finished);

        let join = tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = wait_signal.interrupted() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let outcome = task.await;
            done.store(true, Ordering::SeqCst);
            outcome
        });

        TaskHandle {
            id,
            signal,
            finished,
            join: Mutex::new(Some(join)),
        }
    }
}

/// Cancellable handle to a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    signal: Arc<CancelSignal>,
    finished: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<TaskOutcome>>>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Requests cancellation. Returns `false` when the task had already finished.
    pub fn cancel(&self, interrupt: bool) -> bool {
        if self.is_finished() {
            return false;
        }
        debug!(task = %self.id, interrupt, "Cancelling task");
        self.signal.cancel(interrupt);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Waits for the task. Only the first call observes the outcome.
    pub async fn join(&self) -> TaskOutcome {
        let join = self.join.lock().take();
        match join {
            Some(join) => match join.await {
                Ok(outcome) => outcome,
                Err(e) => TaskOutcome::Failed(DownloadError::internal(format!(
                    "task {} panicked or was aborted: {e}",
                    self.id
                ))),
            },
            None => TaskOutcome::Failed(DownloadError::internal(format!(
                "task {} already joined",
                self.id
            ))),
        }
    }
}
