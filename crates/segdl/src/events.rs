use std::fmt;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;

use crate::error::DownloadError;

/// Identifies one segment task inside a session (the index of its unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle callbacks raised by segment tasks.
///
/// Callbacks run on the task's own execution context. Events of one task arrive in
/// state-machine order; there is no ordering across tasks. Every task ends with exactly
/// one of `on_complete`, `on_failure` or `on_cancel`.
pub trait DownloadListener: Send + Sync {
    fn on_connecting(&self, _task: TaskId, _headers: &HeaderMap) {}

    fn on_progress(&self, _task: TaskId, _delta: u64) {}

    fn on_request_error(&self, _task: TaskId, _status: StatusCode, _body: &str) {}

    fn on_complete(&self, _task: TaskId) {}

    fn on_retry(&self, _task: TaskId) {}

    fn on_failure(&self, _task: TaskId, _error: &DownloadError) {}

    fn on_cancel(&self, _task: TaskId) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl DownloadListener for NoopListener {}

/// Owned form of a listener callback.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Connecting {
        task: TaskId,
        headers: HeaderMap,
    },
    Progress {
        task: TaskId,
        delta: u64,
    },
    RequestError {
        task: TaskId,
        status: StatusCode,
        body: String,
    },
    Complete {
        task: TaskId,
    },
    Retry {
        task: TaskId,
    },
    /// The error is rendered since `DownloadError` is not `Clone`.
    Failure {
        task: TaskId,
        error: String,
    },
    Cancel {
        task: TaskId,
    },
}

impl DownloadEvent {
    pub fn task(&self) -> TaskId {
        match self {
            DownloadEvent::Connecting { task, .. }
            | DownloadEvent::Progress { task, .. }
            | DownloadEvent::RequestError { task, .. }
            | DownloadEvent::Complete { task }
            | DownloadEvent::Retry { task }
            | DownloadEvent::Failure { task, .. }
            | DownloadEvent::Cancel { task } => *task,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Complete { .. }
                | DownloadEvent::Failure { .. }
                | DownloadEvent::Cancel { .. }
        )
    }
}

/// Forwards callbacks as [`DownloadEvent`]s over an unbounded channel.
///
/// Sends after the receiver is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: DownloadEvent) {
        let _ = self.tx.send(event);
    }
}

impl DownloadListener for ChannelListener {
    fn on_connecting(&self, task: TaskId, headers: &HeaderMap) {
        self.send(DownloadEvent::Connecting {
            task,
            headers: headers.clone(),
        });
    }

    fn on_progress(&self, task: TaskId, delta: u64) {
        self.send(DownloadEvent::Progress { task, delta });
    }

    fn on_request_error(&self, task: TaskId, status: StatusCode, body: &str) {
        self.send(DownloadEvent::RequestError {
            task,
            status,
            body: body.to_owned(),
        });
    }

    fn on_complete(&self, task: TaskId) {
        self.send(DownloadEvent::Complete { task });
    }

    fn on_retry(&self, task: TaskId) {
        self.send(DownloadEvent::Retry { task });
    }

    fn on_failure(&self, task: TaskId, error: &DownloadError) {
        self.send(DownloadEvent::Failure {
            task,
            error: error.to_string(),
        });
    }

    fn on_cancel(&self, task: TaskId) {
        self.send(DownloadEvent::Cancel { task });
    }
}
