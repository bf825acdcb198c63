//! Scripted in-memory HTTP server and recording listener for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION,
};
use url::Url;

use crate::connection::{ConnectRequest, Connection, ConnectionFactory};
use crate::error::DownloadError;
use crate::events::{DownloadEvent, DownloadListener, TaskId};
use crate::runner::CancelSignal;

#[derive(Debug, Clone)]
pub(crate) struct MockResource {
    body: Vec<u8>,
    honor_ranges: bool,
    chunk_plan: Vec<usize>,
    length_only_with_identity: bool,
    omit_length: bool,
    failures: VecDeque<StatusCode>,
    always_fail: Option<StatusCode>,
}

impl MockResource {
    pub(crate) fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            honor_ranges: true,
            chunk_plan: Vec::new(),
            length_only_with_identity: false,
            omit_length: false,
            failures: VecDeque::new(),
            always_fail: None,
        }
    }

    pub(crate) fn ignore_ranges(mut self) -> Self {
        self.honor_ranges = false;
        self
    }

    /// Sizes of the chunks the body is delivered in; the rest follows in one chunk.
    pub(crate) fn chunks(mut self, plan: Vec<usize>) -> Self {
        self.chunk_plan = plan;
        self
    }

    /// Omits `Content-Length` unless identity encoding was requested.
    pub(crate) fn length_only_with_identity(mut self) -> Self {
        self.length_only_with_identity = true;
        self
    }

    /// Never sends `Content-Length`, as with chunked transfer encoding.
    pub(crate) fn omit_length(mut self) -> Self {
        self.omit_length = true;
        self
    }

    /// Answers the next `times` requests with `status`.
    pub(crate) fn fail_times(mut self, status: StatusCode, times: usize) -> Self {
        self.failures.extend(std::iter::repeat_n(status, times));
        self
    }

    pub(crate) fn always_fail(mut self, status: StatusCode) -> Self {
        self.always_fail = Some(status);
        self
    }
}

#[derive(Debug, Clone)]
enum Route {
    Serve(MockResource),
    Redirect(Url),
}

#[derive(Debug, Default)]
pub(crate) struct MockConnectionFactory {
    routes: Mutex<HashMap<Url, Route>>,
    requests: Mutex<Vec<ConnectRequest>>,
    reads: Arc<AtomicUsize>,
}

impl MockConnectionFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn serve(&self, url: Url, resource: MockResource) {
        self.routes.lock().insert(url, Route::Serve(resource));
    }

    pub(crate) fn redirect(&self, from: Url, to: Url) {
        self.routes.lock().insert(from, Route::Redirect(to));
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn requests_to(&self, url: &Url) -> Vec<ConnectRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| &r.url == url)
            .cloned()
            .collect()
    }

    /// Body reads across every connection handed out.
    pub(crate) fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &ConnectRequest) -> MockConnection {
        let mut routes = self.routes.lock();
        let mut headers = HeaderMap::new();

        let resource = match routes.get_mut(&request.url) {
            None => {
                return self.status_only(request, StatusCode::NOT_FOUND, "no such route");
            }
            Some(Route::Redirect(to)) => {
                if let Ok(value) = HeaderValue::from_str(to.as_str()) {
                    headers.insert(LOCATION, value);
                }
                return MockConnection {
                    url: request.url.clone(),
                    status: StatusCode::FOUND,
                    headers,
                    chunks: VecDeque::new(),
                    reads: Arc::clone(&self.reads),
                };
            }
            Some(Route::Serve(resource)) => resource,
        };

        if let Some(status) = resource.always_fail.or_else(|| resource.failures.pop_front()) {
            return self.status_only(request, status, "upstream exploded");
        }

        let total = resource.body.len() as u64;
        let (status, slice) = match request.range {
            Some(range) if resource.honor_ranges => {
                let start = range.start.min(total) as usize;
                let end = range.end.min(total) as usize;
                headers.insert(
                    CONTENT_RANGE,
                    header(&format!(
                        "bytes {}-{}/{}",
                        start,
                        end.saturating_sub(1),
                        total
                    )),
                );
                (StatusCode::PARTIAL_CONTENT, &resource.body[start..end])
            }
            _ => (StatusCode::OK, &resource.body[..]),
        };

        if resource.honor_ranges {
            headers.insert(ACCEPT_RANGES, header("bytes"));
        }
        if !resource.omit_length
            && (!resource.length_only_with_identity || request.identity_encoding)
        {
            headers.insert(CONTENT_LENGTH, header(&slice.len().to_string()));
        }

        let mut chunks = VecDeque::new();
        let mut rest = slice;
        for size in &resource.chunk_plan {
            if rest.is_empty() {
                break;
            }
            let (head, tail) = rest.split_at((*size).min(rest.len()));
            chunks.push_back(Bytes::copy_from_slice(head));
            rest = tail;
        }
        if !rest.is_empty() {
            chunks.push_back(Bytes::copy_from_slice(rest));
        }

        MockConnection {
            url: request.url.clone(),
            status,
            headers,
            chunks,
            reads: Arc::clone(&self.reads),
        }
    }

    fn status_only(
        &self,
        request: &ConnectRequest,
        status: StatusCode,
        body: &str,
    ) -> MockConnection {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header("text/plain; charset=utf-8"));
        MockConnection {
            url: request.url.clone(),
            status,
            headers,
            chunks: VecDeque::from([Bytes::copy_from_slice(body.as_bytes())]),
            reads: Arc::clone(&self.reads),
        }
    }
}

fn header(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap()
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<Box<dyn Connection>, DownloadError> {
        self.requests.lock().push(request.clone());
        Ok(Box::new(self.respond(request)))
    }
}

pub(crate) struct MockConnection {
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    chunks: VecDeque<Bytes>,
    reads: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for MockConnection {
    fn url(&self) -> &Url {
        &self.url
    }

    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>, DownloadError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(self.chunks.pop_front())
    }

    async fn error_body(&mut self) -> String {
        let body: Vec<u8> = self.chunks.drain(..).flatten().collect();
        String::from_utf8_lossy(&body).into_owned()
    }
}

/// Records every callback; optionally cancels a task once it has streamed enough bytes.
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<DownloadEvent>>,
    cancel_after: Mutex<Option<(u64, Arc<CancelSignal>)>>,
    streamed: AtomicUsize,
}

impl RecordingListener {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel_after(&self, bytes: u64, signal: Arc<CancelSignal>) {
        *self.cancel_after.lock() = Some((bytes, signal));
    }

    pub(crate) fn events(&self) -> Vec<DownloadEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&DownloadEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub(crate) fn completes(&self) -> usize {
        self.count(|e| matches!(e, DownloadEvent::Complete { .. }))
    }

    pub(crate) fn retries(&self) -> usize {
        self.count(|e| matches!(e, DownloadEvent::Retry { .. }))
    }

    pub(crate) fn failures(&self) -> usize {
        self.count(|e| matches!(e, DownloadEvent::Failure { .. }))
    }

    pub(crate) fn cancels(&self) -> usize {
        self.count(|e| matches!(e, DownloadEvent::Cancel { .. }))
    }

    pub(crate) fn progress_deltas(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DownloadEvent::Progress { delta, .. } => Some(*delta),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: DownloadEvent) {
        self.events.lock().push(event);
    }
}

impl DownloadListener for RecordingListener {
    fn on_connecting(&self, task: TaskId, headers: &HeaderMap) {
        self.push(DownloadEvent::Connecting {
            task,
            headers: headers.clone(),
        });
    }

    fn on_progress(&self, task: TaskId, delta: u64) {
        self.push(DownloadEvent::Progress { task, delta });
        let total = self.streamed.fetch_add(delta as usize, Ordering::SeqCst) as u64 + delta;
        if let Some((limit, signal)) = self.cancel_after.lock().as_ref() {
            if total >= *limit {
                signal.cancel(true);
            }
        }
    }

    fn on_request_error(&self, task: TaskId, status: StatusCode, body: &str) {
        self.push(DownloadEvent::RequestError {
            task,
            status,
            body: body.to_owned(),
        });
    }

    fn on_complete(&self, task: TaskId) {
        self.push(DownloadEvent::Complete { task });
    }

    fn on_retry(&self, task: TaskId) {
        self.push(DownloadEvent::Retry { task });
    }

    fn on_failure(&self, task: TaskId, error: &DownloadError) {
        self.push(DownloadEvent::Failure {
            task,
            error: error.to_string(),
        });
    }

    fn on_cancel(&self, task: TaskId) {
        self.push(DownloadEvent::Cancel { task });
    }
}
