use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH};
use tempfile::TempDir;
use url::Url;

use super::*;
use crate::events::{DownloadEvent, DownloadListener};
use crate::manifest::{BlockConfig, ByteRange, Manifest, ManifestKind, Resource, Unit};
use crate::progress::Counter;
use crate::retry::{BackoffRetry, RetryConfig};
use crate::store::{MemoryResumeStore, load_manifest};
use crate::test_support::{MockConnectionFactory, MockResource, RecordingListener};

fn url(path: &str) -> Url {
    Url::parse(&format!("https://media.test{path}")).unwrap()
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct Harness {
    _dir: TempDir,
    factory: Arc<MockConnectionFactory>,
    store: Arc<MemoryResumeStore>,
    listener: Arc<RecordingListener>,
    request: Arc<DownloadRequest>,
    coordinator: Arc<ManifestCoordinator>,
    progress: Arc<ProgressAccumulator>,
    signal: Arc<CancelSignal>,
}

impl Harness {
    fn new(manifest: Manifest) -> Self {
        Self::with_listener(manifest, None)
    }

    fn with_listener(manifest: Manifest, listener: Option<Arc<dyn DownloadListener>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(MockConnectionFactory::new());
        let store = Arc::new(MemoryResumeStore::new());
        let recorder = Arc::new(RecordingListener::new());
        let request = Arc::new(
            DownloadRequest::new(
                manifest.source.as_str(),
                dir.path().join("out.bin"),
                factory.clone(),
            )
            .unwrap()
            .with_temp_dir(dir.path().join("tmp"))
            .with_buffer_size(64 * 1024),
        );
        let coordinator = Arc::new(ManifestCoordinator::new(
            request.session_id(),
            manifest,
            store.clone(),
            listener.unwrap_or_else(|| recorder.clone() as Arc<dyn DownloadListener>),
        ));
        Self {
            _dir: dir,
            factory,
            store,
            listener: recorder,
            request,
            coordinator,
            progress: Arc::new(ProgressAccumulator::new()),
            signal: Arc::new(CancelSignal::new()),
        }
    }

    fn task(&self, index: usize, max_retries: u32) -> SegmentDownloadTask {
        let retry = BackoffRetry::new(RetryConfig {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        });
        SegmentDownloadTask::new(
            TaskId(index),
            Arc::clone(&self.request),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.progress),
            Arc::clone(&self.signal),
            Box::new(retry),
        )
    }

    fn path(&self, name: &str) -> PathBuf {
        self.request.temp_path(name)
    }

    fn write(&self, name: &str, bytes: &[u8]) {
        let path = self.path(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn read(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.path(name)).unwrap()
    }
}

fn single(length: Option<u64>) -> Manifest {
    Manifest::single_file(url("/file.bin"), length)
}

#[tokio::test]
async fn complete_file_needs_no_network() {
    let h = Harness::new(single(Some(1000)));
    h.write("00000.part", &body(1000));

    let outcome = h.task(0, 3).run().await;

    assert!(outcome.is_completed());
    assert_eq!(h.factory.connect_count(), 0);
    assert_eq!(h.progress.block_so_far(), 1000);
    assert_eq!(h.listener.completes(), 1);
    assert!(h.listener.progress_deltas().is_empty());
}

#[tokio::test]
async fn partial_file_is_resumed_with_range() {
    let h = Harness::new(single(Some(1000)));
    let data = body(1000);
    h.factory.serve(url("/file.bin"), MockResource::new(data.clone()));
    h.write("00000.part", &data[..300]);

    assert!(h.task(0, 3).run().await.is_completed());

    let requests = h.factory.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].range, Some(ByteRange::new(300, 1000)));
    assert!(requests[0].identity_encoding);
    assert_eq!(h.read("00000.part"), data);
    assert_eq!(h.listener.progress_deltas().iter().sum::<u64>(), 700);
    assert_eq!(h.progress.get(Counter::Payload), 1000);
}

#[tokio::test]
async fn oversized_file_is_refetched_from_start() {
    let h = Harness::new(single(Some(1000)));
    let data = body(1000);
    h.factory.serve(url("/file.bin"), MockResource::new(data.clone()));
    h.write("00000.part", &vec![0xAA; 1500]);

    assert!(h.task(0, 3).run().await.is_completed());

    assert_eq!(h.factory.requests()[0].range, None);
    assert_eq!(h.read("00000.part"), data);
}

#[tokio::test]
async fn chunks_are_reported_as_progress() {
    let h = Harness::new(single(Some(1000)));
    h.factory.serve(
        url("/file.bin"),
        MockResource::new(body(1000)).chunks(vec![400, 400, 200]),
    );

    assert!(h.task(0, 3).run().await.is_completed());

    assert_eq!(h.listener.progress_deltas(), vec![400, 400, 200]);
    assert_eq!(h.listener.completes(), 1);
    assert_eq!(h.progress.get(Counter::Payload), 1000);
    let terminal: Vec<_> = h
        .listener
        .events()
        .into_iter()
        .filter(DownloadEvent::is_terminal)
        .collect();
    assert_eq!(terminal.len(), 1);
}

/// Compact rendering of one task's event stream, in delivery order.
fn timeline(listener: &RecordingListener) -> Vec<String> {
    listener
        .events()
        .iter()
        .map(|event| match event {
            DownloadEvent::Connecting { .. } => "connecting".to_owned(),
            DownloadEvent::Progress { delta, .. } => format!("progress {delta}"),
            DownloadEvent::RequestError { status, .. } => {
                format!("request-error {}", status.as_u16())
            }
            DownloadEvent::Complete { .. } => "complete".to_owned(),
            DownloadEvent::Retry { .. } => "retry".to_owned(),
            DownloadEvent::Failure { .. } => "failure".to_owned(),
            DownloadEvent::Cancel { .. } => "cancel".to_owned(),
        })
        .collect()
}

#[tokio::test]
async fn events_follow_state_machine_order() {
    let h = Harness::new(single(Some(1000)));
    h.factory.serve(
        url("/file.bin"),
        MockResource::new(body(1000)).chunks(vec![400, 400, 200]),
    );

    assert!(h.task(0, 3).run().await.is_completed());

    assert_eq!(
        timeline(&h.listener),
        [
            "connecting",
            "progress 400",
            "progress 400",
            "progress 200",
            "complete"
        ]
    );
    let Some(DownloadEvent::Connecting { task, headers }) = h.listener.events().first().cloned()
    else {
        panic!("first event is not a connect");
    };
    assert_eq!(task, TaskId(0));
    assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "1000");
    assert_eq!(headers.get(ACCEPT_RANGES).unwrap(), "bytes");
}

#[tokio::test]
async fn failed_attempt_is_reported_before_its_retry() {
    let h = Harness::new(single(Some(500)));
    h.factory.serve(
        url("/file.bin"),
        MockResource::new(body(500)).fail_times(StatusCode::BAD_GATEWAY, 1),
    );

    assert!(h.task(0, 3).run().await.is_completed());

    assert_eq!(
        timeline(&h.listener),
        [
            "connecting",
            "request-error 502",
            "retry",
            "connecting",
            "progress 500",
            "complete"
        ]
    );
}

#[tokio::test]
async fn last_failed_attempt_ends_with_failure() {
    let h = Harness::new(single(Some(500)));
    h.factory.serve(
        url("/file.bin"),
        MockResource::new(body(500)).always_fail(StatusCode::SERVICE_UNAVAILABLE),
    );

    assert!(!h.task(0, 1).run().await.is_completed());

    assert_eq!(
        timeline(&h.listener),
        [
            "connecting",
            "request-error 503",
            "retry",
            "connecting",
            "request-error 503",
            "failure"
        ]
    );
}

#[tokio::test]
async fn length_discovery_reports_each_connection() {
    let h = Harness::new(single(None));
    h.factory.serve(
        url("/file.bin"),
        MockResource::new(body(1000)).length_only_with_identity(),
    );

    assert!(h.task(0, 3).run().await.is_completed());

    assert_eq!(
        timeline(&h.listener),
        [
            "connecting",
            "connecting",
            "connecting",
            "progress 1000",
            "complete"
        ]
    );
    let connects: Vec<_> = h
        .listener
        .events()
        .into_iter()
        .filter_map(|event| match event {
            DownloadEvent::Connecting { headers, .. } => Some(headers),
            _ => None,
        })
        .collect();
    assert!(connects[0].get(CONTENT_LENGTH).is_none());
    assert_eq!(connects[1].get(CONTENT_LENGTH).unwrap(), "1000");
}

/// Captures the payload counter as seen at each progress callback.
struct CounterProbe {
    progress: Arc<ProgressAccumulator>,
    seen: Mutex<Vec<u64>>,
}

impl DownloadListener for CounterProbe {
    fn on_progress(&self, _task: TaskId, _delta: u64) {
        self.seen.lock().push(self.progress.get(Counter::Payload));
    }
}

#[tokio::test]
async fn ignored_range_restarts_counter_and_overwrites() {
    let progress = Arc::new(ProgressAccumulator::new());
    let probe = Arc::new(CounterProbe {
        progress: Arc::clone(&progress),
        seen: Mutex::new(Vec::new()),
    });
    let mut h = Harness::with_listener(
        single(Some(1000)),
        Some(probe.clone() as Arc<dyn DownloadListener>),
    );
    h.progress = progress;

    let data = body(1000);
    h.factory.serve(
        url("/file.bin"),
        MockResource::new(data.clone())
            .ignore_ranges()
            .chunks(vec![400, 400, 200]),
    );
    h.write("00000.part", &vec![0xEE; 300]);

    assert!(h.task(0, 3).run().await.is_completed());

    assert_eq!(h.factory.requests()[0].range, Some(ByteRange::new(300, 1000)));
    assert_eq!(*probe.seen.lock(), vec![400, 800, 1000]);
    assert_eq!(h.progress.get(Counter::Payload), 1000);
    assert_eq!(h.read("00000.part"), data);
}

#[tokio::test]
async fn exhausted_retries_end_in_one_failure() {
    let h = Harness::new(single(Some(1000)));
    h.factory.serve(
        url("/file.bin"),
        MockResource::new(body(1000)).always_fail(StatusCode::SERVICE_UNAVAILABLE),
    );

    let outcome = h.task(0, 3).run().await;

    assert!(matches!(
        outcome,
        TaskOutcome::Failed(DownloadError::HttpStatus { .. })
    ));
    assert_eq!(h.listener.retries(), 3);
    assert_eq!(h.listener.failures(), 1);
    assert_eq!(h.listener.completes(), 0);
    assert_eq!(h.factory.connect_count(), 4);
    let request_errors = h.listener.count(|e| {
        matches!(e, DownloadEvent::RequestError { body, .. } if body == "upstream exploded")
    });
    assert_eq!(request_errors, 4);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let h = Harness::new(single(Some(500)));
    h.factory.serve(
        url("/file.bin"),
        MockResource::new(body(500)).fail_times(StatusCode::BAD_GATEWAY, 2),
    );

    assert!(h.task(0, 3).run().await.is_completed());
    assert_eq!(h.listener.retries(), 2);
    assert_eq!(h.listener.failures(), 0);
    assert_eq!(h.listener.completes(), 1);
    assert_eq!(h.read("00000.part"), body(500));
}

#[tokio::test]
async fn cancel_mid_stream_stops_reading() {
    let h = Harness::new(single(Some(1000)));
    h.factory.serve(
        url("/file.bin"),
        MockResource::new(body(1000)).chunks(vec![100; 10]),
    );
    h.listener.cancel_after(300, Arc::clone(&h.signal));

    let outcome = h.task(0, 3).run().await;

    assert!(matches!(outcome, TaskOutcome::Cancelled));
    assert_eq!(h.listener.cancels(), 1);
    assert_eq!(h.listener.completes() + h.listener.failures(), 0);
    assert_eq!(h.factory.read_count(), 3);
    let on_disk = h.read("00000.part");
    assert!(on_disk.len() >= 300);
    assert_eq!(&on_disk[..], &body(1000)[..on_disk.len()]);
}

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
    let h = Harness::new(single(Some(10)));
    h.signal.cancel(false);

    assert!(matches!(h.task(0, 3).run().await, TaskOutcome::Cancelled));
    assert_eq!(h.factory.connect_count(), 0);
    assert_eq!(h.listener.cancels(), 1);
}

#[tokio::test]
async fn unknown_length_is_discovered_with_identity_and_persisted() {
    let h = Harness::new(single(None));
    h.factory.redirect(url("/file.bin"), url("/cdn/file.bin"));
    h.factory.serve(
        url("/cdn/file.bin"),
        MockResource::new(body(1000)).length_only_with_identity(),
    );

    assert!(h.task(0, 3).run().await.is_completed());

    let to_cdn = h.factory.requests_to(&url("/cdn/file.bin"));
    assert_eq!(to_cdn.len(), 3);
    assert!(!to_cdn[0].identity_encoding);
    assert!(to_cdn[1].identity_encoding);
    assert_eq!(h.store.write_count(), 1);

    let persisted = load_manifest(h.store.as_ref(), h.coordinator.session_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(persisted.length(0, LengthSlot::Payload), Some(1000));
    assert_eq!(h.read("00000.part"), body(1000));
}

#[tokio::test]
async fn undiscoverable_length_streams_whole_body() {
    let h = Harness::new(single(None));
    h.factory.serve(
        url("/file.bin"),
        MockResource::new(body(700)).omit_length().chunks(vec![350]),
    );
    h.write("00000.part", b"stale bytes");

    assert!(h.task(0, 0).run().await.is_completed());
    assert_eq!(h.read("00000.part"), body(700));
    assert_eq!(h.progress.get(Counter::Payload), 700);
}

#[tokio::test]
async fn persistence_failure_is_fatal() {
    let h = Harness::new(single(None));
    h.factory.serve(url("/file.bin"), MockResource::new(body(100)));
    h.store.set_fail_writes(true);

    let outcome = h.task(0, 5).run().await;

    assert!(matches!(
        outcome,
        TaskOutcome::Failed(DownloadError::Persistence { .. })
    ));
    assert_eq!(h.listener.retries(), 0);
    assert_eq!(h.listener.failures(), 1);
    assert_eq!(
        h.coordinator.snapshot().await.length(0, LengthSlot::Payload),
        None
    );
}

#[tokio::test]
async fn ignored_range_on_block_fails_without_retry() {
    let config = BlockConfig::split(1000, 2);
    let h = Harness::new(Manifest::blocks(url("/file.bin"), &config));
    h.factory.serve(
        url("/file.bin"),
        MockResource::new(body(1000)).ignore_ranges(),
    );

    let outcome = h.task(1, 3).run().await;

    assert!(matches!(
        outcome,
        TaskOutcome::Failed(DownloadError::RangeIgnored { .. })
    ));
    assert_eq!(h.listener.retries(), 0);
}

#[tokio::test]
async fn block_fetches_its_own_range() {
    let config = BlockConfig::split(1000, 2);
    let h = Harness::new(Manifest::blocks(url("/file.bin"), &config));
    let data = body(1000);
    h.factory.serve(url("/file.bin"), MockResource::new(data.clone()));
    h.write("00001.block", &data[500..620]);

    assert!(h.task(1, 3).run().await.is_completed());

    assert_eq!(
        h.factory.requests()[0].range,
        Some(ByteRange::new(620, 1000))
    );
    assert_eq!(h.read("00001.block"), data[500..].to_vec());
}

fn hls_unit() -> Manifest {
    let mut payload = Resource::new(url("/seg0.ts"), "00000.ts");
    payload.length = Some(800);
    Manifest {
        source: url("/index.m3u8"),
        kind: ManifestKind::Hls,
        units: vec![Unit {
            index: 0,
            key: Some(Resource::new(url("/k.bin"), "00000.key")),
            init_segment: Some(Resource::new(url("/init.mp4"), "00000.init")),
            payload,
        }],
    }
}

#[tokio::test]
async fn phases_run_in_order_and_key_is_always_refetched() {
    let h = Harness::new(hls_unit());
    h.factory.serve(url("/k.bin"), MockResource::new(vec![9u8; 16]));
    h.factory.serve(url("/init.mp4"), MockResource::new(body(120)));
    h.factory.serve(url("/seg0.ts"), MockResource::new(body(800)));

    assert!(h.task(0, 1).run().await.is_completed());

    let order: Vec<_> = h.factory.requests().into_iter().map(|r| r.url).collect();
    assert_eq!(
        order,
        vec![
            url("/k.bin"),
            url("/init.mp4"),
            url("/init.mp4"),
            url("/seg0.ts")
        ]
    );
    assert_eq!(h.read("00000.key"), vec![9u8; 16]);
    assert_eq!(h.read("00000.init"), body(120));
    assert_eq!(h.progress.block_so_far(), 920);

    // Second run: only the key goes over the network.
    assert!(h.task(0, 1).run().await.is_completed());
    assert_eq!(h.factory.requests_to(&url("/k.bin")).len(), 2);
    assert_eq!(h.factory.requests_to(&url("/init.mp4")).len(), 2);
    assert_eq!(h.factory.requests_to(&url("/seg0.ts")).len(), 1);
    assert_eq!(h.progress.block_so_far(), 920);
    assert_eq!(h.listener.completes(), 2);
}

#[tokio::test]
async fn retry_resumes_the_failed_phase_only() {
    let h = Harness::new(hls_unit());
    h.factory.serve(url("/k.bin"), MockResource::new(vec![1u8; 16]));
    h.factory.serve(url("/init.mp4"), MockResource::new(body(120)));
    h.factory.serve(
        url("/seg0.ts"),
        MockResource::new(body(800)).fail_times(StatusCode::INTERNAL_SERVER_ERROR, 1),
    );

    assert!(h.task(0, 2).run().await.is_completed());
    assert_eq!(h.factory.requests_to(&url("/k.bin")).len(), 1);
    assert_eq!(h.factory.requests_to(&url("/seg0.ts")).len(), 2);
    assert_eq!(h.listener.retries(), 1);
}
