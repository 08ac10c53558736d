//! Integration tests for ActionQueue
//!
//! These tests verify:
//! - At most one action executes at any instant, whatever the number of submitters
//! - Actions from one submitter execute in submission order
//! - Outcomes reach the diagnostic sink in execution order

use camino::Utf8Path;
use filecopier::diagnostics::{BroadcastSink, DiagnosticSink, Style};
use filecopier::metrics::Metrics;
use filecopier::models::{Action, MirrorPair};
use filecopier::services::{ActionError, ActionExecutor, ActionOutcome, ActionQueue, Submission};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Records execution order and the highest number of overlapping executions
#[derive(Default)]
struct RecordingExecutor {
    running: AtomicUsize,
    max_running: AtomicUsize,
    executed: Mutex<Vec<(usize, String)>>,
}

impl ActionExecutor for RecordingExecutor {
    fn execute(&self, action: &Action) -> Result<ActionOutcome, ActionError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        std::thread::sleep(Duration::from_millis(1));
        self.executed
            .lock()
            .unwrap()
            .push((action.pair.index, action.relative.to_string()));

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(ActionOutcome { bytes: 1 })
    }
}

fn start_queue(
    executor: Arc<RecordingExecutor>,
    sink: Arc<dyn DiagnosticSink>,
) -> (Arc<ActionQueue>, Arc<Metrics>, CancellationToken) {
    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();
    let (queue, _worker) = ActionQueue::start(
        executor,
        sink,
        Arc::clone(&metrics),
        Duration::ZERO,
        cancel.clone(),
    );
    (queue, metrics, cancel)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submitters_are_serialized_in_order() {
    let executor = Arc::new(RecordingExecutor::default());
    let (queue, metrics, cancel) =
        start_queue(Arc::clone(&executor), Arc::new(BroadcastSink::default()));

    let mut submitters = Vec::new();
    for index in 1..=4 {
        let queue = Arc::clone(&queue);
        submitters.push(tokio::spawn(async move {
            let pair = MirrorPair::new(index, "/src".into(), "/dst".into());
            for n in 0..25 {
                let name = format!("{:02}.txt", n);
                let submitted = queue.submit(Action::copy_file(&pair, 0, Utf8Path::new(&name)));
                assert!(matches!(submitted, Submission::Queued(_)));
                tokio::task::yield_now().await;
            }
        }));
    }
    for submitter in submitters {
        submitter.await.unwrap();
    }

    timeout(Duration::from_secs(10), queue.wait_idle())
        .await
        .expect("queue did not drain");

    let executed = executor.executed.lock().unwrap().clone();
    assert_eq!(executed.len(), 100);
    assert_eq!(executor.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.completed(), 100);

    // Each submitter's actions ran in the order it submitted them
    for index in 1..=4 {
        let names: Vec<&String> = executed
            .iter()
            .filter(|(pair, _)| *pair == index)
            .map(|(_, name)| name)
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted, "pair {} ran out of order", index);
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_outcomes_reported_in_execution_order() {
    let executor = Arc::new(RecordingExecutor::default());
    let sink = BroadcastSink::default();
    let mut rx = sink.subscribe();
    let (queue, _metrics, cancel) = start_queue(Arc::clone(&executor), Arc::new(sink));

    let pair = MirrorPair::new(1, "/src".into(), "/dst".into());
    queue.submit(Action::create_dir(&pair, 0, Utf8Path::new("sub")));
    queue.submit(Action::copy_file(&pair, 0, Utf8Path::new("sub/b.txt")));
    queue.submit(Action::delete_file(&pair, 0, Utf8Path::new("a.txt")));

    timeout(Duration::from_secs(5), queue.wait_idle())
        .await
        .expect("queue did not drain");

    let mut lines = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.style, Style::Pair(pair.color));
        lines.push(event.text);
    }
    assert_eq!(
        lines,
        vec!["[1] Created sub", "[1] Copied sub/b.txt", "[1] Deleted a.txt"]
    );

    let status = queue.status();
    assert!(status.is_idle());
    assert_eq!(status.submitted, 3);
    assert_eq!(status.settled, 3);

    cancel.cancel();
}

#[tokio::test]
async fn test_worker_stops_on_cancel() {
    let executor = Arc::new(RecordingExecutor::default());
    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();
    let (_queue, worker) = ActionQueue::start(
        executor,
        Arc::new(BroadcastSink::default()),
        metrics,
        Duration::ZERO,
        cancel.clone(),
    );

    cancel.cancel();
    timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not stop")
        .unwrap();
}
