//! The shared action queue.
//!
//! Every filesystem mutation issued by any watcher goes through one
//! [`ActionQueue`]. A single worker task takes actions in submission order and
//! runs each one on the blocking pool, awaiting it before taking the next, so
//! at most one mutation executes at any instant across the whole process.
//!
//! # Wipe supersedes older work
//!
//! Each pair has a wipe generation. When a `WipeTree` of generation `g` is
//! submitted for a pair, the queue removes every pending action of that pair
//! whose generation is lower than `g`, and from then on rejects submissions
//! for that pair with a generation lower than `g`. The full re-copy that
//! follows a wipe supersedes that work, and letting it run after the wipe
//! could resurrect content the wipe removed.

use crate::diagnostics::{DiagnosticSink, Style};
use crate::metrics::Metrics;
use crate::models::{Action, ActionKind};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Position of an accepted action in the global submission order (1-based)
pub type Ticket = u64;

/// Errors from executing a single action. Reported, never propagated.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Cannot {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Wipe of {path} left {failed} entries behind (first error: {first})")]
    Wipe {
        path: Utf8PathBuf,
        failed: usize,
        first: String,
    },

    #[error("Action task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn io_error(op: &'static str, path: &Utf8Path) -> impl FnOnce(io::Error) -> ActionError {
    let path = path.to_path_buf();
    move |source| ActionError::Io { op, path, source }
}

/// What a successful action produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    pub bytes: u64,
}

/// Performs one action synchronously. Called from the blocking pool.
#[cfg_attr(test, mockall::automock)]
pub trait ActionExecutor: Send + Sync + 'static {
    fn execute(&self, action: &Action) -> Result<ActionOutcome, ActionError>;
}

/// Executor that applies actions to the real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsExecutor;

impl ActionExecutor for FsExecutor {
    fn execute(&self, action: &Action) -> Result<ActionOutcome, ActionError> {
        match &action.kind {
            ActionKind::CreateDir { target } => {
                fs::create_dir_all(target).map_err(io_error("create directory", target))?;
                Ok(ActionOutcome::default())
            }
            ActionKind::CopyFile { source, target } => copy_preserving_mtime(source, target),
            ActionKind::DeleteFile { target } => {
                remove_if_present(fs::remove_file(target), "delete", target)
            }
            ActionKind::DeleteDir { target } => {
                remove_if_present(fs::remove_dir_all(target), "delete directory", target)
            }
            ActionKind::WipeTree { root } => wipe_children(root),
        }
    }
}

/// Copy `source` over `target` and give the copy the source's modification time
/// and permissions.
///
/// Whatever sits at `target` is unlinked first. A read-only copy cannot be
/// reopened for writing, and a symlink would redirect the write to its referent.
fn copy_preserving_mtime(source: &Utf8Path, target: &Utf8Path) -> Result<ActionOutcome, ActionError> {
    let metadata = fs::metadata(source).map_err(io_error("read", source))?;
    let modified = metadata.modified().map_err(io_error("read", source))?;

    remove_if_present(fs::remove_file(target), "replace", target)?;

    let mut reader = File::open(source).map_err(io_error("read", source))?;
    let mut writer = File::create(target).map_err(io_error("create", target))?;
    let bytes = io::copy(&mut reader, &mut writer).map_err(io_error("copy to", target))?;

    // The handle is still writable here, whatever mode the source has
    writer
        .set_modified(modified)
        .map_err(io_error("set modification time of", target))?;
    drop(writer);

    fs::set_permissions(target, metadata.permissions())
        .map_err(io_error("set permissions of", target))?;

    Ok(ActionOutcome { bytes })
}

/// A deletion whose path is already gone has reached its goal
fn remove_if_present(
    result: io::Result<()>,
    op: &'static str,
    target: &Utf8Path,
) -> Result<ActionOutcome, ActionError> {
    match result {
        Ok(()) => Ok(ActionOutcome::default()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("Nothing to {}: {} is already gone", op, target);
            Ok(ActionOutcome::default())
        }
        Err(err) => Err(io_error(op, target)(err)),
    }
}

/// Remove every child of `root`, trying all of them even when some fail
fn wipe_children(root: &Utf8Path) -> Result<ActionOutcome, ActionError> {
    let entries = fs::read_dir(root).map_err(io_error("list", root))?;

    let mut failed = 0;
    let mut first = None;

    for entry in entries {
        let result = entry.and_then(|entry| {
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            }
        });

        if let Err(err) = result {
            tracing::warn!("Wipe of {} could not remove an entry: {}", root, err);
            failed += 1;
            first.get_or_insert_with(|| err.to_string());
        }
    }

    match first {
        None => Ok(ActionOutcome::default()),
        Some(first) => Err(ActionError::Wipe {
            path: root.to_path_buf(),
            failed,
            first,
        }),
    }
}

/// Result of [`ActionQueue::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued(Ticket),
    /// The pair was wiped after this action was planned
    Superseded,
}

/// Observable progress of the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub active: bool,
    /// Highest ticket handed out
    pub submitted: Ticket,
    /// Every ticket at or below this one has been executed or discarded
    pub settled: Ticket,
}

impl QueueStatus {
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && !self.active
    }
}

struct Queued {
    ticket: Ticket,
    action: Action,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Queued>,
    /// Lowest generation still accepted, per pair index
    floors: HashMap<usize, u64>,
    next_ticket: Ticket,
}

/// FIFO executor of filesystem mutations shared by all watchers.
pub struct ActionQueue {
    state: Mutex<QueueState>,
    work_ready: Notify,
    status_tx: watch::Sender<QueueStatus>,
    executor: Arc<dyn ActionExecutor>,
    sink: Arc<dyn DiagnosticSink>,
    metrics: Arc<Metrics>,
    slow_threshold: Duration,
}

impl ActionQueue {
    /// Create the queue and spawn its worker on the current tokio runtime.
    ///
    /// The worker stops when `cancel` fires; an action already running is
    /// finished first, anything still pending is dropped.
    pub fn start(
        executor: Arc<dyn ActionExecutor>,
        sink: Arc<dyn DiagnosticSink>,
        metrics: Arc<Metrics>,
        slow_threshold: Duration,
        cancel: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (status_tx, _) = watch::channel(QueueStatus::default());
        let queue = Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            work_ready: Notify::new(),
            status_tx,
            executor,
            sink,
            metrics,
            slow_threshold,
        });

        let worker = tokio::spawn(Arc::clone(&queue).run(cancel));
        (queue, worker)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("action queue state poisoned")
    }

    /// Append an action to the tail of the queue. Never blocks on execution.
    pub fn submit(&self, action: Action) -> Submission {
        let pair = action.pair;
        let mut state = self.lock();

        let floor = state.floors.get(&pair.index).copied().unwrap_or(0);
        if action.generation < floor {
            tracing::debug!(
                "Rejecting superseded {:?} for pair {} (generation {} < {})",
                action.kind,
                pair.index,
                action.generation,
                floor
            );
            self.metrics.record_superseded(1);
            return Submission::Superseded;
        }

        if action.is_wipe() {
            state.floors.insert(pair.index, action.generation.max(floor));

            let before = state.pending.len();
            state.pending.retain(|queued| {
                queued.action.pair.index != pair.index
                    || queued.action.generation >= action.generation
            });
            let discarded = before - state.pending.len();

            if discarded > 0 {
                self.metrics.record_superseded(discarded);
                self.sink.emit(
                    &format!("{} Wipe discards {} queued actions", pair, discarded),
                    Style::Key,
                );
            }
        }

        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.pending.push_back(Queued { ticket, action });
        self.metrics.record_submitted();

        let pending = state.pending.len();
        self.status_tx.send_modify(|status| {
            status.pending = pending;
            status.submitted = ticket;
        });
        drop(state);

        self.work_ready.notify_one();
        Submission::Queued(ticket)
    }

    pub fn status(&self) -> QueueStatus {
        *self.status_tx.borrow()
    }

    /// Highest ticket known to be executed or discarded
    pub fn settled(&self) -> Ticket {
        self.status_tx.borrow().settled
    }

    /// Wait until nothing is pending and nothing is running
    pub async fn wait_idle(&self) {
        let mut rx = self.status_tx.subscribe();
        // The sender lives as long as self, so this only returns once idle
        let _ = rx.wait_for(QueueStatus::is_idle).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueStatus> {
        self.status_tx.subscribe()
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::debug!("Action queue worker started");

        while !cancel.is_cancelled() {
            let next = {
                let mut state = self.lock();
                let next = state.pending.pop_front();
                if next.is_some() {
                    let pending = state.pending.len();
                    self.status_tx.send_modify(|status| {
                        status.pending = pending;
                        status.active = true;
                    });
                }
                next
            };

            let Some(Queued { ticket, action }) = next else {
                // notify_one keeps a permit, so a submit racing with this check is not lost
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = self.work_ready.notified() => {}
                }
                continue;
            };

            self.execute(action).await;

            // Tickets behind a wipe were removed from the queue, so popping
            // this one settles everything before it as well
            self.status_tx.send_modify(|status| {
                status.active = false;
                status.settled = ticket;
            });
        }

        tracing::debug!("Action queue worker stopped");
    }

    async fn execute(&self, action: Action) {
        let started = Instant::now();
        let executor = Arc::clone(&self.executor);
        let job = action.clone();

        let result = tokio::task::spawn_blocking(move || executor.execute(&job))
            .await
            .unwrap_or_else(|join_error| Err(ActionError::from(join_error)));

        self.report(&action, result, started.elapsed());
    }

    fn report(&self, action: &Action, result: Result<ActionOutcome, ActionError>, elapsed: Duration) {
        let pair = action.pair;
        let path = action.display_path();

        match result {
            Ok(outcome) => {
                let slow = !self.slow_threshold.is_zero() && elapsed >= self.slow_threshold;
                let completion = self.metrics.record_completed(false, slow, outcome.bytes);
                tracing::debug!(
                    "Action #{} done: {} {} in {:?}",
                    completion,
                    action.verb(),
                    action.target(),
                    elapsed
                );

                if slow {
                    self.sink.emit(
                        &format!(
                            "{} {} {} (slow: {:.1}s)",
                            pair,
                            action.verb(),
                            path,
                            elapsed.as_secs_f64()
                        ),
                        Style::Slow,
                    );
                } else {
                    self.sink.emit(
                        &format!("{} {} {}", pair, action.verb(), path),
                        Style::Pair(pair.color),
                    );
                }
            }
            Err(err) => {
                self.metrics.record_completed(true, false, 0);
                tracing::debug!("Action on {} failed: {:?}", action.target(), err);
                self.sink.emit(&format!("{} Failed {}: {}", pair, path, err), Style::Error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{BroadcastSink, DiagnosticEvent};
    use crate::models::MirrorPair;
    use tempfile::TempDir;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    fn pair(index: usize) -> MirrorPair {
        MirrorPair::new(index, "/src".into(), "/dst".into())
    }

    fn start(
        executor: impl ActionExecutor,
        slow: Duration,
    ) -> (Arc<ActionQueue>, broadcast::Receiver<DiagnosticEvent>, CancellationToken) {
        let sink = BroadcastSink::new(256);
        let rx = sink.subscribe();
        let cancel = CancellationToken::new();
        let (queue, _worker) = ActionQueue::start(
            Arc::new(executor),
            Arc::new(sink),
            Arc::new(Metrics::new()),
            slow,
            cancel.clone(),
        );
        (queue, rx, cancel)
    }

    async fn drain(queue: &ActionQueue) {
        timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .expect("queue did not drain");
    }

    fn collect(rx: &mut broadcast::Receiver<DiagnosticEvent>) -> Vec<DiagnosticEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_worker_continues() {
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().times(3).returning(|action| {
            if action.relative.as_str() == "bad.txt" {
                Err(ActionError::Io {
                    op: "copy to",
                    path: action.target().to_path_buf(),
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
                })
            } else {
                Ok(ActionOutcome { bytes: 1 })
            }
        });
        let (queue, mut rx, cancel) = start(executor, Duration::ZERO);

        let p = pair(1);
        for name in ["a.txt", "bad.txt", "c.txt"] {
            queue.submit(Action::copy_file(&p, 0, Utf8Path::new(name)));
        }
        drain(&queue).await;

        let events = collect(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].text, "[1] Copied a.txt");
        assert_eq!(events[1].style, Style::Error);
        assert!(events[1].text.contains("bad.txt"));
        assert!(events[1].text.contains("denied"));
        assert_eq!(events[2].text, "[1] Copied c.txt");
        assert_eq!(events[2].style, Style::Pair(p.color));
        assert_eq!(queue.status().settled, 3);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_slow_actions_use_slow_style() {
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().times(1).returning(|_| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(ActionOutcome::default())
        });
        let (queue, mut rx, cancel) = start(executor, Duration::from_millis(10));

        queue.submit(Action::create_dir(&pair(2), 0, Utf8Path::new("big")));
        drain(&queue).await;

        let events = collect(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].style, Style::Slow);
        assert!(events[0].text.starts_with("[2] Created big (slow:"));
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wipe_discards_older_pending_actions_of_same_pair() {
        let gate = Arc::new(std::sync::Barrier::new(2));
        let worker_gate = Arc::clone(&gate);
        let mut executor = MockActionExecutor::new();
        let mut blocked = false;
        executor.expect_execute().returning(move |_| {
            if !blocked {
                // Hold the worker on the first action until the test has queued the rest
                blocked = true;
                worker_gate.wait();
            }
            Ok(ActionOutcome::default())
        });
        let (queue, _rx, cancel) = start(executor, Duration::ZERO);

        let (one, two) = (pair(1), pair(2));
        queue.submit(Action::create_dir(&one, 0, Utf8Path::new("blocker")));
        let mut status_rx = queue.subscribe();
        timeout(Duration::from_secs(5), status_rx.wait_for(|s| s.active))
            .await
            .expect("worker never picked up the blocker")
            .unwrap();
        queue.submit(Action::copy_file(&one, 0, Utf8Path::new("stale.txt")));
        queue.submit(Action::copy_file(&two, 0, Utf8Path::new("other.txt")));
        queue.submit(Action::delete_file(&one, 0, Utf8Path::new("stale2.txt")));

        assert!(matches!(queue.submit(Action::wipe_tree(&one, 1)), Submission::Queued(_)));
        // Planned before the wipe, submitted after it
        assert_eq!(
            queue.submit(Action::copy_file(&one, 0, Utf8Path::new("late.txt"))),
            Submission::Superseded
        );
        assert!(matches!(
            queue.submit(Action::copy_file(&one, 1, Utf8Path::new("fresh.txt"))),
            Submission::Queued(_)
        ));

        // other.txt, the wipe and fresh.txt
        assert_eq!(queue.status().pending, 3);

        gate.wait();
        drain(&queue).await;
        assert_eq!(queue.metrics.actions_superseded.load(std::sync::atomic::Ordering::Relaxed), 3);
        assert_eq!(queue.metrics.completed(), 4);
        cancel.cancel();
    }

    #[test]
    fn test_fs_executor_copy_preserves_mtime() {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::create_dir(root.join("src")).unwrap();
        fs::create_dir(root.join("dst")).unwrap();
        fs::write(root.join("src/a.txt"), b"hello").unwrap();

        let p = MirrorPair::new(1, root.join("src"), root.join("dst"));
        let outcome = FsExecutor
            .execute(&Action::copy_file(&p, 0, Utf8Path::new("a.txt")))
            .unwrap();

        assert_eq!(outcome.bytes, 5);
        assert_eq!(fs::read(root.join("dst/a.txt")).unwrap(), b"hello");
        let src_time = fs::metadata(root.join("src/a.txt")).unwrap().modified().unwrap();
        let dst_time = fs::metadata(root.join("dst/a.txt")).unwrap().modified().unwrap();
        assert_eq!(src_time, dst_time);
    }

    #[cfg(unix)]
    #[test]
    fn test_fs_executor_recopies_read_only_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::create_dir(root.join("src")).unwrap();
        fs::create_dir(root.join("dst")).unwrap();
        let source = root.join("src/a.txt");
        fs::write(&source, b"v1").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o444)).unwrap();

        let p = MirrorPair::new(1, root.join("src"), root.join("dst"));
        let copy = Action::copy_file(&p, 0, Utf8Path::new("a.txt"));
        FsExecutor.execute(&copy).unwrap();

        let target = root.join("dst/a.txt");
        assert_eq!(fs::read(&target).unwrap(), b"v1");
        assert_eq!(fs::metadata(&target).unwrap().permissions().mode() & 0o777, 0o444);

        fs::set_permissions(&source, fs::Permissions::from_mode(0o644)).unwrap();
        fs::write(&source, b"version two").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o444)).unwrap();

        let outcome = FsExecutor.execute(&copy).unwrap();

        assert_eq!(outcome.bytes, 11);
        assert_eq!(fs::read(&target).unwrap(), b"version two");
        let src_time = fs::metadata(&source).unwrap().modified().unwrap();
        let dst_time = fs::metadata(&target).unwrap().modified().unwrap();
        assert_eq!(src_time, dst_time);
        assert_eq!(fs::metadata(&target).unwrap().permissions().mode() & 0o777, 0o444);
    }

    #[cfg(unix)]
    #[test]
    fn test_fs_executor_copy_replaces_symlink_in_target() {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::create_dir(root.join("src")).unwrap();
        fs::create_dir(root.join("dst")).unwrap();
        fs::write(root.join("src/a.txt"), b"mirrored").unwrap();
        fs::write(root.join("outside.txt"), b"keep me").unwrap();
        std::os::unix::fs::symlink(root.join("outside.txt"), root.join("dst/a.txt")).unwrap();

        let p = MirrorPair::new(1, root.join("src"), root.join("dst"));
        FsExecutor
            .execute(&Action::copy_file(&p, 0, Utf8Path::new("a.txt")))
            .unwrap();

        assert_eq!(fs::read(root.join("outside.txt")).unwrap(), b"keep me");
        let replaced = fs::symlink_metadata(root.join("dst/a.txt")).unwrap();
        assert!(replaced.file_type().is_file());
        assert_eq!(fs::read(root.join("dst/a.txt")).unwrap(), b"mirrored");
    }

    #[test]
    fn test_fs_executor_delete_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let p = MirrorPair::new(1, root.clone(), root.clone());

        assert!(FsExecutor.execute(&Action::delete_file(&p, 0, Utf8Path::new("nope"))).is_ok());
        assert!(FsExecutor.execute(&Action::delete_dir(&p, 0, Utf8Path::new("nope"))).is_ok());
    }

    #[test]
    fn test_fs_executor_wipe_keeps_root() {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/c.txt"), b"c").unwrap();
        fs::write(root.join("top.txt"), b"t").unwrap();
        fs::create_dir(root.join(".git")).unwrap();

        let p = MirrorPair::new(1, "/unused".into(), root.clone());
        FsExecutor.execute(&Action::wipe_tree(&p, 1)).unwrap();

        assert!(root.exists());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn test_fs_executor_copy_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let p = MirrorPair::new(1, root.join("src"), root.join("dst"));

        let err = FsExecutor
            .execute(&Action::copy_file(&p, 0, Utf8Path::new("ghost.txt")))
            .unwrap_err();

        assert!(matches!(err, ActionError::Io { op: "read", .. }));
        assert!(err.to_string().contains("ghost.txt"));
    }
}
