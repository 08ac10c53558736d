//! Per-pair mirroring engine.
//!
//! A [`Watcher`] owns one [`MirrorPair`] and keeps its target a faithful copy
//! of its source for as long as it runs. Each cycle walks both trees on the
//! blocking pool, plans the difference and submits it to the shared
//! [`ActionQueue`]. Watchers never wait for their actions to execute; instead
//! they remember which paths still have an unsettled action in the queue and
//! leave those alone until the queue has moved past them.
//!
//! A cycle starts when the scan interval elapses, when the OS reports a change
//! under the source root (debounced), or when a wipe is requested through a
//! [`WatcherHandle`].

use crate::diagnostics::{DiagnosticSink, Style};
use crate::metrics::Metrics;
use crate::models::{Action, CompareMode, MirrorPair, Settings};
use crate::services::queue::{ActionQueue, Submission, Ticket};
use crate::services::scan::{self, ChangeDetector, ScanError, Step, TreeScan};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Reason a watcher was woken before its scan interval elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Changed,
    Wipe,
}

#[derive(Debug, Default)]
struct Control {
    /// Bumped by every wipe; stamped on every action planned afterwards
    generation: u64,
    /// The next cycle must treat the target as empty
    full_resync: bool,
}

struct Shared {
    pair: MirrorPair,
    queue: Arc<ActionQueue>,
    sink: Arc<dyn DiagnosticSink>,
    control: Mutex<Control>,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().expect("watcher control poisoned")
    }
}

/// Cheap, cloneable command interface to a running watcher.
#[derive(Clone)]
pub struct WatcherHandle {
    shared: Arc<Shared>,
    wake_tx: mpsc::UnboundedSender<Wake>,
}

impl WatcherHandle {
    pub fn pair(&self) -> &MirrorPair {
        &self.shared.pair
    }

    /// Discard everything mirrored so far: wipe the target and copy the whole source again.
    ///
    /// Only enqueues work and never blocks. The wipe is submitted under the
    /// watcher's control lock, so every cycle that starts afterwards sees the
    /// new generation and knows it has to re-copy from scratch.
    pub fn wipe(&self) {
        let pair = &self.shared.pair;
        {
            let mut control = self.shared.control();
            control.generation += 1;
            control.full_resync = true;
            self.shared
                .queue
                .submit(Action::wipe_tree(pair, control.generation));
        }

        tracing::info!("Wipe requested for pair {} ({})", pair.index, pair.target);
        self.shared.sink.emit(
            &format!("{} Wipe and re-copy {}", pair.tag(), pair.target),
            Style::Key,
        );

        // A stopped watcher has dropped its receiver; the wipe still runs
        let _ = self.wake_tx.send(Wake::Wipe);
    }
}

/// What one scan cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub submitted: usize,
    /// Planned steps left out because an earlier action for the path is still queued
    pub in_flight: usize,
    /// Steps the queue refused because a wipe overtook this cycle
    pub superseded: usize,
    pub scan_errors: usize,
    pub full_resync: bool,
}

struct PairScan {
    steps: Vec<Step>,
    errors: Vec<ScanError>,
    source_files: usize,
}

/// Walk both trees of `pair` and plan the steps that bring the target in line.
fn scan_pair(
    pair: &MirrorPair,
    skip: &IndexSet<String>,
    mode: CompareMode,
    full_resync: bool,
) -> PairScan {
    let source = scan::walk_tree(&pair.source, skip);
    let target = if full_resync {
        TreeScan::empty()
    } else {
        scan::walk_tree(&pair.target, skip)
    };

    let detector = ChangeDetector::new(mode, &pair.source, &pair.target);
    let planned = scan::plan(&source, &target, &detector);
    let source_files = source.files().count();

    let mut errors = source.errors;
    errors.extend(target.errors);
    errors.extend(planned.errors);

    PairScan {
        steps: planned.steps,
        errors,
        source_files,
    }
}

/// Scan loop for one pair.
pub struct Watcher {
    shared: Arc<Shared>,
    wake_tx: mpsc::UnboundedSender<Wake>,
    wake_rx: mpsc::UnboundedReceiver<Wake>,
    skip: IndexSet<String>,
    compare_mode: CompareMode,
    scan_interval: Duration,
    debounce: Duration,
    change_notifications: bool,
    metrics: Arc<Metrics>,
    in_flight: HashMap<Utf8PathBuf, Ticket>,
    reported_errors: HashSet<String>,
}

impl Watcher {
    pub fn new(
        pair: MirrorPair,
        queue: Arc<ActionQueue>,
        settings: &Settings,
        sink: Arc<dyn DiagnosticSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                pair,
                queue,
                sink,
                control: Mutex::new(Control::default()),
            }),
            wake_tx,
            wake_rx,
            skip: settings.skip_folders.clone(),
            compare_mode: settings.compare_mode,
            scan_interval: settings.scan_interval(),
            debounce: settings.debounce(),
            change_notifications: settings.change_notifications,
            metrics,
            in_flight: HashMap::new(),
            reported_errors: HashSet::new(),
        }
    }

    pub fn pair(&self) -> &MirrorPair {
        &self.shared.pair
    }

    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            shared: Arc::clone(&self.shared),
            wake_tx: self.wake_tx.clone(),
        }
    }

    /// Run one scan cycle and submit whatever it finds.
    pub async fn scan_once(&mut self) -> CycleReport {
        let shared = Arc::clone(&self.shared);
        let pair = &shared.pair;

        let (generation, full_resync) = {
            let mut control = shared.control();
            (control.generation, std::mem::take(&mut control.full_resync))
        };

        if full_resync {
            self.in_flight.clear();
        }
        let settled = shared.queue.settled();
        self.in_flight.retain(|_, ticket| *ticket > settled);

        let mut report = CycleReport {
            full_resync,
            ..CycleReport::default()
        };

        let job_pair = pair.clone();
        let skip = self.skip.clone();
        let mode = self.compare_mode;
        let scanned = match tokio::task::spawn_blocking(move || {
            scan_pair(&job_pair, &skip, mode, full_resync)
        })
        .await
        {
            Ok(scanned) => scanned,
            Err(err) => {
                tracing::error!("Scan task for pair {} failed: {}", pair.index, err);
                shared
                    .sink
                    .emit(&format!("{} Scan failed: {}", pair.tag(), err), Style::Error);
                self.metrics.record_scan(1);
                report.scan_errors = 1;
                return report;
            }
        };

        report.scan_errors = scanned.errors.len();
        self.metrics.record_scan(scanned.errors.len());
        self.report_scan_errors(&scanned.errors);

        if full_resync {
            shared.sink.emit(
                &format!("{} Re-copying {} files", pair.tag(), scanned.source_files),
                Style::Key,
            );
        }

        // A path whose kind changed gets a deletion and a creation in the same
        // cycle, so only tickets from earlier cycles suppress a step
        let mut queued = Vec::new();
        for step in scanned.steps {
            if self.in_flight.contains_key(step.relative()) {
                report.in_flight += 1;
                continue;
            }
            let relative = step.relative().to_path_buf();
            match shared.queue.submit(step.into_action(pair, generation)) {
                Submission::Queued(ticket) => {
                    queued.push((relative, ticket));
                    report.submitted += 1;
                }
                Submission::Superseded => report.superseded += 1,
            }
        }
        self.in_flight.extend(queued);

        if report.submitted > 0 || report.scan_errors > 0 {
            tracing::debug!("Pair {} cycle: {:?}", pair.index, report);
        }
        report
    }

    /// Errors are logged once when they appear, not again on every cycle they persist
    fn report_scan_errors(&mut self, errors: &[ScanError]) {
        let pair = &self.shared.pair;
        let current: HashSet<String> = errors.iter().map(ToString::to_string).collect();

        for message in &current {
            tracing::debug!("Scan error for pair {}: {}", pair.index, message);
            if !self.reported_errors.contains(message) {
                self.shared
                    .sink
                    .emit(&format!("{} {}", pair.tag(), message), Style::Error);
            }
        }

        self.reported_errors = current;
    }

    /// Scan forever until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let pair = self.shared.pair.clone();
        self.shared.sink.emit(
            &format!("{} Watching {} => {}", pair.tag(), pair.source, pair.target),
            Style::Pair(pair.color),
        );

        // Dropping the OS watcher ends notifications, so it lives as long as the loop
        let _source_watch = self.watch_source();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.scan_once().await;

            let woken = tokio::select! {
                _ = cancel.cancelled() => break,
                wake = self.wake_rx.recv() => wake,
                _ = tokio::time::sleep(self.scan_interval) => None,
            };

            if woken == Some(Wake::Changed) {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.debounce) => {}
                }
            }
            // Everything that arrived meanwhile is covered by the coming scan
            while self.wake_rx.try_recv().is_ok() {}
        }

        tracing::info!("Watcher for pair {} stopped", pair.index);
    }

    /// Subscribe to change notifications under the source root, if enabled and supported.
    fn watch_source(&self) -> Option<RecommendedWatcher> {
        if !self.change_notifications {
            return None;
        }

        let pair = &self.shared.pair;
        let wake_tx = self.wake_tx.clone();
        let root = pair.source.clone();
        let skip = self.skip.clone();

        let handler = move |result: notify::Result<notify::Event>| match result {
            Ok(event) if is_relevant(&event, &root, &skip) => {
                let _ = wake_tx.send(Wake::Changed);
            }
            Ok(_) => {}
            Err(err) => tracing::debug!("Change notification error under {}: {}", root, err),
        };

        let installed = notify::recommended_watcher(handler).and_then(|mut watcher| {
            watcher
                .watch(pair.source.as_std_path(), RecursiveMode::Recursive)
                .map(|()| watcher)
        });

        match installed {
            Ok(watcher) => {
                tracing::debug!("Change notifications active for {}", pair.source);
                Some(watcher)
            }
            Err(err) => {
                tracing::warn!("Change notifications unavailable for {}: {}", pair.source, err);
                self.shared.sink.emit(
                    &format!(
                        "{} No change notifications ({}), rescanning every {}s",
                        pair.tag(),
                        err,
                        self.scan_interval.as_secs()
                    ),
                    Style::Default,
                );
                None
            }
        }
    }
}

fn is_relevant(event: &notify::Event, root: &Utf8Path, skip: &IndexSet<String>) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.is_empty()
        || event
            .paths
            .iter()
            .any(|path| !under_skipped_dir(path, root, skip))
}

fn under_skipped_dir(path: &Path, root: &Utf8Path, skip: &IndexSet<String>) -> bool {
    let Ok(relative) = path.strip_prefix(root.as_std_path()) else {
        return false;
    };
    relative.components().any(|component| match component {
        Component::Normal(name) => name.to_str().is_some_and(|name| skip.contains(name)),
        _ => false,
    })
}
