//! Wires pairs, watchers and the shared action queue together.

use crate::diagnostics::DiagnosticSink;
use crate::metrics::Metrics;
use crate::models::{MirrorPair, Settings};
use crate::services::queue::{ActionExecutor, ActionQueue, FsExecutor};
use crate::services::watcher::{Watcher, WatcherHandle};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running mirror: one watcher per pair feeding one action queue.
///
/// Must be started from inside a tokio runtime. Dropping it without calling
/// [`Mirror::shutdown`] leaves the tasks running until the runtime stops.
pub struct Mirror {
    queue: Arc<ActionQueue>,
    handles: Vec<WatcherHandle>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Mirror {
    /// Start mirroring `pairs` against the real filesystem.
    pub fn start(pairs: Vec<MirrorPair>, settings: &Settings, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self::start_with_executor(pairs, settings, sink, Arc::new(FsExecutor))
    }

    /// Start mirroring with a custom executor for queued actions.
    ///
    /// # Arguments
    /// * `pairs` - Validated pairs, each handed to its own watcher
    /// * `settings` - Scan interval, skip set, compare mode and thresholds
    /// * `sink` - Receives every user-facing line
    /// * `executor` - Applies actions taken off the queue
    pub fn start_with_executor(
        pairs: Vec<MirrorPair>,
        settings: &Settings,
        sink: Arc<dyn DiagnosticSink>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let (queue, worker) = ActionQueue::start(
            executor,
            Arc::clone(&sink),
            Arc::clone(&metrics),
            settings.slow_threshold(),
            cancel.child_token(),
        );

        let mut tasks = vec![worker];
        let mut handles = Vec::with_capacity(pairs.len());

        for pair in pairs {
            tracing::info!("Starting watcher for pair {}: {} => {}", pair.index, pair.source, pair.target);
            let watcher = Watcher::new(
                pair,
                Arc::clone(&queue),
                settings,
                Arc::clone(&sink),
                Arc::clone(&metrics),
            );
            handles.push(watcher.handle());
            tasks.push(tokio::spawn(watcher.run(cancel.child_token())));
        }

        tracing::info!("Mirror started with {} pairs", handles.len());

        Self {
            queue,
            handles,
            metrics,
            cancel,
            tasks,
        }
    }

    pub fn handles(&self) -> &[WatcherHandle] {
        &self.handles
    }

    /// Handle of the pair with the given index
    pub fn handle(&self, index: usize) -> Option<&WatcherHandle> {
        self.handles.iter().find(|handle| handle.pair().index == index)
    }

    /// Request a wipe and re-copy of one pair. Returns false for an unknown index.
    pub fn wipe(&self, index: usize) -> bool {
        match self.handle(index) {
            Some(handle) => {
                handle.wipe();
                true
            }
            None => {
                tracing::warn!("Wipe requested for unknown pair {}", index);
                false
            }
        }
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Stop every watcher and the queue worker, then log the summary.
    ///
    /// An action that is already executing is allowed to finish; pending
    /// actions are dropped.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down mirror");
        self.cancel.cancel();

        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::error!("Mirror task ended abnormally: {}", err);
            }
        }

        self.metrics.log_summary();
    }
}
