//! Services module - the mirroring engine.
//!
//! Everything here is independent of how the process is driven: the binary
//! wires it to stdin and the log, tests drive it directly.
//!
//! # Components
//!
//! - [`scan`]: walks a tree into a sorted snapshot and plans the steps that
//!   make a target match its source. Pure apart from reading the filesystem.
//! - [`ActionQueue`]: the single FIFO through which every mutation of any
//!   target passes. One action executes at a time across all pairs.
//! - [`Watcher`]: one per pair. Rescans on a timer, on change notifications
//!   and on wipe requests, and submits what the planner finds.
//! - [`Mirror`]: starts the queue and all watchers and shuts them down.
//!
//! # Usage Example
//!
//! ```ignore
//! use filecopier::services::Mirror;
//!
//! let mirror = Mirror::start(pairs, &settings, Arc::new(TracingSink));
//! mirror.wipe(2);
//! mirror.shutdown().await;
//! ```

pub mod coordinator;
pub mod queue;
pub mod scan;
pub mod watcher;

pub use coordinator::Mirror;
pub use queue::{
    ActionError, ActionExecutor, ActionOutcome, ActionQueue, FsExecutor, QueueStatus, Submission,
    Ticket,
};
pub use scan::{ChangeDetector, MTIME_TOLERANCE, Plan, ScanError, Step, TreeScan, plan, walk_tree};
pub use watcher::{CycleReport, Watcher, WatcherHandle};
