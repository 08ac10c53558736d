// FileCopier - Continuously mirror source folders into target folders
//
// This is the library crate containing the mirroring engine and its data structures.
// The binary crate (main.rs) provides the console entry point.

pub mod config;
pub mod diagnostics;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;

// Re-export commonly used types for convenience
pub use config::{ConfigError, ConfigManager};
pub use diagnostics::{DiagnosticSink, Style, TracingSink};
pub use models::{Action, ActionKind, MirrorPair, PairColor, Settings};
pub use services::{ActionQueue, Mirror, Watcher, WatcherHandle};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
