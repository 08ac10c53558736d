//! Data models for FileCopier.
//!
//! This module contains the plain data structures shared by the services:
//! - [`Settings`]: Runtime settings loaded from `filecopier.yaml` and the environment
//! - [`PairConfig`]: An unvalidated `source => target` mapping as written by the operator
//! - [`MirrorPair`]: A validated pair, owned by exactly one [`Watcher`](crate::services::Watcher)
//! - [`FileEntry`]: One path of a scanned tree with the metadata used for change detection
//! - [`Action`]: One filesystem mutation waiting in the [`ActionQueue`](crate::services::ActionQueue)
//!
//! # Architecture Note
//!
//! The models are designed to be:
//! - **Serializable**: Config structs derive `Serialize`/`Deserialize` for YAML persistence
//! - **Immutable once built**: A `MirrorPair` never changes after validation
//! - **Cheap to move**: Actions are created by a watcher, consumed once by the queue, then dropped

pub mod config;
pub mod mirror;

pub use config::{CompareMode, PairConfig, Settings};
pub use mirror::{
    Action, ActionKind, EntryKind, FileEntry, MirrorPair, PairColor, PairTag, PALETTE,
};
