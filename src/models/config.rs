use camino::Utf8PathBuf;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a watcher decides that a file present on both sides needs copying.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareMode {
    /// Copy when sizes differ or the source was modified after the target.
    #[default]
    SizeAndMtime,

    /// Copy when sizes differ or the BLAKE3 digests of the two files differ.
    ContentHash,
}

/// An operator-supplied `source => target` mapping, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairConfig {
    pub source: Utf8PathBuf,
    pub target: Utf8PathBuf,
}

impl PairConfig {
    pub fn new(source: impl Into<Utf8PathBuf>, target: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Settings from `filecopier.yaml`, overridable with `FILECOPIER_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Idle time between two scans of the same pair
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Quiet period after a change notification before rescanning
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Successful actions slower than this are reported in the slow style
    #[serde(default = "default_slow_action_ms")]
    pub slow_action_ms: u64,

    /// Directory names never traversed on either side
    #[serde(default = "default_skip_folders")]
    pub skip_folders: IndexSet<String>,

    #[serde(default)]
    pub compare_mode: CompareMode,

    /// Use OS change notifications in addition to the timed rescan
    #[serde(default = "default_true")]
    pub change_notifications: bool,

    #[serde(default)]
    pub debug_mode: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Pairs declared in YAML, appended after the legacy pairs file
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            debounce_ms: default_debounce_ms(),
            slow_action_ms: default_slow_action_ms(),
            skip_folders: default_skip_folders(),
            compare_mode: CompareMode::default(),
            change_notifications: true,
            debug_mode: false,
            log_dir: default_log_dir(),
            pairs: Vec::new(),
        }
    }
}

impl Settings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_action_ms)
    }

    /// Check whether a directory name is excluded from mirroring
    pub fn is_skipped(&self, dir_name: &str) -> bool {
        self.skip_folders.contains(dir_name)
    }
}

fn default_scan_interval_secs() -> u64 {
    5
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_slow_action_ms() -> u64 {
    2000
}

fn default_skip_folders() -> IndexSet<String> {
    IndexSet::from([".git".to_string()])
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> String {
    "logs".to_string()
}
