//! Tree walking and diff planning.
//!
//! A scan cycle walks both trees into [`TreeScan`]s and hands them to [`plan`],
//! which decides the minimal set of [`Step`]s that turns the target into a
//! copy of the source. Both functions are synchronous and meant to run on the
//! blocking pool.
//!
//! # Unstable paths
//!
//! A path that could not be read is not evidence that the path is gone. Every
//! scan error marks a relative prefix as unstable and the planner leaves
//! everything at or below an unstable prefix alone for the cycle. An
//! unreadable source directory therefore never turns into a deletion on the
//! target side.

use crate::models::{Action, CompareMode, EntryKind, FileEntry, MirrorPair};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::time::Duration;
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

/// Errors met while scanning a tree. None of them are fatal to the cycle.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Cannot read {path}: {source}")]
    Walk {
        path: Utf8PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Name is not valid UTF-8: {path}")]
    NonUtf8Path { path: String },

    #[error("Cannot read metadata of {path}: {source}")]
    Metadata {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot hash {path}: {source}")]
    Hash {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Snapshot of one tree, keyed by path relative to the root.
///
/// `BTreeMap` ordering on paths is component-wise, so a directory always sorts
/// directly before its descendants.
#[derive(Debug, Default)]
pub struct TreeScan {
    pub entries: BTreeMap<Utf8PathBuf, FileEntry>,
    pub unstable: Vec<Utf8PathBuf>,
    pub errors: Vec<ScanError>,
}

impl TreeScan {
    /// A scan of a tree with nothing in it, used when the target is about to be wiped
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values().filter(|e| e.kind == EntryKind::File)
    }

    fn mark_unstable(&mut self, root: &Utf8Path, path: Option<&Utf8Path>, error: ScanError) {
        let relative = path
            .and_then(|p| p.strip_prefix(root).ok())
            .map(Utf8Path::to_path_buf)
            .unwrap_or_default();
        self.unstable.push(relative);
        self.errors.push(error);
    }
}

/// Walk `root` depth-first, pruning directories whose name is in `skip`.
///
/// The root itself is not part of the result. Symlinks are not followed; a
/// symlink that resolves to a regular file is recorded as a file, any other
/// symlink is ignored.
pub fn walk_tree(root: &Utf8Path, skip: &IndexSet<String>) -> TreeScan {
    let mut scan = TreeScan::default();
    let mut rejected = Vec::new();

    {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| keep_entry(entry, skip, &mut rejected));

        for item in walker {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .and_then(Utf8Path::from_path)
                        .map(Utf8Path::to_path_buf)
                        .unwrap_or_else(|| root.to_path_buf());
                    tracing::debug!("Walk error under {}: {}", root, err);
                    let failed_at = path.clone();
                    scan.mark_unstable(
                        root,
                        Some(failed_at.as_path()),
                        ScanError::Walk { path, source: err },
                    );
                    continue;
                }
            };

            if entry.depth() == 0 {
                continue;
            }

            // Names were checked in keep_entry, so this only fails for odd roots
            let Some(path) = Utf8Path::from_path(entry.path()) else {
                continue;
            };
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };

            match read_entry(&entry, path, relative) {
                Ok(Some(file_entry)) => {
                    scan.entries.insert(relative.to_path_buf(), file_entry);
                }
                Ok(None) => {
                    tracing::debug!("Ignoring symlink that is not a regular file: {}", path);
                }
                Err(err) => scan.mark_unstable(root, Some(path), err),
            }
        }
    }

    scan.errors.extend(rejected);
    scan
}

fn keep_entry(entry: &DirEntry, skip: &IndexSet<String>, rejected: &mut Vec<ScanError>) -> bool {
    if entry.depth() == 0 {
        return true;
    }

    let Some(name) = entry.file_name().to_str() else {
        rejected.push(ScanError::NonUtf8Path {
            path: entry.path().to_string_lossy().into_owned(),
        });
        return false;
    };

    !(entry.file_type().is_dir() && skip.contains(name))
}

fn read_entry(
    entry: &DirEntry,
    path: &Utf8Path,
    relative: &Utf8Path,
) -> Result<Option<FileEntry>, ScanError> {
    let file_type = entry.file_type();

    let metadata = if file_type.is_symlink() {
        let resolved = fs::metadata(path).map_err(|source| ScanError::Metadata {
            path: path.to_path_buf(),
            source,
        })?;
        if !resolved.is_file() {
            return Ok(None);
        }
        resolved
    } else {
        entry.metadata().map_err(|err| ScanError::Metadata {
            path: path.to_path_buf(),
            source: err.into(),
        })?
    };

    let kind = if metadata.is_dir() {
        EntryKind::Dir
    } else {
        EntryKind::File
    };

    let modified = metadata.modified().map_err(|source| ScanError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(Some(FileEntry {
        relative: relative.to_path_buf(),
        kind,
        size: if kind == EntryKind::File { metadata.len() } else { 0 },
        modified,
    }))
}

/// How much newer a same-size source must be before it counts as changed.
///
/// FAT and some network filesystems store modification times at 2 second
/// granularity, so a copy's mtime can land up to that far from the source's.
pub const MTIME_TOLERANCE: Duration = Duration::from_secs(2);

/// Decides whether a file present in both trees must be copied again
#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector<'a> {
    mode: CompareMode,
    source_root: &'a Utf8Path,
    target_root: &'a Utf8Path,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(mode: CompareMode, source_root: &'a Utf8Path, target_root: &'a Utf8Path) -> Self {
        Self {
            mode,
            source_root,
            target_root,
        }
    }

    pub fn needs_copy(&self, source: &FileEntry, target: &FileEntry) -> Result<bool, ScanError> {
        if source.size != target.size {
            return Ok(true);
        }

        match self.mode {
            CompareMode::SizeAndMtime => Ok(source
                .modified
                .duration_since(target.modified)
                .is_ok_and(|newer_by| newer_by > MTIME_TOLERANCE)),
            CompareMode::ContentHash => {
                let source_digest = hash_file(&self.source_root.join(&source.relative))?;
                let target_digest = hash_file(&self.target_root.join(&target.relative))?;
                Ok(source_digest != target_digest)
            }
        }
    }
}

/// BLAKE3 digest of a file's contents
pub fn hash_file(path: &Utf8Path) -> Result<blake3::Hash, ScanError> {
    let to_error = |source| ScanError::Hash {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(to_error)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher).map_err(to_error)?;
    Ok(hasher.finalize())
}

/// One planned change, relative to the pair roots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    CreateDir(Utf8PathBuf),
    CopyFile(Utf8PathBuf),
    DeleteFile(Utf8PathBuf),
    DeleteDir(Utf8PathBuf),
}

impl Step {
    pub fn relative(&self) -> &Utf8Path {
        match self {
            Step::CreateDir(p) | Step::CopyFile(p) | Step::DeleteFile(p) | Step::DeleteDir(p) => p,
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self, Step::DeleteFile(_) | Step::DeleteDir(_))
    }

    pub fn into_action(self, pair: &MirrorPair, generation: u64) -> Action {
        match self {
            Step::CreateDir(p) => Action::create_dir(pair, generation, &p),
            Step::CopyFile(p) => Action::copy_file(pair, generation, &p),
            Step::DeleteFile(p) => Action::delete_file(pair, generation, &p),
            Step::DeleteDir(p) => Action::delete_dir(pair, generation, &p),
        }
    }
}

/// Ordered steps plus the errors met while comparing file contents
#[derive(Debug, Default)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub errors: Vec<ScanError>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Compute the steps that make `target` mirror `source`.
///
/// Deletions come first, children before parents, so a path whose kind
/// changed is cleared before it is recreated. Creations and copies follow in
/// ascending path order, so every directory exists before its contents.
pub fn plan(source: &TreeScan, target: &TreeScan, detector: &ChangeDetector<'_>) -> Plan {
    let unstable: Vec<&Utf8Path> = source
        .unstable
        .iter()
        .chain(target.unstable.iter())
        .map(Utf8PathBuf::as_path)
        .collect();
    let is_unstable = |path: &Utf8Path| unstable.iter().any(|prefix| path.starts_with(prefix));

    let mut result = Plan::default();

    for (relative, existing) in target.entries.iter().rev() {
        if is_unstable(relative) {
            continue;
        }
        let keep = source
            .entries
            .get(relative)
            .is_some_and(|wanted| wanted.kind == existing.kind);
        if !keep {
            result.steps.push(match existing.kind {
                EntryKind::File => Step::DeleteFile(relative.clone()),
                EntryKind::Dir => Step::DeleteDir(relative.clone()),
            });
        }
    }

    for (relative, wanted) in &source.entries {
        if is_unstable(relative) {
            continue;
        }
        let step = match (wanted.kind, target.entries.get(relative)) {
            (EntryKind::Dir, Some(existing)) if existing.kind == EntryKind::Dir => None,
            (EntryKind::Dir, _) => Some(Step::CreateDir(relative.clone())),
            (EntryKind::File, Some(existing)) if existing.kind == EntryKind::File => {
                match detector.needs_copy(wanted, existing) {
                    Ok(true) => Some(Step::CopyFile(relative.clone())),
                    Ok(false) => None,
                    Err(err) => {
                        result.errors.push(err);
                        None
                    }
                }
            }
            (EntryKind::File, _) => Some(Step::CopyFile(relative.clone())),
        };
        if let Some(step) = step {
            result.steps.push(step);
        }
    }

    result
}
