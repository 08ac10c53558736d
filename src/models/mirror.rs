use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use std::time::SystemTime;

/// Display colors assigned to pairs, cycled by pair index.
pub const PALETTE: [PairColor; 3] = [PairColor::Magenta, PairColor::Cyan, PairColor::Yellow];

/// Color used to tag every log line that belongs to one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairColor {
    Magenta,
    Cyan,
    Yellow,
}

impl PairColor {
    pub fn for_index(index: usize) -> Self {
        PALETTE[index % PALETTE.len()]
    }

    pub fn name(self) -> &'static str {
        match self {
            PairColor::Magenta => "magenta",
            PairColor::Cyan => "cyan",
            PairColor::Yellow => "yellow",
        }
    }
}

/// A validated source → target mapping.
///
/// Built once by [`ConfigManager::validate_pair`](crate::config::ConfigManager::validate_pair)
/// and then owned by a single watcher for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorPair {
    pub index: usize,
    pub source: Utf8PathBuf,
    pub target: Utf8PathBuf,
    pub color: PairColor,
}

impl MirrorPair {
    pub fn new(index: usize, source: Utf8PathBuf, target: Utf8PathBuf) -> Self {
        Self {
            index,
            source,
            target,
            color: PairColor::for_index(index),
        }
    }

    pub fn tag(&self) -> PairTag {
        PairTag {
            index: self.index,
            color: self.color,
        }
    }
}

/// The part of a pair carried by every action, used for log correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairTag {
    pub index: usize,
    pub color: PairColor,
}

impl fmt::Display for PairTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// One path of a scanned tree, relative to the tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub relative: Utf8PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: SystemTime,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// What an [`Action`] does to the target tree. Paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    CreateDir { target: Utf8PathBuf },
    CopyFile { source: Utf8PathBuf, target: Utf8PathBuf },
    DeleteFile { target: Utf8PathBuf },
    DeleteDir { target: Utf8PathBuf },
    /// Remove every child of `root`, keeping `root` itself
    WipeTree { root: Utf8PathBuf },
}

/// One unit of mutating work, consumed exactly once by the action queue.
///
/// `generation` is the pair's wipe generation at the time the action was
/// planned. A `WipeTree` carries the generation it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub pair: PairTag,
    pub generation: u64,
    pub relative: Utf8PathBuf,
    pub kind: ActionKind,
}

impl Action {
    pub fn create_dir(pair: &MirrorPair, generation: u64, relative: &Utf8Path) -> Self {
        Self {
            pair: pair.tag(),
            generation,
            relative: relative.to_path_buf(),
            kind: ActionKind::CreateDir {
                target: pair.target.join(relative),
            },
        }
    }

    pub fn copy_file(pair: &MirrorPair, generation: u64, relative: &Utf8Path) -> Self {
        Self {
            pair: pair.tag(),
            generation,
            relative: relative.to_path_buf(),
            kind: ActionKind::CopyFile {
                source: pair.source.join(relative),
                target: pair.target.join(relative),
            },
        }
    }

    pub fn delete_file(pair: &MirrorPair, generation: u64, relative: &Utf8Path) -> Self {
        Self {
            pair: pair.tag(),
            generation,
            relative: relative.to_path_buf(),
            kind: ActionKind::DeleteFile {
                target: pair.target.join(relative),
            },
        }
    }

    pub fn delete_dir(pair: &MirrorPair, generation: u64, relative: &Utf8Path) -> Self {
        Self {
            pair: pair.tag(),
            generation,
            relative: relative.to_path_buf(),
            kind: ActionKind::DeleteDir {
                target: pair.target.join(relative),
            },
        }
    }

    pub fn wipe_tree(pair: &MirrorPair, generation: u64) -> Self {
        Self {
            pair: pair.tag(),
            generation,
            relative: Utf8PathBuf::new(),
            kind: ActionKind::WipeTree {
                root: pair.target.clone(),
            },
        }
    }

    pub fn is_wipe(&self) -> bool {
        matches!(self.kind, ActionKind::WipeTree { .. })
    }

    /// The path the action mutates
    pub fn target(&self) -> &Utf8Path {
        match &self.kind {
            ActionKind::CreateDir { target }
            | ActionKind::CopyFile { target, .. }
            | ActionKind::DeleteFile { target }
            | ActionKind::DeleteDir { target } => target,
            ActionKind::WipeTree { root } => root,
        }
    }

    /// Past-tense verb used when reporting success
    pub fn verb(&self) -> &'static str {
        match self.kind {
            ActionKind::CreateDir { .. } => "Created",
            ActionKind::CopyFile { .. } => "Copied",
            ActionKind::DeleteFile { .. } | ActionKind::DeleteDir { .. } => "Deleted",
            ActionKind::WipeTree { .. } => "Wiped",
        }
    }

    /// Display form of the mutated path: relative when there is one
    pub fn display_path(&self) -> &Utf8Path {
        if self.relative.as_str().is_empty() {
            self.target()
        } else {
            &self.relative
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> MirrorPair {
        MirrorPair::new(4, "/src".into(), "/dst".into())
    }

    #[test]
    fn test_palette_cycles_by_index() {
        assert_eq!(PairColor::for_index(0), PairColor::Magenta);
        assert_eq!(PairColor::for_index(1), PairColor::Cyan);
        assert_eq!(PairColor::for_index(2), PairColor::Yellow);
        assert_eq!(PairColor::for_index(3), PairColor::Magenta);
        assert_eq!(pair().color, PairColor::Cyan);
    }

    #[test]
    fn test_copy_action_paths() {
        let action = Action::copy_file(&pair(), 2, Utf8Path::new("sub/b.txt"));

        assert_eq!(
            action.kind,
            ActionKind::CopyFile {
                source: Utf8PathBuf::from("/src/sub/b.txt"),
                target: Utf8PathBuf::from("/dst/sub/b.txt"),
            }
        );
        assert_eq!(action.target(), Utf8Path::new("/dst/sub/b.txt"));
        assert_eq!(action.generation, 2);
        assert_eq!(action.pair.to_string(), "[4]");
    }

    #[test]
    fn test_wipe_displays_root() {
        let action = Action::wipe_tree(&pair(), 1);
        assert!(action.is_wipe());
        assert_eq!(action.display_path(), Utf8Path::new("/dst"));
        assert_eq!(action.verb(), "Wiped");
    }
}
