use crate::diagnostics::{DiagnosticSink, Style};
use crate::models::{MirrorPair, PairConfig, Settings};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::fs;
use thiserror::Error;

/// Name of the settings file inside the configuration directory
pub const SETTINGS_FILE: &str = "filecopier.yaml";

/// Name of the legacy pairs file in the home directory
pub const LEGACY_PAIRS_FILE: &str = ".filecopier";

/// Prefix of environment variables that override settings
pub const ENV_PREFIX: &str = "FILECOPIER";

/// A pair declaration that was rejected. The pair is reported and skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Settings line does not match pattern (c:\\source => c:\\target): {line}")]
    BadSyntax { line: usize },

    #[error("Source folder not found: {path}")]
    SourceNotFound { path: Utf8PathBuf },

    #[error("Source is not a folder: {path}")]
    SourceNotDirectory { path: Utf8PathBuf },

    #[error("Target folder not found: {path}")]
    TargetNotFound { path: Utf8PathBuf },

    #[error("Target is not a folder: {path}")]
    TargetNotDirectory { path: Utf8PathBuf },

    #[error("Target is not writable: {path}")]
    TargetNotWritable { path: Utf8PathBuf },

    #[error("Source and target are the same folder: {path}")]
    SamePath { path: Utf8PathBuf },
}

/// Contents of a legacy pairs file.
#[derive(Debug, Default)]
pub struct PairsFile {
    /// Number of lines read, used to index pairs declared elsewhere after these
    pub lines: usize,
    /// Accepted declarations with their 1-based line numbers
    pub pairs: Vec<(usize, PairConfig)>,
    pub errors: Vec<ConfigError>,
}

/// Configuration manager for settings and pair declarations.
///
/// Manages two sources:
/// - `filecopier.yaml` in the configuration directory: engine settings and optional pairs
/// - `~/.filecopier`: one `source => target` pair per line
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
    /// `source => target`, spaces around the arrow optional
    pair_pattern: Regex,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// # Arguments
    /// * `config_dir` - Directory holding `filecopier.yaml`; created if missing
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            settings_path: config_dir.join(SETTINGS_FILE),
            config_dir,
            pair_pattern: Regex::new(r"^(.*[^ ]) ?=> ?([^ ].*)$").expect("Invalid pair regex"),
        })
    }

    /// Load settings from `filecopier.yaml`, then apply `FILECOPIER_*` environment overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load_settings(&self) -> Result<Settings> {
        let layered = config::Config::builder()
            .add_source(
                config::File::from(self.settings_path.as_std_path())
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .with_context(|| format!("Failed to read settings: {}", self.settings_path))?;

        let settings: Settings = layered
            .try_deserialize()
            .with_context(|| format!("Failed to parse settings: {}", self.settings_path))?;

        tracing::info!("Loaded settings from {}", self.settings_path);
        Ok(settings)
    }

    /// Save settings to `filecopier.yaml`.
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(settings).context("Failed to serialize settings to YAML")?;

        fs::write(&self.settings_path, yaml_string)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    /// Parse the legacy pairs format.
    ///
    /// Blank lines and lines starting with `#` are ignored. Every other line
    /// must read `source => target`; lines that don't are collected as
    /// [`ConfigError::BadSyntax`].
    pub fn parse_pairs(&self, text: &str) -> PairsFile {
        let mut parsed = PairsFile::default();

        for (number, line) in text.lines().enumerate() {
            let line_number = number + 1;
            parsed.lines = line_number;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match self.pair_pattern.captures(trimmed) {
                Some(captures) => {
                    let source = captures[1].trim();
                    let target = captures[2].trim();
                    parsed
                        .pairs
                        .push((line_number, PairConfig::new(source, target)));
                }
                None => {
                    tracing::warn!("Pairs file line {} is malformed: {:?}", line_number, line);
                    parsed.errors.push(ConfigError::BadSyntax { line: line_number });
                }
            }
        }

        parsed
    }

    /// Read and parse a legacy pairs file.
    ///
    /// Bytes that are not valid UTF-8 are replaced, so one badly encoded line
    /// only spoils that line.
    pub fn load_pairs_file(&self, path: &Utf8Path) -> Result<PairsFile> {
        let bytes = fs::read(path).with_context(|| format!("Failed to read pairs file: {}", path))?;

        let parsed = self.parse_pairs(&String::from_utf8_lossy(&bytes));
        tracing::info!(
            "Loaded {} pairs from {} ({} rejected)",
            parsed.pairs.len(),
            path,
            parsed.errors.len()
        );
        Ok(parsed)
    }

    /// Load the legacy pairs file if there is one.
    ///
    /// A file that exists but cannot be read is reported to `sink` and
    /// treated as absent, so the pairs declared in the settings still run.
    pub fn load_legacy_pairs(&self, path: &Utf8Path, sink: &dyn DiagnosticSink) -> Option<PairsFile> {
        if !path.exists() {
            tracing::info!("No pairs file at {}", path);
            return None;
        }

        match self.load_pairs_file(path) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                tracing::warn!("{:#}", err);
                sink.emit(&format!("Unable to load configuration file: {}", path), Style::Error);
                None
            }
        }
    }

    /// Validate a declared pair and build the [`MirrorPair`] a watcher runs on.
    ///
    /// Checks, in order: the source exists and is a folder, the target exists,
    /// is a folder and is writable, and the two are not the same folder.
    pub fn validate_pair(&self, declared: PairConfig, index: usize) -> Result<MirrorPair, ConfigError> {
        let PairConfig { source, target } = declared;

        if !source.exists() {
            return Err(ConfigError::SourceNotFound { path: source });
        }
        if !source.is_dir() {
            return Err(ConfigError::SourceNotDirectory { path: source });
        }
        if !target.exists() {
            return Err(ConfigError::TargetNotFound { path: target });
        }
        if !target.is_dir() {
            return Err(ConfigError::TargetNotDirectory { path: target });
        }

        if !is_writable_dir(&target) {
            return Err(ConfigError::TargetNotWritable { path: target });
        }

        let same = match (source.canonicalize_utf8(), target.canonicalize_utf8()) {
            (Ok(source), Ok(target)) => source == target,
            _ => source == target,
        };
        if same {
            return Err(ConfigError::SamePath { path: target });
        }

        Ok(MirrorPair::new(index, source, target))
    }

    /// Validate every declared pair, legacy file first.
    ///
    /// YAML pairs are indexed after the last line of the legacy file so
    /// indices never collide. Returns the valid pairs and every rejection.
    pub fn resolve_pairs(
        &self,
        legacy: Option<PairsFile>,
        declared: &[PairConfig],
    ) -> (Vec<MirrorPair>, Vec<ConfigError>) {
        let legacy = legacy.unwrap_or_default();
        let mut errors = legacy.errors;
        let mut pairs = Vec::new();

        let yaml = declared
            .iter()
            .cloned()
            .enumerate()
            .map(|(offset, pair)| (legacy.lines + offset + 1, pair));

        for (index, declared) in legacy.pairs.into_iter().chain(yaml) {
            match self.validate_pair(declared, index) {
                Ok(pair) => pairs.push(pair),
                Err(err) => {
                    tracing::warn!("Pair {} rejected: {}", index, err);
                    errors.push(err);
                }
            }
        }

        (pairs, errors)
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn settings_path(&self) -> &Utf8Path {
        &self.settings_path
    }
}

/// Whether the current process can create files in `dir`.
///
/// Mode bits alone miss ownership and ACLs, so this creates an anonymous
/// temporary file and lets the OS decide.
fn is_writable_dir(dir: &Utf8Path) -> bool {
    let readonly = fs::metadata(dir)
        .map(|metadata| metadata.permissions().readonly())
        .unwrap_or(true);
    if readonly {
        return false;
    }

    match tempfile::tempfile_in(dir) {
        Ok(_) => true,
        Err(err) => {
            tracing::debug!("Cannot create a file in {}: {}", dir, err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompareMode, PairColor};
    use tempfile::TempDir;

    fn create_test_config_manager() -> (ConfigManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let manager = ConfigManager::new(&config_path).unwrap();
        (manager, temp_dir)
    }

    #[test]
    fn test_missing_settings_file_gives_defaults() {
        let (manager, _temp_dir) = create_test_config_manager();

        let settings = manager.load_settings().unwrap();
        assert_eq!(settings.scan_interval_secs, 5);
        assert!(settings.is_skipped(".git"));
        assert!(settings.pairs.is_empty());
    }

    #[test]
    fn test_load_save_settings() {
        let (manager, _temp_dir) = create_test_config_manager();

        let settings = Settings {
            scan_interval_secs: 30,
            compare_mode: CompareMode::ContentHash,
            pairs: vec![PairConfig::new("/a", "/b")],
            ..Settings::default()
        };
        manager.save_settings(&settings).unwrap();

        let loaded = manager.load_settings().unwrap();
        assert_eq!(loaded.scan_interval_secs, 30);
        assert_eq!(loaded.compare_mode, CompareMode::ContentHash);
        assert_eq!(loaded.pairs, vec![PairConfig::new("/a", "/b")]);
    }

    #[test]
    fn test_parse_pairs_accepts_optional_spaces() {
        let (manager, _temp_dir) = create_test_config_manager();

        let parsed = manager.parse_pairs(
            "# mirrors\n\nC:\\work => D:\\backup\n/home/a=>/mnt/a\n  /x y => /z  \n",
        );

        assert_eq!(parsed.lines, 5);
        assert!(parsed.errors.is_empty());
        assert_eq!(
            parsed.pairs,
            vec![
                (3, PairConfig::new("C:\\work", "D:\\backup")),
                (4, PairConfig::new("/home/a", "/mnt/a")),
                (5, PairConfig::new("/x y", "/z")),
            ]
        );
    }

    #[test]
    fn test_parse_pairs_ignores_indented_comments() {
        let (manager, _temp_dir) = create_test_config_manager();

        let parsed = manager.parse_pairs("   # /old => /gone\n\t/a => /b\t\n");

        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.pairs, vec![(2, PairConfig::new("/a", "/b"))]);
    }

    #[test]
    fn test_parse_pairs_reports_bad_lines() {
        let (manager, _temp_dir) = create_test_config_manager();

        let parsed = manager.parse_pairs("/a -> /b\n/c => /d\n=> /e\n");

        assert_eq!(parsed.pairs, vec![(2, PairConfig::new("/c", "/d"))]);
        assert_eq!(
            parsed.errors,
            vec![
                ConfigError::BadSyntax { line: 1 },
                ConfigError::BadSyntax { line: 3 }
            ]
        );
        assert!(parsed.errors[0].to_string().starts_with("Settings line does not match pattern"));
    }

    #[test]
    fn test_validate_pair_checks() {
        let (manager, temp_dir) = create_test_config_manager();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        fs::create_dir(root.join("src")).unwrap();
        fs::create_dir(root.join("dst")).unwrap();
        fs::write(root.join("file.txt"), b"x").unwrap();

        let missing = manager.validate_pair(PairConfig::new(root.join("nope"), root.join("dst")), 1);
        assert!(matches!(missing, Err(ConfigError::SourceNotFound { .. })));

        let not_dir = manager.validate_pair(PairConfig::new(root.join("file.txt"), root.join("dst")), 1);
        assert!(matches!(not_dir, Err(ConfigError::SourceNotDirectory { .. })));

        let no_target = manager.validate_pair(PairConfig::new(root.join("src"), root.join("nope")), 1);
        assert!(matches!(no_target, Err(ConfigError::TargetNotFound { .. })));

        let file_target =
            manager.validate_pair(PairConfig::new(root.join("src"), root.join("file.txt")), 1);
        assert!(matches!(file_target, Err(ConfigError::TargetNotDirectory { .. })));

        let same = manager.validate_pair(PairConfig::new(root.join("src"), root.join("src/.")), 1);
        assert!(matches!(same, Err(ConfigError::SamePath { .. })));

        let pair = manager
            .validate_pair(PairConfig::new(root.join("src"), root.join("dst")), 2)
            .unwrap();
        assert_eq!(pair.index, 2);
        assert_eq!(pair.color, PairColor::Yellow);
    }

    #[test]
    fn test_yaml_pairs_indexed_after_legacy_lines() {
        let (manager, temp_dir) = create_test_config_manager();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        for dir in ["a", "b", "c", "d"] {
            fs::create_dir(root.join(dir)).unwrap();
        }

        let legacy = manager.parse_pairs(&format!(
            "# header\n{} => {}\nbroken\n",
            root.join("a"),
            root.join("b")
        ));
        let declared = [
            PairConfig::new(root.join("c"), root.join("d")),
            PairConfig::new(root.join("missing"), root.join("d")),
        ];

        let (pairs, errors) = manager.resolve_pairs(Some(legacy), &declared);

        assert_eq!(pairs.iter().map(|p| p.index).collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], ConfigError::BadSyntax { line: 3 });
        assert!(matches!(errors[1], ConfigError::SourceNotFound { .. }));
    }
}
