//! FileCopier - continuously mirror source folders into target folders
//!
//! Main entry point for the console application.
//!
//! # Execution Flow
//!
//! 1. Load `filecopier.yaml` from the user configuration directory
//! 2. Initialize logging → `<log_dir>/filecopier.<date>`, plus the console
//! 3. Read pairs from `~/.filecopier` and from the YAML `pairs` list, and
//!    report every rejected pair
//! 4. Start one watcher per valid pair on a multi-threaded tokio runtime
//! 5. Serve operator commands from stdin until `quit`, end of input or Ctrl-C
//! 6. Shut down and log the metrics summary
//!
//! # Commands
//!
//! - `list`: show every pair with its index
//! - `wipe <n>`: empty the target of pair `n` and copy its source again
//! - `status`: show queue and metrics counters
//! - `quit`: stop mirroring and exit

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use filecopier::config::LEGACY_PAIRS_FILE;
use filecopier::logging::{LoggingOptions, setup_logging};
use filecopier::{APP_NAME, ConfigManager, DiagnosticSink, Mirror, Style, TracingSink, VERSION};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// An operator command read from stdin
#[derive(Debug, PartialEq, Eq)]
enum Command {
    List,
    Wipe(usize),
    Status,
    Quit,
    Help,
}

fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let command = match words.next()? {
        "list" | "ls" => Command::List,
        "wipe" => Command::Wipe(words.next()?.parse().ok()?),
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        "help" | "?" => Command::Help,
        _ => return None,
    };
    Some(command)
}

fn config_dir() -> Result<Utf8PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", APP_NAME)
        .context("Could not determine the configuration directory")?;
    Utf8PathBuf::from_path_buf(dirs.config_dir().to_path_buf())
        .map_err(|path| anyhow::anyhow!("Configuration directory is not UTF-8: {}", path.display()))
}

fn legacy_pairs_path() -> Option<Utf8PathBuf> {
    let dirs = directories::BaseDirs::new()?;
    Utf8PathBuf::from_path_buf(dirs.home_dir().join(LEGACY_PAIRS_FILE)).ok()
}

fn main() -> Result<()> {
    let config_manager = ConfigManager::new(config_dir()?)?;
    let settings = config_manager.load_settings()?;

    let _log_guard = setup_logging(&LoggingOptions {
        log_dir: Utf8PathBuf::from(&settings.log_dir),
        debug: settings.debug_mode,
        ..LoggingOptions::default()
    })?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);
    let sink: Arc<dyn DiagnosticSink> = Arc::new(TracingSink);
    sink.emit(&format!("FileCopier {}", VERSION), Style::Emphasis);

    let legacy = legacy_pairs_path()
        .and_then(|path| config_manager.load_legacy_pairs(&path, sink.as_ref()));

    let (pairs, errors) = config_manager.resolve_pairs(legacy, &settings.pairs);
    for err in &errors {
        sink.emit(&err.to_string(), Style::Error);
    }
    if pairs.is_empty() {
        sink.emit(
            &format!(
                "No pairs to mirror; add `source => target` lines to ~/{} or `pairs` to {}",
                LEGACY_PAIRS_FILE,
                config_manager.settings_path()
            ),
            Style::Key,
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("filecopier-worker")
        .build()
        .context("Failed to build the tokio runtime")?;

    runtime.block_on(async {
        let mirror = Mirror::start(pairs, &settings, Arc::clone(&sink));
        serve_commands(&mirror, sink.as_ref()).await;
        mirror.shutdown().await;
    });

    // A pending stdin read holds a blocking thread that would otherwise delay exit
    runtime.shutdown_timeout(Duration::from_secs(5));

    tracing::info!("Application shutdown complete");
    Ok(())
}

/// Read commands until quit, end of input or Ctrl-C
async fn serve_commands(mirror: &Mirror, sink: &dyn DiagnosticSink) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                return;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                // Without a console there is nothing to read; keep mirroring until interrupted
                tracing::debug!("Standard input closed");
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to wait for Ctrl-C: {}", err);
                }
                return;
            }
            Err(err) => {
                tracing::error!("Failed to read standard input: {}", err);
                return;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Some(Command::List) => {
                for handle in mirror.handles() {
                    let pair = handle.pair();
                    sink.emit(
                        &format!("{} {} => {}", pair.tag(), pair.source, pair.target),
                        Style::Pair(pair.color),
                    );
                }
            }
            Some(Command::Wipe(index)) => {
                if !mirror.wipe(index) {
                    sink.emit(&format!("No pair with index {}", index), Style::Error);
                }
            }
            Some(Command::Status) => {
                let status = mirror.queue().status();
                let metrics = mirror.metrics();
                sink.emit(
                    &format!(
                        "Queue: {} pending{}, {} completed, {} failed, {} bytes copied",
                        status.pending,
                        if status.active { " + 1 running" } else { "" },
                        metrics.completed(),
                        metrics.actions_failed.load(Ordering::Relaxed),
                        metrics.bytes_copied.load(Ordering::Relaxed)
                    ),
                    Style::Default,
                );
            }
            Some(Command::Quit) => return,
            Some(Command::Help) | None => {
                sink.emit("Commands: list, wipe <n>, status, quit", Style::Key);
            }
        }
    }
}
