//! Diagnostic sink - the live log consumed by the presentation layer.
//!
//! Watchers and the action queue report everything the operator should see as
//! styled lines through a [`DiagnosticSink`]. The core never assumes anything
//! about the threading model of whoever renders those lines: implementations
//! must accept `emit` from any thread.
//!
//! Two sinks are provided:
//! - [`TracingSink`]: forwards each line to `tracing`, with the level chosen by style
//! - [`BroadcastSink`]: fans lines out over a tokio broadcast channel for UIs and tests

use crate::models::PairColor;
use std::fmt;
use tokio::sync::broadcast;

/// Visual style of one diagnostic line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Style {
    Default,
    Emphasis,
    Key,
    Error,
    Slow,
    Pair(PairColor),
}

impl Style {
    pub fn name(self) -> &'static str {
        match self {
            Style::Default => "default",
            Style::Emphasis => "emphasis",
            Style::Key => "key",
            Style::Error => "error",
            Style::Slow => "slow",
            Style::Pair(color) => color.name(),
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receiver of styled log lines.
///
/// Each call carries one complete line without a trailing newline. Lines
/// emitted by one thread must be kept in order; lines from different threads
/// may interleave.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, text: &str, style: Style);
}

/// A line as delivered by [`BroadcastSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub text: String,
    pub style: Style,
}

/// Sink that writes every line to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, text: &str, style: Style) {
        match style {
            Style::Error => tracing::error!(style = %style, "{}", text),
            Style::Slow => tracing::warn!(style = %style, "{}", text),
            _ => tracing::info!(style = %style, "{}", text),
        }
    }
}

/// Sink that broadcasts lines to any number of subscribers.
///
/// Sending never blocks. Slow subscribers lag and lose the oldest lines;
/// lines emitted while nobody listens are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<DiagnosticEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl DiagnosticSink for BroadcastSink {
    fn emit(&self, text: &str, style: Style) {
        // Ignore send errors - it's OK if no one is listening
        let _ = self.tx.send(DiagnosticEvent {
            text: text.to_string(),
            style,
        });
    }
}
