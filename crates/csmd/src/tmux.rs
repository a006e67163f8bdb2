//! Tmux integration - terminal labels and pane activation.
//!
//! Sessions are identified by their tty. This module maps a tty to the tmux
//! pane attached to it, both to show a readable label (`work:1.0`) and to
//! bring that pane to the foreground.
//!
//! [`TmuxLabels::load`] is blocking and should be called via
//! `spawn_blocking`. [`TmuxActivator`] uses `tokio::process`.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A missing tmux server yields empty labels, never an error

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Command;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Program used unless overridden.
pub const TMUX_PROGRAM: &str = "tmux";

/// `list-panes` format: tty, pane target and title, tab separated.
pub const PANE_FORMAT: &str =
    "#{pane_tty}\t#{session_name}:#{window_index}.#{pane_index}\t#{pane_title}";

// ============================================================================
// Error Types
// ============================================================================

/// Errors from running tmux.
#[derive(Debug, Error)]
pub enum TmuxError {
    /// tmux could not be started
    #[error("failed to launch tmux: {0}")]
    Launch(#[from] io::Error),

    /// tmux ran but reported failure
    #[error("tmux {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

// ============================================================================
// Labels
// ============================================================================

/// Maps a session's tty to a human-readable terminal label.
pub trait LabelResolver: Send + Sync {
    /// Returns the label for `tty`, or `None` if the terminal is unknown.
    fn label_for(&self, tty: &str) -> Option<String>;
}

/// One tmux pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    /// `session:window.pane`
    pub target: String,
    /// Pane title (may be empty)
    pub title: String,
}

impl PaneInfo {
    /// Target followed by the title, if the pane has one.
    pub fn label(&self) -> String {
        if self.title.is_empty() {
            self.target.clone()
        } else {
            format!("{} {}", self.target, self.title)
        }
    }

    /// `session:window`, for `select-window`.
    pub fn window_target(&self) -> &str {
        self.target
            .rsplit_once('.')
            .map_or(self.target.as_str(), |(window, _)| window)
    }

    /// Session name, for `switch-client`.
    pub fn session_name(&self) -> &str {
        let window = self.window_target();
        window.rsplit_once(':').map_or(window, |(session, _)| session)
    }
}

/// Pane table from `tmux list-panes -a`, keyed by normalized tty.
#[derive(Debug, Clone, Default)]
pub struct TmuxLabels {
    panes: HashMap<String, PaneInfo>,
}

impl TmuxLabels {
    /// Queries the running tmux server.
    ///
    /// Returns an empty table if tmux is missing or no server runs.
    ///
    /// # Note
    /// This function performs blocking I/O and should be called via `spawn_blocking`.
    pub fn load() -> Self {
        let output = match Command::new(TMUX_PROGRAM)
            .args(["list-panes", "-a", "-F", PANE_FORMAT])
            .output()
        {
            Ok(output) if output.status.success() => output,
            Ok(_) => {
                debug!("tmux list-panes failed, no labels available");
                return Self::default();
            }
            Err(e) => {
                debug!(error = %e, "tmux not available, no labels available");
                return Self::default();
            }
        };

        let labels = Self::parse(&String::from_utf8_lossy(&output.stdout));
        debug!(panes = labels.len(), "Loaded tmux pane labels");
        labels
    }

    /// Parses `list-panes` output in [`PANE_FORMAT`].
    ///
    /// Lines without a tty or target are skipped. A missing title is empty.
    pub fn parse(output: &str) -> Self {
        let mut panes = HashMap::new();
        for line in output.lines() {
            let mut fields = line.splitn(3, '\t');
            let (Some(tty), Some(target)) = (fields.next(), fields.next()) else {
                trace!(line, "Skipping malformed pane line");
                continue;
            };
            let (tty, target) = (normalize_tty(tty.trim()), target.trim());
            if tty.is_empty() || target.is_empty() {
                continue;
            }
            panes.insert(
                tty.to_string(),
                PaneInfo {
                    target: target.to_string(),
                    title: fields.next().unwrap_or_default().trim().to_string(),
                },
            );
        }
        Self { panes }
    }

    /// Looks up the pane attached to `tty`.
    pub fn pane_for(&self, tty: &str) -> Option<&PaneInfo> {
        self.panes.get(normalize_tty(tty))
    }

    pub fn len(&self) -> usize {
        self.panes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.panes.is_empty()
    }
}

impl LabelResolver for TmuxLabels {
    fn label_for(&self, tty: &str) -> Option<String> {
        self.pane_for(tty).map(PaneInfo::label)
    }
}

/// Strips a leading `/dev/` so `ps` and tmux ttys compare equal.
pub fn normalize_tty(tty: &str) -> &str {
    tty.strip_prefix("/dev/").unwrap_or(tty)
}

/// Label to show for a session: the resolved label, else the raw tty.
pub fn display_label(resolver: &dyn LabelResolver, tty: &str) -> String {
    resolver
        .label_for(tty)
        .unwrap_or_else(|| normalize_tty(tty).to_string())
}

// ============================================================================
// Activation
// ============================================================================

/// Brings the terminal of a session to the foreground.
#[async_trait]
pub trait TerminalActivator: Send + Sync {
    /// Activates the terminal attached to `tty`.
    ///
    /// Fire-and-forget: failures are logged, not returned.
    async fn activate(&self, tty: &str);
}

/// Activates panes by switching the tmux client.
#[derive(Debug, Clone)]
pub struct TmuxActivator {
    program: PathBuf,
}

impl TmuxActivator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_program(TMUX_PROGRAM)
    }

    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            return Err(TmuxError::CommandFailed {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn try_activate(&self, tty: &str) -> Result<bool, TmuxError> {
        let listing = self.run(&["list-panes", "-a", "-F", PANE_FORMAT]).await?;
        let labels = TmuxLabels::parse(&listing);
        let Some(pane) = labels.pane_for(tty) else {
            return Ok(false);
        };

        self.run(&["switch-client", "-t", pane.session_name()]).await?;
        self.run(&["select-window", "-t", pane.window_target()]).await?;
        self.run(&["select-pane", "-t", &pane.target]).await?;
        debug!(tty, target = %pane.target, "Activated tmux pane");
        Ok(true)
    }
}

impl Default for TmuxActivator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalActivator for TmuxActivator {
    async fn activate(&self, tty: &str) {
        match self.try_activate(tty).await {
            Ok(true) => {}
            Ok(false) => warn!(tty, "No tmux pane attached to terminal"),
            Err(e) => warn!(tty, error = %e, "Failed to activate terminal"),
        }
    }
}
