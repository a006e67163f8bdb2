//! Process sampling - reads the process table and keeps the target command.
//!
//! Two backends implement [`ProcessSource`]:
//! - [`PsSampler`] runs `ps -eo pid,pcpu,tty,comm` and parses its output
//! - [`SysinfoSampler`] queries the process table through `sysinfo`
//!
//! Both are blocking and must be called off the async runtime (the poll
//! scheduler uses `spawn_blocking`).
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Malformed output lines are skipped, never fatal

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use csm_core::ProcessRecord;
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, trace};

/// Program used by [`PsSampler`] unless overridden.
pub const PS_PROGRAM: &str = "ps";

/// Column selection passed to `ps`.
pub const PS_ARGS: [&str; 2] = ["-eo", "pid,pcpu,tty,comm"];

/// Placeholder tty for processes without a controlling terminal.
pub const NO_TTY: &str = "??";

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while sampling the process table.
#[derive(Debug, Error)]
pub enum SampleError {
    /// The listing program could not be started.
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The listing program exited unsuccessfully.
    #[error("{program} exited with status {code:?}")]
    ExitStatus { program: String, code: Option<i32> },

    /// The blocking sampling task failed to complete.
    #[error("sampling task failed: {0}")]
    TaskFailed(String),
}

// ============================================================================
// Command Filter
// ============================================================================

/// Decides which process records belong to the target command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFilter {
    target: String,
    gui_marker: String,
}

impl CommandFilter {
    /// Creates a filter for `target` that rejects commands containing
    /// `gui_marker`. An empty marker rejects nothing.
    pub fn new(target: impl Into<String>, gui_marker: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            gui_marker: gui_marker.into(),
        }
    }

    /// The command basename this filter keeps.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns true if `record` runs the target command and is not the GUI
    /// variant.
    #[must_use]
    pub fn matches(&self, record: &ProcessRecord) -> bool {
        if record.command_name() != self.target {
            return false;
        }
        self.gui_marker.is_empty() || !record.command.contains(&self.gui_marker)
    }

    /// Keeps only matching records.
    pub fn apply(&self, records: Vec<ProcessRecord>) -> Vec<ProcessRecord> {
        records.into_iter().filter(|r| self.matches(r)).collect()
    }
}

// ============================================================================
// Process Source
// ============================================================================

/// A blocking reader of the process table.
pub trait ProcessSource: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Returns the target-command processes currently running.
    ///
    /// # Errors
    ///
    /// Returns `SampleError` if the process table could not be read at all.
    fn sample(&self) -> Result<Vec<ProcessRecord>, SampleError>;
}

// ============================================================================
// ps Backend
// ============================================================================

/// Samples by running `ps` and parsing its tabular output.
#[derive(Debug, Clone)]
pub struct PsSampler {
    program: PathBuf,
    filter: CommandFilter,
}

impl PsSampler {
    #[must_use]
    pub fn new(filter: CommandFilter) -> Self {
        Self::with_program(PS_PROGRAM, filter)
    }

    /// Uses a different listing program (which must accept `ps` arguments).
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>, filter: CommandFilter) -> Self {
        Self {
            program: program.into(),
            filter,
        }
    }
}

impl ProcessSource for PsSampler {
    fn name(&self) -> &'static str {
        "ps"
    }

    fn sample(&self) -> Result<Vec<ProcessRecord>, SampleError> {
        let program = self.program.display().to_string();
        let output = Command::new(&self.program)
            .args(PS_ARGS)
            .output()
            .map_err(|source| SampleError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SampleError::ExitStatus {
                program,
                code: output.status.code(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let records = self.filter.apply(parse_ps_output(&stdout));
        trace!(count = records.len(), "ps sample parsed");
        Ok(records)
    }
}

/// Parses `ps -o pid,pcpu,tty,comm` output into records.
///
/// The first line is a header and is skipped. Each other line holds at most
/// four whitespace-separated fields, the last (command) taking the rest of
/// the line. Lines with fewer fields or an unparsable pid/cpu are dropped.
pub fn parse_ps_output(output: &str) -> Vec<ProcessRecord> {
    output.lines().skip(1).filter_map(parse_ps_line).collect()
}

fn parse_ps_line(line: &str) -> Option<ProcessRecord> {
    let (pid, rest) = take_field(line)?;
    let (cpu, rest) = take_field(rest)?;
    let (tty, rest) = take_field(rest)?;
    let command = rest.trim();
    if command.is_empty() {
        return None;
    }

    let Ok(pid) = pid.parse::<u32>() else {
        trace!(line, "Skipping ps line with bad pid");
        return None;
    };
    // Some locales print the decimal separator as a comma.
    let Ok(cpu) = cpu.replace(',', ".").parse::<f32>() else {
        trace!(line, "Skipping ps line with bad cpu");
        return None;
    };

    Some(ProcessRecord::new(pid, cpu, tty, command))
}

/// Splits off the first whitespace-delimited field; `None` if no whitespace
/// follows it.
fn take_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    let end = s.find(char::is_whitespace)?;
    Some(s.split_at(end))
}

// ============================================================================
// sysinfo Backend
// ============================================================================

/// Samples through the `sysinfo` crate instead of spawning `ps`.
///
/// CPU usage is computed between consecutive refreshes, so the first sample
/// reports 0% for every process. The tty is read from the `/proc/<pid>/fd/0`
/// link where available and is `??` otherwise.
pub struct SysinfoSampler {
    system: Mutex<System>,
    filter: CommandFilter,
}

impl SysinfoSampler {
    #[must_use]
    pub fn new(filter: CommandFilter) -> Self {
        Self {
            system: Mutex::new(System::new()),
            filter,
        }
    }
}

impl ProcessSource for SysinfoSampler {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    fn sample(&self) -> Result<Vec<ProcessRecord>, SampleError> {
        // A poisoned lock only means an earlier sample panicked mid-refresh;
        // the next refresh overwrites whatever it left behind.
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // refresh_all() is required for CPU calculation to work
        system.refresh_all();

        let records: Vec<ProcessRecord> = system
            .processes()
            .iter()
            .map(|(pid, process)| {
                let name = process.name().to_string_lossy().into_owned();
                // Prefer the executable path when it names the same program,
                // so GUI bundles are visible to the marker check.
                let command = match process.exe() {
                    Some(exe)
                        if exe
                            .file_name()
                            .is_some_and(|f| f.to_string_lossy() == name.as_str()) =>
                    {
                        exe.display().to_string()
                    }
                    _ => name,
                };
                let pid = pid.as_u32();
                ProcessRecord::new(pid, process.cpu_usage(), tty_for_pid(pid), command)
            })
            .collect();

        let records = self.filter.apply(records);
        debug!(count = records.len(), "sysinfo sample collected");
        Ok(records)
    }
}

/// Resolves a process's terminal from its stdin link under `/proc`.
fn tty_for_pid(pid: u32) -> String {
    let link = Path::new("/proc").join(pid.to_string()).join("fd").join("0");
    match fs::read_link(&link) {
        Ok(target) => normalize_tty_path(&target),
        Err(_) => NO_TTY.to_string(),
    }
}

/// Turns `/dev/pts/3` into `pts/3`; non-terminal targets become `??`.
fn normalize_tty_path(target: &Path) -> String {
    match target.strip_prefix("/dev") {
        Ok(rest) if rest.starts_with("pts") || rest.to_string_lossy().starts_with("tty") => {
            rest.display().to_string()
        }
        _ => NO_TTY.to_string(),
    }
}
