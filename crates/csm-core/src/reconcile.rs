//! Session state machine.
//!
//! [`reconcile`] folds one process sample into the previous session map.
//! Each session moves through `Idle -> Running -> Done` driven by CPU
//! utilization, with two thresholds forming a hysteresis band:
//!
//! ```text
//!             cpu > running                cpu < idle
//!   ┌──────┐ ───────────────▶ ┌─────────┐ ───────────▶ ┌──────┐
//!   │ Idle │                  │ Running │              │ Done │
//!   └──────┘                  └─────────┘ ◀─────────── └──────┘
//!      ▲                                  cpu > running    │
//!      └───────────────────── acknowledge ─────────────────┘
//! ```
//!
//! Samples inside `[idle, running]` never cause a transition. Done is
//! sticky: only renewed activity or an explicit acknowledgment leaves it.
//!
//! Known accuracy boundary: a pid that exits and is reused by another
//! instance of the target command between two samples looks exactly like one
//! continuous session.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{DomainError, DomainResult};
use crate::session::{ProcessRecord, Session, SessionMap, SessionState};

/// CPU percentage above which a session counts as running.
pub const DEFAULT_RUNNING_THRESHOLD: f32 = 5.0;

/// CPU percentage below which a running session counts as done.
pub const DEFAULT_IDLE_THRESHOLD: f32 = 2.0;

// ============================================================================
// Thresholds
// ============================================================================

/// CPU thresholds for state transitions.
///
/// Invariant: `0 <= idle < running`, both finite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    running: f32,
    idle: f32,
}

impl Thresholds {
    /// Creates a validated threshold pair.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidThresholds` unless `0 <= idle < running`.
    pub fn new(running: f32, idle: f32) -> DomainResult<Self> {
        let valid = running.is_finite() && idle.is_finite() && idle >= 0.0 && idle < running;
        if !valid {
            return Err(DomainError::InvalidThresholds { running, idle });
        }
        Ok(Self { running, idle })
    }

    #[must_use]
    pub fn running(&self) -> f32 {
        self.running
    }

    #[must_use]
    pub fn idle(&self) -> f32 {
        self.idle
    }

    /// State of a session seen for the first time at `cpu`.
    ///
    /// Never Done: completion must be observed as a transition.
    #[must_use]
    pub fn initial_state(&self, cpu: f32) -> SessionState {
        if cpu > self.running {
            SessionState::Running
        } else {
            SessionState::Idle
        }
    }

    /// Next state for a session currently in `current` sampled at `cpu`.
    #[must_use]
    pub fn next_state(&self, current: SessionState, cpu: f32) -> SessionState {
        match current {
            SessionState::Idle if cpu > self.running => SessionState::Running,
            SessionState::Running if cpu < self.idle => SessionState::Done,
            SessionState::Done if cpu > self.running => SessionState::Running,
            unchanged => unchanged,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            running: DEFAULT_RUNNING_THRESHOLD,
            idle: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Result of folding one sample into the session map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reconciliation {
    /// Sessions alive in the sample, in pid order
    pub sessions: SessionMap,
    /// Pids that went Running -> Done in this sample, ascending
    pub newly_completed: Vec<u32>,
}

/// Reconciles a process sample against the previous session map.
///
/// - pids missing from `observed` are dropped
/// - known pids take the latest cpu/tty and follow the transition table
/// - unknown pids start as Running or Idle per their own cpu
///
/// If a pid appears more than once in `observed`, the last record wins.
pub fn reconcile(
    previous: &SessionMap,
    observed: &[ProcessRecord],
    now: DateTime<Utc>,
    thresholds: &Thresholds,
) -> Reconciliation {
    let latest: BTreeMap<u32, &ProcessRecord> =
        observed.iter().map(|record| (record.pid, record)).collect();

    let mut result = Reconciliation::default();

    for (&pid, record) in &latest {
        let session = match previous.get(&pid) {
            Some(known) => {
                let mut session = known.clone();
                session.cpu_percent = record.cpu_percent;
                session.tty = record.tty.clone();

                let from = session.state;
                let to = thresholds.next_state(from, record.cpu_percent);
                if session.transition_to(to, now) {
                    info!(
                        pid,
                        from = %from,
                        to = %to,
                        cpu = record.cpu_percent,
                        "Session state changed"
                    );
                    if from == SessionState::Running && to == SessionState::Done {
                        result.newly_completed.push(pid);
                    }
                }
                session
            }
            None => {
                let state = thresholds.initial_state(record.cpu_percent);
                info!(
                    pid,
                    tty = %record.tty,
                    state = %state,
                    cpu = record.cpu_percent,
                    "Session discovered"
                );
                Session::observed(record, state, now)
            }
        };
        result.sessions.insert(pid, session);
    }

    for pid in previous.keys().filter(|pid| !latest.contains_key(*pid)) {
        debug!(pid, "Session process gone, dropping");
    }

    result
}
