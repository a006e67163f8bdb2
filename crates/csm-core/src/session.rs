//! Session domain entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Process Record
// ============================================================================

/// One row of the process table, as produced by a sampler.
///
/// Records are ephemeral: they are consumed by [`crate::reconcile`] and
/// never retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Process ID
    pub pid: u32,
    /// CPU utilization in percent; may exceed 100 on multi-core hosts
    pub cpu_percent: f32,
    /// Controlling terminal device name (e.g. "ttys001", "pts/3", "??")
    pub tty: String,
    /// Raw command string; may contain spaces
    pub command: String,
}

impl ProcessRecord {
    pub fn new(
        pid: u32,
        cpu_percent: f32,
        tty: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            pid,
            cpu_percent,
            tty: tty.into(),
            command: command.into(),
        }
    }

    /// Returns the last path component of the command.
    ///
    /// `/usr/local/bin/claude` yields `claude`; a bare name is returned as is.
    #[must_use]
    pub fn command_name(&self) -> &str {
        let trimmed = self.command.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Activity state of a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for the user; cpu at or below the running threshold.
    #[default]
    Idle,

    /// Actively computing; cpu above the running threshold.
    Running,

    /// Finished work after running, not yet acknowledged.
    Done,
}

impl SessionState {
    /// Returns the display label for this state.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Done => "done",
        }
    }

    /// Returns the ASCII icon for this state.
    #[must_use]
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Idle => "-",
            Self::Running => ">",
            Self::Done => "!",
        }
    }

    /// Returns true if the session completed work and awaits acknowledgment.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Done => write!(f, "Done"),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A tracked instance of the target command, keyed by pid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Process ID (session identity)
    pub pid: u32,
    /// Terminal device from the latest sample
    pub tty: String,
    /// CPU utilization from the latest sample
    pub cpu_percent: f32,
    /// Current activity state
    pub state: SessionState,
    /// When `state` last changed (or when the session was first seen)
    pub last_state_change: DateTime<Utc>,
    /// Basename of the command the session runs
    pub command_name: String,
}

impl Session {
    /// Creates a session for a freshly observed process.
    pub fn observed(record: &ProcessRecord, state: SessionState, now: DateTime<Utc>) -> Self {
        Self {
            pid: record.pid,
            tty: record.tty.clone(),
            cpu_percent: record.cpu_percent,
            state,
            last_state_change: now,
            command_name: record.command_name().to_string(),
        }
    }

    /// Moves the session to `state`, stamping the change time.
    ///
    /// Returns false (and leaves the timestamp alone) if already in `state`.
    pub fn transition_to(&mut self, state: SessionState, now: DateTime<Utc>) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.last_state_change = now;
        true
    }

    /// Clears a Done session back to Idle.
    ///
    /// Returns true if the session was Done.
    pub fn acknowledge(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != SessionState::Done {
            return false;
        }
        self.transition_to(SessionState::Idle, now)
    }

    /// Time spent in the current state as of `now`.
    #[must_use]
    pub fn time_in_state(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_state_change)
    }
}

/// All live sessions, enumerated in pid order.
pub type SessionMap = BTreeMap<u32, Session>;

// ============================================================================
// Aggregate Counts
// ============================================================================

/// Per-state session counts for summary displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCounts {
    pub idle: usize,
    pub running: usize,
    pub done: usize,
}

impl SessionCounts {
    /// Tallies the sessions in `sessions`.
    pub fn from_sessions(sessions: &SessionMap) -> Self {
        sessions
            .values()
            .fold(Self::default(), |mut counts, session| {
                match session.state {
                    SessionState::Idle => counts.idle += 1,
                    SessionState::Running => counts.running += 1,
                    SessionState::Done => counts.done += 1,
                }
                counts
            })
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.idle + self.running + self.done
    }
}

impl fmt::Display for SessionCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} running, {} idle, {} done",
            self.running, self.idle, self.done
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32, cpu: f32) -> ProcessRecord {
        ProcessRecord::new(pid, cpu, "ttys001", "/usr/local/bin/claude")
    }

    #[test]
    fn test_command_name_strips_directories() {
        assert_eq!(record(1, 0.0).command_name(), "claude");
        assert_eq!(ProcessRecord::new(1, 0.0, "??", "claude").command_name(), "claude");
        assert_eq!(
            ProcessRecord::new(1, 0.0, "??", "/opt/My Tools/claude").command_name(),
            "claude"
        );
    }

    #[test]
    fn test_session_state_labels() {
        assert_eq!(SessionState::Idle.label(), "idle");
        assert_eq!(SessionState::Running.label(), "running");
        assert_eq!(SessionState::Done.label(), "done");
        assert_eq!(SessionState::Done.to_string(), "Done");
        assert!(SessionState::Done.needs_attention());
        assert!(!SessionState::Running.needs_attention());
        assert_eq!(SessionState::default(), SessionState::Idle);
    }

    #[test]
    fn test_session_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn test_transition_to_stamps_only_on_change() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(2);
        let mut session = Session::observed(&record(7, 9.0), SessionState::Running, t0);

        assert!(!session.transition_to(SessionState::Running, t1));
        assert_eq!(session.last_state_change, t0);

        assert!(session.transition_to(SessionState::Done, t1));
        assert_eq!(session.last_state_change, t1);
        assert_eq!(session.time_in_state(t1), chrono::Duration::zero());
    }

    #[test]
    fn test_acknowledge_only_clears_done() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);

        let mut running = Session::observed(&record(1, 9.0), SessionState::Running, t0);
        assert!(!running.acknowledge(t1));
        assert_eq!(running.state, SessionState::Running);

        let mut done = Session::observed(&record(2, 0.0), SessionState::Done, t0);
        assert!(done.acknowledge(t1));
        assert_eq!(done.state, SessionState::Idle);
        assert_eq!(done.last_state_change, t1);
    }

    #[test]
    fn test_session_counts() {
        let now = Utc::now();
        let mut sessions = SessionMap::new();
        sessions.insert(1, Session::observed(&record(1, 0.0), SessionState::Idle, now));
        sessions.insert(2, Session::observed(&record(2, 9.0), SessionState::Running, now));
        sessions.insert(3, Session::observed(&record(3, 9.0), SessionState::Running, now));
        sessions.insert(4, Session::observed(&record(4, 0.0), SessionState::Done, now));

        let counts = SessionCounts::from_sessions(&sessions);
        assert_eq!(
            counts,
            SessionCounts {
                idle: 1,
                running: 2,
                done: 1
            }
        );
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.to_string(), "2 running, 1 idle, 1 done");
    }
}
