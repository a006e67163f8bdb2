//! Registry actor commands, errors, and published snapshots.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `Snapshot`: Immutable state published to subscribers
//!
//! All types are designed for async message passing and follow the panic-free policy.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use csm_core::{ProcessRecord, Session, SessionCounts, SessionMap, SessionState};
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Request-style commands carry a oneshot channel for the response.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Reconcile a process sample against the current sessions.
    ///
    /// Responds with the pids that completed (Running -> Done) in this sample.
    ApplySample {
        /// Target-command processes observed this tick
        records: Vec<ProcessRecord>,
        /// Channel to send newly completed pids
        respond_to: oneshot::Sender<Vec<u32>>,
    },

    /// Move every Done session back to Idle.
    ///
    /// Responds with the number of sessions acknowledged.
    AcknowledgeAll {
        /// Channel to send the acknowledged count
        respond_to: oneshot::Sender<usize>,
    },

    /// Move one Done session back to Idle.
    ///
    /// Responds with `false` if the pid is unknown or not Done.
    AcknowledgeOne {
        /// Process ID of the session
        pid: u32,
        /// Channel to send whether a session was acknowledged
        respond_to: oneshot::Sender<bool>,
    },

    /// Get the current state as a snapshot.
    GetSnapshot {
        /// Channel to send the snapshot
        respond_to: oneshot::Sender<Snapshot>,
    },

    /// Publish the current state unchanged.
    ///
    /// Fire-and-forget; used when a tick produced no sample.
    Republish {
        /// Reason recorded on the published snapshot
        reason: SnapshotReason,
    },

    /// Delayed attention clear scheduled by a trigger.
    ///
    /// Fire-and-forget; ignored unless `generation` is still current.
    ExpireAttention {
        /// Generation returned by the trigger that scheduled this clear
        generation: u64,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The command or response channel was closed.
    ///
    /// This typically indicates the actor was shut down.
    #[error("registry channel closed")]
    ChannelClosed,
}

// ============================================================================
// Snapshots
// ============================================================================

/// Why a snapshot was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    /// A process sample was applied.
    Sampled,

    /// Sampling failed; sessions are unchanged.
    SampleFailed,

    /// One or more sessions were acknowledged.
    Acknowledged,

    /// The attention signal timed out.
    AttentionExpired,

    /// A consumer asked for the current state.
    Requested,
}

impl fmt::Display for SnapshotReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sampled => write!(f, "sample applied"),
            Self::SampleFailed => write!(f, "sample failed"),
            Self::Acknowledged => write!(f, "sessions acknowledged"),
            Self::AttentionExpired => write!(f, "attention expired"),
            Self::Requested => write!(f, "requested"),
        }
    }
}

/// Immutable view of the registry at one instant.
///
/// The session map is shared, so cloning a snapshot is cheap and consumers
/// never observe a partially applied update.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Live sessions in pid order
    pub sessions: Arc<SessionMap>,
    /// Whether the attention signal is raised
    pub attention: bool,
    /// Pids that completed in the sample behind this snapshot
    pub newly_completed: Vec<u32>,
    /// What caused this snapshot
    pub reason: SnapshotReason,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Per-state counts.
    pub fn counts(&self) -> SessionCounts {
        SessionCounts::from_sessions(&self.sessions)
    }

    /// Sessions in pid order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Looks up one session.
    pub fn session(&self, pid: u32) -> Option<&Session> {
        self.sessions.get(&pid)
    }

    /// Pids of sessions awaiting acknowledgment.
    pub fn done_pids(&self) -> Vec<u32> {
        self.sessions()
            .filter(|s| s.state == SessionState::Done)
            .map(|s| s.pid)
            .collect()
    }

    /// True if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        assert_eq!(
            RegistryError::ChannelClosed.to_string(),
            "registry channel closed"
        );
    }

    #[test]
    fn test_snapshot_reason_display() {
        assert_eq!(SnapshotReason::Sampled.to_string(), "sample applied");
        assert_eq!(SnapshotReason::SampleFailed.to_string(), "sample failed");
        assert_eq!(
            SnapshotReason::Acknowledged.to_string(),
            "sessions acknowledged"
        );
        assert_eq!(
            SnapshotReason::AttentionExpired.to_string(),
            "attention expired"
        );
        assert_eq!(SnapshotReason::Requested.to_string(), "requested");
    }

    #[test]
    fn test_snapshot_helpers() {
        let now = Utc::now();
        let mut sessions = SessionMap::new();
        for (pid, state) in [
            (3, SessionState::Done),
            (1, SessionState::Running),
            (2, SessionState::Done),
        ] {
            let record = ProcessRecord::new(pid, 0.0, "ttys001", "claude");
            sessions.insert(pid, Session::observed(&record, state, now));
        }

        let snapshot = Snapshot {
            sessions: Arc::new(sessions),
            attention: true,
            newly_completed: vec![2],
            reason: SnapshotReason::Sampled,
            taken_at: now,
        };

        assert_eq!(snapshot.done_pids(), vec![2, 3]);
        assert_eq!(snapshot.counts().done, 2);
        assert_eq!(snapshot.counts().running, 1);
        assert!(snapshot.session(1).is_some());
        assert!(snapshot.session(9).is_none());
        assert!(!snapshot.is_empty());

        // Clones share the session map.
        let cloned = snapshot.clone();
        assert!(Arc::ptr_eq(&cloned.sessions, &snapshot.sessions));
    }

    #[tokio::test]
    async fn test_command_oneshot_pattern() {
        let (tx, rx) = oneshot::channel::<Vec<u32>>();

        tokio::spawn(async move {
            tx.send(vec![10]).ok();
        });

        assert_eq!(rx.await.unwrap(), vec![10]);
    }
}
