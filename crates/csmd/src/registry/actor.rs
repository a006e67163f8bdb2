//! Registry actor - owns all session state and processes commands.
//!
//! The RegistryActor is the single owner of the session map and the
//! attention signal. Poll results, acknowledgments and attention expiries all
//! arrive as commands on one mpsc channel and are applied in order, so no
//! locking is needed. After every mutation the actor publishes a
//! [`Snapshot`] via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel send failures are ignored (subscribers and requesters may leave)

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use csm_core::{reconcile, AttentionSignal, ProcessRecord, SessionMap, SessionState, Thresholds};

use super::commands::{RegistryCommand, Snapshot, SnapshotReason};

/// Default delay before a raised attention signal clears itself.
pub const DEFAULT_ATTENTION_CLEAR: Duration = Duration::from_secs(5);

// ============================================================================
// Settings
// ============================================================================

/// Tunables for the registry actor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrySettings {
    /// CPU thresholds for state transitions
    pub thresholds: Thresholds,
    /// How long the attention signal stays raised after the latest completion
    pub attention_clear: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            attention_clear: DEFAULT_ATTENTION_CLEAR,
        }
    }
}

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all session state.
///
/// # Ownership
///
/// The actor owns:
/// - `sessions`: the live session map, shared copy-on-write with snapshots
/// - `attention`: the attention signal and its generation counter
/// - `attention_timer`: the pending delayed clear, if any
///
/// # Attention Timer
///
/// Each completion bumps the signal's generation, aborts the previous timer
/// task and spawns a new one that sleeps `attention_clear` and then sends
/// `ExpireAttention { generation }` back through the command channel. The
/// timer holds only a weak sender, so it never keeps the actor alive.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Weak handle to our own command channel, for delayed self-messages
    self_sender: mpsc::WeakSender<RegistryCommand>,

    /// Live sessions; snapshots hold clones of this `Arc`
    sessions: Arc<SessionMap>,

    attention: AttentionSignal,

    attention_timer: Option<JoinHandle<()>>,

    settings: RegistrySettings,

    /// Snapshot publisher for subscribers
    event_publisher: broadcast::Sender<Snapshot>,
}

impl RegistryActor {
    /// Creates a new registry actor.
    ///
    /// # Arguments
    ///
    /// * `receiver` - Channel for receiving commands
    /// * `self_sender` - Weak sender to the same channel, for timer messages
    /// * `event_publisher` - Broadcast channel for publishing snapshots
    /// * `settings` - Thresholds and attention delay
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        self_sender: mpsc::WeakSender<RegistryCommand>,
        event_publisher: broadcast::Sender<Snapshot>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            receiver,
            self_sender,
            sessions: Arc::new(SessionMap::new()),
            attention: AttentionSignal::new(),
            attention_timer: None,
            settings,
            event_publisher,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all senders dropped).
    /// This is the main entry point - call this in a spawned task.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        if let Some(timer) = self.attention_timer.take() {
            timer.abort();
        }

        info!(sessions = self.sessions.len(), "Registry actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::ApplySample {
                records,
                respond_to,
            } => {
                let completed = self.handle_apply_sample(records);
                // Ignore send error - caller may have dropped the receiver
                let _ = respond_to.send(completed);
            }
            RegistryCommand::AcknowledgeAll { respond_to } => {
                let count = self.handle_acknowledge_all();
                let _ = respond_to.send(count);
            }
            RegistryCommand::AcknowledgeOne { pid, respond_to } => {
                let acknowledged = self.handle_acknowledge_one(pid);
                let _ = respond_to.send(acknowledged);
            }
            RegistryCommand::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot(SnapshotReason::Requested, Vec::new()));
            }
            RegistryCommand::Republish { reason } => {
                debug!(%reason, "Republishing current state");
                self.publish(reason, Vec::new());
            }
            RegistryCommand::ExpireAttention { generation } => {
                self.handle_expire_attention(generation);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Reconciles a sample, raises attention per completion and publishes.
    fn handle_apply_sample(&mut self, records: Vec<ProcessRecord>) -> Vec<u32> {
        let now = Utc::now();
        let result = reconcile(&self.sessions, &records, now, &self.settings.thresholds);

        let dropped = self
            .sessions
            .keys()
            .filter(|pid| !result.sessions.contains_key(*pid))
            .count();
        self.sessions = Arc::new(result.sessions);

        for &pid in &result.newly_completed {
            info!(pid, "Session finished, raising attention");
            self.trigger_attention();
        }

        debug!(
            observed = records.len(),
            sessions = self.sessions.len(),
            dropped,
            completed = result.newly_completed.len(),
            attention = self.attention.is_raised(),
            "Sample applied"
        );

        self.publish(SnapshotReason::Sampled, result.newly_completed.clone());
        result.newly_completed
    }

    /// Acknowledges every Done session.
    ///
    /// Clears the attention signal (no Done sessions remain afterwards) and
    /// publishes if anything changed.
    fn handle_acknowledge_all(&mut self) -> usize {
        let now = Utc::now();
        let has_done = self
            .sessions
            .values()
            .any(|s| s.state == SessionState::Done);

        let count = if has_done {
            Arc::make_mut(&mut self.sessions)
                .values_mut()
                .map(|session| session.acknowledge(now))
                .filter(|acknowledged| *acknowledged)
                .count()
        } else {
            0
        };

        let cleared = self.attention.clear();
        if count > 0 || cleared {
            info!(count, "Sessions acknowledged");
            self.cancel_attention_timer();
            self.publish(SnapshotReason::Acknowledged, Vec::new());
        }
        count
    }

    /// Acknowledges one Done session.
    ///
    /// Unknown pids and sessions that are not Done are left alone. Clears the
    /// attention signal if this was the last Done session.
    fn handle_acknowledge_one(&mut self, pid: u32) -> bool {
        let is_done = self
            .sessions
            .get(&pid)
            .is_some_and(|s| s.state == SessionState::Done);
        if !is_done {
            debug!(pid, "Acknowledge ignored: no Done session with this pid");
            return false;
        }

        let now = Utc::now();
        let sessions = Arc::make_mut(&mut self.sessions);
        let acknowledged = sessions
            .get_mut(&pid)
            .is_some_and(|session| session.acknowledge(now));

        let any_done = sessions.values().any(|s| s.state == SessionState::Done);
        if !any_done && self.attention.clear() {
            self.cancel_attention_timer();
        }

        info!(pid, remaining_done = any_done, "Session acknowledged");
        self.publish(SnapshotReason::Acknowledged, Vec::new());
        acknowledged
    }

    /// Applies a delayed clear if it belongs to the latest trigger.
    fn handle_expire_attention(&mut self, generation: u64) {
        if self.attention.expire(generation) {
            debug!(generation, "Attention signal expired");
            self.attention_timer = None;
            self.publish(SnapshotReason::AttentionExpired, Vec::new());
        } else {
            debug!(
                generation,
                current = self.attention.generation(),
                "Stale attention expiry ignored"
            );
        }
    }

    // ========================================================================
    // Attention Timer
    // ========================================================================

    /// Raises the signal and (re)starts the auto-clear countdown.
    fn trigger_attention(&mut self) {
        let generation = self.attention.trigger();
        self.cancel_attention_timer();

        let weak = self.self_sender.clone();
        let delay = self.settings.attention_clear;
        self.attention_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(sender) = weak.upgrade() {
                // Fire-and-forget: the actor may be shutting down
                let _ = sender
                    .send(RegistryCommand::ExpireAttention { generation })
                    .await;
            }
        }));
    }

    fn cancel_attention_timer(&mut self) {
        if let Some(timer) = self.attention_timer.take() {
            timer.abort();
        }
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    fn snapshot(&self, reason: SnapshotReason, newly_completed: Vec<u32>) -> Snapshot {
        Snapshot {
            sessions: Arc::clone(&self.sessions),
            attention: self.attention.is_raised(),
            newly_completed,
            reason,
            taken_at: Utc::now(),
        }
    }

    /// Publishes a snapshot (ignored if there are no subscribers).
    fn publish(&self, reason: SnapshotReason, newly_completed: Vec<u32>) {
        let _ = self
            .event_publisher
            .send(self.snapshot(reason, newly_completed));
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    /// Returns the number of sessions currently tracked.
    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn attention_raised(&self) -> bool {
        self.attention.is_raised()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn rec(pid: u32, cpu: f32) -> ProcessRecord {
        ProcessRecord::new(pid, cpu, "ttys001", "claude")
    }

    fn create_actor() -> (
        mpsc::Sender<RegistryCommand>,
        RegistryActor,
        broadcast::Receiver<Snapshot>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(16);
        let actor = RegistryActor::new(
            cmd_rx,
            cmd_tx.downgrade(),
            event_tx,
            RegistrySettings::default(),
        );
        (cmd_tx, actor, event_rx)
    }

    fn apply(actor: &mut RegistryActor, records: Vec<ProcessRecord>) -> Vec<u32> {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::ApplySample {
            records,
            respond_to: tx,
        });
        rx.try_recv().unwrap()
    }

    fn snapshot(actor: &mut RegistryActor) -> Snapshot {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::GetSnapshot { respond_to: tx });
        rx.try_recv().unwrap()
    }

    fn ack_one(actor: &mut RegistryActor, pid: u32) -> bool {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::AcknowledgeOne {
            pid,
            respond_to: tx,
        });
        rx.try_recv().unwrap()
    }

    fn ack_all(actor: &mut RegistryActor) -> usize {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::AcknowledgeAll { respond_to: tx });
        rx.try_recv().unwrap()
    }

    #[tokio::test]
    async fn test_apply_sample_via_channel() {
        let (cmd_tx, mut actor, mut event_rx) = create_actor();

        let (respond_tx, respond_rx) = oneshot::channel();
        cmd_tx
            .send(RegistryCommand::ApplySample {
                records: vec![rec(10, 8.0)],
                respond_to: respond_tx,
            })
            .await
            .unwrap();

        // Process the command manually (actor not running in background)
        if let Some(cmd) = actor.receiver.recv().await {
            actor.handle_command(cmd);
        }

        assert!(respond_rx.await.unwrap().is_empty());
        assert_eq!(actor.session_count(), 1);

        let event = event_rx.try_recv().unwrap();
        assert_eq!(event.reason, SnapshotReason::Sampled);
        assert_eq!(event.sessions[&10].state, SessionState::Running);
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let (_cmd_tx, mut actor, _event_rx) = create_actor();

        assert!(apply(&mut actor, vec![rec(10, 8.0)]).is_empty());
        assert_eq!(snapshot(&mut actor).sessions[&10].state, SessionState::Running);

        assert_eq!(apply(&mut actor, vec![rec(10, 1.0)]), vec![10]);
        let snap = snapshot(&mut actor);
        assert_eq!(snap.sessions[&10].state, SessionState::Done);
        assert!(snap.attention);

        assert!(apply(&mut actor, vec![rec(10, 1.0)]).is_empty());
        assert_eq!(snapshot(&mut actor).sessions[&10].state, SessionState::Done);

        assert!(ack_one(&mut actor, 10));
        let snap = snapshot(&mut actor);
        assert_eq!(snap.sessions[&10].state, SessionState::Idle);
        assert!(!snap.attention);
    }

    #[tokio::test]
    async fn test_ack_one_leaves_other_sessions() {
        let (_cmd_tx, mut actor, _event_rx) = create_actor();

        apply(&mut actor, vec![rec(1, 9.0), rec(2, 9.0), rec(3, 9.0)]);
        assert_eq!(apply(&mut actor, vec![rec(1, 0.0), rec(2, 0.0), rec(3, 9.0)]), vec![1, 2]);

        assert!(ack_one(&mut actor, 1));
        let snap = snapshot(&mut actor);
        assert_eq!(snap.sessions[&1].state, SessionState::Idle);
        assert_eq!(snap.sessions[&2].state, SessionState::Done);
        assert_eq!(snap.sessions[&3].state, SessionState::Running);
        // Pid 2 is still Done, so attention stays up.
        assert!(snap.attention);

        assert!(ack_one(&mut actor, 2));
        assert!(!snapshot(&mut actor).attention);
    }

    #[tokio::test]
    async fn test_ack_unknown_or_not_done_is_noop() {
        let (_cmd_tx, mut actor, mut event_rx) = create_actor();

        apply(&mut actor, vec![rec(1, 9.0)]);
        let _ = event_rx.try_recv();

        assert!(!ack_one(&mut actor, 999));
        assert!(!ack_one(&mut actor, 1));
        assert!(event_rx.try_recv().is_err(), "no-op acks publish nothing");
        assert_eq!(snapshot(&mut actor).sessions[&1].state, SessionState::Running);
    }

    #[tokio::test]
    async fn test_ack_all() {
        let (_cmd_tx, mut actor, mut event_rx) = create_actor();

        apply(&mut actor, vec![rec(1, 9.0), rec(2, 9.0), rec(3, 0.0)]);
        apply(&mut actor, vec![rec(1, 0.0), rec(2, 0.0), rec(3, 0.0)]);
        assert!(actor.attention_raised());
        while event_rx.try_recv().is_ok() {}

        assert_eq!(ack_all(&mut actor), 2);
        let event = event_rx.try_recv().unwrap();
        assert_eq!(event.reason, SnapshotReason::Acknowledged);
        assert!(!event.attention);
        assert!(event.sessions.values().all(|s| s.state == SessionState::Idle));

        // Nothing left to acknowledge.
        assert_eq!(ack_all(&mut actor), 0);
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ack_all_clears_attention_after_done_session_exits() {
        let (_cmd_tx, mut actor, _event_rx) = create_actor();

        apply(&mut actor, vec![rec(1, 9.0)]);
        apply(&mut actor, vec![rec(1, 0.0)]);
        apply(&mut actor, vec![]);
        assert!(actor.attention_raised());

        assert_eq!(ack_all(&mut actor), 0);
        assert!(!actor.attention_raised());
    }

    #[tokio::test]
    async fn test_stale_expiry_ignored() {
        let (_cmd_tx, mut actor, mut event_rx) = create_actor();

        apply(&mut actor, vec![rec(1, 9.0), rec(2, 9.0)]);
        apply(&mut actor, vec![rec(1, 0.0), rec(2, 9.0)]);
        let first = actor.attention.generation();
        apply(&mut actor, vec![rec(1, 0.0), rec(2, 0.0)]);
        while event_rx.try_recv().is_ok() {}

        actor.handle_command(RegistryCommand::ExpireAttention { generation: first });
        assert!(actor.attention_raised());
        assert!(event_rx.try_recv().is_err());

        let current = actor.attention.generation();
        actor.handle_command(RegistryCommand::ExpireAttention { generation: current });
        assert!(!actor.attention_raised());
        let event = event_rx.try_recv().unwrap();
        assert_eq!(event.reason, SnapshotReason::AttentionExpired);
        assert!(!event.attention);
    }

    #[tokio::test]
    async fn test_republish_keeps_state() {
        let (_cmd_tx, mut actor, mut event_rx) = create_actor();

        apply(&mut actor, vec![rec(1, 9.0)]);
        apply(&mut actor, vec![rec(1, 0.0)]);
        while event_rx.try_recv().is_ok() {}

        actor.handle_command(RegistryCommand::Republish {
            reason: SnapshotReason::SampleFailed,
        });

        let event = event_rx.try_recv().unwrap();
        assert_eq!(event.reason, SnapshotReason::SampleFailed);
        assert_eq!(event.sessions[&1].state, SessionState::Done);
        assert!(event.attention);
        assert!(event.newly_completed.is_empty());
        assert_eq!(actor.session_count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_copy_on_write() {
        let (_cmd_tx, mut actor, _event_rx) = create_actor();

        apply(&mut actor, vec![rec(1, 9.0)]);
        apply(&mut actor, vec![rec(1, 0.0)]);
        let before = snapshot(&mut actor);

        ack_one(&mut actor, 1);
        assert_eq!(before.sessions[&1].state, SessionState::Done);
        assert_eq!(snapshot(&mut actor).sessions[&1].state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_process_exit_drops_session() {
        let (_cmd_tx, mut actor, _event_rx) = create_actor();

        apply(&mut actor, vec![rec(1, 9.0), rec(2, 0.0)]);
        assert_eq!(actor.session_count(), 2);
        apply(&mut actor, vec![rec(2, 0.0)]);
        assert_eq!(actor.session_count(), 1);
        assert!(snapshot(&mut actor).session(1).is_none());
    }
}
