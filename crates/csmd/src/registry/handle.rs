//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to snapshots. It can be used from
//! any task; the actor serializes every request.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use tokio::sync::{broadcast, mpsc, oneshot};

use csm_core::ProcessRecord;

use super::commands::{RegistryCommand, RegistryError, Snapshot, SnapshotReason};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// # Usage
///
/// ```ignore
/// // Acknowledge a finished session from a UI task
/// handle.acknowledge_one(pid).await?;
///
/// // Subscribe to snapshots
/// let mut rx = handle.subscribe();
/// while let Ok(snapshot) = rx.recv().await {
///     render(&snapshot);
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Snapshot broadcaster for subscribing to updates
    event_sender: broadcast::Sender<Snapshot>,
}

impl RegistryHandle {
    /// Create a new registry handle.
    ///
    /// # Arguments
    ///
    /// * `sender` - The command channel sender for communicating with the actor
    /// * `event_sender` - The broadcast sender for subscribing to snapshots
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<Snapshot>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Apply one process sample.
    ///
    /// Returns the pids that went Running -> Done in this sample.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn apply_sample(
        &self,
        records: Vec<ProcessRecord>,
    ) -> Result<Vec<u32>, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::ApplySample {
                records,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Acknowledge every Done session.
    ///
    /// Returns how many sessions were moved back to Idle.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn acknowledge_all(&self) -> Result<usize, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::AcknowledgeAll { respond_to: tx })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Acknowledge one Done session.
    ///
    /// Returns `false` if no Done session has this pid (not an error).
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn acknowledge_one(&self, pid: u32) -> Result<bool, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::AcknowledgeOne {
                pid,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Publish the current state to subscribers without changing it.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn republish(&self, reason: SnapshotReason) -> Result<(), RegistryError> {
        self.sender
            .send(RegistryCommand::Republish { reason })
            .await
            .map_err(|_| RegistryError::ChannelClosed)
    }

    /// Get the current state.
    ///
    /// Returns `None` if communication with the actor fails.
    pub async fn snapshot(&self) -> Option<Snapshot> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::GetSnapshot { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Subscribe to snapshots.
    ///
    /// The receiver gets a snapshot after every poll tick (applied or
    /// failed), acknowledgment and attention expiry.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.event_sender.subscribe()
    }

    /// Check if the actor is still running.
    ///
    /// Returns `true` if the command channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
