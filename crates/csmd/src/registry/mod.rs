//! Session registry using Actor pattern.
//!
//! The registry is the single owner of session state. It receives commands
//! via a tokio mpsc channel, applies them one at a time, and publishes an
//! immutable snapshot after every change.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │  PollScheduler  │────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! │  UI (acks)      │     │                 │     │                  │
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │    ▲                   │
//!         │   RegistryCommand     │    │ ExpireAttention   │   Snapshot
//!         │   (mpsc channel)      │    │ (timer task)      │   (broadcast)
//!         ▼                       ▼    │                   ▼
//!    ApplySample /          BTreeMap<u32, Session>    All consumers
//!    Acknowledge            + AttentionSignal         receive state
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, RegistrySettings, DEFAULT_ATTENTION_CLEAR};
pub use commands::{RegistryCommand, RegistryError, Snapshot, SnapshotReason};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawn the registry actor and return a handle for interaction.
///
/// This function:
/// 1. Creates command and snapshot channels
/// 2. Spawns the RegistryActor on a tokio task
/// 3. Returns a RegistryHandle for client use
///
/// The actor stops once every handle has been dropped.
///
/// # Example
///
/// ```no_run
/// use csmd::registry::{spawn_registry, RegistrySettings};
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(RegistrySettings::default());
///
///     let snapshot = handle.snapshot().await;
/// }
/// ```
pub fn spawn_registry(settings: RegistrySettings) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, cmd_tx.downgrade(), event_tx.clone(), settings);
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}
