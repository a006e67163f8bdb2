//! Poll scheduler - samples the process table on a fixed interval.
//!
//! Each tick runs the [`ProcessSource`] on tokio's blocking pool and hands
//! the records to the registry, which reconciles them and publishes a
//! snapshot. The first tick fires immediately; missed ticks are delayed
//! rather than bursted.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failed or panicked sample republishes the unchanged state instead of ending the loop

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{RegistryError, RegistryHandle, SnapshotReason};
use crate::sampler::{ProcessSource, SampleError};

/// Default time between samples.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Intervals shorter than this are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a single poll.
#[derive(Debug)]
pub enum TickOutcome {
    /// The sample reached the registry.
    Applied {
        /// Target-command processes seen
        observed: usize,
        /// Pids that went Running -> Done
        completed: Vec<u32>,
    },

    /// Sampling failed; sessions were left untouched and republished.
    Skipped(SampleError),
}

/// Samples once and applies the result.
///
/// Sampling failures are logged and reported as [`TickOutcome::Skipped`];
/// they are not errors. Either way subscribers receive a snapshot for the
/// tick.
///
/// # Errors
///
/// Returns `RegistryError::ChannelClosed` if the registry actor is gone.
pub async fn poll_once(
    source: &Arc<dyn ProcessSource>,
    registry: &RegistryHandle,
) -> Result<TickOutcome, RegistryError> {
    let sampler = Arc::clone(source);
    let sampled = tokio::task::spawn_blocking(move || sampler.sample())
        .await
        .map_err(|e| SampleError::TaskFailed(e.to_string()))
        .and_then(|result| result);

    match sampled {
        Ok(records) => {
            let observed = records.len();
            let completed = registry.apply_sample(records).await?;
            Ok(TickOutcome::Applied {
                observed,
                completed,
            })
        }
        Err(e) => {
            warn!(
                backend = source.name(),
                error = %e,
                "Process sample failed, republishing unchanged state"
            );
            registry.republish(SnapshotReason::SampleFailed).await?;
            Ok(TickOutcome::Skipped(e))
        }
    }
}

// ============================================================================
// Poll Scheduler
// ============================================================================

/// Handle to the background polling task.
///
/// Dropping the scheduler cancels the task.
pub struct PollScheduler {
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollScheduler {
    /// Spawns the polling loop.
    ///
    /// # Arguments
    ///
    /// * `source` - Process table reader, called on the blocking pool
    /// * `registry` - Registry that receives every sample
    /// * `period` - Time between ticks (at least [`MIN_POLL_INTERVAL`])
    /// * `cancel_token` - Token for graceful shutdown
    pub fn spawn(
        source: Arc<dyn ProcessSource>,
        registry: RegistryHandle,
        period: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        let period = period.max(MIN_POLL_INTERVAL);
        let task = tokio::spawn(run_loop(source, registry, period, cancel_token.clone()));

        Self {
            cancel_token,
            task: Some(task),
        }
    }

    /// Returns true once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancels the loop and waits for it to exit.
    ///
    /// A sample still running on the blocking pool is abandoned; its result
    /// is discarded.
    pub async fn stop(mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Poll task ended abnormally");
            }
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn run_loop(
    source: Arc<dyn ProcessSource>,
    registry: RegistryHandle,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        backend = source.name(),
        interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
        "Poll scheduler started"
    );

    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                info!("Poll scheduler shutting down");
                break;
            }

            _ = tick.tick() => {}
        }

        let outcome = tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                info!("Poll scheduler shutting down mid-sample");
                break;
            }

            outcome = poll_once(&source, &registry) => outcome,
        };

        match outcome {
            Ok(TickOutcome::Applied {
                observed,
                completed,
            }) => {
                debug!(observed, completed = completed.len(), "Poll tick applied");
            }
            Ok(TickOutcome::Skipped(_)) => {}
            Err(RegistryError::ChannelClosed) => {
                info!("Registry closed, poll scheduler stopping");
                break;
            }
        }
    }

    debug!("Poll scheduler task completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{spawn_registry, RegistrySettings};
    use csm_core::{ProcessRecord, SessionState};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::{broadcast, mpsc};
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    /// Returns scripted results in order, then empty samples.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<ProcessRecord>, SampleError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<ProcessRecord>, SampleError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ProcessSource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn sample(&self) -> Result<Vec<ProcessRecord>, SampleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct PanickingSource;

    impl ProcessSource for PanickingSource {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn sample(&self) -> Result<Vec<ProcessRecord>, SampleError> {
            panic!("sampler blew up");
        }
    }

    fn rec(pid: u32, cpu: f32) -> ProcessRecord {
        ProcessRecord::new(pid, cpu, "ttys001", "claude")
    }

    fn failure() -> SampleError {
        SampleError::ExitStatus {
            program: "ps".to_string(),
            code: Some(1),
        }
    }

    #[tokio::test]
    async fn test_poll_once_applies_sample() {
        let registry = spawn_registry(RegistrySettings::default());
        let source: Arc<dyn ProcessSource> = ScriptedSource::new(vec![Ok(vec![rec(5, 9.0)])]);

        let outcome = poll_once(&source, &registry).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Applied { observed: 1, .. }));

        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.sessions[&5].state, SessionState::Running);
    }

    #[tokio::test]
    async fn test_poll_once_failure_leaves_sessions() {
        let registry = spawn_registry(RegistrySettings::default());
        let mut events = registry.subscribe();
        let source: Arc<dyn ProcessSource> =
            ScriptedSource::new(vec![Ok(vec![rec(5, 9.0)]), Err(failure())]);

        poll_once(&source, &registry).await.unwrap();
        let applied = events.recv().await.unwrap();
        assert_eq!(applied.reason, SnapshotReason::Sampled);

        let outcome = poll_once(&source, &registry).await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Skipped(SampleError::ExitStatus { .. })
        ));

        // A failed sample is not an empty sample: the session survives.
        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.sessions[&5].state, SessionState::Running);

        // The failed tick still publishes the unchanged state.
        let republished = events.recv().await.unwrap();
        assert_eq!(republished.reason, SnapshotReason::SampleFailed);
        assert!(Arc::ptr_eq(&republished.sessions, &applied.sessions));
    }

    #[tokio::test]
    async fn test_poll_once_failure_publishes_with_no_sessions() {
        let registry = spawn_registry(RegistrySettings::default());
        let mut events = registry.subscribe();
        let source: Arc<dyn ProcessSource> = ScriptedSource::new(vec![Err(
            SampleError::TaskFailed("join error".to_string()),
        )]);

        poll_once(&source, &registry).await.unwrap();

        // Queued behind the republish, so the snapshot is already out.
        registry.snapshot().await.unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.reason, SnapshotReason::SampleFailed);
        assert!(event.is_empty());
        assert!(!event.attention);
    }

    #[tokio::test]
    async fn test_poll_once_panicking_sampler_is_skipped() {
        let registry = spawn_registry(RegistrySettings::default());
        let source: Arc<dyn ProcessSource> = Arc::new(PanickingSource);

        let outcome = poll_once(&source, &registry).await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Skipped(SampleError::TaskFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_poll_once_registry_gone() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (event_tx, _) = broadcast::channel(4);
        let registry = RegistryHandle::new(cmd_tx, event_tx);
        drop(cmd_rx);

        let source: Arc<dyn ProcessSource> = ScriptedSource::new(vec![]);
        let result = poll_once(&source, &registry).await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_first_tick_is_immediate() {
        let registry = spawn_registry(RegistrySettings::default());
        let mut events = registry.subscribe();
        let source = ScriptedSource::new(vec![Ok(vec![rec(1, 0.0)])]);

        let scheduler = PollScheduler::spawn(
            source.clone(),
            registry.clone(),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );

        let snapshot = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(snapshot.reason, SnapshotReason::Sampled);
        assert!(snapshot.session(1).is_some());
        assert_eq!(source.calls(), 1);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_failed_tick_publishes_unchanged_state() {
        let registry = spawn_registry(RegistrySettings::default());
        let mut events = registry.subscribe();
        let source = ScriptedSource::new(vec![Err(failure()), Ok(vec![rec(7, 9.0)])]);

        let scheduler = PollScheduler::spawn(
            source.clone(),
            registry.clone(),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        let failed = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(failed.reason, SnapshotReason::SampleFailed);
        assert!(failed.is_empty());

        let applied = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(applied.reason, SnapshotReason::Sampled);
        assert_eq!(applied.sessions[&7].state, SessionState::Running);
        assert!(source.calls() >= 2);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_halts_ticks() {
        let registry = spawn_registry(RegistrySettings::default());
        let mut events = registry.subscribe();
        let source = ScriptedSource::new(vec![]);
        let token = CancellationToken::new();

        let scheduler = PollScheduler::spawn(
            source.clone(),
            registry.clone(),
            Duration::from_millis(20),
            token.clone(),
        );
        timeout(WAIT, events.recv()).await.unwrap().unwrap();

        scheduler.stop().await;
        assert!(token.is_cancelled());

        let calls = source.calls();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls(), calls);
    }

    #[tokio::test]
    async fn test_external_cancel_stops_loop() {
        let registry = spawn_registry(RegistrySettings::default());
        let token = CancellationToken::new();
        let scheduler = PollScheduler::spawn(
            ScriptedSource::new(vec![]),
            registry,
            Duration::from_millis(20),
            token.clone(),
        );

        token.cancel();
        timeout(WAIT, async {
            while !scheduler.is_finished() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_loop_exits_when_registry_gone() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (event_tx, _) = broadcast::channel(4);
        drop(cmd_rx);

        let scheduler = PollScheduler::spawn(
            ScriptedSource::new(vec![]),
            RegistryHandle::new(cmd_tx, event_tx),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        timeout(WAIT, async {
            while !scheduler.is_finished() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_runs_without_subscribers() {
        let registry = spawn_registry(RegistrySettings::default());
        let source = ScriptedSource::new(vec![Ok(vec![rec(3, 9.0)])]);

        let scheduler = PollScheduler::spawn(
            source.clone(),
            registry.clone(),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        timeout(WAIT, async {
            while source.calls() < 3 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!scheduler.is_finished());
        scheduler.stop().await;
    }
}
