//! # Change Coordinator
//!
//! Turns bursts of hardware-change events into one settle-and-publish cycle
//! per task kind.
//!
//! ## State Machine (per kind)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │            change event                                                 │
//! │   ┌──────┐ (flag false→true) ┌─────────┐                                │
//! │   │ Idle │ ────────────────► │ Pending │ ◄── further events dropped     │
//! │   └──────┘                   └────┬────┘                                │
//! │       ▲                           │ sleep(delay)                        │
//! │       │                           ▼                                     │
//! │       │                    timeout(body.run())                          │
//! │       │                           │ ok / error / timeout                │
//! │       └───────────────────────────┘ (flag cleared)                      │
//! │                                                                         │
//! │  Kinds: Advertise, CloudSync. Independent, no ordering between them.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Task bodies run on their own Tokio task; the receive loop never awaits
//! them. A pending debounce is never cancelled, but once the coordinator is
//! [closed](ChangeCoordinator::close) a task whose delay elapses skips its
//! body and returns to idle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::local::DeviceEvent;

// =============================================================================
// Task Kind & State
// =============================================================================

/// Independent kinds of debounced work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Refresh the local mDNS announcement.
    Advertise,
    /// Push to and pull from the shared cloud directory.
    CloudSync,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Advertise => write!(f, "advertise"),
            TaskKind::CloudSync => write!(f, "cloud-sync"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Pending,
}

/// Work executed once the debounce delay elapses.
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn run(&self) -> SyncResult<()>;
}

// =============================================================================
// Slots
// =============================================================================

struct Slot {
    kind: TaskKind,
    delay: Duration,
    timeout: Duration,
    body: Arc<dyn TaskBody>,
    pending: AtomicBool,
    completed: AtomicU64,
    /// Held while the body executes.
    running: tokio::sync::Mutex<()>,
}

/// Clears the pending flag however the task ends, panics included.
struct PendingGuard(Arc<Slot>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.store(false, Ordering::Release);
    }
}

// =============================================================================
// Change Coordinator
// =============================================================================

/// Debounces and deduplicates re-advertise and cloud-sync work.
///
/// Cheap to clone; clones share the same pending flags.
#[derive(Clone, Default)]
pub struct ChangeCoordinator {
    advertise: Option<Arc<Slot>>,
    cloud_sync: Option<Arc<Slot>>,
    closed: Arc<AtomicBool>,
}

impl ChangeCoordinator {
    /// A coordinator with no kinds wired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires `kind` to `body`, run `delay` after the triggering event and
    /// bounded by `timeout`.
    pub fn with_task(
        mut self,
        kind: TaskKind,
        delay: Duration,
        timeout: Duration,
        body: Arc<dyn TaskBody>,
    ) -> Self {
        let slot = Arc::new(Slot {
            kind,
            delay,
            timeout,
            body,
            pending: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            running: tokio::sync::Mutex::new(()),
        });
        match kind {
            TaskKind::Advertise => self.advertise = Some(slot),
            TaskKind::CloudSync => self.cloud_sync = Some(slot),
        }
        self
    }

    fn slot(&self, kind: TaskKind) -> Option<&Arc<Slot>> {
        match kind {
            TaskKind::Advertise => self.advertise.as_ref(),
            TaskKind::CloudSync => self.cloud_sync.as_ref(),
        }
    }

    pub fn is_wired(&self, kind: TaskKind) -> bool {
        self.slot(kind).is_some()
    }

    /// Current state of `kind`. Unwired kinds are always idle.
    pub fn state(&self, kind: TaskKind) -> TaskState {
        match self.slot(kind) {
            Some(slot) if slot.pending.load(Ordering::Acquire) => TaskState::Pending,
            _ => TaskState::Idle,
        }
    }

    /// Number of bodies of `kind` that have finished, whatever the outcome.
    pub fn completed(&self, kind: TaskKind) -> u64 {
        self.slot(kind)
            .map(|slot| slot.completed.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops every kind from running again and waits for bodies already
    /// executing to finish.
    ///
    /// Tasks still in their delay stay pending until it elapses, then skip
    /// their body.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in [&self.advertise, &self.cloud_sync].into_iter().flatten() {
            drop(slot.running.lock().await);
        }
        debug!("Change coordinator closed");
    }

    /// Feeds one hardware-change event to every wired kind.
    ///
    /// Returns how many kinds moved from idle to pending.
    pub fn on_change(&self, event: &DeviceEvent) -> usize {
        debug!(action = %event.action, device = %event.device, "Hardware change");
        [TaskKind::Advertise, TaskKind::CloudSync]
            .into_iter()
            .filter(|kind| self.trigger(*kind))
            .count()
    }

    /// Schedules `kind` unless one is already pending.
    ///
    /// Returns true when a new task was scheduled.
    pub fn trigger(&self, kind: TaskKind) -> bool {
        let Some(slot) = self.slot(kind) else {
            return false;
        };
        if self.is_closed() {
            debug!(%kind, "Coordinator closed, ignoring trigger");
            return false;
        }

        if slot
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(%kind, "Task already pending, dropping event");
            return false;
        }

        debug!(%kind, delay_secs = slot.delay.as_secs(), "Task scheduled");
        let slot = Arc::clone(slot);
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
            let ran = {
                let _guard = PendingGuard(Arc::clone(&slot));

                tokio::time::sleep(slot.delay).await;
                let _running = slot.running.lock().await;
                if closed.load(Ordering::Acquire) {
                    debug!(kind = %slot.kind, "Coordinator closed, skipping task");
                    false
                } else {
                    match run_bounded(slot.body.as_ref(), slot.timeout).await {
                        Ok(()) => debug!(kind = %slot.kind, "Task complete"),
                        Err(e) if e.is_retryable() => {
                            warn!(kind = %slot.kind, error = %e, "Task failed, next change retries")
                        }
                        Err(e) => warn!(kind = %slot.kind, error = %e, "Task failed"),
                    }
                    true
                }
            };
            // Counted only once the flag is clear.
            if ran {
                slot.completed.fetch_add(1, Ordering::AcqRel);
            }
        });
        true
    }

    /// Receive loop: feeds events until shutdown or the event source closes.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<DeviceEvent>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!(
            advertise = self.is_wired(TaskKind::Advertise),
            cloud_sync = self.is_wired(TaskKind::CloudSync),
            "Change coordinator started"
        );

        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => {
                        self.on_change(&event);
                    }
                    None => {
                        debug!("Device event source closed");
                        break;
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("Change coordinator received shutdown");
                    break;
                }
            }
        }
    }
}

/// Runs `body`, turning an elapsed deadline into [`SyncError::Timeout`].
async fn run_bounded(body: &dyn TaskBody, limit: Duration) -> SyncResult<()> {
    tokio::time::timeout(limit, body.run())
        .await
        .unwrap_or_else(|_| Err(SyncError::Timeout(limit.as_secs())))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::DeviceAction;

    struct CountingBody {
        runs: AtomicU64,
        work: Duration,
        fail: bool,
    }

    impl CountingBody {
        fn new() -> Arc<Self> {
            Self::with(Duration::ZERO, false)
        }

        fn with(work: Duration, fail: bool) -> Arc<Self> {
            Arc::new(CountingBody {
                runs: AtomicU64::new(0),
                work,
                fail,
            })
        }

        fn runs(&self) -> u64 {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskBody for CountingBody {
        async fn run(&self) -> SyncResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            if self.fail {
                return Err(SyncError::CloudFailed("unreachable".into()));
            }
            Ok(())
        }
    }

    fn event(n: usize) -> DeviceEvent {
        DeviceEvent::new(DeviceAction::Add, format!("usb-FTDI_{}", n))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    const DELAY: Duration = Duration::from_secs(30);
    const TIMEOUT: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_task_per_kind() {
        let advertise = CountingBody::new();
        let cloud = CountingBody::new();
        let coordinator = ChangeCoordinator::new()
            .with_task(TaskKind::Advertise, DELAY, TIMEOUT, advertise.clone())
            .with_task(TaskKind::CloudSync, DELAY, TIMEOUT, cloud.clone());

        assert_eq!(coordinator.on_change(&event(0)), 2);
        for n in 1..5 {
            assert_eq!(coordinator.on_change(&event(n)), 0);
        }
        assert_eq!(coordinator.state(TaskKind::Advertise), TaskState::Pending);

        tokio::time::sleep(DELAY + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(advertise.runs(), 1);
        assert_eq!(cloud.runs(), 1);
        assert_eq!(coordinator.completed(TaskKind::CloudSync), 1);
        assert_eq!(coordinator.state(TaskKind::Advertise), TaskState::Idle);

        // A later change schedules a fresh cycle.
        assert_eq!(coordinator.on_change(&event(9)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_body_does_not_run_before_delay() {
        let body = CountingBody::new();
        let coordinator =
            ChangeCoordinator::new().with_task(TaskKind::Advertise, DELAY, TIMEOUT, body.clone());

        coordinator.trigger(TaskKind::Advertise);
        tokio::time::sleep(DELAY - Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(body.runs(), 0);
        assert_eq!(coordinator.state(TaskKind::Advertise), TaskState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kinds_are_independent() {
        let advertise = CountingBody::new();
        let cloud = CountingBody::new();
        let coordinator = ChangeCoordinator::new()
            .with_task(TaskKind::Advertise, DELAY, TIMEOUT, advertise.clone())
            .with_task(TaskKind::CloudSync, Duration::from_secs(5), TIMEOUT, cloud.clone());

        assert!(coordinator.trigger(TaskKind::CloudSync));
        assert!(coordinator.trigger(TaskKind::Advertise));
        assert!(!coordinator.trigger(TaskKind::CloudSync));

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(cloud.runs(), 1);
        assert_eq!(advertise.runs(), 0);
        assert_eq!(coordinator.state(TaskKind::CloudSync), TaskState::Idle);
        assert_eq!(coordinator.state(TaskKind::Advertise), TaskState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_kind_to_idle() {
        let slow = CountingBody::with(Duration::from_secs(600), false);
        let coordinator = ChangeCoordinator::new().with_task(
            TaskKind::CloudSync,
            Duration::ZERO,
            Duration::from_secs(10),
            slow.clone(),
        );

        coordinator.trigger(TaskKind::CloudSync);
        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;

        assert_eq!(slow.runs(), 1);
        assert_eq!(coordinator.completed(TaskKind::CloudSync), 1);
        assert_eq!(coordinator.state(TaskKind::CloudSync), TaskState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_deadline_is_timeout_error() {
        let slow = CountingBody::with(Duration::from_secs(600), false);
        let err = run_bounded(slow.as_ref(), Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(10)));
        assert!(err.is_retryable());

        let quick = CountingBody::new();
        assert!(run_bounded(quick.as_ref(), Duration::from_secs(10)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_skips_pending_task() {
        let body = CountingBody::new();
        let coordinator =
            ChangeCoordinator::new().with_task(TaskKind::Advertise, DELAY, TIMEOUT, body.clone());

        assert!(coordinator.trigger(TaskKind::Advertise));
        coordinator.close().await;
        assert!(coordinator.is_closed());
        assert!(!coordinator.trigger(TaskKind::Advertise));

        tokio::time::sleep(DELAY + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(body.runs(), 0);
        assert_eq!(coordinator.completed(TaskKind::Advertise), 0);
        assert_eq!(coordinator.state(TaskKind::Advertise), TaskState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_running_body() {
        let body = CountingBody::with(Duration::from_secs(20), false);
        let coordinator = ChangeCoordinator::new().with_task(
            TaskKind::CloudSync,
            Duration::ZERO,
            TIMEOUT,
            body.clone(),
        );

        coordinator.trigger(TaskKind::CloudSync);
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(body.runs(), 1);

        let started = tokio::time::Instant::now();
        coordinator.close().await;
        assert!(started.elapsed() >= Duration::from_secs(19));
        settle().await;
        assert_eq!(coordinator.completed(TaskKind::CloudSync), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_returns_kind_to_idle() {
        let failing = CountingBody::with(Duration::ZERO, true);
        let coordinator = ChangeCoordinator::new().with_task(
            TaskKind::CloudSync,
            Duration::from_secs(1),
            TIMEOUT,
            failing.clone(),
        );

        coordinator.trigger(TaskKind::CloudSync);
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(failing.runs(), 1);
        assert!(coordinator.trigger(TaskKind::CloudSync));
    }

    #[tokio::test]
    async fn test_unwired_kind_is_ignored() {
        let coordinator = ChangeCoordinator::new().with_task(
            TaskKind::Advertise,
            DELAY,
            TIMEOUT,
            CountingBody::new(),
        );
        assert!(!coordinator.trigger(TaskKind::CloudSync));
        assert_eq!(coordinator.state(TaskKind::CloudSync), TaskState::Idle);
        assert_eq!(coordinator.on_change(&event(0)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_feeds_events_until_shutdown() {
        let body = CountingBody::new();
        let coordinator =
            ChangeCoordinator::new().with_task(TaskKind::Advertise, DELAY, TIMEOUT, body.clone());

        let (event_tx, event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let loop_handle = tokio::spawn(coordinator.clone().run(event_rx, shutdown_rx));

        for n in 0..3 {
            event_tx.send(event(n)).await.unwrap();
        }
        settle().await;
        assert_eq!(coordinator.state(TaskKind::Advertise), TaskState::Pending);

        tokio::time::sleep(DELAY + Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(body.runs(), 1);

        shutdown_tx.send(()).await.unwrap();
        loop_handle.await.unwrap();
    }
}
