//! Graceful shutdown coordination.
//!
//! ```text
//! Running --trigger--> Draining --drained / deadline--> Stopped
//! ```
//!
//! The first trigger starts the only shutdown sequence of the process.
//! Later triggers, including a second signal during the drain, are logged
//! and ignored.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::background::BackgroundTaskTracker;
use crate::error::{ThrottlerError, ThrottlerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// What asked the process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Interrupt,
    Terminate,
    Programmatic,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::Interrupt => write!(f, "SIGINT"),
            ShutdownTrigger::Terminate => write!(f, "SIGTERM"),
            ShutdownTrigger::Programmatic => write!(f, "programmatic"),
        }
    }
}

pub struct ShutdownCoordinator {
    state: watch::Sender<ShutdownState>,
    drain_deadline: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_deadline: Duration) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            state,
            drain_deadline,
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    pub fn drain_deadline(&self) -> Duration {
        self.drain_deadline
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Move from `Running` to `Draining`. Returns `false` when a shutdown is
    /// already under way.
    pub fn trigger(&self, trigger: ShutdownTrigger) -> bool {
        let started = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });

        if started {
            info!(
                signal = %trigger,
                deadline = ?self.drain_deadline,
                "shutting down server"
            );
        } else {
            warn!(
                signal = %trigger,
                state = ?self.state(),
                "shutdown already in progress, ignoring signal"
            );
        }

        started
    }

    /// Resolves once the state has left `Running`.
    pub async fn draining(&self) {
        let mut state = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = state.wait_for(|state| *state != ShutdownState::Running).await;
    }

    /// Wait for the trigger, then wait for `requests` (the HTTP layer's
    /// in-flight connections) and every tracked background task, bounded by
    /// the drain deadline. Always leaves the coordinator `Stopped`.
    pub async fn drain<R>(
        &self,
        requests: R,
        tracker: &BackgroundTaskTracker,
    ) -> ThrottlerResult<()>
    where
        R: Future<Output = ()>,
    {
        self.draining().await;

        info!(pending = tracker.in_flight(), "completing background tasks");

        let outcome = tokio::time::timeout(self.drain_deadline, async {
            tokio::join!(requests, tracker.wait());
        })
        .await;

        self.state.send_replace(ShutdownState::Stopped);

        match outcome {
            Ok(()) => {
                info!("stopped server");
                Ok(())
            }
            Err(_) => {
                let pending_tasks = tracker.in_flight();
                error!(
                    deadline = ?self.drain_deadline,
                    pending_tasks,
                    "drain deadline elapsed, abandoning in-flight work"
                );
                Err(ThrottlerError::ShutdownTimeout {
                    deadline: self.drain_deadline,
                    pending_tasks,
                })
            }
        }
    }
}

/// Installed SIGINT/SIGTERM streams.
///
/// Installing is separate from listening so a process that cannot receive
/// termination signals fails at startup instead of running unstoppable.
pub struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    pub fn install() -> ThrottlerResult<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> ThrottlerResult<Self> {
        Ok(Self {})
    }

    /// Wait for the next termination signal.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> ThrottlerResult<ShutdownTrigger> {
        tokio::select! {
            _ = self.interrupt.recv() => Ok(ShutdownTrigger::Interrupt),
            _ = self.terminate.recv() => Ok(ShutdownTrigger::Terminate),
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> ThrottlerResult<ShutdownTrigger> {
        tokio::signal::ctrl_c().await?;
        Ok(ShutdownTrigger::Interrupt)
    }

    /// Forward every received signal to the coordinator for as long as the
    /// task runs.
    pub async fn forward(mut self, coordinator: Arc<ShutdownCoordinator>) -> ThrottlerResult<()> {
        loop {
            let trigger = self.recv().await?;
            coordinator.trigger(trigger);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_single_transition() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
        assert_eq!(coordinator.state(), ShutdownState::Running);
        assert!(coordinator.is_accepting());

        assert!(coordinator.trigger(ShutdownTrigger::Terminate));
        assert_eq!(coordinator.state(), ShutdownState::Draining);
        assert!(!coordinator.is_accepting());

        assert!(!coordinator.trigger(ShutdownTrigger::Interrupt));
        assert_eq!(coordinator.state(), ShutdownState::Draining);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_triggers_start_one_sequence() {
        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(30)));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.trigger(ShutdownTrigger::Programmatic) })
            })
            .collect();

        let mut started = 0;
        for handle in handles {
            if handle.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_every_task() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
        let tracker = BackgroundTaskTracker::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..3u64 {
            let finished = Arc::clone(&finished);
            tracker.run("notification", async move {
                tokio::time::sleep(Duration::from_secs(i + 1)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                if i == 1 {
                    panic!("delivery failed");
                }
            });
        }

        coordinator.trigger(ShutdownTrigger::Terminate);
        coordinator.drain(async {}, &tracker).await.unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_in_flight_requests() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
        let tracker = BackgroundTaskTracker::new();
        let start = Instant::now();

        coordinator.trigger(ShutdownTrigger::Programmatic);
        coordinator
            .drain(tokio::time::sleep(Duration::from_secs(5)), &tracker)
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_on_stuck_task() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let tracker = BackgroundTaskTracker::new();
        tracker.run("stuck", tokio::time::sleep(Duration::from_secs(3600)));

        coordinator.trigger(ShutdownTrigger::Interrupt);
        let err = coordinator.drain(async {}, &tracker).await.unwrap_err();

        match err {
            ThrottlerError::ShutdownTimeout {
                deadline,
                pending_tasks,
            } => {
                assert_eq!(deadline, Duration::from_secs(1));
                assert_eq!(pending_tasks, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_on_stuck_request() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
        let tracker = BackgroundTaskTracker::new();

        coordinator.trigger(ShutdownTrigger::Interrupt);
        let result = coordinator
            .drain(std::future::pending::<()>(), &tracker)
            .await;

        assert!(matches!(
            result,
            Err(ThrottlerError::ShutdownTimeout { pending_tasks: 0, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_does_not_start_before_trigger() {
        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(30)));
        let tracker = BackgroundTaskTracker::new();

        let drain = {
            let coordinator = Arc::clone(&coordinator);
            let tracker = tracker.clone();
            tokio::spawn(async move { coordinator.drain(async {}, &tracker).await })
        };

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!drain.is_finished());
        assert_eq!(coordinator.state(), ShutdownState::Running);

        coordinator.trigger(ShutdownTrigger::Programmatic);
        drain.await.unwrap().unwrap();
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn test_subscribers_observe_stop() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
        let mut state = coordinator.subscribe();

        coordinator.trigger(ShutdownTrigger::Programmatic);
        coordinator
            .drain(async {}, &BackgroundTaskTracker::new())
            .await
            .unwrap();

        state.changed().await.unwrap();
        assert_eq!(*state.borrow_and_update(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn test_installed_signals_wait_without_triggering() {
        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(30)));
        let signals = ShutdownSignals::install().unwrap();

        let mut forward = tokio_test::task::spawn(signals.forward(Arc::clone(&coordinator)));
        tokio_test::assert_pending!(forward.poll());
        assert_eq!(coordinator.state(), ShutdownState::Running);
    }

    #[test]
    fn test_trigger_names() {
        assert_eq!(ShutdownTrigger::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownTrigger::Terminate.to_string(), "SIGTERM");
    }
}
