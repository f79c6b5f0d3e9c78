//! Tracked fire-and-forget work launched from request handlers.

use futures_util::FutureExt;
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Counts in-flight background tasks so shutdown can wait for them.
///
/// Cloning is cheap and every clone shares the same counter.
#[derive(Clone, Default)]
pub struct BackgroundTaskTracker {
    inner: Arc<Inner>,
}

/// One unit of the in-flight count, released on drop. This also covers a
/// task the runtime drops before it completes.
struct InFlightGuard {
    inner: Arc<Inner>,
}

impl InFlightGuard {
    fn acquire(inner: &Arc<Inner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl BackgroundTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` and count it until it terminates. A panic inside the task
    /// is logged and contained.
    pub fn run<F>(&self, name: &'static str, task: F) -> Uuid
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // The count is taken before spawning so a concurrent `wait` cannot
        // miss a task that is about to start.
        let guard = InFlightGuard::acquire(&self.inner);
        let task_id = Uuid::new_v4();
        let span = tracing::info_span!("background_task", task = name, %task_id);

        tokio::spawn(
            async move {
                let _guard = guard;
                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                    tracing::error!(panic = %panic_message(&*panic), "background task panicked");
                }
            }
            .instrument(span),
        );

        task_id
    }

    /// Like [`run`](Self::run) for tasks that report failure through a
    /// `Result`. The error is logged, never propagated.
    pub fn run_fallible<F, E>(&self, name: &'static str, task: F) -> Uuid
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.run(name, async move {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background task failed");
            }
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Resolve once no tracked task is running.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before reading the counter so a release in between
            // still wakes us.
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }

            notified.await;
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
