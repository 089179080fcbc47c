use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use sentry::{Hub, SentryFutureExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A single-slot delayed task.
///
/// Scheduling a task replaces the pending one. Once the delay of a task has elapsed, the task is
/// spawned on its own and is no longer affected by later calls to [`schedule`](Self::schedule) or
/// [`cancel`](Self::cancel).
#[derive(Debug, Default)]
pub struct ScheduledTask {
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` after `delay`, dropping a task that is still waiting for its delay.
    ///
    /// Returns `true` if a pending task was replaced. Must be called within a Tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let timer = async move {
            tokio::time::sleep_until(deadline).await;
            tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
        };
        let handle = tokio::spawn(timer);

        let previous = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        match previous {
            Some(previous) if !previous.is_finished() => {
                previous.abort();
                true
            }
            _ => false,
        }
    }

    /// Drops the pending task, if any. Returns `true` if one was waiting.
    pub fn cancel(&self) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        match pending {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Whether a task is still waiting for its delay to elapse.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
