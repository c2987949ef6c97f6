use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct TaskSupervisorState {
    running: AtomicU64,
    /// Cancelled when stop is requested.
    stop: CancellationToken,
    /// Cancelled once every supervised task has finished after a stop.
    stopped: CancellationToken,
}

impl TaskSupervisorState {
    fn finish_async_task(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 && self.stop.is_cancelled() {
            self.stopped.cancel();
        }
    }
}

/// A group of background tasks stopped together.
///
/// Each peer owns one supervisor per transport session (consumer loop and
/// channel watcher) and one for its own lifetime (outbox flusher, timeout
/// sweeper). Stopping the supervisor cancels every task spawned through it;
/// dropping it does the same.
#[derive(Debug)]
pub struct TaskSupervisor(Arc<TaskSupervisorState>);

/// Keeps a supervised task counted as running until dropped.
#[derive(Debug)]
pub struct TaskSupervisorGuard(Arc<TaskSupervisorState>);

impl TaskSupervisor {
    #[must_use]
    pub fn create() -> Self {
        Self(Arc::default())
    }

    /// Requests every supervised task to stop.
    pub fn stop(&self) {
        self.0.stop.cancel();
        if self.0.running.load(Ordering::Acquire) == 0 {
            self.0.stopped.cancel();
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    /// Resolves when [`stop`](Self::stop) is called.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    /// Resolves once stop was requested and every supervised task finished.
    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.0.clone())
    }

    /// Spawns `fut` on the runtime. The task is dropped at its next await
    /// point once the supervisor stops.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.start_async_task();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.stopped() => {}
                () = fut => {}
            }
        });
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskSupervisorGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskSupervisorGuard {
    fn drop(&mut self) {
        self.0.finish_async_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_supervisor() {
        let task_supervisor = TaskSupervisor::create();
        task_supervisor.spawn(std::future::pending());
        task_supervisor.spawn(async {});
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(task_supervisor.0.running.load(Ordering::Acquire), 1);

        task_supervisor.stop();
        task_supervisor.stopped().await;
        tokio::time::timeout(Duration::from_secs(1), task_supervisor.all_stopped())
            .await
            .unwrap();
        assert_eq!(task_supervisor.0.running.load(Ordering::Acquire), 0);
        assert!(task_supervisor.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_without_tasks() {
        let task_supervisor = TaskSupervisor::create();
        task_supervisor.stop();
        task_supervisor.all_stopped().await;
    }
}
