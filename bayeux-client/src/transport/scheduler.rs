use std::{future::Future, time::Duration};
use tokio::sync::watch;

/// Delayed-task executor backed by the tokio runtime.
///
/// Tasks scheduled here run once after their delay unless cancelled through
/// their [`TimeoutHandle`] or the whole scheduler is shut down. A scheduler
/// may be shared between transports; whoever created it shuts it down.
#[derive(Debug)]
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels a single scheduled task.
#[derive(Debug)]
pub struct TimeoutHandle {
    task: tokio::task::JoinHandle<()>,
}

impl TimeoutHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { shutdown }
    }

    /// Runs `task` once `delay` has elapsed. Must be called from within a
    /// tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimeoutHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => task.await,
                _ = shutdown.changed() => {}
            }
        });
        TimeoutHandle { task }
    }

    /// Cancels everything still pending. Scheduling afterwards is a no-op.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test(start_paused = true)]
    async fn it_runs_after_the_delay() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler.schedule(Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn it_cancels_tasks() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = scheduler.schedule(Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_tasks() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = fired.clone();
            scheduler.schedule(Duration::from_secs(1), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.shutdown();
        assert!(scheduler.is_shutdown());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
