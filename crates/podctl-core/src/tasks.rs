//! Managed periodic background tasks.
//!
//! The driver runs two loops next to the user-facing operations: the busy
//! window prune while initialised, and the readiness probe after a
//! transport connection. Both are [`PeriodicTask`]s: a spawned tokio task
//! ticking on an interval, stopped through a cancellation token, and
//! cancelled automatically when the handle is dropped.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to a running periodic task.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl PeriodicTask {
    /// Spawn `tick` every `period`, the first call immediately.
    ///
    /// `tick` receives the 1-based tick number. Returning
    /// [`ControlFlow::Break`] ends the task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send,
    {
        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut count: u32 = 0;

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!("Task '{}' cancelled, stopping gracefully", name);
                        break;
                    }
                    _ = ticker.tick() => {
                        count = count.saturating_add(1);
                        if tick(count).await.is_break() {
                            debug!("Task '{}' finished after {} tick(s)", name, count);
                            break;
                        }
                    }
                }
            }
        });

        Self {
            name,
            handle,
            cancel_token,
        }
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task to stop after its current tick.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Whether the background task is still running.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Whether [`stop`](Self::stop) was called (or the handle dropped).
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Wait until the task has ended.
    pub async fn join(&mut self) {
        let _ = (&mut self.handle).await;
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_break_ends_task() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);

        let mut task = PeriodicTask::spawn("test", Duration::from_secs(5), move |n| {
            let counter = Arc::clone(&counter);
            async move {
                counter.store(n, Ordering::SeqCst);
                if n >= 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        });

        task.join().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(!task.is_active());
        assert!(!task.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels() {
        let mut task = PeriodicTask::spawn("forever", Duration::from_secs(60), |_| async {
            ControlFlow::Continue(())
        });
        assert_eq!(task.name(), "forever");
        assert!(task.is_active());

        task.stop();
        task.join().await;
        assert!(task.is_cancelled());
        assert!(!task.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);

        let task = PeriodicTask::spawn("dropped", Duration::from_secs(1), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        drop(task);

        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
