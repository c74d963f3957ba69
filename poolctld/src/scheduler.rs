//! A periodic task with stable, non-drifting deadlines.
//!
//! Grounded on `original_source/src/models/timer.py`'s `Timer`: the
//! next deadline is always `previous_deadline + period`, never
//! `now + period`, so a slow tick doesn't push every future tick back
//! by the same amount. If a tick overruns its own period, the next
//! deadline collapses to "now" and the task fires again immediately,
//! exactly as `Timer.schedule_timer` does when `timer_period < 0`.
//!
//! Cancellation is instant for a task that hasn't started its next
//! tick yet; a tick already running is allowed to finish first
//! (`spec.md` §4.1, §5).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info_span};
use tracing_futures::Instrument;

/// A running (or cancelled-but-not-yet-joined) periodic task.
pub struct PeriodicTask {
    name: &'static str,
    cancel: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns a task that calls `tick` every `period`, starting one
    /// `period` from now.
    pub fn start<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let cancel = Arc::new(Notify::new());
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(
            async move {
                let mut next_deadline = Instant::now() + period;

                loop {
                    tokio::select! {
                        biased;

                        _ = task_cancel.notified() => {
                            debug!("cancelled while waiting for next deadline");
                            break;
                        }
                        _ = tokio::time::sleep_until(next_deadline) => {}
                    }

                    tick().await;

                    let now = Instant::now();

                    next_deadline += period;
                    if next_deadline < now {
                        next_deadline = now;
                    }
                }
            }
            .instrument(info_span!("periodic_task", name)),
        );

        PeriodicTask {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    /// Withdraws the next pending tick. A tick currently executing
    /// runs to completion before the task notices.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    /// Waits for the task to actually stop, after `cancel()`.
    pub async fn join(mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        debug!(name = self.name, "periodic task handle dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let task = PeriodicTask::start("test", Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::advance(Duration::from_millis(3_500)).await;
        // Allow the spawned task a chance to run after each advance.
        tokio::task::yield_now().await;

        assert_eq!(count.load(Ordering::SeqCst), 3);

        task.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_next_tick_withdraws_it() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let task = PeriodicTask::start("test", Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        task.cancel();
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
