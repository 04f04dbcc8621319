//! Cancellable interval loops
//!
//! A [`PeriodicTask`] runs an async job on a fixed period until cancelled.
//! It can be paused (the app went to the background) and nudged to run
//! immediately (connectivity came back). Ticks that arrive while a job is
//! still running are skipped, never queued.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Handle to a spawned interval loop
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    trigger: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `job` every `period`. The first run happens one period after
    /// spawning unless [`trigger`](Self::trigger) is called.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let paused = Arc::new(AtomicBool::new(false));
        let trigger = Arc::new(Notify::new());

        let loop_cancel = cancel.clone();
        let loop_paused = paused.clone();
        let loop_trigger = trigger.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let forced = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = interval.tick() => false,
                    _ = loop_trigger.notified() => true,
                };

                if !forced && loop_paused.load(Ordering::SeqCst) {
                    continue;
                }
                debug!(task = name, forced, "Periodic task tick");
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = job() => {}
                }
            }
            debug!(task = name, "Periodic task stopped");
        });

        info!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
        Self {
            name,
            cancel,
            paused,
            trigger,
            handle,
        }
    }

    /// Task name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Skip scheduled ticks until resumed. Triggers still run.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume scheduled ticks
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether scheduled ticks are being skipped
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Run the job as soon as the current run (if any) finishes
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Whether the loop is still alive
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the loop without waiting
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
        info!(task = self.name, "Periodic task shut down");
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// In-progress flag held for the duration of a pass; released on drop
pub(crate) struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    /// `None` if another pass holds the flag
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
