//! Retry Module
//!
//! Single-flight guard and cancellable delayed tasks used to schedule
//! retries.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Test-and-set guard: at most one holder at a time.
#[derive(Debug, Default)]
pub struct InFlight(AtomicBool);

impl InFlight {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Claim the guard; `false` if someone already holds it
    pub fn try_begin(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Delayed tasks that can all be cancelled at once.
///
/// After [`Timers::cancel_all`] new schedules are ignored.
#[derive(Default)]
pub struct Timers {
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancelled: AtomicBool,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay` unless cancelled first
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancelled.load(Ordering::Acquire) {
            debug!("Timers cancelled, dropping scheduled task");
            return;
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });

        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
    }

    /// Abort every pending task and refuse new ones
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn in_flight_admits_one_holder() {
        let guard = InFlight::new();
        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        guard.finish();
        assert!(guard.try_begin());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_task_runs_after_delay() {
        let timers = Timers::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timers.schedule(Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_aborts_pending_and_future_tasks() {
        let timers = Timers::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timers.schedule(Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timers.cancel_all();

        let counter = fired.clone();
        timers.schedule(Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timers.handles.lock().unwrap().is_empty());
    }
}
