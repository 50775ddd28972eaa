use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

/// Runs a task on a fixed period until stopped or dropped.
///
/// Ticks never overlap: the next one starts only after the previous run has
/// finished, and ticks missed while a run was slow are skipped.
#[derive(Debug)]
pub struct Poller {
    handle: JoinHandle<()>,
}

impl Poller {
    pub fn spawn<F, Fut>(period: Duration, mut task: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                task().await;
            }
        });
        debug!(period_ms = period.as_millis() as u64, "poller started");
        Self { handle }
    }

    /// Stops the loop, cancelling a run that is in progress.
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn slow_runs_never_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let poller = {
            let (running, peak, runs) = (running.clone(), peak.clone(), runs.clone());
            Poller::spawn(Duration::from_millis(100), move || {
                let (running, peak, runs) = (running.clone(), peak.clone(), runs.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    time::sleep(Duration::from_millis(250)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(runs.load(Ordering::SeqCst) >= 4);
        poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_polling() {
        let runs = Arc::new(AtomicUsize::new(0));
        let poller = {
            let runs = runs.clone();
            Poller::spawn(Duration::from_millis(50), move || {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        time::sleep(Duration::from_millis(175)).await;
        drop(poller);
        tokio::task::yield_now().await;
        let stopped_at = runs.load(Ordering::SeqCst);
        assert!(stopped_at >= 3);

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), stopped_at);
    }
}
