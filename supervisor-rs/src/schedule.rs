//! Scheduled-task abstraction
//!
//! Periodic work (recording segments, health sweeps, retention) takes its
//! clock from a [`Schedule`] so tests can drive ticks by hand.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Source of periodic ticks.
#[async_trait::async_trait]
pub trait Ticker: Send {
    /// Resolves at the next period boundary. Cancel-safe.
    async fn tick(&mut self);
}

/// Factory for tickers; the seam tests replace.
pub trait Schedule: Send + Sync {
    /// A ticker whose first tick fires one full `period` from now.
    fn ticker(&self, period: Duration) -> Box<dyn Ticker>;
}

/// Wall-clock schedule backed by `tokio::time::interval`.
///
/// Missed ticks are skipped rather than bunched up, so a slow consumer never
/// sees a burst of catch-up ticks.
#[derive(Debug, Default, Clone)]
pub struct IntervalSchedule;

struct IntervalTicker(tokio::time::Interval);

#[async_trait::async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.0.tick().await;
    }
}

impl Schedule for IntervalSchedule {
    fn ticker(&self, period: Duration) -> Box<dyn Ticker> {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Box::new(IntervalTicker(interval))
    }
}

/// A job run on every tick until cancelled.
pub struct PeriodicTask {
    name: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: impl Into<String>, mut ticker: Box<dyn Ticker>, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => job().await,
                }
            }
            debug!("Periodic task {} stopped", task_name);
        });
        Self { name, cancel, join }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Disarm without waiting; no tick fires after the current job returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_interval_first_tick_after_one_period() {
        let mut ticker = IntervalSchedule.ticker(Duration::from_secs(60));
        let start = Instant::now();
        ticker.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let task = PeriodicTask::spawn(
            "count",
            IntervalSchedule.ticker(Duration::from_secs(1)),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        task.shutdown().await;
        let seen = count.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
