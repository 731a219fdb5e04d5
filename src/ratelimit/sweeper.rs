//! Background reclamation of expired window counters.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::store::CounterStore;
use crate::error::{QuotaError, Result};

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Periodically removes counters whose window expired more than one window
/// ago.
///
/// Deletion is per key and never blocks hits on other keys.
#[derive(Debug, Clone)]
pub struct Sweeper {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(QuotaError::config("sweep interval must be greater than 0"));
        }
        Ok(Self {
            store,
            clock,
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass and return the number of counters removed.
    pub async fn sweep_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let removed = self.store.sweep(now).await?;
        debug!(
            removed,
            remaining = self.store.counter_count(),
            "Swept expired rate limit counters"
        );
        Ok(removed)
    }

    /// Start sweeping on a background task.
    ///
    /// The first pass runs one interval after the call.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        info!(interval = ?self.interval, "Starting counter sweeper");

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = IntervalStream::new(ticker);
            let mut total: u64 = 0;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    Some(_) = ticks.next() => match self.sweep_once().await {
                        Ok(removed) => total += removed as u64,
                        Err(e) => warn!(error = %e, "Counter sweep failed"),
                    },
                }
            }

            info!(total_removed = total, "Counter sweeper stopped");
            total
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl SweeperHandle {
    /// Stop the sweeper and return the total number of counters it removed.
    pub async fn shutdown(mut self) -> std::result::Result<u64, tokio::task::JoinError> {
        if let Some(tx) = self.shutdown.take() {
            // The task may already be gone; nothing to signal then.
            let _ = tx.send(());
        }
        self.task.await
    }
}
