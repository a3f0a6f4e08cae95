//! Background Sweep Schedule
//!
//! Runs a sweep task on a fixed interval until cancelled. Ticks missed while
//! a sweep runs are skipped, so sweeps never overlap.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Handle to a running sweep schedule. Dropping it cancels the schedule.
pub struct Sweeper {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Start running `sweep` every `period`, first run one period from now.
    ///
    /// `sweep` returns the number of entries it removed.
    pub fn spawn<F, Fut>(period: Duration, sweep: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = usize> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!("Sweep schedule started every {:?}", period);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => {
                        debug!("Sweep schedule cancelled");
                        break;
                    }
                    _ = tick.tick() => {
                        let removed = sweep().await;
                        if removed > 0 {
                            info!("Periodic sweep removed {} expired entries", removed);
                        }
                    }
                }
            }
        });

        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Cancel the schedule without waiting for it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the schedule and wait for the task to exit
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            // A sweep in progress finishes first
            let _ = handle.await;
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
