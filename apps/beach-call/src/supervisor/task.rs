use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep};

/// A timer-driven task that is aborted when cancelled or dropped.
///
/// Heartbeats, the reconnection window and the waiting tick are all modeled
/// with this so their owner can stop them without threading raw handles around.
#[derive(Debug)]
pub struct ScheduledTask {
    label: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Runs `work` once after `delay`.
    pub fn after<F>(label: &'static str, delay: Duration, work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            work.await;
        });
        Self {
            label,
            handle: Some(handle),
        }
    }

    /// Runs `work` immediately; used for watchers that wait on an external signal.
    pub fn watch<F>(label: &'static str, work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            label,
            handle: Some(tokio::spawn(work)),
        }
    }

    /// Calls `tick` every `period`, starting one period from now, until it
    /// returns `false` or the task is cancelled.
    pub fn every<F>(label: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !tick() {
                    break;
                }
            }
        });
        Self {
            label,
            handle: Some(handle),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Returns whether the task was still pending when cancelled.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
