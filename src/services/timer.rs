// src/services/timer.rs

use std::future::Future;

use tokio::{
    task::JoinHandle,
    time::{Duration, Instant, MissedTickBehavior, interval},
};

/// Once-per-second countdown that runs `on_expire` when `deadline` is reached.
///
/// The task is aborted when the timer is cancelled or dropped, so a session
/// leaving `in_progress` by any path cannot leak it. The only exception is
/// [`CountdownTimer::disarm`], used by the expiry callback itself.
#[derive(Debug)]
pub struct CountdownTimer {
    handle: Option<JoinHandle<()>>,
}

impl CountdownTimer {
    pub fn start<F, Fut>(deadline: Instant, on_expire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if Instant::now() >= deadline {
                    break;
                }
            }
            on_expire().await;
        });

        Self {
            handle: Some(handle),
        }
    }

    /// Stops the countdown.
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Releases the timer without aborting its task.
    ///
    /// Must only be called from inside `on_expire`, where aborting would
    /// cancel the expiry work half-way.
    pub fn disarm(mut self) {
        self.handle.take();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CountdownTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Whole seconds left until `deadline`, rounded up.
pub fn remaining_seconds(deadline: Instant) -> u64 {
    let left = deadline.saturating_duration_since(Instant::now());
    let secs = left.as_secs();
    if left.subsec_nanos() > 0 { secs + 1 } else { secs }
}
