//! Scheduled Tasks
//!
//! Cancellable delayed and periodic events delivered into a mailbox.
//!
//! Each task carries a [`TaskToken`] that is stamped into every event it
//! emits. The receiver compares the token against the task it currently
//! holds, so an event that was already queued when the task got cancelled is
//! recognised as stale and dropped. Cancelling (or dropping) a task that has
//! already fired or was already cancelled is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identity of a scheduled task, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskToken(u64);

impl TaskToken {
    fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle to a spawned timer task. Dropping it cancels the task.
#[derive(Debug)]
pub struct ScheduledTask {
    token: TaskToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Deliver one event after `delay`
    pub fn after<E, F>(delay: Duration, tx: mpsc::Sender<E>, make: F) -> Self
    where
        E: Send + 'static,
        F: FnOnce(TaskToken) -> E + Send + 'static,
    {
        let token = TaskToken::next();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(make(token)).await;
        });
        Self { token, handle }
    }

    /// Deliver an event every `period`, first one a full period from now
    pub fn every<E, F>(period: Duration, tx: mpsc::Sender<E>, make: F) -> Self
    where
        E: Send + 'static,
        F: Fn(TaskToken) -> E + Send + 'static,
    {
        let token = TaskToken::next();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(make(token)).await.is_err() {
                    // Receiver is gone, nothing left to drive
                    return;
                }
            }
        });
        Self { token, handle }
    }

    pub fn token(&self) -> TaskToken {
        self.token
    }

    /// Whether an event carrying `token` came from this task
    pub fn owns(&self, token: TaskToken) -> bool {
        self.token == token
    }

    /// Stop the task. Safe to call on a task that already finished.
    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
