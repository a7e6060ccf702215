//! Timer Engine
//!
//! Drives running timers forward once per tick period. Only a node that owns
//! canonical state keeps the engine running; the coordinator starts and stops
//! it on role transitions.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::schedule::{ScheduledTask, TaskToken};

use super::TimerCollection;

/// Result of handling a tick event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Tick came from a loop that is no longer current
    Stale,
    /// No running timers, nothing changed
    Unchanged,
    /// At least one timer changed
    Changed,
}

/// Owner of the periodic tick loop. At most one loop exists per engine.
#[derive(Debug)]
pub struct TimerEngine {
    period: Duration,
    task: Option<ScheduledTask>,
}

impl TimerEngine {
    pub fn new(period: Duration) -> Self {
        Self { period, task: None }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Start the tick loop unless one is already running.
    ///
    /// Returns `true` if a new loop was started.
    pub fn start<E, F>(&mut self, tx: mpsc::Sender<E>, make: F) -> bool
    where
        E: Send + 'static,
        F: Fn(TaskToken) -> E + Send + 'static,
    {
        if self.task.is_some() {
            return false;
        }
        debug!("Timer engine: starting tick loop ({:?})", self.period);
        self.task = Some(ScheduledTask::every(self.period, tx, make));
        true
    }

    /// Stop the tick loop. Returns `true` if one was running.
    pub fn stop(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                debug!("Timer engine: stopping tick loop");
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Apply one tick to `timers` if `token` belongs to the current loop
    pub fn on_tick(&self, token: TaskToken, timers: &mut TimerCollection, now: u64) -> TickOutcome {
        match self.task {
            Some(ref task) if task.owns(token) => {
                if timers.tick(now) {
                    TickOutcome::Changed
                } else {
                    TickOutcome::Unchanged
                }
            }
            _ => TickOutcome::Stale,
        }
    }
}
