//! Timers
//!
//! The countdown timer model replicated between nodes, plus the bounded
//! ordered collection that the owning node mutates.
//!
//! Only the node that owns canonical state (standalone or parent) calls the
//! mutating methods here. Child nodes replace the whole collection with
//! [`TimerCollection::replace`] when a snapshot arrives.

mod engine;

pub use engine::{TickOutcome, TimerEngine};

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of locally generated timer identifiers
const TIMER_ID_LEN: usize = 9;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Errors from timer collection operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// Collection already holds the configured maximum
    CapacityReached(usize),
    /// No timer with the given id
    NotFound(String),
    /// Timer or snapshot violates an invariant
    Invalid(String),
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::CapacityReached(cap) => write!(f, "timer limit reached ({})", cap),
            TimerError::NotFound(id) => write!(f, "timer '{}' not found", id),
            TimerError::Invalid(msg) => write!(f, "invalid timer: {}", msg),
        }
    }
}

impl std::error::Error for TimerError {}

/// A single countdown timer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    /// Opaque unique identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Duration the timer was set to
    pub initial_seconds: u64,
    /// Time left, never above `initial_seconds`
    pub remaining_seconds: u64,
    /// Whether the timer counts down on each tick
    pub is_running: bool,
    /// Epoch milliseconds of the last local change
    #[serde(default)]
    pub last_updated: u64,
}

impl Timer {
    /// Create a stopped timer with the full duration remaining
    pub fn new(id: impl Into<String>, name: impl Into<String>, seconds: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            initial_seconds: seconds,
            remaining_seconds: seconds,
            is_running: false,
            last_updated: now_millis(),
        }
    }

    /// Advance the timer by one tick.
    ///
    /// A running timer with time left loses one second. A running timer at
    /// zero is stopped without going negative. Returns whether anything changed.
    pub fn tick(&mut self, now: u64) -> bool {
        if !self.is_running {
            return false;
        }
        if self.remaining_seconds > 0 {
            self.remaining_seconds -= 1;
        } else {
            self.is_running = false;
        }
        self.last_updated = now;
        true
    }

    /// Apply a partial update, keeping `remaining_seconds <= initial_seconds`
    pub fn apply(&mut self, patch: &TimerPatch, now: u64) {
        if let Some(ref name) = patch.name {
            self.name = name.clone();
        }
        if let Some(initial) = patch.initial_seconds {
            self.initial_seconds = initial;
        }
        if let Some(remaining) = patch.remaining_seconds {
            self.remaining_seconds = remaining;
        }
        if let Some(running) = patch.is_running {
            self.is_running = running;
        }
        self.remaining_seconds = self.remaining_seconds.min(self.initial_seconds);
        self.last_updated = now;
    }

    /// Check the timer invariants
    pub fn validate(&self) -> Result<(), TimerError> {
        if self.id.is_empty() {
            return Err(TimerError::Invalid("empty id".to_string()));
        }
        if self.remaining_seconds > self.initial_seconds {
            return Err(TimerError::Invalid(format!(
                "timer '{}' has {}s remaining of {}s",
                self.id, self.remaining_seconds, self.initial_seconds
            )));
        }
        Ok(())
    }
}

/// Partial update for a timer. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerPatch {
    pub name: Option<String>,
    pub initial_seconds: Option<u64>,
    pub remaining_seconds: Option<u64>,
    pub is_running: Option<bool>,
}

impl TimerPatch {
    /// Rename only
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Set a new duration, restarting the countdown from it
    pub fn duration(seconds: u64) -> Self {
        Self {
            initial_seconds: Some(seconds),
            remaining_seconds: Some(seconds),
            ..Default::default()
        }
    }

    /// Start or stop the timer
    pub fn running(running: bool) -> Self {
        Self {
            is_running: Some(running),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.initial_seconds.is_none()
            && self.remaining_seconds.is_none()
            && self.is_running.is_none()
    }
}

/// Ordered, bounded set of timers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerCollection {
    timers: Vec<Timer>,
    cap: usize,
}

impl TimerCollection {
    pub fn new(cap: usize) -> Self {
        Self {
            timers: Vec::new(),
            cap,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.timers.len() >= self.cap
    }

    pub fn get(&self, id: &str) -> Option<&Timer> {
        self.timers.iter().find(|t| t.id == id)
    }

    pub fn as_slice(&self) -> &[Timer] {
        &self.timers
    }

    pub fn to_vec(&self) -> Vec<Timer> {
        self.timers.clone()
    }

    /// Append a timer at the end
    pub fn add(&mut self, timer: Timer) -> Result<(), TimerError> {
        if self.is_full() {
            return Err(TimerError::CapacityReached(self.cap));
        }
        timer.validate()?;
        if self.get(&timer.id).is_some() {
            return Err(TimerError::Invalid(format!("duplicate id '{}'", timer.id)));
        }
        self.timers.push(timer);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<Timer, TimerError> {
        let pos = self
            .timers
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| TimerError::NotFound(id.to_string()))?;
        Ok(self.timers.remove(pos))
    }

    pub fn update(&mut self, id: &str, patch: &TimerPatch, now: u64) -> Result<(), TimerError> {
        let timer = self
            .timers
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TimerError::NotFound(id.to_string()))?;
        timer.apply(patch, now);
        Ok(())
    }

    /// Set every timer running. Returns whether anything changed.
    pub fn start_all(&mut self, now: u64) -> bool {
        self.set_all_running(true, now)
    }

    /// Stop every timer. Returns whether anything changed.
    pub fn pause_all(&mut self, now: u64) -> bool {
        self.set_all_running(false, now)
    }

    fn set_all_running(&mut self, running: bool, now: u64) -> bool {
        if self.timers.is_empty() {
            return false;
        }
        for timer in &mut self.timers {
            timer.is_running = running;
            timer.last_updated = now;
        }
        true
    }

    /// Advance every timer by one tick. Returns whether anything changed.
    pub fn tick(&mut self, now: u64) -> bool {
        let mut changed = false;
        for timer in &mut self.timers {
            changed |= timer.tick(now);
        }
        changed
    }

    /// Replace the whole collection with a snapshot.
    ///
    /// The snapshot is validated up front; on error the current contents are
    /// left untouched.
    pub fn replace(&mut self, timers: Vec<Timer>) -> Result<(), TimerError> {
        Self::validate_snapshot(&timers, self.cap)?;
        self.timers = timers;
        Ok(())
    }

    /// Validate a snapshot against the cap and per-timer invariants
    pub fn validate_snapshot(timers: &[Timer], cap: usize) -> Result<(), TimerError> {
        if timers.len() > cap {
            return Err(TimerError::Invalid(format!(
                "snapshot holds {} timers, limit is {}",
                timers.len(),
                cap
            )));
        }
        for (i, timer) in timers.iter().enumerate() {
            timer.validate()?;
            if timers[..i].iter().any(|t| t.id == timer.id) {
                return Err(TimerError::Invalid(format!("duplicate id '{}'", timer.id)));
            }
        }
        Ok(())
    }
}

/// Generate a random timer id (9 lowercase base-36 characters)
pub fn generate_timer_id() -> String {
    let mut rng = rand::thread_rng();
    (0..TIMER_ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
