//! # Retry Timeout Table
//!
//! Per-attempt wait durations shared by every bring-up state. The table is
//! indexed by the state's retry counter; running past its end is terminal
//! failure for the current attempt.
//!
//! The default doubles from 1 s and then jumps to a ten-minute and a
//! one-hour ceiling, so a modem that cannot reach the network in a
//! reasonable time stops hammering it.

use std::time::Duration;

/// Bounded, caller-replaceable sequence of retry delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTable {
    timeouts: Vec<Duration>,
}

impl RetryTable {
    /// Maximum number of entries. Longer replacements are truncated.
    pub const CAPACITY: usize = 10;

    const DEFAULT_SECS: [u64; Self::CAPACITY] = [1, 2, 4, 8, 16, 32, 64, 128, 600, 3600];

    /// Builds a table, silently dropping entries beyond [`Self::CAPACITY`].
    pub fn new(timeouts: &[Duration]) -> Self {
        let len = timeouts.len().min(Self::CAPACITY);
        RetryTable {
            timeouts: timeouts[..len].to_vec(),
        }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        let timeouts: Vec<Duration> = secs.iter().map(|s| Duration::from_secs(*s)).collect();
        Self::new(&timeouts)
    }

    /// Replaces the whole table, truncating to capacity.
    pub fn replace(&mut self, timeouts: &[Duration]) {
        *self = Self::new(timeouts);
    }

    /// Delay for the given retry counter, or `None` once the budget is spent.
    pub fn get(&self, retry: usize) -> Option<Duration> {
        self.timeouts.get(retry).copied()
    }

    pub fn as_slice(&self) -> &[Duration] {
        &self.timeouts
    }

    pub fn len(&self) -> usize {
        self.timeouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }
}

impl Default for RetryTable {
    fn default() -> Self {
        Self::from_secs(&Self::DEFAULT_SECS)
    }
}
