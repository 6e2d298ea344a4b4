//! # Cooperative Timer Queue
//!
//! Deadline-ordered task queue owned by the state machine worker. Tasks are
//! plain values; the owner pops due entries and runs them to completion one
//! at a time, so nothing in the queue needs locking.
//!
//! Capacity is fixed at construction. A full queue refuses new work with
//! [`CellularError::NoMemory`] instead of growing.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::CellularError;

/// Handle to a scheduled task, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct EventQueue<T> {
    capacity: usize,
    next_id: u64,
    /// Keyed by (deadline, id) so equal deadlines run in scheduling order.
    pending: BTreeMap<(Instant, EventId), T>,
    deadlines: HashMap<EventId, Instant>,
}

impl<T> EventQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        EventQueue {
            capacity,
            next_id: 1,
            pending: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Schedules `task` to run `delay` from now.
    pub fn call_in(&mut self, delay: Duration, task: T) -> Result<EventId, CellularError> {
        let deadline = Instant::now()
            .checked_add(delay)
            .ok_or(CellularError::Parameter)?;
        self.call_at(deadline, task)
    }

    pub fn call_at(&mut self, deadline: Instant, task: T) -> Result<EventId, CellularError> {
        if self.pending.len() >= self.capacity {
            return Err(CellularError::NoMemory);
        }
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.pending.insert((deadline, id), task);
        self.deadlines.insert(id, deadline);
        Ok(id)
    }

    /// Removes a pending task. Returns `false` if it already ran or was
    /// never scheduled.
    pub fn cancel(&mut self, id: EventId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.pending.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Earliest deadline among pending tasks.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pops the earliest task if its deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(EventId, T)> {
        match self.next_deadline() {
            Some(deadline) if deadline <= now => self.pop_next(),
            _ => None,
        }
    }

    /// Pops the earliest task regardless of its deadline.
    pub fn pop_next(&mut self) -> Option<(EventId, T)> {
        let ((_, id), task) = self.pending.pop_first()?;
        self.deadlines.remove(&id);
        Some((id, task))
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
