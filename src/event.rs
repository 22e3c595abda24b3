//! Builder events
//!
//! Events are transient markers ("slave connected", "builder idle", ...) kept
//! only in memory, oldest first, and trimmed to the configured horizon.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A state-transition marker for one builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub started_at: DateTime<Utc>,
    /// `None` while in progress; point events finish when they start
    pub finished_at: Option<DateTime<Utc>>,
    pub text: Vec<String>,
}

impl Event {
    /// A duration event, finished later with [`Event::finish`]
    pub fn new(started_at: DateTime<Utc>, text: Vec<String>) -> Self {
        Self {
            started_at,
            finished_at: None,
            text,
        }
    }

    /// An instantaneous event
    pub fn point(at: DateTime<Utc>, text: Vec<String>) -> Self {
        Self {
            started_at: at,
            finished_at: Some(at),
            text,
        }
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
    }

    pub fn is_point(&self) -> bool {
        self.finished_at == Some(self.started_at)
    }
}

/// Append-only, horizon-bounded event log
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, returning its absolute index
    pub fn push(&mut self, event: Event) -> usize {
        self.events.push(event);
        self.events.len() - 1
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Event by index; negative indexes count back from the newest (`-1`)
    pub fn get(&self, index: i64) -> Option<&Event> {
        let len = self.events.len() as i64;
        let index = if index < 0 { len + index } else { index };
        if index < 0 || index >= len {
            return None;
        }
        self.events.get(index as usize)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Event> {
        self.events.get_mut(index)
    }

    /// Keep only the newest `horizon` events, returning how many were dropped
    pub fn truncate_to(&mut self, horizon: usize) -> usize {
        let excess = self.events.len().saturating_sub(horizon);
        self.events.drain(..excess);
        excess
    }

    /// Events oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Event> {
        self.events.iter()
    }

    /// Copy of the events, oldest first
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.clone()
    }
}
