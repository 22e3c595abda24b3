//! Merged timeline of events, builds and steps
//!
//! Builds are walked newest first. Before a build is yielded, every pending
//! event newer than the build's last activity is yielded; after it, its
//! started steps follow newest first, each preceded by the events newer than
//! its start. Remaining events come last.
//!
//! A build is keyed by its last activity, so it comes before its own steps:
//! events at 1, 5 and 9 around a build finished at 8 with steps started at
//! 3 and 7 give `E9, B, S7, E5, S3, E1`.

use super::BuilderStatus;
use crate::event::Event;
use crate::record::{Build, BuildRecord, StepRecord};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

/// Which builds appear in a timeline
#[derive(Debug, Clone, Default)]
pub struct TimelineFilter {
    pub branches: BTreeSet<String>,
    pub categories: BTreeSet<String>,
    pub committers: BTreeSet<String>,
    /// Nothing that started before this is yielded
    pub min_time: Option<DateTime<Utc>>,
}

impl TimelineFilter {
    fn accepts(&self, record: &BuildRecord, category: Option<&str>) -> bool {
        if !self.branches.is_empty() && !record.branches().any(|b| self.branches.contains(b)) {
            return false;
        }
        if !self.categories.is_empty() && !category.is_some_and(|c| self.categories.contains(c)) {
            return false;
        }
        self.committers.is_empty()
            || record
                .responsible_users
                .iter()
                .any(|u| self.committers.contains(u))
    }
}

/// One timeline item
#[derive(Debug, Clone)]
pub enum TimelineEntry {
    Event(Event),
    Build(Arc<Build>),
    Step { build: u64, step: StepRecord },
}

impl TimelineEntry {
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Event(event) => Some(event.started_at),
            Self::Build(build) => Some(build.record().started_at),
            Self::Step { step, .. } => step.started_at,
        }
    }
}

/// Forward cursor over a builder's timeline
pub struct Timeline<'a> {
    status: &'a BuilderStatus,
    filter: TimelineFilter,
    category: Option<String>,
    /// Oldest first; `remaining` are still to be yielded, newest last
    events: Vec<Event>,
    remaining: usize,
    next_number: u64,
    offset: u64,
    builds_done: bool,
    staged: VecDeque<TimelineEntry>,
}

impl<'a> Timeline<'a> {
    /// Next entry, newest first
    pub async fn next(&mut self) -> Option<TimelineEntry> {
        loop {
            if let Some(entry) = self.staged.pop_front() {
                return Some(entry);
            }
            if self.builds_done {
                return self.next_event();
            }
            self.stage_next_build().await;
        }
    }

    pub async fn collect(mut self) -> Vec<TimelineEntry> {
        let mut entries = vec![];
        while let Some(entry) = self.next().await {
            entries.push(entry);
        }
        entries
    }

    pub fn into_stream(self) -> impl Stream<Item = TimelineEntry> + 'a {
        stream::unfold(self, |mut timeline| async move {
            let entry = timeline.next().await?;
            Some((entry, timeline))
        })
    }

    async fn stage_next_build(&mut self) {
        self.offset += 1;
        if self.offset > self.next_number {
            self.builds_done = true;
            return;
        }

        let number = self.next_number - self.offset;
        let Some(build) = self.status.get_build(number as i64).await else {
            // The newest build may not be saved yet; any other gap ends the walk.
            if self.offset > 1 {
                self.builds_done = true;
            }
            return;
        };

        let record = build.snapshot();
        if self.filter.min_time.is_some_and(|min| record.started_at < min) {
            self.builds_done = true;
            return;
        }
        if !self.filter.accepts(&record, self.category.as_deref()) {
            return;
        }

        self.stage_events_after(record.last_activity());
        self.staged.push_back(TimelineEntry::Build(build));
        for step in record.steps.iter().rev() {
            let Some(started) = step.started_at else {
                continue;
            };
            self.stage_events_after(started);
            self.staged.push_back(TimelineEntry::Step {
                build: number,
                step: step.clone(),
            });
        }
    }

    fn stage_events_after(&mut self, at: DateTime<Utc>) {
        while self.remaining > 0 {
            let event = &self.events[self.remaining - 1];
            if event.started_at <= at {
                break;
            }
            self.staged.push_back(TimelineEntry::Event(event.clone()));
            self.remaining -= 1;
        }
    }

    fn next_event(&mut self) -> Option<TimelineEntry> {
        if self.remaining == 0 {
            return None;
        }
        let event = &self.events[self.remaining - 1];
        if self.filter.min_time.is_some_and(|min| event.started_at < min) {
            self.remaining = 0;
            return None;
        }
        self.remaining -= 1;
        Some(TimelineEntry::Event(event.clone()))
    }
}

impl BuilderStatus {
    /// Events, builds and steps merged newest first
    pub fn timeline(&self, filter: TimelineFilter) -> Timeline<'_> {
        let events = self.events_snapshot();
        Timeline {
            status: self,
            filter,
            category: self.category(),
            remaining: events.len(),
            events,
            next_number: self.next_build_number(),
            offset: 0,
            builds_done: false,
            staged: VecDeque::new(),
        }
    }
}
