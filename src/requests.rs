//! Build request store boundary
//!
//! The durable queue of build requests lives outside this crate. Builders
//! only need a handful of queries against it, expressed by [`RequestStore`].
//! [`MemoryRequestStore`] is a process-local implementation.

use crate::error::{BuildhistError, BuildhistResult};
use crate::record::{BuildResult, SourceStamp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A queued, not-yet-started build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBuildRequest {
    pub id: u64,
    pub builder: String,
    pub sourcestamps: Vec<SourceStamp>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub priority: i32,
}

/// Constrains which source-stamps a query matches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStampFilter {
    pub codebase: Option<String>,
    pub branch: Option<String>,
}

impl SourceStampFilter {
    pub fn branch(branch: impl Into<String>) -> Self {
        Self {
            codebase: None,
            branch: Some(branch.into()),
        }
    }

    pub fn codebase(codebase: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            codebase: Some(codebase.into()),
            branch: Some(branch.into()),
        }
    }

    pub fn matches(&self, stamp: &SourceStamp) -> bool {
        self.codebase.as_ref().is_none_or(|c| *c == stamp.codebase)
            && self
                .branch
                .as_ref()
                .is_none_or(|b| stamp.branch.as_deref() == Some(b.as_str()))
    }
}

/// Every filter is satisfied by at least one stamp
fn stamps_match(filters: &[SourceStampFilter], stamps: &[SourceStamp]) -> bool {
    filters
        .iter()
        .all(|filter| stamps.iter().any(|stamp| filter.matches(stamp)))
}

/// Queries a builder needs from the external build request store
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Numbers of the builder's most recent finished builds, newest first
    async fn last_build_numbers(
        &self,
        builder: &str,
        filters: &[SourceStampFilter],
        exclude_results: &[BuildResult],
        limit: usize,
    ) -> BuildhistResult<Vec<u64>>;

    /// Queued requests for the builder in submission order
    async fn pending_requests(
        &self,
        builder: &str,
        filters: &[SourceStampFilter],
    ) -> BuildhistResult<Vec<PendingBuildRequest>>;

    /// Cancel one queued request
    async fn cancel_request(&self, id: u64) -> BuildhistResult<PendingBuildRequest>;

    /// Fold `merged` requests into `into`, removing them from the queue
    async fn mark_merged(&self, into: u64, merged: &[u64]) -> BuildhistResult<()>;
}

#[derive(Debug, Clone)]
struct FinishedRow {
    builder: String,
    number: u64,
    sourcestamps: Vec<SourceStamp>,
    result: BuildResult,
}

#[derive(Debug, Default)]
struct MemoryState {
    queue: Vec<PendingBuildRequest>,
    finished: Vec<FinishedRow>,
    merged: HashMap<u64, u64>,
}

/// In-process request store
#[derive(Debug, Default)]
pub struct MemoryRequestStore {
    state: Mutex<MemoryState>,
    fetches: AtomicUsize,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request
    pub fn submit(&self, request: PendingBuildRequest) {
        self.state.lock().queue.push(request);
    }

    /// Record a finished build so it shows up in [`RequestStore::last_build_numbers`]
    pub fn record_build(
        &self,
        builder: &str,
        number: u64,
        sourcestamps: Vec<SourceStamp>,
        result: BuildResult,
    ) {
        self.state.lock().finished.push(FinishedRow {
            builder: builder.to_string(),
            number,
            sourcestamps,
            result,
        });
    }

    /// How many times pending requests were fetched
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Request `id` was merged into
    pub fn merged_into(&self, id: u64) -> Option<u64> {
        self.state.lock().merged.get(&id).copied()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn last_build_numbers(
        &self,
        builder: &str,
        filters: &[SourceStampFilter],
        exclude_results: &[BuildResult],
        limit: usize,
    ) -> BuildhistResult<Vec<u64>> {
        let state = self.state.lock();
        let mut numbers: Vec<u64> = state
            .finished
            .iter()
            .filter(|row| row.builder == builder)
            .filter(|row| !exclude_results.contains(&row.result))
            .filter(|row| stamps_match(filters, &row.sourcestamps))
            .map(|row| row.number)
            .collect();
        numbers.sort_unstable_by(|a, b| b.cmp(a));
        numbers.truncate(limit);
        Ok(numbers)
    }

    async fn pending_requests(
        &self,
        builder: &str,
        filters: &[SourceStampFilter],
    ) -> BuildhistResult<Vec<PendingBuildRequest>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock();
        let mut requests: Vec<_> = state
            .queue
            .iter()
            .filter(|r| r.builder == builder)
            .filter(|r| stamps_match(filters, &r.sourcestamps))
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }

    async fn cancel_request(&self, id: u64) -> BuildhistResult<PendingBuildRequest> {
        let mut state = self.state.lock();
        let index = state
            .queue
            .iter()
            .position(|r| r.id == id)
            .ok_or(BuildhistError::RequestNotFound(id))?;
        Ok(state.queue.remove(index))
    }

    async fn mark_merged(&self, into: u64, merged: &[u64]) -> BuildhistResult<()> {
        let mut state = self.state.lock();
        let builder = state
            .queue
            .iter()
            .find(|r| r.id == into)
            .map(|r| r.builder.clone())
            .ok_or(BuildhistError::RequestNotFound(into))?;
        if let Some(other) = state
            .queue
            .iter()
            .find(|r| merged.contains(&r.id) && r.builder != builder)
        {
            return Err(BuildhistError::RequestStore(format!(
                "request {} is queued on {}, cannot merge into {} on {}",
                other.id, other.builder, into, builder
            )));
        }
        state.queue.retain(|r| r.id == into || !merged.contains(&r.id));
        for id in merged.iter().filter(|id| **id != into) {
            state.merged.insert(*id, into);
        }
        Ok(())
    }
}
