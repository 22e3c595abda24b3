//! Pending build request cache
//!
//! Queued requests are fetched from the [`RequestStore`] per cache key and
//! kept until the builder reports any build or request transition, at which
//! point everything is dropped. A generation counter keeps a fetch that
//! raced with an invalidation from repopulating the cache with stale data.

use super::key::BranchSelection;
use crate::builder::{BuilderStatus, StatusReceiver};
use crate::error::BuildhistResult;
use crate::record::{Build, BuildResult, BuildWatcher, SourceStamp};
use crate::requests::{PendingBuildRequest, RequestStore, SourceStampFilter};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Serializable projection of a pending request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRequestSummary {
    pub id: u64,
    /// Zero-based position in the builder's queue
    pub position: usize,
    pub submitted_at: DateTime<Utc>,
    pub reason: String,
    pub priority: i32,
    pub sourcestamps: Vec<SourceStamp>,
}

impl PendingRequestSummary {
    fn project(position: usize, request: &PendingBuildRequest) -> Self {
        Self {
            id: request.id,
            position,
            submitted_at: request.submitted_at,
            reason: request.reason.clone(),
            priority: request.priority,
            sourcestamps: request.sourcestamps.clone(),
        }
    }
}

#[derive(Default)]
struct PendingState {
    generation: u64,
    requests: HashMap<String, Arc<Vec<PendingBuildRequest>>>,
    summaries: HashMap<String, Arc<Vec<PendingRequestSummary>>>,
}

/// Queued requests per cache key for one builder
pub struct PendingRequestCache {
    store: Arc<dyn RequestStore>,
    state: Mutex<PendingState>,
}

impl PendingRequestCache {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self {
            store,
            state: Mutex::new(PendingState::default()),
        }
    }

    /// Create a cache and subscribe it to `status`
    pub fn attach(status: &BuilderStatus, store: Arc<dyn RequestStore>) -> Arc<Self> {
        let cache = Arc::new(Self::new(store));
        status.subscribe(cache.clone());
        cache
    }

    /// Queued requests matching `codebases`, in submission order
    pub async fn get_pending_builds(
        &self,
        status: &BuilderStatus,
        codebases: &BranchSelection,
    ) -> BuildhistResult<Arc<Vec<PendingBuildRequest>>> {
        let mut selection = codebases.clone();
        let key = status.codebases_cache_key(&mut selection);

        let generation = {
            let state = self.state.lock();
            if let Some(requests) = state.requests.get(&key) {
                return Ok(requests.clone());
            }
            state.generation
        };

        // Query with the filled selection so the fetch agrees with the key
        let filters: Vec<SourceStampFilter> = selection
            .iter()
            .map(|(codebase, branch)| SourceStampFilter::codebase(codebase, branch))
            .collect();
        let requests = Arc::new(self.store.pending_requests(status.name(), &filters).await?);
        debug!(
            "Fetched {} pending requests for {} ({:?})",
            requests.len(),
            status.name(),
            key
        );

        let mut state = self.state.lock();
        if state.generation == generation {
            state.requests.insert(key, requests.clone());
        }
        Ok(requests)
    }

    /// Serializable projections of [`get_pending_builds`](Self::get_pending_builds)
    pub async fn get_pending_builds_summaries(
        &self,
        status: &BuilderStatus,
        codebases: &BranchSelection,
    ) -> BuildhistResult<Arc<Vec<PendingRequestSummary>>> {
        let mut selection = codebases.clone();
        let key = status.codebases_cache_key(&mut selection);

        let generation = {
            let state = self.state.lock();
            if let Some(summaries) = state.summaries.get(&key) {
                return Ok(summaries.clone());
            }
            state.generation
        };

        let requests = self.get_pending_builds(status, &selection).await?;
        let summaries = Arc::new(
            requests
                .iter()
                .enumerate()
                .map(|(position, request)| PendingRequestSummary::project(position, request))
                .collect::<Vec<_>>(),
        );

        let mut state = self.state.lock();
        if state.generation == generation {
            state.summaries.insert(key, summaries.clone());
        }
        Ok(summaries)
    }

    /// Number of queued requests matching `codebases`
    pub async fn get_total(
        &self,
        status: &BuilderStatus,
        codebases: &BranchSelection,
    ) -> BuildhistResult<usize> {
        Ok(self.get_pending_builds(status, codebases).await?.len())
    }

    /// Drop every cached list
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.requests.clear();
        state.summaries.clear();
    }

    pub fn cached_keys(&self) -> usize {
        self.state.lock().requests.len()
    }
}

impl StatusReceiver for PendingRequestCache {
    fn build_started(
        &self,
        _builder: &str,
        _build: &Arc<Build>,
    ) -> BuildhistResult<Option<Arc<dyn BuildWatcher>>> {
        self.invalidate();
        Ok(None)
    }

    fn build_finished(
        &self,
        _builder: &str,
        _build: &Arc<Build>,
        _result: BuildResult,
    ) -> BuildhistResult<()> {
        self.invalidate();
        Ok(())
    }

    fn request_submitted(&self, _request: &PendingBuildRequest) -> BuildhistResult<()> {
        self.invalidate();
        Ok(())
    }

    fn request_cancelled(&self, _request: &PendingBuildRequest) -> BuildhistResult<()> {
        self.invalidate();
        Ok(())
    }
}
