//! Per-builder status
//!
//! [`BuilderStatus`] owns everything one builder knows about its builds:
//! the number allocator, the set of running builds, the record cache, the
//! event log, the latest-build memo and the subscribers that hear about
//! transitions.
//!
//! # Build lifecycle
//!
//! 1. [`BuilderStatus::new_build`] allocates a number and returns a [`Build`]
//!    handle. A background task waits for that handle to finish.
//! 2. [`BuilderStatus::build_started`] pins it in the cache and notifies
//!    subscribers.
//! 3. Whoever runs the build calls [`Build::finish`]. The background task
//!    persists the record, drops it from the running set, notifies
//!    subscribers, updates the memo and schedules pruning.

pub mod history;
pub mod receiver;
pub mod timeline;

pub use history::{BuildPredicate, BuildQuery, FinishedBuilds};
pub use receiver::{BuilderState, StatusReceiver};
pub use timeline::{Timeline, TimelineEntry, TimelineFilter};

use crate::cache::key::{derive_cache_key, BranchSelection, CodebaseConfig};
use crate::cache::latest::{LatestBuildMemo, MemoLookup};
use crate::cache::records::BuildRecordCache;
use crate::config::Config;
use crate::coordinator::SingleFlight;
use crate::error::{BuildhistError, BuildhistResult};
use crate::event::{Event, EventLog};
use crate::record::schema::DESCRIPTOR_SCHEMA_VERSION;
use crate::record::{Build, BuildRecord, BuildResult, BuilderDescriptor, RecordStore};
use crate::requests::PendingBuildRequest;
use crate::retention::{Horizons, PruneReport, RetentionPruner};
use chrono::{Duration, Utc};
use parking_lot::{Mutex, RwLock};
use receiver::same_receiver;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Mutable builder metadata, changed only through setters
#[derive(Debug, Clone, Default)]
pub struct BuilderInfo {
    pub category: Option<String>,
    pub project: Option<String>,
    pub friendly_name: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    /// Codebases of the builder's project
    pub codebases: Vec<CodebaseConfig>,
}

struct Inner {
    next_build_number: u64,
    state: BuilderState,
    current_builds: Vec<Arc<Build>>,
    watchers: Vec<Arc<dyn StatusReceiver>>,
    events: EventLog,
    memo: LatestBuildMemo,
    retention: RetentionPruner,
    max_search: usize,
}

/// Status of one builder
pub struct BuilderStatus {
    name: String,
    info: RwLock<BuilderInfo>,
    inner: Mutex<Inner>,
    cache: BuildRecordCache,
    cancels: SingleFlight<u64, bool>,
}

impl BuilderStatus {
    /// Create a status over `store`. Call [`determine_next_build_number`]
    /// before allocating builds for a directory with history.
    ///
    /// [`determine_next_build_number`]: BuilderStatus::determine_next_build_number
    pub fn new(name: impl Into<String>, store: Arc<RecordStore>, config: &Config) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            cache: BuildRecordCache::new(name.clone(), store, config.status.build_cache_size),
            name,
            info: RwLock::new(BuilderInfo::default()),
            inner: Mutex::new(Inner {
                next_build_number: 0,
                state: BuilderState::Offline,
                current_builds: vec![],
                watchers: vec![],
                events: EventLog::new(),
                memo: LatestBuildMemo::new(Duration::days(config.status.last_build_cache_days.into())),
                retention: RetentionPruner::new(Horizons::from(&config.retention)),
                max_search: config.status.max_search,
            }),
            cancels: SingleFlight::new("build cancel"),
        })
    }

    /// Open the builder stored in `dir`, restoring its descriptor and counter
    pub async fn open(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        config: &Config,
    ) -> BuildhistResult<Arc<Self>> {
        let store = Arc::new(RecordStore::new(dir, config.status.io_workers));
        let status = Self::new(name, store, config);

        match status.store().load_descriptor().await {
            Ok(Some(descriptor)) => status.apply_descriptor(descriptor, config),
            Ok(None) => debug!("No descriptor for builder {}", status.name),
            Err(e) if e.is_absent() => warn!("Ignoring descriptor of builder {}: {}", status.name, e),
            Err(e) => return Err(e),
        }

        let next = status.determine_next_build_number().await?;
        info!("Opened builder {} (next build #{})", status.name, next);
        Ok(status)
    }

    fn apply_descriptor(&self, descriptor: BuilderDescriptor, config: &Config) {
        if descriptor.name != self.name {
            debug!(
                "Descriptor names builder {}, opened as {}",
                descriptor.name, self.name
            );
        }
        let codebases = descriptor
            .project
            .as_ref()
            .and_then(|p| config.projects.get(p))
            .map(|p| p.codebases.clone())
            .unwrap_or_default();

        let mut info = self.info.write();
        info.category = descriptor.category;
        info.project = descriptor.project;
        info.friendly_name = descriptor.friendly_name;
        info.description = descriptor.description;
        info.tags = descriptor.tags;
        info.codebases = codebases;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        self.cache.store()
    }

    pub fn cache(&self) -> &BuildRecordCache {
        &self.cache
    }

    // Metadata

    pub fn info(&self) -> BuilderInfo {
        self.info.read().clone()
    }

    /// Friendly name, falling back to the builder name
    pub fn friendly_name(&self) -> String {
        self.info
            .read()
            .friendly_name
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }

    pub fn set_friendly_name(&self, friendly_name: Option<String>) {
        self.info.write().friendly_name = friendly_name;
    }

    pub fn category(&self) -> Option<String> {
        self.info.read().category.clone()
    }

    pub fn set_category(&self, category: Option<String>) {
        self.info.write().category = category;
    }

    pub fn set_description(&self, description: Option<String>) {
        self.info.write().description = description;
    }

    pub fn set_tags(&self, tags: Vec<String>) {
        self.info.write().tags = tags;
    }

    /// Assign the project and its codebases.
    ///
    /// Cache keys depend on the codebases, so the latest-build memo is reset.
    pub fn set_project(&self, project: Option<String>, codebases: Vec<CodebaseConfig>) {
        {
            let mut info = self.info.write();
            info.project = project;
            info.codebases = codebases;
        }
        self.inner.lock().memo.clear();
    }

    /// Durable projection of the builder's identity
    pub fn descriptor(&self) -> BuilderDescriptor {
        let info = self.info.read();
        BuilderDescriptor {
            schema_version: DESCRIPTOR_SCHEMA_VERSION,
            name: self.name.clone(),
            category: info.category.clone(),
            project: info.project.clone(),
            friendly_name: info.friendly_name.clone(),
            description: info.description.clone(),
            tags: info.tags.clone(),
        }
    }

    // Settings

    /// Resize the record cache
    pub fn set_cache_size(&self, size: usize) {
        self.cache.set_capacity(size);
    }

    pub fn set_horizons(&self, horizons: Horizons) {
        self.inner.lock().retention.set_horizons(horizons);
    }

    pub fn horizons(&self) -> Horizons {
        self.inner.lock().retention.horizons()
    }

    pub fn set_max_search(&self, max_search: usize) {
        self.inner.lock().max_search = max_search;
    }

    pub(crate) fn max_search(&self) -> usize {
        self.inner.lock().max_search
    }

    // Build numbers

    pub fn next_build_number(&self) -> u64 {
        self.inner.lock().next_build_number
    }

    /// Recover the counter from the highest numbered file on disk
    pub async fn determine_next_build_number(&self) -> BuildhistResult<u64> {
        let next = self.store().highest_number().await?.map_or(0, |n| n + 1);
        let mut inner = self.inner.lock();
        inner.next_build_number = inner.next_build_number.max(next);
        Ok(inner.next_build_number)
    }

    /// Allocate the next build.
    ///
    /// Must be called within a tokio runtime: the finish of the returned
    /// build is picked up by a background task.
    pub fn new_build(self: &Arc<Self>) -> Arc<Build> {
        let number = {
            let mut inner = self.inner.lock();
            let number = inner.next_build_number;
            inner.next_build_number += 1;
            number
        };
        let build = Arc::new(Build::new(self.name.clone(), number));
        debug!("Allocated build #{} of {}", number, self.name);

        let status: Weak<Self> = Arc::downgrade(self);
        let watched = build.clone();
        tokio::spawn(async move {
            watched.wait_until_finished().await;
            match status.upgrade() {
                Some(status) => status.build_finished(&watched).await,
                None => debug!("Builder gone before build #{} finished", watched.number()),
            }
        });
        build
    }

    // Running builds

    /// Register a running build and tell subscribers about it
    pub fn build_started(&self, build: &Arc<Build>) -> BuildhistResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.current_builds.iter().any(|b| b.number() == build.number()) {
                return Err(BuildhistError::BuildAlreadyRunning(build.number()));
            }
            inner.current_builds.push(build.clone());
        }
        self.cache.pin(build.clone());
        info!("Build #{} of {} started", build.number(), self.name);

        for receiver in self.receivers() {
            match receiver.build_started(&self.name, build) {
                Ok(Some(watcher)) => build.subscribe(watcher),
                Ok(None) => {}
                Err(e) => warn!("Status receiver failed on build start of {}: {}", self.name, e),
            }
        }
        Ok(())
    }

    async fn build_finished(self: &Arc<Self>, build: &Arc<Build>) {
        let number = build.number();
        let running = self
            .inner
            .lock()
            .current_builds
            .iter()
            .any(|b| Arc::ptr_eq(b, build));
        if !running {
            warn!("Build #{} of {} finished without being started", number, self.name);
            return;
        }

        let record = build.snapshot();
        if let Err(e) = self.store().save_build(&record).await {
            error!("Failed to save build #{} of {}: {}", number, self.name, e);
        }

        self.inner
            .lock()
            .current_builds
            .retain(|b| !Arc::ptr_eq(b, build));
        self.cache.unpin(number);

        let result = record.result.unwrap_or(BuildResult::Exception);
        info!("Build #{} of {} finished: {}", number, self.name, result);
        for receiver in self.receivers() {
            if let Err(e) = receiver.build_finished(&self.name, build, result) {
                warn!("Status receiver failed on build finish of {}: {}", self.name, e);
            }
        }

        self.save_latest_build(Some(&record), "");

        let status = Arc::clone(self);
        tokio::spawn(async move {
            status.prune(false).await;
        });
    }

    /// Running builds whose source-stamps all match `codebases`
    pub fn get_current_builds(&self, codebases: &BranchSelection) -> Vec<Arc<Build>> {
        self.inner
            .lock()
            .current_builds
            .iter()
            .filter(|b| b.record().matches_codebases(codebases))
            .cloned()
            .collect()
    }

    /// Cache-resident builds whose source-stamps all match `codebases`
    pub fn get_cached_builds(&self, codebases: &BranchSelection) -> Vec<Arc<Build>> {
        self.cache
            .builds()
            .into_iter()
            .filter(|b| b.record().matches_codebases(codebases))
            .collect()
    }

    // Lookups

    /// Build by number; negative numbers count back from the newest (`-1`)
    pub async fn get_build(&self, number: i64) -> Option<Arc<Build>> {
        let next = self.next_build_number();
        let number = if number < 0 { next as i64 + number } else { number };
        if number < 0 || number >= next as i64 {
            return None;
        }
        self.cache.get(number as u64, next).await
    }

    /// Newest build if finished, else the one before it
    pub async fn get_last_finished_build(&self) -> Option<Arc<Build>> {
        match self.get_build(-1).await {
            Some(build) if build.is_finished() => Some(build),
            _ => self.get_build(-2).await,
        }
    }

    /// Event by index; negative numbers count back from the newest (`-1`)
    pub fn get_event(&self, index: i64) -> Option<Event> {
        self.inner.lock().events.get(index).cloned()
    }

    pub fn add_event(&self, event: Event) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.events.push(event);
        inner.retention.prune_events(&mut inner.events);
    }

    /// Record an instantaneous event now
    pub fn add_point_event(&self, text: Vec<String>) {
        self.add_event(Event::point(Utc::now(), text));
    }

    pub(crate) fn events_snapshot(&self) -> Vec<Event> {
        self.inner.lock().events.snapshot()
    }

    // State

    /// Current coarse state and the builds running right now
    pub fn get_state(&self) -> (BuilderState, Vec<Arc<Build>>) {
        let inner = self.inner.lock();
        (inner.state, inner.current_builds.clone())
    }

    /// Publish a new coarse state; unchanged states are not republished
    pub fn set_big_state(&self, state: BuilderState) {
        {
            let mut inner = self.inner.lock();
            if inner.state == state {
                return;
            }
            inner.state = state;
        }
        debug!("Builder {} is now {}", self.name, state);
        for receiver in self.receivers() {
            if let Err(e) = receiver.builder_changed_state(&self.name, state) {
                warn!("Status receiver failed on state change of {}: {}", self.name, e);
            }
        }
    }

    // Subscribers

    /// Add a receiver and push the current state to it
    pub fn subscribe(&self, receiver: Arc<dyn StatusReceiver>) {
        let state = {
            let mut inner = self.inner.lock();
            inner.watchers.push(receiver.clone());
            inner.state
        };
        if let Err(e) = receiver.builder_changed_state(&self.name, state) {
            warn!("Status receiver failed on subscribe to {}: {}", self.name, e);
        }
    }

    pub fn unsubscribe(&self, receiver: &Arc<dyn StatusReceiver>) {
        self.inner
            .lock()
            .watchers
            .retain(|w| !same_receiver(w, receiver));
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }

    fn receivers(&self) -> Vec<Arc<dyn StatusReceiver>> {
        self.inner.lock().watchers.clone()
    }

    pub fn request_submitted(&self, request: &PendingBuildRequest) {
        for receiver in self.receivers() {
            if let Err(e) = receiver.request_submitted(request) {
                warn!("Status receiver failed on request {} of {}: {}", request.id, self.name, e);
            }
        }
    }

    pub fn request_cancelled(&self, request: &PendingBuildRequest) {
        for receiver in self.receivers() {
            if let Err(e) = receiver.request_cancelled(request) {
                warn!("Status receiver failed on cancelled request {} of {}: {}", request.id, self.name, e);
            }
        }
    }

    // Cache keys and the latest-build memo

    /// Cache key for `selection` against the project's codebases.
    ///
    /// Missing codebases are filled into `selection`. An empty selection
    /// has the empty key.
    pub fn codebases_cache_key(&self, selection: &mut BranchSelection) -> String {
        if selection.is_empty() {
            return String::new();
        }
        derive_cache_key(&self.info.read().codebases, selection)
    }

    pub(crate) fn lookup_latest(&self, key: &str) -> MemoLookup {
        self.inner.lock().memo.lookup(key, Utc::now())
    }

    /// Remember `build` as the newest for its codebases, or that `key` has none
    pub fn save_latest_build(&self, build: Option<&BuildRecord>, key: &str) {
        let now = Utc::now();
        match build {
            Some(record) => {
                if record.result == Some(BuildResult::Resume) {
                    return;
                }
                let key = self.codebases_cache_key(&mut record.codebase_branches());
                if key.is_empty() {
                    return;
                }
                let mut inner = self.inner.lock();
                if matches!(inner.memo.get(&key), Some(Some(known)) if known > record.number) {
                    return;
                }
                inner.memo.save(&key, Some(record.number), now);
            }
            None if !key.is_empty() => {
                self.inner.lock().memo.save(key, None, now);
            }
            None => {}
        }
    }

    /// Memoized latest build for `key`, if any
    pub fn latest_memo(&self, key: &str) -> Option<Option<u64>> {
        self.inner.lock().memo.get(key)
    }

    pub fn set_memo_max_age(&self, max_age: Duration) {
        self.inner.lock().memo.set_max_age(max_age);
    }

    // Cancellation

    /// Cancel build `number`.
    ///
    /// A running build is finished as cancelled; a finished build awaiting
    /// resume is marked cancelled and saved again. Concurrent requests for
    /// the same build share one attempt.
    pub async fn cancel_build(&self, number: i64) -> Option<Arc<Build>> {
        let build = self.get_build(number).await?;
        let store = self.store().clone();
        let target = build.clone();
        let changed = self
            .cancels
            .run(build.number(), move || cancel(store, target))
            .await;
        if changed {
            info!("Cancelled build #{} of {}", build.number(), self.name);
        }
        Some(build)
    }

    pub fn is_cancelling(&self, number: u64) -> bool {
        self.cancels.is_in_flight(&number)
    }

    // Persistence

    /// Apply retention horizons; file deletion is skipped when `events_only`
    pub async fn prune(&self, events_only: bool) -> PruneReport {
        let (events_dropped, pruner, next) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let dropped = inner.retention.prune_events(&mut inner.events);
            (dropped, inner.retention.clone(), inner.next_build_number)
        };

        let mut report = if events_only {
            PruneReport::default()
        } else {
            pruner
                .prune_files(self.store(), next, |n| self.cache.contains(n))
                .await
        };
        report.events_dropped = events_dropped;
        report
    }

    /// Save the descriptor and any unfinished builds
    pub async fn save_yourself(&self) {
        let running: Vec<Arc<Build>> = self
            .inner
            .lock()
            .current_builds
            .iter()
            .filter(|b| !b.is_finished())
            .cloned()
            .collect();

        // A build finishing meanwhile is persisted by its own finish
        for build in running {
            if let Err(e) = self.store().save_unfinished(&build).await {
                error!("Failed to save running build #{} of {}: {}", build.number(), self.name, e);
            }
        }

        if let Err(e) = self.store().save_descriptor(&self.descriptor()).await {
            error!("Failed to save builder {}: {}", self.name, e);
        }
    }
}

async fn cancel(store: Arc<RecordStore>, build: Arc<Build>) -> bool {
    if !build.is_finished() {
        return build.finish(BuildResult::Cancelled);
    }
    if build.result() != Some(BuildResult::Resume) {
        return false;
    }

    build.update(|r| r.result = Some(BuildResult::Cancelled));
    if let Err(e) = store.save_build(&build.snapshot()).await {
        error!("Failed to save cancelled build #{}: {}", build.number(), e);
    }
    true
}

impl std::fmt::Debug for BuilderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderStatus")
            .field("name", &self.name)
            .field("next_build_number", &self.next_build_number())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SourceStamp;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn test_status(config: &Config) -> (Arc<BuilderStatus>, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(RecordStore::new(temp.path(), 2));
        (BuilderStatus::new("linux", store, config), temp)
    }

    /// Forwards finishes to a channel
    struct Finishes(mpsc::UnboundedSender<(u64, BuildResult)>);

    impl StatusReceiver for Finishes {
        fn build_finished(
            &self,
            _builder: &str,
            build: &Arc<Build>,
            result: BuildResult,
        ) -> BuildhistResult<()> {
            let _ = self.0.send((build.number(), result));
            Ok(())
        }
    }

    struct Broken;

    impl StatusReceiver for Broken {
        fn build_started(
            &self,
            _builder: &str,
            _build: &Arc<Build>,
        ) -> BuildhistResult<Option<Arc<dyn crate::record::BuildWatcher>>> {
            Err(BuildhistError::Receiver("broken".into()))
        }

        fn build_finished(&self, _: &str, _: &Arc<Build>, _: BuildResult) -> BuildhistResult<()> {
            Err(BuildhistError::Receiver("broken".into()))
        }
    }

    fn finishes(status: &BuilderStatus) -> mpsc::UnboundedReceiver<(u64, BuildResult)> {
        let (tx, rx) = mpsc::unbounded_channel();
        status.subscribe(Arc::new(Finishes(tx)));
        rx
    }

    async fn next_finish(rx: &mut mpsc::UnboundedReceiver<(u64, BuildResult)>) -> (u64, BuildResult) {
        tokio::time::timeout(StdDuration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn build_numbers_increase() {
        let (status, _temp) = test_status(&Config::default());
        let numbers: Vec<u64> = (0..5).map(|_| status.new_build().number()).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
        assert_eq!(status.next_build_number(), 5);
    }

    #[tokio::test]
    async fn running_build_is_served_as_same_instance() {
        let (status, _temp) = test_status(&Config::default());
        let build = status.new_build();
        status.build_started(&build).unwrap();

        let fetched = status.get_build(build.number() as i64).await.unwrap();
        assert!(Arc::ptr_eq(&build, &fetched));
        let newest = status.get_build(-1).await.unwrap();
        assert!(Arc::ptr_eq(&build, &newest));
        assert_eq!(status.get_current_builds(&BranchSelection::new()).len(), 1);
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let (status, _temp) = test_status(&Config::default());
        let build = status.new_build();
        status.build_started(&build).unwrap();
        assert!(matches!(
            status.build_started(&build),
            Err(BuildhistError::BuildAlreadyRunning(0))
        ));
    }

    #[tokio::test]
    async fn finished_builds_are_persisted_before_notification() {
        let (status, _temp) = test_status(&Config::default());
        let mut rx = finishes(&status);

        let build = status.new_build();
        status.build_started(&build).unwrap();
        build.finish(BuildResult::Warnings);

        assert_eq!(next_finish(&mut rx).await, (0, BuildResult::Warnings));
        assert!(status.store().build_path(0).exists());
        assert!(status.get_current_builds(&BranchSelection::new()).is_empty());

        let loaded = status.store().load_build(0).await.unwrap().unwrap();
        assert_eq!(loaded.record.result, Some(BuildResult::Warnings));
    }

    #[tokio::test]
    async fn failing_receivers_do_not_block_others() {
        let (status, _temp) = test_status(&Config::default());
        status.subscribe(Arc::new(Broken));
        let mut rx = finishes(&status);

        let build = status.new_build();
        status.build_started(&build).unwrap();
        build.finish(BuildResult::Success);

        assert_eq!(next_finish(&mut rx).await, (0, BuildResult::Success));
    }

    #[tokio::test]
    async fn unsubscribed_receivers_hear_nothing() {
        let (status, _temp) = test_status(&Config::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver: Arc<dyn StatusReceiver> = Arc::new(Finishes(tx));
        status.subscribe(receiver.clone());
        status.unsubscribe(&receiver);
        assert_eq!(status.subscriber_count(), 0);

        let build = status.new_build();
        status.build_started(&build).unwrap();
        build.finish(BuildResult::Success);
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        assert!(rx.try_recv().is_err());
        assert!(status.store().build_path(0).exists());
    }

    #[tokio::test]
    async fn build_finishing_during_save_stays_finished_on_disk() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(RecordStore::new(temp.path(), 1));
        let status = BuilderStatus::new("linux", store, &Config::default());
        let mut rx = finishes(&status);

        let first = status.new_build();
        let second = status.new_build();
        status.build_started(&first).unwrap();
        status.build_started(&second).unwrap();

        let saving = tokio::spawn({
            let status = status.clone();
            async move { status.save_yourself().await }
        });
        tokio::task::yield_now().await;
        second.finish(BuildResult::Success);

        assert_eq!(next_finish(&mut rx).await, (1, BuildResult::Success));
        saving.await.unwrap();

        let on_disk = status.store().load_build(1).await.unwrap().unwrap();
        assert!(on_disk.record.finished);
        assert_eq!(on_disk.record.result, Some(BuildResult::Success));
        let running = status.store().load_build(0).await.unwrap().unwrap();
        assert!(!running.record.finished);
    }

    #[tokio::test]
    async fn last_finished_build_skips_running() {
        let (status, _temp) = test_status(&Config::default());
        let mut rx = finishes(&status);

        let first = status.new_build();
        status.build_started(&first).unwrap();
        first.finish(BuildResult::Success);
        next_finish(&mut rx).await;

        let second = status.new_build();
        status.build_started(&second).unwrap();

        let last = status.get_last_finished_build().await.unwrap();
        assert_eq!(last.number(), 0);
    }

    #[tokio::test]
    async fn out_of_range_numbers_are_not_found() {
        let (status, _temp) = test_status(&Config::default());
        status.new_build();
        assert!(status.get_build(5).await.is_none());
        assert!(status.get_build(-3).await.is_none());
    }

    #[tokio::test]
    async fn next_number_recovered_from_disk() {
        let (status, temp) = test_status(&Config::default());
        std::fs::write(status.store().build_path(41), b"{}").unwrap();
        std::fs::write(status.store().log_path(42, "stdio"), b"").unwrap();

        let reopened = BuilderStatus::open("linux", temp.path(), &Config::default())
            .await
            .unwrap();
        assert_eq!(reopened.next_build_number(), 43);
    }

    #[tokio::test]
    async fn descriptor_survives_reopen() {
        let mut config = Config::default();
        config.projects.insert(
            "web".into(),
            crate::config::ProjectConfig {
                codebases: vec![CodebaseConfig::new("app").with_branch("main")],
            },
        );
        let (status, temp) = test_status(&config);
        status.set_category(Some("linux".into()));
        status.set_project(Some("web".into()), vec![]);
        status.set_friendly_name(Some("Linux x64".into()));
        status.save_yourself().await;

        let reopened = BuilderStatus::open("linux", temp.path(), &config).await.unwrap();
        assert_eq!(reopened.friendly_name(), "Linux x64");
        assert_eq!(reopened.category().as_deref(), Some("linux"));
        assert_eq!(reopened.info().codebases.len(), 1);
    }

    #[tokio::test]
    async fn friendly_name_falls_back_to_name() {
        let (status, _temp) = test_status(&Config::default());
        assert_eq!(status.friendly_name(), "linux");
    }

    #[tokio::test]
    async fn events_are_bounded_and_indexed_from_newest() {
        let mut config = Config::default();
        config.retention.event_horizon = Some(3);
        let (status, _temp) = test_status(&config);
        for i in 0..5 {
            status.add_point_event(vec![format!("event {}", i)]);
        }

        assert_eq!(status.get_event(-1).unwrap().text, vec!["event 4"]);
        assert_eq!(status.get_event(0).unwrap().text, vec!["event 2"]);
        assert!(status.get_event(3).is_none());
    }

    #[tokio::test]
    async fn state_changes_are_published_once() {
        struct States(Mutex<Vec<BuilderState>>);
        impl StatusReceiver for States {
            fn builder_changed_state(&self, _: &str, state: BuilderState) -> BuildhistResult<()> {
                self.0.lock().push(state);
                Ok(())
            }
        }

        let (status, _temp) = test_status(&Config::default());
        let states = Arc::new(States(Mutex::new(vec![])));
        status.subscribe(states.clone());
        status.set_big_state(BuilderState::Idle);
        status.set_big_state(BuilderState::Idle);
        status.set_big_state(BuilderState::Building);

        assert_eq!(
            *states.0.lock(),
            vec![BuilderState::Offline, BuilderState::Idle, BuilderState::Building]
        );
    }

    #[tokio::test]
    async fn cancelling_running_build_finishes_it() {
        let (status, _temp) = test_status(&Config::default());
        let mut rx = finishes(&status);
        let build = status.new_build();
        status.build_started(&build).unwrap();

        let cancelled = status.cancel_build(0).await.unwrap();
        assert!(Arc::ptr_eq(&cancelled, &build));
        assert_eq!(next_finish(&mut rx).await, (0, BuildResult::Cancelled));
    }

    #[tokio::test]
    async fn cancelling_resume_build_rewrites_it_once() {
        let (status, _temp) = test_status(&Config::default());
        let mut record = BuildRecord::new("linux", 0);
        record.finished = true;
        record.result = Some(BuildResult::Resume);
        status.store().save_build(&record).await.unwrap();
        status.determine_next_build_number().await.unwrap();

        let (a, b) = tokio::join!(status.cancel_build(0), status.cancel_build(0));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert!(!status.is_cancelling(0));

        let stored = status.store().load_build(0).await.unwrap().unwrap();
        assert_eq!(stored.record.result, Some(BuildResult::Cancelled));

        // Finished builds with a final result are left alone
        let again = status.cancel_build(0).await.unwrap();
        assert_eq!(again.result(), Some(BuildResult::Cancelled));
    }

    #[tokio::test]
    async fn memo_keys_come_from_build_stamps() {
        let (status, _temp) = test_status(&Config::default());
        status.set_project(None, vec![CodebaseConfig::new("app").with_branch("main")]);

        let mut record = BuildRecord::new("linux", 7);
        record.sourcestamps.push(SourceStamp::new("app", "feature"));
        status.save_latest_build(Some(&record), "");
        assert_eq!(status.latest_memo("app=feature;"), Some(Some(7)));

        record.number = 9;
        record.result = Some(BuildResult::Resume);
        status.save_latest_build(Some(&record), "");
        assert_eq!(status.latest_memo("app=feature;"), Some(Some(7)));

        status.save_latest_build(None, "app=feature;");
        assert_eq!(status.latest_memo("app=feature;"), Some(Some(7)));
    }

    #[tokio::test]
    async fn empty_selection_has_empty_key() {
        let (status, _temp) = test_status(&Config::default());
        status.set_project(None, vec![CodebaseConfig::new("app").with_branch("main")]);
        assert_eq!(status.codebases_cache_key(&mut BranchSelection::new()), "");

        let mut selection = BranchSelection::from([("app".to_string(), "dev".to_string())]);
        assert_eq!(status.codebases_cache_key(&mut selection), "app=dev;");
    }

    #[tokio::test]
    async fn prune_spares_cached_builds() {
        let mut config = Config::default();
        config.retention.build_horizon = Some(2);
        let (status, _temp) = test_status(&config);
        for n in 0..6u64 {
            let mut record = BuildRecord::new("linux", n);
            record.finished = true;
            record.result = Some(BuildResult::Success);
            status.store().save_build(&record).await.unwrap();
        }
        status.determine_next_build_number().await.unwrap();
        assert!(status.get_build(1).await.is_some());

        let report = status.prune(false).await;
        assert_eq!(report.deleted.len(), 3);
        assert!(status.store().build_path(1).exists());
        assert!(!status.store().build_path(0).exists());
        assert!(status.store().build_path(4).exists());
    }
}
