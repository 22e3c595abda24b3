//! Finished-build queries
//!
//! [`FinishedBuilds`] walks build numbers backward from the newest, loading
//! records through the cache and yielding the finished ones that pass a
//! [`BuildQuery`]. Single-result queries over a codebase selection go through
//! the latest-build memo.

use super::BuilderStatus;
use crate::cache::key::BranchSelection;
use crate::cache::latest::MemoLookup;
use crate::error::BuildhistResult;
use crate::record::{Build, BuildRecord, BuildResult};
use crate::requests::{RequestStore, SourceStampFilter};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Arbitrary record filter
pub type BuildPredicate = Arc<dyn Fn(&BuildRecord) -> bool + Send + Sync>;

/// Which finished builds to return
#[derive(Clone, Default)]
pub struct BuildQuery {
    /// Any stamp on one of these branches
    pub branches: BTreeSet<String>,
    /// Every stamp matches this codebase → branch selection
    pub codebases: BranchSelection,
    pub results: Option<HashSet<BuildResult>>,
    pub num_builds: Option<usize>,
    pub max_build_number: Option<u64>,
    pub finished_before: Option<DateTime<Utc>>,
    /// Scan depth; the builder's setting when unset
    pub max_search: Option<usize>,
    pub predicate: Option<BuildPredicate>,
    /// Consult and update the latest-build memo
    pub use_cache: bool,
}

impl BuildQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branches.insert(branch.into());
        self
    }

    pub fn codebase(mut self, codebase: impl Into<String>, branch: impl Into<String>) -> Self {
        self.codebases.insert(codebase.into(), branch.into());
        self
    }

    pub fn result(mut self, result: BuildResult) -> Self {
        self.results.get_or_insert_with(HashSet::new).insert(result);
        self
    }

    pub fn limit(mut self, num_builds: usize) -> Self {
        self.num_builds = Some(num_builds);
        self
    }

    pub fn max_build_number(mut self, number: u64) -> Self {
        self.max_build_number = Some(number);
        self
    }

    pub fn finished_before(mut self, at: DateTime<Utc>) -> Self {
        self.finished_before = Some(at);
        self
    }

    pub fn max_search(mut self, depth: usize) -> Self {
        self.max_search = Some(depth);
        self
    }

    pub fn filter(mut self, predicate: impl Fn(&BuildRecord) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn cached(mut self) -> Self {
        self.use_cache = true;
        self
    }

    /// Whether a finished record passes every filter
    pub fn accepts(&self, record: &BuildRecord) -> bool {
        if !record.finished {
            return false;
        }
        if self.max_build_number.is_some_and(|max| record.number > max) {
            return false;
        }
        if let Some(before) = self.finished_before {
            if record.finished_at.is_none_or(|end| end >= before) {
                return false;
            }
        }
        if !self.codebases.is_empty() {
            if !record.matches_codebases(&self.codebases) {
                return false;
            }
        } else if !self.branches.is_empty()
            && !record.branches().any(|b| self.branches.contains(b))
        {
            return false;
        }
        if let Some(results) = &self.results {
            if !record.result.is_some_and(|r| results.contains(&r)) {
                return false;
            }
        }
        self.predicate.as_ref().is_none_or(|p| p(record))
    }

    fn memoizable(&self, key: &str) -> bool {
        self.use_cache && self.num_builds == Some(1) && !key.is_empty()
    }

    fn store_filters(&self) -> Vec<SourceStampFilter> {
        if !self.branches.is_empty() {
            self.branches.iter().map(SourceStampFilter::branch).collect()
        } else {
            self.codebases
                .iter()
                .map(|(codebase, branch)| SourceStampFilter::codebase(codebase, branch))
                .collect()
        }
    }
}

impl fmt::Debug for BuildQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildQuery")
            .field("branches", &self.branches)
            .field("codebases", &self.codebases)
            .field("results", &self.results)
            .field("num_builds", &self.num_builds)
            .field("max_build_number", &self.max_build_number)
            .field("finished_before", &self.finished_before)
            .field("max_search", &self.max_search)
            .field("predicate", &self.predicate.is_some())
            .field("use_cache", &self.use_cache)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Scanning,
    Done,
}

/// Lazy backward scan over finished builds
pub struct FinishedBuilds<'a> {
    status: &'a BuilderStatus,
    query: BuildQuery,
    key: String,
    next_number: u64,
    max_search: u64,
    offset: u64,
    found: usize,
    phase: Phase,
}

impl<'a> FinishedBuilds<'a> {
    /// The cache key the query resolved to
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next matching build, newest first
    pub async fn next(&mut self) -> Option<Arc<Build>> {
        loop {
            match self.phase {
                Phase::Done => return None,
                Phase::Start => {
                    self.phase = Phase::Scanning;
                    if self.query.memoizable(&self.key) {
                        match self.status.lookup_latest(&self.key) {
                            MemoLookup::Hit(number) => {
                                trace!("Latest build memo hit for {:?}: {:?}", self.key, number);
                                self.phase = Phase::Done;
                                let number = number?;
                                return self.status.get_build(number as i64).await;
                            }
                            MemoLookup::Miss => {}
                        }
                    }
                }
                Phase::Scanning => {
                    if self.query.num_builds.is_some_and(|n| self.found >= n) {
                        self.phase = Phase::Done;
                        continue;
                    }
                    self.offset += 1;
                    if self.offset > self.next_number || self.offset > self.max_search {
                        self.phase = Phase::Done;
                        if self.query.memoizable(&self.key) && self.found == 0 {
                            self.status.save_latest_build(None, &self.key);
                        }
                        continue;
                    }

                    let number = self.next_number - self.offset;
                    let Some(build) = self.status.get_build(number as i64).await else {
                        continue;
                    };
                    if !self.query.accepts(&build.record()) {
                        continue;
                    }

                    self.found += 1;
                    if self.query.memoizable(&self.key) {
                        self.status.save_latest_build(Some(&build.snapshot()), &self.key);
                    }
                    return Some(build);
                }
            }
        }
    }

    /// Drain the scan
    pub async fn collect(mut self) -> Vec<Arc<Build>> {
        let mut builds = vec![];
        while let Some(build) = self.next().await {
            builds.push(build);
        }
        builds
    }

    /// Adapt the scan into a [`Stream`]
    pub fn into_stream(self) -> impl Stream<Item = Arc<Build>> + 'a {
        stream::unfold(self, |mut scan| async move {
            let build = scan.next().await?;
            Some((build, scan))
        })
    }
}

impl BuilderStatus {
    /// Finished builds matching `query`, newest first
    pub fn finished_builds(&self, mut query: BuildQuery) -> FinishedBuilds<'_> {
        let key = self.codebases_cache_key(&mut query.codebases);
        let max_search = query.max_search.unwrap_or_else(|| self.max_search()) as u64;
        FinishedBuilds {
            status: self,
            next_number: self.next_build_number(),
            query,
            key,
            max_search,
            offset: 0,
            found: 0,
            phase: Phase::Start,
        }
    }

    /// Finished builds matching `query`, located through the request store.
    ///
    /// The store picks the candidate numbers; records are loaded through the
    /// cache. Retry results are never requested from the store.
    pub async fn finished_builds_from_store(
        &self,
        store: &dyn RequestStore,
        mut query: BuildQuery,
    ) -> BuildhistResult<Vec<Arc<Build>>> {
        let key = self.codebases_cache_key(&mut query.codebases);
        let memoizable = query.memoizable(&key);
        if memoizable {
            if let MemoLookup::Hit(number) = self.lookup_latest(&key) {
                let build = match number {
                    Some(n) => self.get_build(n as i64).await,
                    None => None,
                };
                return Ok(build.into_iter().collect());
            }
        }

        let limit = query
            .num_builds
            .unwrap_or_else(|| query.max_search.unwrap_or_else(|| self.max_search()));
        let numbers = store
            .last_build_numbers(&self.name, &query.store_filters(), &[BuildResult::Retry], limit)
            .await?;

        let mut builds = vec![];
        for number in numbers {
            let Some(build) = self.get_build(number as i64).await else {
                continue;
            };
            if !query.accepts(&build.record()) {
                continue;
            }
            builds.push(build);
            if query.num_builds.is_some_and(|n| builds.len() >= n) {
                break;
            }
        }

        if memoizable {
            match builds.first() {
                Some(build) => self.save_latest_build(Some(&build.snapshot()), &key),
                None => self.save_latest_build(None, &key),
            }
        }
        Ok(builds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::CodebaseConfig;
    use crate::config::Config;
    use crate::record::{RecordStore, SourceStamp};
    use crate::requests::MemoryRequestStore;
    use chrono::Duration;
    use futures_util::StreamExt;
    use tempfile::TempDir;

    async fn seeded(builds: &[(u64, &str, BuildResult)]) -> (Arc<BuilderStatus>, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(RecordStore::new(temp.path(), 2));
        let status = BuilderStatus::new("linux", store, &Config::default());
        status.set_project(None, vec![CodebaseConfig::new("app").with_branch("main")]);

        for (number, branch, result) in builds {
            let mut record = BuildRecord::new("linux", *number);
            record.sourcestamps.push(SourceStamp::new("app", *branch));
            record.finished = true;
            record.result = Some(*result);
            record.finished_at = Some(Utc::now() - Duration::minutes(60 - *number as i64));
            status.store().save_build(&record).await.unwrap();
        }
        status.determine_next_build_number().await.unwrap();
        (status, temp)
    }

    fn numbers(builds: &[Arc<Build>]) -> Vec<u64> {
        builds.iter().map(|b| b.number()).collect()
    }

    #[tokio::test]
    async fn scans_newest_first_with_filters() {
        let (status, _temp) = seeded(&[
            (0, "main", BuildResult::Success),
            (1, "dev", BuildResult::Failure),
            (2, "main", BuildResult::Failure),
            (3, "main", BuildResult::Success),
        ])
        .await;

        let all = status.finished_builds(BuildQuery::new()).collect().await;
        assert_eq!(numbers(&all), vec![3, 2, 1, 0]);

        let main = status.finished_builds(BuildQuery::new().branch("main")).collect().await;
        assert_eq!(numbers(&main), vec![3, 2, 0]);

        let failed_main = status
            .finished_builds(BuildQuery::new().codebase("app", "main").result(BuildResult::Failure))
            .collect()
            .await;
        assert_eq!(numbers(&failed_main), vec![2]);

        let bounded = status
            .finished_builds(BuildQuery::new().max_build_number(2).limit(2))
            .collect()
            .await;
        assert_eq!(numbers(&bounded), vec![2, 1]);

        let odd = status
            .finished_builds(BuildQuery::new().filter(|r| r.number % 2 == 1))
            .collect()
            .await;
        assert_eq!(numbers(&odd), vec![3, 1]);
    }

    #[tokio::test]
    async fn scan_depth_is_bounded() {
        let (status, _temp) = seeded(&[
            (0, "main", BuildResult::Success),
            (1, "main", BuildResult::Success),
            (2, "main", BuildResult::Success),
        ])
        .await;
        let shallow = status.finished_builds(BuildQuery::new().max_search(2)).collect().await;
        assert_eq!(numbers(&shallow), vec![2, 1]);
    }

    #[tokio::test]
    async fn finished_before_excludes_later_builds() {
        let (status, _temp) = seeded(&[
            (0, "main", BuildResult::Success),
            (1, "main", BuildResult::Success),
        ])
        .await;
        let cutoff = Utc::now() - Duration::minutes(59) - Duration::seconds(30);
        let early = status
            .finished_builds(BuildQuery::new().finished_before(cutoff))
            .collect()
            .await;
        assert_eq!(numbers(&early), vec![0]);
    }

    #[tokio::test]
    async fn single_cached_result_is_memoized() {
        let (status, _temp) = seeded(&[
            (0, "main", BuildResult::Success),
            (1, "main", BuildResult::Failure),
        ])
        .await;
        let query = || BuildQuery::new().codebase("app", "main").limit(1).cached();

        let first = status.finished_builds(query()).collect().await;
        assert_eq!(numbers(&first), vec![1]);
        assert_eq!(status.latest_memo("app=main;"), Some(Some(1)));

        let second = status.finished_builds(query()).collect().await;
        assert_eq!(numbers(&second), vec![1]);
    }

    #[tokio::test]
    async fn memoized_absence_short_circuits() {
        let (status, _temp) = seeded(&[(0, "main", BuildResult::Success)]).await;
        let query = || BuildQuery::new().codebase("app", "release").limit(1).cached();

        assert!(status.finished_builds(query()).collect().await.is_empty());
        assert_eq!(status.latest_memo("app=release;"), Some(None));

        let mut scan = status.finished_builds(query());
        assert_eq!(scan.key(), "app=release;");
        assert!(scan.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_adapter_yields_same_builds() {
        let (status, _temp) = seeded(&[
            (0, "main", BuildResult::Success),
            (1, "main", BuildResult::Success),
        ])
        .await;
        let streamed: Vec<_> = status
            .finished_builds(BuildQuery::new())
            .into_stream()
            .collect()
            .await;
        assert_eq!(numbers(&streamed), vec![1, 0]);
    }

    #[tokio::test]
    async fn store_assisted_lookup_loads_listed_numbers() {
        let (status, _temp) = seeded(&[
            (0, "main", BuildResult::Success),
            (1, "main", BuildResult::Retry),
            (2, "main", BuildResult::Failure),
        ])
        .await;
        let requests = MemoryRequestStore::new();
        for (n, result) in [(0, BuildResult::Success), (1, BuildResult::Retry), (2, BuildResult::Failure)] {
            requests.record_build("linux", n, vec![SourceStamp::new("app", "main")], result);
        }

        let builds = status
            .finished_builds_from_store(&requests, BuildQuery::new().codebase("app", "main"))
            .await
            .unwrap();
        assert_eq!(numbers(&builds), vec![2, 0]);

        let latest = status
            .finished_builds_from_store(&requests, BuildQuery::new().codebase("app", "main").limit(1).cached())
            .await
            .unwrap();
        assert_eq!(numbers(&latest), vec![2]);
        assert_eq!(status.latest_memo("app=main;"), Some(Some(2)));
    }
}
