//! Build records
//!
//! A [`BuildRecord`] is the plain data describing one build attempt. While a
//! build runs it lives inside a shared [`Build`] handle owned by the running
//! build; once finished and persisted it is reachable through the record
//! cache and the on-disk [`RecordStore`](store::RecordStore).

pub mod schema;
pub mod store;

pub use schema::{BuilderDescriptor, StoredBuild, CURRENT_SCHEMA_VERSION};
pub use store::{RecordFile, RecordFileKind, RecordStore};

use crate::error::BuildhistResult;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Outcome of a finished build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildResult {
    Success,
    Warnings,
    Failure,
    Skipped,
    Exception,
    Retry,
    Cancelled,
    /// Interrupted and waiting to be resumed on another worker
    Resume,
}

impl BuildResult {
    /// Numeric result code, stable across schema versions
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Warnings => 1,
            Self::Failure => 2,
            Self::Skipped => 3,
            Self::Exception => 4,
            Self::Retry => 5,
            Self::Cancelled => 6,
            Self::Resume => 9,
        }
    }

    /// Inverse of [`BuildResult::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::Warnings,
            2 => Self::Failure,
            3 => Self::Skipped,
            4 => Self::Exception,
            5 => Self::Retry,
            6 => Self::Cancelled,
            9 => Self::Resume,
            _ => return None,
        })
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Warnings => "warnings",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
            Self::Exception => "exception",
            Self::Retry => "retry",
            Self::Cancelled => "cancelled",
            Self::Resume => "resume",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for BuildResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "success" => Self::Success,
            "warnings" => Self::Warnings,
            "failure" => Self::Failure,
            "skipped" => Self::Skipped,
            "exception" => Self::Exception,
            "retry" => Self::Retry,
            "cancelled" => Self::Cancelled,
            "resume" => Self::Resume,
            _ => return Err(format!("unknown build result '{}'", s)),
        })
    }
}

/// What was built for one codebase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStamp {
    pub codebase: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
}

impl SourceStamp {
    pub fn new(codebase: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            codebase: codebase.into(),
            branch: Some(branch.into()),
            revision: None,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// One step of a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Step is blocked waiting on a lock or a dependency
    #[serde(default)]
    pub waiting: bool,
}

impl StepRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started_at: None,
            finished_at: None,
            waiting: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }
}

/// Data describing one build attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub number: u64,
    pub builder: String,
    pub finished: bool,
    pub result: Option<BuildResult>,
    pub sourcestamps: Vec<SourceStamp>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub responsible_users: Vec<String>,
}

impl BuildRecord {
    /// Create a fresh, unfinished record
    pub fn new(builder: impl Into<String>, number: u64) -> Self {
        Self {
            number,
            builder: builder.into(),
            finished: false,
            result: None,
            sourcestamps: vec![],
            started_at: Utc::now(),
            finished_at: None,
            steps: vec![],
            reason: String::new(),
            responsible_users: vec![],
        }
    }

    /// Branch of every source-stamp that names one
    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.sourcestamps.iter().filter_map(|ss| ss.branch.as_deref())
    }

    /// Every source-stamp matches the codebase → branch selection.
    ///
    /// An empty selection matches everything.
    pub fn matches_codebases(&self, selection: &BTreeMap<String, String>) -> bool {
        if selection.is_empty() {
            return true;
        }
        self.sourcestamps.iter().all(|ss| {
            selection
                .get(&ss.codebase)
                .is_some_and(|branch| ss.branch.as_deref() == Some(branch.as_str()))
        })
    }

    /// Codebase → branch pairs of the stamps that carry both
    pub fn codebase_branches(&self) -> BTreeMap<String, String> {
        self.sourcestamps
            .iter()
            .filter(|ss| !ss.codebase.is_empty())
            .filter_map(|ss| match ss.branch.as_deref() {
                Some(branch) if !branch.is_empty() => Some((ss.codebase.clone(), branch.to_string())),
                _ => None,
            })
            .collect()
    }

    /// Most recent moment this build did anything
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.finished_at
            .or_else(|| self.steps.iter().filter_map(|s| s.started_at).max())
            .unwrap_or(self.started_at)
    }
}

/// Receives notifications about a single build
pub trait BuildWatcher: Send + Sync {
    fn build_finished(&self, build: &Build, result: BuildResult) -> BuildhistResult<()>;
}

/// Shared handle over a build record
///
/// Running builds mutate the record through this handle; everyone else reads
/// it. The same handle is served from the record cache for as long as it is
/// resident, so callers can compare identity with [`Arc::ptr_eq`].
pub struct Build {
    number: u64,
    record: RwLock<BuildRecord>,
    finished: watch::Sender<bool>,
    watchers: Mutex<Vec<Arc<dyn BuildWatcher>>>,
}

impl Build {
    /// Create a handle for a new build
    pub fn new(builder: impl Into<String>, number: u64) -> Self {
        Self::from_record(BuildRecord::new(builder, number))
    }

    /// Wrap an existing record (e.g. one loaded from disk)
    pub fn from_record(record: BuildRecord) -> Self {
        let (finished, _) = watch::channel(record.finished);
        Self {
            number: record.number,
            record: RwLock::new(record),
            finished,
            watchers: Mutex::new(vec![]),
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Read access to the record
    pub fn record(&self) -> RwLockReadGuard<'_, BuildRecord> {
        self.record.read()
    }

    /// Clone of the current record state
    pub fn snapshot(&self) -> BuildRecord {
        self.record.read().clone()
    }

    /// Mutate the record in place
    pub fn update<R>(&self, f: impl FnOnce(&mut BuildRecord) -> R) -> R {
        f(&mut self.record.write())
    }

    pub fn is_finished(&self) -> bool {
        self.record.read().finished
    }

    pub fn result(&self) -> Option<BuildResult> {
        self.record.read().result
    }

    /// Append a step, returning its index
    pub fn add_step(&self, name: impl Into<String>) -> usize {
        self.update(|r| {
            r.steps.push(StepRecord::new(name));
            r.steps.len() - 1
        })
    }

    pub fn start_step(&self, index: usize, at: DateTime<Utc>) {
        self.update(|r| {
            if let Some(step) = r.steps.get_mut(index) {
                step.started_at = Some(at);
            }
        });
    }

    pub fn finish_step(&self, index: usize, at: DateTime<Utc>) {
        self.update(|r| {
            if let Some(step) = r.steps.get_mut(index) {
                step.finished_at = Some(at);
                step.waiting = false;
            }
        });
    }

    /// Register a watcher for this build's finish. Dropped once notified.
    pub fn subscribe(&self, watcher: Arc<dyn BuildWatcher>) {
        self.watchers.lock().push(watcher);
    }

    /// Mark the build finished.
    ///
    /// Returns false if it was already finished. Build watchers are notified
    /// and released; the owning builder picks the transition up through
    /// [`Build::wait_until_finished`].
    pub fn finish(&self, result: BuildResult) -> bool {
        let transitioned = self.update(|r| {
            if r.finished {
                return false;
            }
            r.finished = true;
            r.result = Some(result);
            r.finished_at.get_or_insert_with(Utc::now);
            true
        });
        if !transitioned {
            return false;
        }

        let watchers = std::mem::take(&mut *self.watchers.lock());
        for watcher in watchers {
            if let Err(e) = watcher.build_finished(self, result) {
                warn!("Build watcher failed for build #{}: {}", self.number, e);
            }
        }

        self.finished.send_replace(true);
        true
    }

    /// Resolve once the build is finished
    pub async fn wait_until_finished(&self) {
        let mut rx = self.finished.subscribe();
        // Sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl fmt::Debug for Build {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Build")
            .field("number", &self.number)
            .field("record", &*self.record.read())
            .finish()
    }
}
