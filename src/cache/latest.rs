//! Latest-build memo
//!
//! Remembers, per cache key, the most recent finished build matching that
//! codebase selection (or that there is none), so single-result queries can
//! skip a backward scan.

use super::key::codebase_count;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemoEntry {
    build: Option<u64>,
    saved_at: DateTime<Utc>,
}

/// Outcome of a memo lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoLookup {
    /// Nothing usable memoized; scan
    Miss,
    /// A fresh answer: the build number, or `None` for "no such build"
    Hit(Option<u64>),
}

/// Time-boxed map of cache key to latest matching build
#[derive(Debug, Clone)]
pub struct LatestBuildMemo {
    entries: HashMap<String, MemoEntry>,
    max_age: Duration,
}

impl LatestBuildMemo {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_age,
        }
    }

    pub fn set_max_age(&mut self, max_age: Duration) {
        self.max_age = max_age;
    }

    /// Look up `key`, dropping the entry if it has aged out
    pub fn lookup(&mut self, key: &str, now: DateTime<Utc>) -> MemoLookup {
        let Some(entry) = self.entries.get(key) else {
            return MemoLookup::Miss;
        };
        if now - entry.saved_at > self.max_age {
            trace!("Latest build memo for {:?} expired", key);
            self.entries.remove(key);
            return MemoLookup::Miss;
        }
        MemoLookup::Hit(entry.build)
    }

    /// Record the latest build for `key`.
    ///
    /// An empty result never replaces a known build, and is never stored for
    /// keys spanning several codebases. Returns whether the memo changed.
    pub fn save(&mut self, key: &str, build: Option<u64>, now: DateTime<Utc>) -> bool {
        if build.is_none() {
            let holds_build = self.entries.get(key).is_some_and(|e| e.build.is_some());
            if holds_build || codebase_count(key) > 1 {
                return false;
            }
        }
        self.entries.insert(
            key.to_string(),
            MemoEntry {
                build,
                saved_at: now,
            },
        );
        true
    }

    pub fn get(&self, key: &str) -> Option<Option<u64>> {
        self.entries.get(key).map(|e| e.build)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
