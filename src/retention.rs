//! Retention horizons
//!
//! Events are trimmed in memory; build records and logs older than their
//! horizon are unlinked from the builder directory, except for numbers that
//! are resident in the record cache or being written by a save.

use crate::config::RetentionConfig;
use crate::event::EventLog;
use crate::record::{RecordFileKind, RecordStore};
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// How much history to keep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Horizons {
    pub events: Option<usize>,
    pub builds: Option<u64>,
    pub logs: Option<u64>,
}

impl Horizons {
    /// Build and log floors for a builder whose next number is `next`.
    ///
    /// Files numbered below a floor are eligible for deletion. The log floor
    /// never trails the build floor.
    pub fn floors(&self, next: u64) -> (u64, u64) {
        let build_floor = self.builds.map_or(0, |h| next.saturating_sub(h));
        let log_floor = self
            .logs
            .map_or(0, |h| next.saturating_sub(h))
            .max(build_floor);
        (build_floor, log_floor)
    }
}

impl From<&RetentionConfig> for Horizons {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            events: config.event_horizon,
            builds: config.build_horizon,
            logs: config.log_horizon,
        }
    }
}

/// What a prune pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub events_dropped: usize,
    pub deleted: Vec<PathBuf>,
    /// Eligible files spared because they were cached or being saved
    pub spared: Vec<u64>,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.events_dropped == 0 && self.deleted.is_empty()
    }
}

/// Applies [`Horizons`] to one builder
#[derive(Debug, Clone)]
pub struct RetentionPruner {
    horizons: Horizons,
}

impl RetentionPruner {
    pub fn new(horizons: Horizons) -> Self {
        Self { horizons }
    }

    pub fn horizons(&self) -> Horizons {
        self.horizons
    }

    pub fn set_horizons(&mut self, horizons: Horizons) {
        self.horizons = horizons;
    }

    /// Drop events beyond the events horizon
    pub fn prune_events(&self, log: &mut EventLog) -> usize {
        match self.horizons.events {
            Some(horizon) => log.truncate_to(horizon),
            None => 0,
        }
    }

    /// Delete record and log files below their floors.
    ///
    /// Failures are logged and skipped; a missing directory is not an error.
    pub async fn prune_files(
        &self,
        store: &RecordStore,
        next: u64,
        is_resident: impl Fn(u64) -> bool,
    ) -> PruneReport {
        let mut report = PruneReport::default();
        let (build_floor, log_floor) = self.horizons.floors(next);
        if build_floor == 0 && log_floor == 0 {
            return report;
        }

        let files = match store.scan().await {
            Ok(files) => files,
            Err(e) => {
                warn!("Skipping prune of {}: {}", store.dir().display(), e);
                return report;
            }
        };

        for file in files {
            let floor = match file.kind {
                RecordFileKind::Build => build_floor,
                RecordFileKind::Log => log_floor,
            };
            if file.number >= floor {
                continue;
            }
            if is_resident(file.number) || store.is_saving(file.number) {
                debug!("Sparing {} (in use)", file.path.display());
                report.spared.push(file.number);
                continue;
            }
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => report.deleted.push(file.path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to prune {}: {}", file.path.display(), e),
            }
        }

        if !report.deleted.is_empty() {
            info!(
                "Pruned {} files from {} (build floor {}, log floor {})",
                report.deleted.len(),
                store.dir().display(),
                build_floor,
                log_floor
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use chrono::Utc;
    use tempfile::TempDir;

    fn horizons(builds: Option<u64>, logs: Option<u64>) -> Horizons {
        Horizons {
            events: None,
            builds,
            logs,
        }
    }

    #[test]
    fn floors_take_the_stricter_log_horizon() {
        assert_eq!(horizons(Some(5), Some(3)).floors(20), (15, 17));
        assert_eq!(horizons(Some(5), Some(10)).floors(20), (15, 15));
        assert_eq!(horizons(None, Some(3)).floors(20), (0, 17));
        assert_eq!(horizons(Some(50), None).floors(20), (0, 0));
    }

    #[test]
    fn events_trimmed_to_horizon() {
        let pruner = RetentionPruner::new(Horizons {
            events: Some(2),
            ..Horizons::default()
        });
        let mut log = EventLog::new();
        for i in 0..5 {
            log.push(Event::point(Utc::now(), vec![format!("e{}", i)]));
        }

        assert_eq!(pruner.prune_events(&mut log), 3);
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(-1).unwrap().text, vec!["e4"]);
    }

    #[tokio::test]
    async fn prunes_builds_and_logs_below_floors() {
        let temp = TempDir::new().unwrap();
        let store = RecordStore::new(temp.path(), 2);
        for n in 0..20u64 {
            std::fs::write(store.build_path(n), b"{}").unwrap();
            std::fs::write(store.log_path(n, "stdio"), b"log").unwrap();
        }

        let pruner = RetentionPruner::new(horizons(Some(5), Some(3)));
        let report = pruner.prune_files(&store, 20, |n| n == 3).await;

        for n in 0..20u64 {
            let build_kept = n >= 15 || n == 3;
            let log_kept = n >= 17 || n == 3;
            assert_eq!(store.build_path(n).exists(), build_kept, "build {}", n);
            assert_eq!(store.log_path(n, "stdio").exists(), log_kept, "log {}", n);
        }
        assert_eq!(report.deleted.len(), 14 + 16);
        assert_eq!(report.spared, vec![3, 3]);
    }

    #[tokio::test]
    async fn missing_directory_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let store = RecordStore::new(temp.path().join("gone"), 1);
        let pruner = RetentionPruner::new(horizons(Some(1), None));

        let report = pruner.prune_files(&store, 10, |_| false).await;
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn no_horizons_touch_nothing() {
        let temp = TempDir::new().unwrap();
        let store = RecordStore::new(temp.path(), 1);
        std::fs::write(store.build_path(0), b"{}").unwrap();

        let report = RetentionPruner::new(Horizons::default())
            .prune_files(&store, 100, |_| false)
            .await;
        assert!(report.is_empty());
        assert!(store.build_path(0).exists());
    }
}
