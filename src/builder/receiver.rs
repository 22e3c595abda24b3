//! Status subscribers

use crate::error::BuildhistResult;
use crate::record::{Build, BuildResult, BuildWatcher};
use crate::requests::PendingBuildRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Coarse state of a builder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuilderState {
    #[default]
    Offline,
    Idle,
    Waiting,
    Interlocked,
    Building,
}

impl fmt::Display for BuilderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offline => "offline",
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Interlocked => "interlocked",
            Self::Building => "building",
        };
        f.write_str(name)
    }
}

/// Receives a builder's state transitions.
///
/// Every method has a no-op default. An `Err` from one receiver is logged and
/// does not stop delivery to the others.
pub trait StatusReceiver: Send + Sync {
    fn builder_changed_state(
        &self,
        _builder: &str,
        _state: BuilderState,
    ) -> BuildhistResult<()> {
        Ok(())
    }

    /// A build started. Returning a watcher subscribes it to that build's finish.
    fn build_started(
        &self,
        _builder: &str,
        _build: &Arc<Build>,
    ) -> BuildhistResult<Option<Arc<dyn BuildWatcher>>> {
        Ok(None)
    }

    fn build_finished(
        &self,
        _builder: &str,
        _build: &Arc<Build>,
        _result: BuildResult,
    ) -> BuildhistResult<()> {
        Ok(())
    }

    fn request_submitted(&self, _request: &PendingBuildRequest) -> BuildhistResult<()> {
        Ok(())
    }

    fn request_cancelled(&self, _request: &PendingBuildRequest) -> BuildhistResult<()> {
        Ok(())
    }
}

/// Identity comparison for trait objects, ignoring vtables
pub(crate) fn same_receiver(a: &Arc<dyn StatusReceiver>, b: &Arc<dyn StatusReceiver>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
