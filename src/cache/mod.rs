//! Per-builder caches
//!
//! | Cache | Keyed by | Invalidated |
//! |-------|----------|-------------|
//! | [`BuildRecordCache`] | build number | LRU eviction, running builds pinned |
//! | [`LatestBuildMemo`] | cache key | age, newer finished builds |
//! | [`PendingRequestCache`] | cache key | any build or request transition |

pub mod key;
pub mod latest;
pub mod pending;
pub mod records;

pub use key::{derive_cache_key, BranchSelection, CodebaseConfig};
pub use latest::{LatestBuildMemo, MemoLookup};
pub use pending::{PendingRequestCache, PendingRequestSummary};
pub use records::{BuildRecordCache, LoadOutcome};
