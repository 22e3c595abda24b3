//! Cache keys for codebase selections
//!
//! A key encodes which branch of each of a project's codebases a query is
//! about, e.g. `app=main;lib=release-2;`. Keys partition the pending-request
//! cache and the latest-build memo.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Branch selection per codebase, as supplied by callers
pub type BranchSelection = BTreeMap<String, String>;

/// A codebase as configured on a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodebaseConfig {
    pub name: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
}

impl CodebaseConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branch: None,
            default_branch: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = Some(branch.into());
        self
    }

    /// Branch used when the caller does not pick one
    pub fn configured_branch(&self) -> &str {
        self.default_branch
            .as_deref()
            .or(self.branch.as_deref())
            .unwrap_or("")
    }
}

/// Derive the cache key for `overrides` against the project's codebases.
///
/// Codebases without an override get their configured branch, which is also
/// written back into `overrides`, so deriving twice over the same map is
/// stable.
pub fn derive_cache_key(codebases: &[CodebaseConfig], overrides: &mut BranchSelection) -> String {
    let mut sorted: Vec<&CodebaseConfig> = codebases.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut key = String::new();
    for codebase in sorted {
        let branch = overrides
            .entry(codebase.name.clone())
            .or_insert_with(|| codebase.configured_branch().to_string());
        key.push_str(&codebase.name);
        key.push('=');
        key.push_str(branch);
        key.push(';');
    }
    key
}

/// Number of codebases a key spans
pub fn codebase_count(key: &str) -> usize {
    key.split(';').filter(|part| !part.is_empty()).count()
}
