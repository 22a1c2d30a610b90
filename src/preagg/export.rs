//! Export location value object.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a backend export landed: a storage path plus a file pattern.
///
/// Owned by the manager from creation until released. Hashable so the
/// tracked-export set can atomically guard against double release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportLocation {
    pub path: String,
    pub file_pattern: String,
}

impl ExportLocation {
    pub fn new(path: impl Into<String>, file_pattern: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            file_pattern: file_pattern.into(),
        }
    }

    /// Path and pattern joined for the load statement.
    pub fn full_pattern(&self) -> String {
        format!("{}/{}", self.path, self.file_pattern)
    }
}

impl fmt::Display for ExportLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.path, self.file_pattern)
    }
}
