//! Maps a project id (`workspaceRef`) onto its directory under the workspace root.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorkspaceError {
    #[error("invalid workspace reference {0:?}")]
    InvalidRef(String),
}

pub struct WorkspaceResolver {
    root: PathBuf,
}

impl WorkspaceResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `workspace_ref`. Existence is checked when the shell is spawned.
    pub fn resolve(&self, workspace_ref: &str) -> Result<PathBuf, WorkspaceError> {
        validate_project_id(workspace_ref)?;
        Ok(self.root.join(workspace_ref))
    }
}

/// Project ids are single path components: 1-128 chars of `[A-Za-z0-9._-]`, not `.` or `..`.
pub fn validate_project_id(id: &str) -> Result<(), WorkspaceError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidRef(id.chars().take(128).collect()))
    }
}
