// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Git repository trait definitions.
//!
//! The control plane only needs path-level operations against an
//! environment repository: read a file, write a file, delete a file.
//! Every write or delete authors exactly one commit and returns its sha,
//! including a write whose content matches the head (an empty commit).

use async_trait::async_trait;
use thiserror::Error;

/// Errors from repository operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GitError {
    /// Repository cannot be reached or opened.
    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    /// Another writer changed the repository concurrently.
    #[error("Conflicting write to {path}: {message}")]
    Conflict {
        /// File being written.
        path: String,
        /// Backend message.
        message: String,
    },

    /// Path does not exist.
    #[error("File not found: {0}")]
    NotFound(String),

    /// Path escapes the repository.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// git exited with an error.
    #[error("git {command} failed: {output}")]
    Command {
        /// Subcommand that failed.
        command: String,
        /// Standard error, or standard output when git wrote nothing there.
        output: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Whether repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GitError::Unavailable(_) | GitError::Conflict { .. } | GitError::Io(_)
        )
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, GitError>;

/// Trait for environment repository backends.
///
/// Backends are PURE file stores - they do NOT touch the database.
/// The file-to-objects index is maintained by the caller.
#[async_trait]
pub trait GitRepository: Send + Sync {
    /// Backend identifier (e.g., "cli", "mock")
    fn backend_type(&self) -> &'static str;

    /// Read a file at the repository head. `None` if it does not exist.
    async fn read_file(&self, repository: &str, path: &str) -> Result<Option<String>>;

    /// Create or replace a file and commit. Returns the commit sha.
    ///
    /// Unchanged content still yields a new, empty commit so every write
    /// has a sha of its own.
    async fn write_file(
        &self,
        repository: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<String>;

    /// Delete a file and commit. Returns the commit sha.
    async fn delete_file(&self, repository: &str, path: &str, message: &str) -> Result<String>;
}

/// Reject absolute paths and parent traversal.
pub fn check_relative_path(path: &str) -> Result<()> {
    let p = std::path::Path::new(path);
    let escapes = p.is_absolute()
        || p.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir)
        });
    if path.is_empty() || escapes {
        return Err(GitError::InvalidPath(path.to_string()));
    }
    Ok(())
}
