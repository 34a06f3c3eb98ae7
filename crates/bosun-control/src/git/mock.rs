// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock repository for testing.
//!
//! Keeps files in memory and fabricates commit shas, so the manifest
//! writer can be exercised without a git binary.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::traits::*;

/// Commit authored by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCommit {
    /// Commit sha.
    pub sha: String,
    /// Repository.
    pub repository: String,
    /// File touched.
    pub path: String,
    /// Commit message.
    pub message: String,
    /// Whether the commit deleted the file.
    pub deleted: bool,
    /// Whether the content matched the previous head (an empty commit).
    pub empty: bool,
}

/// Mock repository for testing.
pub struct MockGitRepository {
    files: Arc<Mutex<HashMap<(String, String), String>>>,
    commits: Arc<Mutex<Vec<MockCommit>>>,
    fail_writes: AtomicBool,
}

impl Default for MockGitRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGitRepository {
    /// Create an empty mock repository.
    pub fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            commits: Arc::new(Mutex::new(Vec::new())),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Create a mock whose writes fail as if the remote were unreachable.
    pub fn failing() -> Self {
        let repo = Self::new();
        repo.set_failing(true);
        repo
    }

    /// Toggle write failures.
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Seed a file without authoring a commit.
    pub async fn seed_file(&self, repository: &str, path: &str, content: &str) {
        self.files
            .lock()
            .await
            .insert((repository.to_string(), path.to_string()), content.to_string());
    }

    /// Current content of a file.
    pub async fn file(&self, repository: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .await
            .get(&(repository.to_string(), path.to_string()))
            .cloned()
    }

    /// Every commit authored so far, oldest first.
    pub async fn commits(&self) -> Vec<MockCommit> {
        self.commits.lock().await.clone()
    }

    /// Latest commit of a repository.
    pub async fn head(&self, repository: &str) -> Option<String> {
        self.commits
            .lock()
            .await
            .iter()
            .rev()
            .find(|c| c.repository == repository)
            .map(|c| c.sha.clone())
    }

    fn check_available(&self, repository: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GitError::Unavailable(format!(
                "mock repository '{}' is offline",
                repository
            )));
        }
        Ok(())
    }

    async fn record_commit(
        &self,
        repository: &str,
        path: &str,
        content: &str,
        message: &str,
        deleted: bool,
        empty: bool,
    ) -> String {
        let mut commits = self.commits.lock().await;

        let mut hasher = Sha256::new();
        hasher.update(repository.as_bytes());
        hasher.update(path.as_bytes());
        hasher.update(content.as_bytes());
        hasher.update(commits.len().to_le_bytes());
        let digest = format!("{:x}", hasher.finalize());
        let sha = digest[..40].to_string();

        commits.push(MockCommit {
            sha: sha.clone(),
            repository: repository.to_string(),
            path: path.to_string(),
            message: message.to_string(),
            deleted,
            empty,
        });
        sha
    }
}

#[async_trait]
impl GitRepository for MockGitRepository {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    async fn read_file(&self, repository: &str, path: &str) -> Result<Option<String>> {
        check_relative_path(path)?;
        Ok(self.file(repository, path).await)
    }

    async fn write_file(
        &self,
        repository: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<String> {
        check_relative_path(path)?;
        self.check_available(repository)?;

        let previous = self
            .files
            .lock()
            .await
            .insert((repository.to_string(), path.to_string()), content.to_string());
        let empty = previous.as_deref() == Some(content);

        Ok(self
            .record_commit(repository, path, content, message, false, empty)
            .await)
    }

    async fn delete_file(&self, repository: &str, path: &str, message: &str) -> Result<String> {
        check_relative_path(path)?;
        self.check_available(repository)?;

        let removed = self
            .files
            .lock()
            .await
            .remove(&(repository.to_string(), path.to_string()));
        if removed.is_none() {
            return Err(GitError::NotFound(path.to_string()));
        }

        Ok(self
            .record_commit(repository, path, "", message, true, false)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_delete() {
        let repo = MockGitRepository::new();

        let first = repo
            .write_file("env", "release-web.yaml", "a: 1\n", "create web")
            .await
            .unwrap();
        assert_eq!(first.len(), 40);
        assert_eq!(
            repo.read_file("env", "release-web.yaml").await.unwrap().as_deref(),
            Some("a: 1\n")
        );

        let second = repo
            .write_file("env", "release-web.yaml", "a: 1\n", "rewrite web")
            .await
            .unwrap();
        assert_ne!(first, second);

        let third = repo
            .delete_file("env", "release-web.yaml", "delete web")
            .await
            .unwrap();
        assert_eq!(repo.head("env").await, Some(third));
        assert!(repo.read_file("env", "release-web.yaml").await.unwrap().is_none());
        let commits = repo.commits().await;
        assert_eq!(commits.len(), 3);
        assert!(!commits[0].empty);
        assert!(commits[1].empty);
        assert!(commits[2].deleted);
    }

    #[tokio::test]
    async fn test_failing_repository_is_retryable() {
        let repo = MockGitRepository::failing();
        let err = repo
            .write_file("env", "release-web.yaml", "a: 1\n", "create")
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        repo.set_failing(false);
        assert!(repo.write_file("env", "release-web.yaml", "a: 1\n", "create").await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let repo = MockGitRepository::new();
        assert!(matches!(
            repo.write_file("env", "../other/x.yaml", "", "bad").await,
            Err(GitError::InvalidPath(_))
        ));
        assert!(repo.read_file("env", "/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_file() {
        let repo = MockGitRepository::new();
        assert!(matches!(
            repo.delete_file("env", "nope.yaml", "delete").await,
            Err(GitError::NotFound(_))
        ));
    }
}
