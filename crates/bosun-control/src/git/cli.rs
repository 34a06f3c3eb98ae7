// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repository backend driving the `git` binary.
//!
//! Each environment repository is a working copy under a common root
//! (`<root>/<repository>`). Writes stage a single path and commit it;
//! the new HEAD is returned as the commit sha. Rewriting identical content
//! authors an empty commit. Pushing to a remote is left to whatever syncs
//! the working copies.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use super::traits::*;

/// Repository backend using the git command line.
pub struct CliGitRepository {
    root: PathBuf,
    author_name: String,
    author_email: String,
}

impl CliGitRepository {
    /// Create a backend over `root`. `author` has the form `Name <email>`.
    pub fn new(root: impl Into<PathBuf>, author: &str) -> Self {
        let (author_name, author_email) = parse_author(author);
        Self {
            root: root.into(),
            author_name,
            author_email,
        }
    }

    /// Create an empty repository under the root.
    pub async fn init_repository(&self, repository: &str) -> Result<PathBuf> {
        check_relative_path(repository)?;
        let dir = self.root.join(repository);
        tokio::fs::create_dir_all(&dir).await?;
        self.git(&dir, &["init", "--quiet"]).await?;
        Ok(dir)
    }

    fn repo_dir(&self, repository: &str) -> Result<PathBuf> {
        check_relative_path(repository)?;
        let dir = self.root.join(repository);
        if !dir.join(".git").exists() {
            return Err(GitError::Unavailable(format!(
                "no working copy at {}",
                dir.display()
            )));
        }
        Ok(dir)
    }

    fn command(&self, dir: &Path, args: &[&str]) -> Command {
        let mut command = Command::new("git");
        command
            .arg("-C")
            .arg(dir)
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(args);
        command
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self
            .command(dir, args)
            .output()
            .await
            .map_err(|e| GitError::Unavailable(format!("cannot run git: {}", e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let command = args.first().copied().unwrap_or_default().to_string();
        if stderr.contains("index.lock") || stderr.contains("cannot lock ref") {
            return Err(GitError::Conflict {
                path: dir.display().to_string(),
                message: stderr,
            });
        }
        let output = if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr
        };
        Err(GitError::Command { command, output })
    }

    /// Whether the index differs from HEAD for `path`.
    async fn has_staged_change(&self, dir: &Path, path: &str) -> Result<bool> {
        let status = self
            .command(dir, &["diff", "--cached", "--quiet", "--", path])
            .status()
            .await
            .map_err(|e| GitError::Unavailable(format!("cannot run git: {}", e)))?;

        match status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(GitError::Command {
                command: "diff".to_string(),
                output: format!("exited with {}", status),
            }),
        }
    }

    async fn commit(&self, dir: &Path, path: &str, message: &str) -> Result<String> {
        if self.has_staged_change(dir, path).await? {
            self.git(dir, &["commit", "--quiet", "-m", message, "--", path])
                .await?;
        } else {
            self.git(dir, &["commit", "--quiet", "--allow-empty", "-m", message])
                .await?;
        }
        let sha = self.git(dir, &["rev-parse", "HEAD"]).await?;
        debug!(repository = %dir.display(), path = %path, sha = %sha, "Committed manifest change");
        Ok(sha)
    }
}

fn parse_author(author: &str) -> (String, String) {
    match author.split_once('<') {
        Some((name, rest)) => (
            name.trim().to_string(),
            rest.trim_end_matches('>').trim().to_string(),
        ),
        None => (author.trim().to_string(), "bosun@localhost".to_string()),
    }
}

#[async_trait]
impl GitRepository for CliGitRepository {
    fn backend_type(&self) -> &'static str {
        "cli"
    }

    async fn read_file(&self, repository: &str, path: &str) -> Result<Option<String>> {
        check_relative_path(path)?;
        let dir = self.repo_dir(repository)?;
        match tokio::fs::read_to_string(dir.join(path)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(
        &self,
        repository: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<String> {
        check_relative_path(path)?;
        let dir = self.repo_dir(repository)?;
        let target = dir.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;

        self.git(&dir, &["add", "--", path]).await?;
        self.commit(&dir, path, message).await
    }

    async fn delete_file(&self, repository: &str, path: &str, message: &str) -> Result<String> {
        check_relative_path(path)?;
        let dir = self.repo_dir(repository)?;
        if !dir.join(path).exists() {
            return Err(GitError::NotFound(path.to_string()));
        }

        self.git(&dir, &["rm", "--quiet", "--", path]).await?;
        self.commit(&dir, path, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_parse_author() {
        assert_eq!(
            parse_author("Deploy Bot <deploy@example.com>"),
            ("Deploy Bot".to_string(), "deploy@example.com".to_string())
        );
        assert_eq!(
            parse_author("bosun"),
            ("bosun".to_string(), "bosun@localhost".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_working_copy_is_unavailable() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = CliGitRepository::new(temp.path(), "bosun <bosun@localhost>");
        let err = repo.read_file("staging", "a.yaml").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_write_and_delete_commit() {
        if !git_available().await {
            eprintln!("Skipping test: git not installed");
            return;
        }

        let temp = tempfile::TempDir::new().unwrap();
        let repo = CliGitRepository::new(temp.path(), "bosun <bosun@localhost>");
        repo.init_repository("staging").await.unwrap();

        let first = repo
            .write_file("staging", "release-web.yaml", "a: 1\n", "create web")
            .await
            .unwrap();
        assert_eq!(first.len(), 40);
        assert_eq!(
            repo.read_file("staging", "release-web.yaml").await.unwrap().as_deref(),
            Some("a: 1\n")
        );

        let second = repo
            .delete_file("staging", "release-web.yaml", "delete web")
            .await
            .unwrap();
        assert_ne!(first, second);
        assert!(repo.read_file("staging", "release-web.yaml").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rewriting_identical_content_commits() {
        if !git_available().await {
            eprintln!("Skipping test: git not installed");
            return;
        }

        let temp = tempfile::TempDir::new().unwrap();
        let repo = CliGitRepository::new(temp.path(), "bosun <bosun@localhost>");
        repo.init_repository("staging").await.unwrap();

        let first = repo
            .write_file("staging", "release-web.yaml", "a: 1\n", "create web")
            .await
            .unwrap();
        let second = repo
            .write_file("staging", "release-web.yaml", "a: 1\n", "update web")
            .await
            .unwrap();

        assert_eq!(second.len(), 40);
        assert_ne!(first, second);
        assert_eq!(
            repo.read_file("staging", "release-web.yaml").await.unwrap().as_deref(),
            Some("a: 1\n")
        );
    }

    #[tokio::test]
    async fn test_failed_command_reports_output() {
        if !git_available().await {
            eprintln!("Skipping test: git not installed");
            return;
        }

        let temp = tempfile::TempDir::new().unwrap();
        let repo = CliGitRepository::new(temp.path(), "bosun <bosun@localhost>");
        let dir = repo.init_repository("staging").await.unwrap();

        let err = repo
            .git(&dir, &["commit", "-m", "nothing"])
            .await
            .unwrap_err();
        let GitError::Command { command, output } = err else {
            panic!("expected a command error, got {:?}", err);
        };
        assert_eq!(command, "commit");
        assert!(!output.is_empty());
    }
}
