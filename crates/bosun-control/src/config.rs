// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for bosun-control.

use std::path::PathBuf;
use std::time::Duration;

/// Control plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Directory holding one working copy per environment repository
    pub gitops_dir: PathBuf,
    /// How often the timeout sweep runs
    pub sweep_interval: Duration,
    /// How long an in-flight command is left alone before its status is re-requested
    pub command_grace: Duration,
    /// Author recorded on manifest commits
    pub git_author: String,
    /// Upper bound on agent messages handled at once
    pub max_concurrent_messages: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = std::env::var("BOSUN_DATABASE_PATH")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingEnvVar("BOSUN_DATABASE_PATH"))?;

        let gitops_dir = std::env::var("BOSUN_GITOPS_DIR")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingEnvVar("BOSUN_GITOPS_DIR"))?;

        let sweep_interval =
            Duration::from_secs(parse_number("BOSUN_SWEEP_INTERVAL_SECS", 60)?);

        let command_grace =
            Duration::from_millis(parse_number("BOSUN_COMMAND_GRACE_MS", 180_000)?);

        let git_author = std::env::var("BOSUN_GIT_AUTHOR")
            .unwrap_or_else(|_| "bosun <bosun@localhost>".to_string());

        let max_concurrent_messages = parse_number("BOSUN_MAX_CONCURRENT_MESSAGES", 64)? as usize;

        Ok(Self {
            database_path,
            gitops_dir,
            sweep_interval,
            command_grace,
            git_author,
            max_concurrent_messages,
        })
    }
}

fn parse_number(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber(var)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A numeric variable could not be parsed.
    #[error("Invalid number in environment variable: {0}")]
    InvalidNumber(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number_default_when_unset() {
        assert_eq!(
            parse_number("BOSUN_TEST_SURELY_UNSET_VARIABLE", 42).unwrap(),
            42
        );
    }
}
