// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for bosun-control.

use thiserror::Error;

use crate::model::{CommandType, ObjectKind, ObjectStatus};

/// Control plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Desired-state composition rejected the documents.
    #[error("Validation error: {0}")]
    Compose(#[from] crate::compose::ComposeError),

    /// Git repository operation failed.
    #[error("Git error: {0}")]
    Git(#[from] crate::git::GitError),

    /// Agent dispatch failed.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] crate::dispatch::DispatchError),

    /// Agent message could not be interpreted.
    #[error("Protocol error: {0}")]
    Protocol(#[from] bosun_protocol::ProtocolError),

    /// The object's status does not permit the operation.
    #[error("cannot {operation} {kind} '{name}' while it is {status}")]
    InvalidTransition {
        /// Object kind.
        kind: ObjectKind,
        /// Object name.
        name: String,
        /// Requested operation.
        operation: CommandType,
        /// Current status, or `absent`.
        status: String,
    },

    /// Environment was not found.
    #[error("Environment not found: {0}")]
    EnvironmentNotFound(i64),

    /// Object was not found.
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Object already exists.
    #[error("{kind} '{name}' already exists")]
    ObjectAlreadyExists {
        /// Object kind.
        kind: ObjectKind,
        /// Object name.
        name: String,
    },

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build an [`Error::InvalidTransition`].
    pub fn invalid_transition(
        kind: ObjectKind,
        name: &str,
        operation: CommandType,
        status: Option<ObjectStatus>,
    ) -> Self {
        Error::InvalidTransition {
            kind,
            name: name.to_string(),
            operation,
            status: status.map_or_else(|| "absent".to_string(), |s| s.to_string()),
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Git(e) => e.is_retryable(),
            Error::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }

    /// Whether the caller sent something invalid.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Compose(_)
                | Error::InvalidTransition { .. }
                | Error::InvalidRequest(_)
                | Error::ObjectAlreadyExists { .. }
        )
    }
}

/// Result type using the control plane Error.
pub type Result<T> = std::result::Result<T, Error>;
