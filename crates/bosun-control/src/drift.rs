// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drift reconciler.
//!
//! Consumes the agent's commit ledger for one GitOps sync cycle and
//! settles in-flight commands by comparing the commit the agent applied
//! for each object with the sha the command expects.
//!
//! Per object, in order of precedence:
//!
//! 1. An apply error recorded for the object's file and tagged with this
//!    object fails the command.
//! 2. A reported commit equal to the command's sha succeeds it.
//! 3. Anything else leaves it in flight.
//!
//! A ledger whose top-level commit was already recorded is a duplicate and
//! changes nothing.

use std::sync::Arc;

use bosun_protocol::payload::{GitOpsSyncPayload, ResourceCommit};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{ObjectKind, split_sync_tag};
use crate::persistence::{EnvironmentRecord, FileErrorReport, Persistence};
use crate::resolution::{self, Resolution};

/// What one ledger changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// The ledger had already been applied.
    pub duplicate: bool,
    /// Commands resolved to SUCCESS.
    pub succeeded: Vec<i64>,
    /// Commands resolved to FAILED.
    pub failed: Vec<i64>,
    /// Commands still waiting for their commit.
    pub pending: Vec<i64>,
    /// Resource tags that named no known object.
    pub unresolved: Vec<String>,
}

/// Settles commands from GitOps sync ledgers.
pub struct DriftReconciler {
    store: Arc<dyn Persistence>,
}

impl DriftReconciler {
    /// Create a reconciler.
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// Apply one ledger to an environment.
    pub async fn reconcile(
        &self,
        env_id: i64,
        payload: &GitOpsSyncPayload,
    ) -> Result<SyncReport> {
        let env = self
            .store
            .get_environment(env_id)
            .await?
            .ok_or(Error::EnvironmentNotFound(env_id))?;
        let commit = payload.metadata.commit.as_str();

        if env.agent_sync_commit.as_deref() == Some(commit) {
            debug!(env_id, commit, "Sync ledger already applied, skipping");
            return Ok(SyncReport {
                duplicate: true,
                ..SyncReport::default()
            });
        }

        if !commit.is_empty() {
            self.store.set_agent_sync_commit(env.id, commit).await?;
        }
        for file in &payload.metadata.files_commit {
            self.store
                .set_file_agent_commit(env.id, &file.file, &file.commit)
                .await?;
        }

        let mut error_paths = Vec::with_capacity(payload.errors.len());
        for error in &payload.errors {
            self.store
                .record_file_error(
                    env.id,
                    &FileErrorReport {
                        file_path: error.path.clone(),
                        commit: error.commit.clone(),
                        error: error.error.clone(),
                        resource: error.id.clone(),
                    },
                )
                .await?;
            error_paths.push(error.path.clone());
        }
        let cleared = self
            .store
            .clear_file_errors_except(env.id, &error_paths)
            .await?;

        let mut report = SyncReport::default();
        for entry in &payload.metadata.resource_commits {
            self.reconcile_entry(&env, entry, &mut report).await?;
        }

        info!(
            env_id = env.id,
            commit,
            errors = payload.errors.len(),
            cleared_errors = cleared,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            pending = report.pending.len(),
            unresolved = report.unresolved.len(),
            "Sync ledger reconciled"
        );

        Ok(report)
    }

    async fn reconcile_entry(
        &self,
        env: &EnvironmentRecord,
        entry: &ResourceCommit,
        report: &mut SyncReport,
    ) -> Result<()> {
        let Some((segment, name)) = split_sync_tag(&entry.resource_id) else {
            debug!(resource_id = %entry.resource_id, "Malformed resource tag in ledger");
            report.unresolved.push(entry.resource_id.clone());
            return Ok(());
        };
        let kind = ObjectKind::from_sync_segment(segment);
        let custom_kind = if kind == ObjectKind::Custom { segment } else { "" };

        let Some(object) = self
            .store
            .find_object(env.id, kind, custom_kind, name)
            .await?
        else {
            debug!(resource_id = %entry.resource_id, "Ledger names an unknown object");
            report.unresolved.push(entry.resource_id.clone());
            return Ok(());
        };

        let Some(command) = resolution::current_command(self.store.as_ref(), &object).await?
        else {
            return Ok(());
        };
        if command.status.is_terminal() {
            return Ok(());
        }

        let file_path = match &entry.file {
            Some(path) => Some(path.clone()),
            None => self
                .store
                .get_file_resource(env.id, object.id)
                .await?
                .map(|f| f.file_path),
        };
        let file_error = match &file_path {
            Some(path) => self.store.get_file_error(env.id, path).await?,
            None => None,
        };
        let tag = object.sync_tag();

        if let Some(error) = file_error.filter(|e| {
            e.resource
                .as_deref()
                .is_some_and(|r| r.eq_ignore_ascii_case(&tag))
        }) {
            if resolution::resolve(
                self.store.as_ref(),
                &object,
                &command,
                Resolution::failure(error.error),
            )
            .await?
            {
                report.failed.push(command.id);
            }
        } else if command.sha.as_deref() == Some(entry.commit.as_str()) {
            if resolution::resolve(
                self.store.as_ref(),
                &object,
                &command,
                Resolution::success(),
            )
            .await?
            {
                report.succeeded.push(command.id);
            }
        } else {
            debug!(
                command_id = command.id,
                expected = command.sha.as_deref().unwrap_or(""),
                reported = %entry.commit,
                "Applied commit has not caught up"
            );
            report.pending.push(command.id);
        }

        Ok(())
    }
}
