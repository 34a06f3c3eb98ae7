// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that surfaces commands the agent never answered.
//!
//! Every poll, each environment's in-flight commands that have not been
//! touched within the grace window are sent to the agent in a
//! `command_status_sync` request. The agent replies with the commit it
//! holds for each command; a reply matching the command's sha succeeds
//! it, anything else fails it with [`TIMEOUT_ERROR`].

use std::sync::Arc;
use std::time::Duration;

use bosun_protocol::payload::CommandSyncEntry;
use bosun_protocol::{AgentMessage, MessageKey, MessageType};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::dispatch::AgentChannel;
use crate::error::{Error, Result};
use crate::model::{ObjectKind, ObjectStatus};
use crate::persistence::{EnvironmentRecord, Persistence, TrackedCommand};
use crate::resolution::{self, Resolution};

/// Error stored on commands failed by the sweep.
pub const TIMEOUT_ERROR: &str = "The deploy is time out!";

/// Default grace window for in-flight commands.
pub const DEFAULT_COMMAND_GRACE: Duration = Duration::from_millis(180_000);

/// Configuration for the timeout sweep.
#[derive(Debug, Clone)]
pub struct TimeoutSweepConfig {
    /// How often to sweep all environments.
    pub poll_interval: Duration,
    /// Commands updated more recently than this are left alone.
    pub grace: Duration,
}

impl Default for TimeoutSweepConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            grace: DEFAULT_COMMAND_GRACE,
        }
    }
}

/// Outcome of applying one status reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSyncReport {
    /// Commands resolved to SUCCESS.
    pub succeeded: Vec<i64>,
    /// Commands resolved to FAILED.
    pub failed: Vec<i64>,
    /// Entries that were stale, terminal, or unknown.
    pub skipped: Vec<i64>,
}

/// Background worker that re-requests status for overdue commands.
pub struct TimeoutSweep {
    store: Arc<dyn Persistence>,
    channel: Arc<dyn AgentChannel>,
    config: TimeoutSweepConfig,
    shutdown: Arc<Notify>,
}

impl TimeoutSweep {
    /// Create a new sweep.
    pub fn new(
        store: Arc<dyn Persistence>,
        channel: Arc<dyn AgentChannel>,
        config: TimeoutSweepConfig,
    ) -> Self {
        Self {
            store,
            channel,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            grace_ms = self.config.grace.as_millis() as u64,
            "Timeout sweep started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Timeout sweep received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep_all(Utc::now()).await {
                        error!(error = %e, "Failed to sweep environments");
                    }
                }
            }
        }

        info!("Timeout sweep stopped");
    }

    /// Sweep every environment once. Returns the number of commands requested.
    pub async fn sweep_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut requested = 0;
        for env in self.store.list_environments().await? {
            match self.request_status(&env, now).await {
                Ok(n) => requested += n,
                Err(e) => warn!(env_id = env.id, error = %e, "Status request failed"),
            }
        }
        Ok(requested)
    }

    /// In-flight commands of an environment outside the grace window.
    pub async fn stale_commands(
        &self,
        env_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrackedCommand>> {
        let grace = chrono::Duration::from_std(self.config.grace)
            .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;

        Ok(self
            .store
            .list_tracked_commands(env_id)
            .await?
            .into_iter()
            .filter(|t| !t.command.status.is_terminal())
            .filter(|t| now - t.command.updated_at > grace)
            .collect())
    }

    /// Ask the agent for the status of overdue commands. Returns how many were sent.
    pub async fn request_status(&self, env: &EnvironmentRecord, now: DateTime<Utc>) -> Result<usize> {
        let stale = self.stale_commands(env.id, now).await?;
        if stale.is_empty() {
            debug!(env_id = env.id, "No overdue commands");
            return Ok(0);
        }

        let entries: Vec<CommandSyncEntry> = stale
            .iter()
            .map(|t| CommandSyncEntry {
                id: t.command.id,
                resource_type: t.object.kind.sync_segment(&t.object.custom_kind),
                resource_name: t.object.name.clone(),
                commit: t.command.sha.clone(),
            })
            .collect();

        let key = MessageKey::for_environment(env.cluster_id, &env.code, env.id);
        let message = AgentMessage::new(
            &key,
            MessageType::CommandStatusSync,
            serde_json::to_value(&entries)?,
        );
        self.channel.send(message).await?;

        info!(
            env_id = env.id,
            commands = entries.len(),
            "Requested status for overdue commands"
        );
        Ok(entries.len())
    }

    /// Apply the agent's status reply.
    pub async fn handle_status_result(
        &self,
        env_id: i64,
        entries: &[CommandSyncEntry],
    ) -> Result<StatusSyncReport> {
        let mut report = StatusSyncReport::default();

        for entry in entries {
            let Some(command) = self.store.get_command(entry.id).await? else {
                report.skipped.push(entry.id);
                continue;
            };
            let Some(object) = self.store.get_object(command.object_id).await? else {
                report.skipped.push(entry.id);
                continue;
            };
            if object.env_id != env_id
                || object.command_id != Some(command.id)
                || command.status.is_terminal()
            {
                debug!(command_id = command.id, "Status reply for a settled or superseded command");
                report.skipped.push(entry.id);
                continue;
            }

            let applied = command.sha.is_some() && entry.commit == command.sha;
            let resolved = if applied {
                let mut outcome = Resolution::success();
                if object.kind == ObjectKind::Certificate {
                    outcome = outcome.with_object_status(ObjectStatus::Active);
                }
                resolution::resolve(self.store.as_ref(), &object, &command, outcome).await?
            } else {
                resolution::resolve(
                    self.store.as_ref(),
                    &object,
                    &command,
                    Resolution::failure(TIMEOUT_ERROR),
                )
                .await?
            };

            match (resolved, applied) {
                (true, true) => report.succeeded.push(command.id),
                (true, false) => report.failed.push(command.id),
                (false, _) => report.skipped.push(command.id),
            }
        }

        info!(
            env_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Status reply applied"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TimeoutSweepConfig::default();
        assert_eq!(config.grace, Duration::from_millis(180_000));
        assert_eq!(config.poll_interval, Duration::from_secs(60));
    }
}
