// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Observed-state ingestor.
//!
//! Routes each inbound agent message to the handler for its type. Every
//! handler is a single pass against the store; nothing here holds locks
//! across objects, and duplicate or reordered messages are absorbed by
//! the revision gate and the command compare-and-set.
//!
//! Messages that name no known environment or object are dropped with a
//! log line. That is the expected outcome for traffic racing a deletion.

mod certificate;
pub mod pod;
mod release;
mod resource;

use std::sync::Arc;

use bosun_protocol::payload::{CommandSyncEntry, GitOpsSyncPayload};
use bosun_protocol::{AgentMessage, MessageKey, MessageType};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::drift::DriftReconciler;
use crate::error::Result;
use crate::model::{CommandType, ObjectKind};
use crate::persistence::{CommandRecord, EnvironmentRecord, ManagedObjectRecord, Persistence};
use crate::resolution;
use crate::timeout_sweep::TimeoutSweep;

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// State was read and applied.
    Applied,
    /// The message referred to a superseded or settled command, or repeated
    /// state already stored.
    Stale,
    /// No environment or object matched; the message was discarded.
    Dropped,
}

/// A message resolved to its environment.
pub(crate) struct MessageContext<'a> {
    pub env: EnvironmentRecord,
    pub key: MessageKey,
    pub message: &'a AgentMessage,
}

/// Handles inbound agent messages.
pub struct AgentMessageHandler {
    store: Arc<dyn Persistence>,
    drift: DriftReconciler,
    sweep: Arc<TimeoutSweep>,
}

impl AgentMessageHandler {
    /// Create a handler.
    pub fn new(store: Arc<dyn Persistence>, sweep: Arc<TimeoutSweep>) -> Self {
        let drift = DriftReconciler::new(store.clone());
        Self {
            store,
            drift,
            sweep,
        }
    }

    /// Handle one message.
    ///
    /// Errors are store or payload failures; unknown references are not errors.
    pub async fn handle(&self, message: &AgentMessage) -> Result<Disposition> {
        let key = match message.parsed_key() {
            Ok(key) => key,
            Err(e) => {
                warn!(key = %message.key, error = %e, "Dropping message with malformed key");
                return Ok(Disposition::Dropped);
            }
        };

        let Some(env) = self.resolve_environment(&key).await? else {
            info!(
                key = %message.key,
                message_type = %message.message_type,
                "No environment for message, dropping"
            );
            return Ok(Disposition::Dropped);
        };

        debug!(
            env_id = env.id,
            message_type = %message.message_type,
            command_id = message.command_id,
            "Handling agent message"
        );

        let ctx = MessageContext { env, key, message };
        match message.message_type {
            MessageType::HelmReleasePreInstall | MessageType::HelmReleasePreUpgrade => {
                self.handle_job_report(&ctx).await
            }
            MessageType::HelmInstallResourceInfo | MessageType::HelmUpgradeResourceInfo => {
                self.handle_release_result(&ctx).await
            }
            MessageType::HelmReleaseInstallFailed
            | MessageType::HelmReleaseUpgradeFailed
            | MessageType::HelmReleaseStartFailed
            | MessageType::HelmReleaseStopFailed
            | MessageType::HelmReleaseDeleteFailed => self.handle_release_failure(&ctx).await,
            MessageType::HelmReleaseStarted
            | MessageType::HelmReleaseStopped
            | MessageType::HelmReleaseDeleted => self.handle_release_confirmation(&ctx).await,
            MessageType::ResourceUpdate => self.handle_resource_update(&ctx).await,
            MessageType::ResourceDelete => self.handle_resource_delete(&ctx).await,
            MessageType::ResourceSync => self.handle_resource_sync(&ctx).await,
            MessageType::JobEvent | MessageType::ReleasePodEvent => {
                self.handle_kube_event(&ctx).await
            }
            MessageType::NetworkService => {
                self.handle_network_created(&ctx, ObjectKind::Service).await
            }
            MessageType::NetworkIngress => {
                self.handle_network_created(&ctx, ObjectKind::Ingress).await
            }
            MessageType::CertIssued | MessageType::CertFailed => {
                self.handle_certificate(&ctx).await
            }
            MessageType::GitOpsSyncEvent => {
                let payload: GitOpsSyncPayload = message.decode_payload()?;
                let report = self.drift.reconcile(ctx.env.id, &payload).await?;
                Ok(if report.duplicate {
                    Disposition::Stale
                } else {
                    Disposition::Applied
                })
            }
            MessageType::CommandStatusSyncRequest => {
                self.sweep.request_status(&ctx.env, Utc::now()).await?;
                Ok(Disposition::Applied)
            }
            MessageType::CommandStatusSyncResult => {
                let entries: Vec<CommandSyncEntry> = if message.payload_is_empty() {
                    Vec::new()
                } else {
                    message.decode_payload()?
                };
                self.sweep
                    .handle_status_result(ctx.env.id, &entries)
                    .await?;
                Ok(Disposition::Applied)
            }
            other => {
                info!(message_type = %other, "Unhandled message type, dropping");
                Ok(Disposition::Dropped)
            }
        }
    }

    async fn resolve_environment(&self, key: &MessageKey) -> Result<Option<EnvironmentRecord>> {
        let Ok(cluster_id) = key.cluster_id() else {
            return Ok(None);
        };

        if let Some(env_id) = key.env_id() {
            let env = self.store.get_environment(env_id).await?;
            return Ok(env.filter(|e| e.cluster_id == cluster_id));
        }

        match key.namespace() {
            Some(code) => self.store.find_environment(cluster_id, code).await,
            None => Ok(None),
        }
    }

    /// Instance named by the key's `release:` segment or `fallback`.
    pub(crate) async fn find_instance(
        &self,
        ctx: &MessageContext<'_>,
        fallback: Option<&str>,
    ) -> Result<Option<ManagedObjectRecord>> {
        let Some(name) = ctx.key.release().or(fallback) else {
            return Ok(None);
        };
        self.store
            .find_object(ctx.env.id, ObjectKind::Instance, "", name)
            .await
    }

    /// The object's in-flight command, if the message still concerns it.
    ///
    /// Returns `None` when there is no current command, it is already
    /// terminal, it is not of an accepted type, or the message carries a
    /// `commandId` naming a different command.
    pub(crate) async fn correlate(
        &self,
        ctx: &MessageContext<'_>,
        object: &ManagedObjectRecord,
        accepts: &[CommandType],
    ) -> Result<Option<CommandRecord>> {
        let Some(command) = resolution::current_command(self.store.as_ref(), object).await? else {
            return Ok(None);
        };

        if let Some(id) = ctx.message.command_id
            && id != command.id
        {
            debug!(
                object_id = object.id,
                reported = id,
                current = command.id,
                "Message refers to a superseded command"
            );
            return Ok(None);
        }
        if command.status.is_terminal() || !accepts.contains(&command.command_type) {
            debug!(
                command_id = command.id,
                status = %command.status,
                command_type = %command.command_type,
                message_type = %ctx.message.message_type,
                "Message does not apply to the current command"
            );
            return Ok(None);
        }
        Ok(Some(command))
    }

    pub(crate) fn dropped(ctx: &MessageContext<'_>, what: &str) -> Disposition {
        info!(
            env_id = ctx.env.id,
            key = %ctx.message.key,
            message_type = %ctx.message.message_type,
            "No {} for message, dropping",
            what
        );
        Disposition::Dropped
    }
}

/// Decode a payload that may hold one item or a list.
pub(crate) fn decode_many<T: serde::de::DeserializeOwned>(
    message: &AgentMessage,
) -> Result<Vec<T>> {
    if message.payload_is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = message.decode_payload()?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };
    items
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(Into::into))
        .collect()
}
