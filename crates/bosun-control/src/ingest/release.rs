// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release lifecycle reports: hook jobs, install/upgrade results, failures,
//! and confirmations of start/stop/delete.

use bosun_protocol::MessageType;
use bosun_protocol::payload::{JobReport, ReleasePayload};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{AgentMessageHandler, Disposition, MessageContext, decode_many};
use crate::error::Result;
use crate::model::CommandType;
use crate::persistence::ResourceObservation;
use crate::resolution::{self, Resolution};

/// Commands that end in an install or upgrade.
const DEPLOYS: &[CommandType] = &[CommandType::Create, CommandType::Update, CommandType::Restart];

impl AgentMessageHandler {
    /// Pre-install/pre-upgrade job reports. The command stays in flight.
    pub(super) async fn handle_job_report(&self, ctx: &MessageContext<'_>) -> Result<Disposition> {
        let reports: Vec<JobReport> = decode_many(ctx.message)?;
        let fallback = reports.first().map(|r| r.release_name.as_str());
        let Some(object) = self.find_instance(ctx, fallback).await? else {
            return Ok(Self::dropped(ctx, "release"));
        };
        let Some(command) = self.correlate(ctx, &object, DEPLOYS).await? else {
            return Ok(Disposition::Stale);
        };

        for report in &reports {
            self.store
                .upsert_resource(&ResourceObservation {
                    env_id: ctx.env.id,
                    object_id: Some(object.id),
                    command_id: Some(command.id),
                    kind: report.kind.clone(),
                    name: report.name.clone(),
                    revision: Some(manifest_digest(&report.manifest)),
                    detail: report.manifest.clone(),
                    weight: report.weight,
                    scope_to_command: true,
                })
                .await?;
        }
        self.store.touch_command(command.id, Utc::now()).await?;

        debug!(
            command_id = command.id,
            jobs = reports.len(),
            "Hook jobs recorded"
        );
        Ok(Disposition::Applied)
    }

    /// Install or upgrade finished; the payload lists the release's resources.
    pub(super) async fn handle_release_result(
        &self,
        ctx: &MessageContext<'_>,
    ) -> Result<Disposition> {
        let payload: ReleasePayload = ctx.message.decode_payload()?;
        let Some(object) = self
            .find_instance(ctx, Some(payload.release_name.as_str()))
            .await?
        else {
            return Ok(Self::dropped(ctx, "release"));
        };

        let mut disposition = Disposition::Stale;
        if let Some(command) = self.correlate(ctx, &object, DEPLOYS).await? {
            let version_matches = match (&payload.chart_version, &command.version) {
                (Some(reported), Some(expected)) => reported == expected,
                _ => true,
            };
            if version_matches {
                let resolved = resolution::resolve(
                    self.store.as_ref(),
                    &object,
                    &command,
                    Resolution::success(),
                )
                .await?;
                if resolved {
                    if let Some(version) = payload.chart_version.as_ref().or(command.version.as_ref()) {
                        self.store.set_object_version(object.id, version).await?;
                    }
                    disposition = Disposition::Applied;
                }
            } else {
                info!(
                    command_id = command.id,
                    reported = payload.chart_version.as_deref().unwrap_or(""),
                    expected = command.version.as_deref().unwrap_or(""),
                    "Release result is for another version"
                );
            }
        }

        for resource in &payload.resources {
            let outcome = if resource.kind == "Pod" {
                self.mirror_pod(ctx, Some(object.id), &resource.object).await?
            } else {
                Some(
                    self.mirror_resource(
                        ctx,
                        Some(object.id),
                        &resource.kind,
                        &resource.name,
                        &resource.object,
                    )
                    .await?,
                )
            };
            if outcome.is_some_and(|o| o != crate::persistence::UpsertOutcome::Unchanged) {
                disposition = Disposition::Applied;
            }
        }

        Ok(disposition)
    }

    /// Explicit failure of an install, upgrade, start, stop, or delete.
    pub(super) async fn handle_release_failure(
        &self,
        ctx: &MessageContext<'_>,
    ) -> Result<Disposition> {
        let accepts: &[CommandType] = match ctx.message.message_type {
            MessageType::HelmReleaseStartFailed => &[CommandType::Start],
            MessageType::HelmReleaseStopFailed => &[CommandType::Stop],
            MessageType::HelmReleaseDeleteFailed => &[CommandType::Delete],
            _ => DEPLOYS,
        };
        let Some(object) = self.find_instance(ctx, None).await? else {
            return Ok(Self::dropped(ctx, "release"));
        };
        let Some(command) = self.correlate(ctx, &object, accepts).await? else {
            return Ok(Disposition::Stale);
        };

        let mut error = ctx.message.payload_text();
        if error.is_empty() {
            error = ctx.message.message_type.to_string();
        }

        let resolved = resolution::resolve(
            self.store.as_ref(),
            &object,
            &command,
            Resolution::failure(error),
        )
        .await?;
        Ok(if resolved {
            Disposition::Applied
        } else {
            Disposition::Stale
        })
    }

    /// Agent confirmed a start, stop, or delete.
    pub(super) async fn handle_release_confirmation(
        &self,
        ctx: &MessageContext<'_>,
    ) -> Result<Disposition> {
        let accepts: &[CommandType] = match ctx.message.message_type {
            MessageType::HelmReleaseStarted => &[CommandType::Start],
            MessageType::HelmReleaseStopped => &[CommandType::Stop],
            _ => &[CommandType::Delete],
        };
        let Some(object) = self.find_instance(ctx, None).await? else {
            return Ok(Self::dropped(ctx, "release"));
        };
        let Some(command) = self.correlate(ctx, &object, accepts).await? else {
            return Ok(Disposition::Stale);
        };

        let resolved = resolution::resolve(
            self.store.as_ref(),
            &object,
            &command,
            Resolution::success(),
        )
        .await?;
        Ok(if resolved {
            Disposition::Applied
        } else {
            Disposition::Stale
        })
    }
}

/// Revision token for job manifests, which carry no resource version.
fn manifest_digest(manifest: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(manifest.as_bytes()));
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_digest_is_stable() {
        assert_eq!(manifest_digest("a: 1"), manifest_digest("a: 1"));
        assert_ne!(manifest_digest("a: 1"), manifest_digest("a: 2"));
        assert_eq!(manifest_digest("").len(), 16);
    }
}
