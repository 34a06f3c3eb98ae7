// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Certificate issuance reports.

use bosun_protocol::MessageType;
use tracing::debug;

use super::{AgentMessageHandler, Disposition, MessageContext};
use crate::error::Result;
use crate::model::{CommandType, ObjectKind, ObjectStatus};
use crate::persistence::NewCommand;
use crate::resolution::{self, Resolution};

impl AgentMessageHandler {
    /// `cert_issued` / `cert_failed`, keyed by `Cert:<name>` and optionally
    /// `commit:<sha>`.
    ///
    /// Issuance can happen long after the certificate's command settled
    /// (renewals). Without an in-flight command, one is recorded and
    /// resolved on the spot so the outcome appears in the history.
    pub(super) async fn handle_certificate(&self, ctx: &MessageContext<'_>) -> Result<Disposition> {
        let issued = ctx.message.message_type == MessageType::CertIssued;
        let Some(name) = ctx.key.cert().or(ctx.key.name()) else {
            return Ok(Self::dropped(ctx, "certificate name"));
        };
        let Some(object) = self
            .store
            .find_object(ctx.env.id, ObjectKind::Certificate, "", name)
            .await?
        else {
            return Ok(Self::dropped(ctx, "certificate"));
        };

        let outcome = if issued {
            Resolution::success().with_object_status(ObjectStatus::Active)
        } else {
            let text = ctx.message.payload_text();
            Resolution::failure(if text.is_empty() {
                "certificate issuance failed".to_string()
            } else {
                text
            })
        };
        let commit = ctx.key.commit();

        let current = resolution::current_command(self.store.as_ref(), &object).await?;
        let in_flight = current.filter(|c| {
            !c.status.is_terminal() && ctx.message.command_id.is_none_or(|id| id == c.id)
        });

        let command = match in_flight {
            Some(command) => {
                if let (Some(reported), Some(expected)) = (commit, command.sha.as_deref())
                    && reported != expected
                {
                    debug!(
                        command_id = command.id,
                        reported,
                        expected,
                        "Certificate report is for another commit"
                    );
                    return Ok(Disposition::Stale);
                }
                command
            }
            None => {
                let settled = if issued {
                    object.status == ObjectStatus::Active
                } else {
                    object.status == ObjectStatus::Failed
                };
                if settled {
                    return Ok(Disposition::Stale);
                }
                self.store
                    .begin_command(
                        object.id,
                        &NewCommand {
                            command_type: CommandType::Update,
                            version: object.desired_version.clone(),
                            deployed_values: object.deployed_values.clone(),
                            sha: commit.map(str::to_string),
                        },
                    )
                    .await?
            }
        };

        let resolved =
            resolution::resolve(self.store.as_ref(), &object, &command, outcome).await?;
        Ok(if resolved {
            Disposition::Applied
        } else {
            Disposition::Stale
        })
    }
}
