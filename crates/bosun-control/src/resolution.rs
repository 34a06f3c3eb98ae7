// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command resolution shared by every resolver.
//!
//! The ingestor, the drift reconciler, the timeout sweep, and the dispatch
//! failure path all settle commands through [`resolve`]. Resolution is a
//! compare-and-set on "still OPERATING", so concurrent resolvers racing on
//! the same command leave exactly one winner and the rest observe a no-op.

use tracing::{debug, info};

use crate::error::Result;
use crate::model::{CommandStatus, CommandType, ObjectKind, ObjectStatus};
use crate::persistence::{CommandRecord, CommandResolution, ManagedObjectRecord, Persistence};

/// Requested outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Terminal command status.
    pub status: CommandStatus,
    /// Failure text.
    pub error: Option<String>,
    /// Explicit object status; derived from kind and command type when `None`.
    pub object_status: Option<ObjectStatus>,
}

impl Resolution {
    /// Successful resolution with the kind's default status.
    pub fn success() -> Self {
        Self {
            status: CommandStatus::Success,
            error: None,
            object_status: None,
        }
    }

    /// Failed resolution with the kind's default failure status.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Failed,
            error: Some(error.into()),
            object_status: None,
        }
    }

    /// Override the object status.
    pub fn with_object_status(mut self, status: ObjectStatus) -> Self {
        self.object_status = Some(status);
        self
    }
}

/// Object status after a successful command.
pub fn success_status(kind: ObjectKind, command_type: CommandType) -> ObjectStatus {
    match command_type {
        CommandType::Stop => ObjectStatus::Stopped,
        _ => kind.steady_status(),
    }
}

/// Object status after a failed command.
///
/// A failed stop or start did not take effect, so the object keeps the
/// status it had before.
pub fn failure_status(kind: ObjectKind, command_type: CommandType) -> ObjectStatus {
    match command_type {
        CommandType::Stop => ObjectStatus::Running,
        CommandType::Start => ObjectStatus::Stopped,
        _ => kind.failure_status(),
    }
}

/// Load the object's current command.
pub async fn current_command(
    store: &dyn Persistence,
    object: &ManagedObjectRecord,
) -> Result<Option<CommandRecord>> {
    match object.command_id {
        Some(id) => store.get_command(id).await,
        None => Ok(None),
    }
}

/// Resolve `command` of `object`. Returns whether this call made the transition.
///
/// A successful DELETE removes the object and everything it owns.
pub async fn resolve(
    store: &dyn Persistence,
    object: &ManagedObjectRecord,
    command: &CommandRecord,
    resolution: Resolution,
) -> Result<bool> {
    if command.status.is_terminal() {
        debug!(
            command_id = command.id,
            status = %command.status,
            "Command already resolved"
        );
        return Ok(false);
    }

    let performed = if resolution.status == CommandStatus::Success
        && command.command_type == CommandType::Delete
    {
        store
            .resolve_command_and_remove_object(command.id, object.id)
            .await?
    } else {
        let object_status = resolution.object_status.unwrap_or(match resolution.status {
            CommandStatus::Failed => failure_status(object.kind, command.command_type),
            _ => success_status(object.kind, command.command_type),
        });
        store
            .resolve_command(&CommandResolution {
                command_id: command.id,
                object_id: object.id,
                status: resolution.status,
                error: resolution.error.clone(),
                object_status: Some(object_status),
            })
            .await?
    };

    if performed {
        info!(
            command_id = command.id,
            object_id = object.id,
            kind = %object.kind,
            name = %object.name,
            command_type = %command.command_type,
            status = %resolution.status,
            error = resolution.error.as_deref().unwrap_or(""),
            "Command resolved"
        );
    } else {
        debug!(
            command_id = command.id,
            "Command was resolved concurrently, skipping"
        );
    }

    Ok(performed)
}
