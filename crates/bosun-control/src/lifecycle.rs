// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command lifecycle manager.
//!
//! Entry point for user intent. Every request walks the same steps:
//!
//! 1. Check the object's status permits the operation.
//! 2. Compose and validate the desired state; identical state is a no-op.
//! 3. Insert a new OPERATING command and repoint the object at it.
//! 4. Write the manifest to Git (create, update, delete only).
//! 5. Store the commit sha on the command.
//! 6. Dispatch to the agent.
//!
//! Steps 1 and 2 fail before anything is persisted. A Git failure leaves
//! the command OPERATING with no sha, which is what allows the same
//! request to be retried. A dispatch failure is the only synchronous
//! resolution: the command fails immediately.

use std::sync::Arc;

use bosun_protocol::key::{KIND, NAME};
use bosun_protocol::payload::{GitOpsApplyPayload, ReleaseCommandPayload};
use bosun_protocol::{AgentMessage, MessageKey, MessageType};
use tracing::{info, warn};

use crate::compose::compose;
use crate::dispatch::AgentChannel;
use crate::error::{Error, Result};
use crate::manifest_writer::{self, DeleteOutcome, ManifestWriter};
use crate::model::{CommandType, ObjectKind, ObjectStatus};
use crate::persistence::{
    CommandRecord, EnvironmentRecord, ManagedObjectRecord, NewCommand, NewObject, Persistence,
    TrackedCommand,
};
use crate::resolution::{self, Resolution};

/// Maximum length of a release name.
pub const MAX_RELEASE_NAME_LEN: usize = 53;

/// Application version an instance is deployed from.
#[derive(Debug, Clone)]
pub struct AppVersion {
    /// Helm chart name.
    pub chart_name: String,
    /// Chart version.
    pub version: String,
    /// Chart repository.
    pub repo_url: Option<String>,
    /// Baseline values document of the version.
    pub values: String,
}

/// Create or update an instance.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Environment.
    pub env_id: i64,
    /// Release name.
    pub name: String,
    /// Version to deploy.
    pub version: AppVersion,
    /// Override values, possibly empty.
    pub values: String,
}

/// Create or update a non-instance object.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    /// Environment.
    pub env_id: i64,
    /// Kind; must not be [`ObjectKind::Instance`].
    pub kind: ObjectKind,
    /// Concrete kind for custom resources.
    pub custom_kind: String,
    /// Object name.
    pub name: String,
    /// Resource manifest.
    pub manifest: String,
    /// Service type, services only.
    pub service_type: Option<String>,
}

/// What a lifecycle request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// A command was created and dispatched.
    Accepted {
        /// Object.
        object_id: i64,
        /// New current command.
        command_id: i64,
        /// Commit the command expects, if it wrote Git.
        sha: Option<String>,
    },
    /// Desired state already matched; nothing was written.
    Unchanged {
        /// Object.
        object_id: i64,
    },
    /// The object had nothing in Git and was removed directly.
    Removed {
        /// Removed object.
        object_id: i64,
    },
}

/// Check a release name against DNS-label rules.
pub fn validate_release_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_RELEASE_NAME_LEN
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!(
            "release name '{}' must be a lowercase DNS label of at most {} characters",
            name, MAX_RELEASE_NAME_LEN
        )))
    }
}

/// Manages commands for every object kind.
pub struct CommandLifecycle {
    store: Arc<dyn Persistence>,
    writer: ManifestWriter,
    channel: Arc<dyn AgentChannel>,
}

impl CommandLifecycle {
    /// Create a lifecycle manager.
    pub fn new(
        store: Arc<dyn Persistence>,
        writer: ManifestWriter,
        channel: Arc<dyn AgentChannel>,
    ) -> Self {
        Self {
            store,
            writer,
            channel,
        }
    }

    /// Deploy an instance. `operation` is CREATE or UPDATE.
    pub async fn deploy_instance(
        &self,
        request: &DeployRequest,
        operation: CommandType,
    ) -> Result<OperationOutcome> {
        if !matches!(operation, CommandType::Create | CommandType::Update) {
            return Err(Error::InvalidRequest(format!(
                "deploy does not accept {}",
                operation
            )));
        }
        validate_release_name(&request.name)?;
        let env = self.environment(request.env_id).await?;

        let existing = self
            .store
            .find_object(env.id, ObjectKind::Instance, "", &request.name)
            .await?;
        self.checked_current(ObjectKind::Instance, &request.name, operation, existing.as_ref())
            .await?;

        let composition = compose(&request.version.values, &request.values)?;

        if let Some(object) = &existing
            && object.status == ObjectStatus::Running
            && object.desired_version.as_deref() == Some(request.version.version.as_str())
            && object.deployed_values.as_deref() == Some(composition.merged.as_str())
        {
            info!(object_id = object.id, "Desired state unchanged, skipping deploy");
            return Ok(OperationOutcome::Unchanged {
                object_id: object.id,
            });
        }

        let document = manifest_writer::release_document(
            &request.name,
            &request.version.chart_name,
            &request.version.version,
            request.version.repo_url.as_deref(),
            &composition.delta,
        )?;

        let new_command = NewCommand {
            command_type: operation,
            version: Some(request.version.version.clone()),
            deployed_values: Some(composition.merged),
            sha: None,
        };
        let (object, command) = self
            .start_command(
                existing,
                NewObject {
                    env_id: env.id,
                    kind: ObjectKind::Instance,
                    custom_kind: String::new(),
                    name: request.name.clone(),
                    service_type: None,
                },
                &new_command,
            )
            .await?;

        self.write_and_dispatch(&env, &object, &command, &document)
            .await
    }

    /// Create or update a service, ingress, certificate, config map, secret,
    /// or custom resource.
    pub async fn apply_object(
        &self,
        request: &ApplyRequest,
        operation: CommandType,
    ) -> Result<OperationOutcome> {
        if request.kind == ObjectKind::Instance {
            return Err(Error::InvalidRequest(
                "instances are deployed from an application version".into(),
            ));
        }
        if !matches!(operation, CommandType::Create | CommandType::Update) {
            return Err(Error::InvalidRequest(format!(
                "apply does not accept {}",
                operation
            )));
        }
        if request.kind == ObjectKind::Custom && request.custom_kind.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "custom resources need a concrete kind".into(),
            ));
        }
        if request.name.is_empty() || request.name.contains('/') {
            return Err(Error::InvalidRequest(format!(
                "invalid object name '{}'",
                request.name
            )));
        }
        let env = self.environment(request.env_id).await?;

        let existing = self
            .store
            .find_object(env.id, request.kind, &request.custom_kind, &request.name)
            .await?;
        self.checked_current(request.kind, &request.name, operation, existing.as_ref())
            .await?;

        let document = manifest_writer::resource_document(
            request.kind.manifest_kind(&request.custom_kind),
            &request.name,
            &request.manifest,
        )?;
        let rendered = serde_yaml::to_string(&document)?;

        if let Some(object) = &existing
            && !matches!(object.status, ObjectStatus::Operating | ObjectStatus::Failed)
            && object.deployed_values.as_deref() == Some(rendered.as_str())
        {
            info!(object_id = object.id, "Manifest unchanged, skipping apply");
            return Ok(OperationOutcome::Unchanged {
                object_id: object.id,
            });
        }

        let new_command = NewCommand {
            command_type: operation,
            version: None,
            deployed_values: Some(rendered),
            sha: None,
        };
        let (object, command) = self
            .start_command(
                existing,
                NewObject {
                    env_id: env.id,
                    kind: request.kind,
                    custom_kind: request.custom_kind.clone(),
                    name: request.name.clone(),
                    service_type: request.service_type.clone(),
                },
                &new_command,
            )
            .await?;

        self.write_and_dispatch(&env, &object, &command, &document)
            .await
    }

    /// Delete any object.
    pub async fn delete_object(
        &self,
        env_id: i64,
        kind: ObjectKind,
        custom_kind: &str,
        name: &str,
    ) -> Result<OperationOutcome> {
        let env = self.environment(env_id).await?;
        let object = self.require_object(&env, kind, custom_kind, name).await?;
        self.checked_current(kind, name, CommandType::Delete, Some(&object))
            .await?;

        let (object, command) = self
            .begin_on(
                object,
                &NewCommand {
                    command_type: CommandType::Delete,
                    version: None,
                    deployed_values: None,
                    sha: None,
                },
            )
            .await?;

        let outcome = match self.writer.delete(&env, &object).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(command_id = command.id, error = %e, "Manifest delete failed, command left in flight");
                return Err(e);
            }
        };

        match outcome {
            DeleteOutcome::Untracked => {
                self.store.delete_object(object.id).await?;
                info!(object_id = object.id, "Object had no manifest, removed");
                Ok(OperationOutcome::Removed {
                    object_id: object.id,
                })
            }
            DeleteOutcome::Committed(write) => {
                self.store.set_command_sha(command.id, &write.sha).await?;
                self.dispatch(
                    &object,
                    &command,
                    git_ops_sync(&env, &object, &write.sha, &write.path)?.with_command(command.id),
                )
                .await?;
                Ok(OperationOutcome::Accepted {
                    object_id: object.id,
                    command_id: command.id,
                    sha: Some(write.sha),
                })
            }
        }
    }

    /// Scale an instance to zero.
    pub async fn stop_instance(&self, env_id: i64, name: &str) -> Result<OperationOutcome> {
        self.release_action(env_id, name, CommandType::Stop).await
    }

    /// Scale a stopped instance back up.
    pub async fn start_instance(&self, env_id: i64, name: &str) -> Result<OperationOutcome> {
        self.release_action(env_id, name, CommandType::Start).await
    }

    /// Redeploy an instance's current manifest.
    pub async fn restart_instance(&self, env_id: i64, name: &str) -> Result<OperationOutcome> {
        self.release_action(env_id, name, CommandType::Restart).await
    }

    /// An object together with its current command.
    pub async fn current(
        &self,
        env_id: i64,
        kind: ObjectKind,
        custom_kind: &str,
        name: &str,
    ) -> Result<Option<TrackedCommand>> {
        let Some(object) = self
            .store
            .find_object(env_id, kind, custom_kind, name)
            .await?
        else {
            return Ok(None);
        };
        let command = resolution::current_command(self.store.as_ref(), &object).await?;
        Ok(command.map(|command| TrackedCommand { object, command }))
    }

    async fn release_action(
        &self,
        env_id: i64,
        name: &str,
        operation: CommandType,
    ) -> Result<OperationOutcome> {
        let env = self.environment(env_id).await?;
        let object = self
            .require_object(&env, ObjectKind::Instance, "", name)
            .await?;
        let previous = self
            .checked_current(ObjectKind::Instance, name, operation, Some(&object))
            .await?;

        let new_command = match (&previous, operation) {
            (Some(prev), CommandType::Restart) => NewCommand {
                command_type: operation,
                version: prev.version.clone(),
                deployed_values: prev.deployed_values.clone(),
                sha: prev.sha.clone(),
            },
            _ => NewCommand {
                command_type: operation,
                version: object.version.clone().or(object.desired_version.clone()),
                deployed_values: None,
                sha: None,
            },
        };
        let payload = ReleaseCommandPayload {
            release_name: name.to_string(),
            chart_version: new_command.version.clone(),
            values: new_command.deployed_values.clone(),
        };
        let message_type = match operation {
            CommandType::Stop => MessageType::HelmReleaseStop,
            CommandType::Start => MessageType::HelmReleaseStart,
            _ => MessageType::HelmReleaseRestart,
        };

        let (object, command) = self.begin_on(object, &new_command).await?;

        let key = MessageKey::for_release(env.cluster_id, &env.code, env.id, name);
        let message = AgentMessage::new(&key, message_type, serde_json::to_value(&payload)?)
            .with_command(command.id);
        self.dispatch(&object, &command, message).await?;

        Ok(OperationOutcome::Accepted {
            object_id: object.id,
            command_id: command.id,
            sha: command.sha.clone(),
        })
    }

    async fn environment(&self, env_id: i64) -> Result<EnvironmentRecord> {
        self.store
            .get_environment(env_id)
            .await?
            .ok_or(Error::EnvironmentNotFound(env_id))
    }

    async fn require_object(
        &self,
        env: &EnvironmentRecord,
        kind: ObjectKind,
        custom_kind: &str,
        name: &str,
    ) -> Result<ManagedObjectRecord> {
        self.store
            .find_object(env.id, kind, custom_kind, name)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(crate::model::sync_tag(kind, custom_kind, name)))
    }

    /// Validate the transition and return the object's current command.
    ///
    /// While OPERATING, a Git-writing operation may be repeated if the
    /// current command is of the same type and its write never landed.
    async fn checked_current(
        &self,
        kind: ObjectKind,
        name: &str,
        operation: CommandType,
        object: Option<&ManagedObjectRecord>,
    ) -> Result<Option<CommandRecord>> {
        let Some(object) = object else {
            return if kind.permits(operation, None) {
                Ok(None)
            } else {
                Err(Error::invalid_transition(kind, name, operation, None))
            };
        };

        let current = resolution::current_command(self.store.as_ref(), object).await?;
        if kind.permits(operation, Some(object.status)) {
            return Ok(current);
        }

        let retry = object.status == ObjectStatus::Operating
            && operation.writes_git()
            && current.as_ref().is_some_and(|c| {
                c.command_type == operation && c.sha.is_none() && !c.status.is_terminal()
            });
        if retry {
            info!(object_id = object.id, command_type = %operation, "Retrying unwritten command");
            return Ok(current);
        }

        if operation == CommandType::Create {
            return Err(Error::ObjectAlreadyExists {
                kind,
                name: name.to_string(),
            });
        }
        Err(Error::invalid_transition(
            kind,
            name,
            operation,
            Some(object.status),
        ))
    }

    async fn start_command(
        &self,
        existing: Option<ManagedObjectRecord>,
        new_object: NewObject,
        command: &NewCommand,
    ) -> Result<(ManagedObjectRecord, CommandRecord)> {
        match existing {
            Some(object) => self.begin_on(object, command).await,
            None => {
                let (object, record) = self
                    .store
                    .create_object_with_command(&new_object, command)
                    .await?;
                info!(
                    object_id = object.id,
                    command_id = record.id,
                    kind = %object.kind,
                    name = %object.name,
                    "Object created"
                );
                Ok((object, record))
            }
        }
    }

    /// Supersede the object's current command and reload the object.
    async fn begin_on(
        &self,
        object: ManagedObjectRecord,
        command: &NewCommand,
    ) -> Result<(ManagedObjectRecord, CommandRecord)> {
        let record = self.store.begin_command(object.id, command).await?;
        let object = self
            .store
            .get_object(object.id)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(object.sync_tag()))?;

        info!(
            object_id = object.id,
            command_id = record.id,
            command_type = %record.command_type,
            "Command started"
        );
        Ok((object, record))
    }

    async fn write_and_dispatch(
        &self,
        env: &EnvironmentRecord,
        object: &ManagedObjectRecord,
        command: &CommandRecord,
        document: &serde_yaml::Value,
    ) -> Result<OperationOutcome> {
        let write = match self
            .writer
            .write(env, object, document, command.command_type)
            .await
        {
            Ok(write) => write,
            Err(e) => {
                warn!(
                    command_id = command.id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Manifest write failed, command left in flight"
                );
                return Err(e);
            }
        };

        self.store.set_command_sha(command.id, &write.sha).await?;

        let message =
            git_ops_sync(env, object, &write.sha, &write.path)?.with_command(command.id);
        self.dispatch(object, command, message).await?;

        Ok(OperationOutcome::Accepted {
            object_id: object.id,
            command_id: command.id,
            sha: Some(write.sha),
        })
    }

    async fn dispatch(
        &self,
        object: &ManagedObjectRecord,
        command: &CommandRecord,
        message: AgentMessage,
    ) -> Result<()> {
        let Err(e) = self.channel.send(message).await else {
            return Ok(());
        };

        warn!(
            command_id = command.id,
            object_id = object.id,
            channel = self.channel.channel_type(),
            error = %e,
            "Dispatch failed, failing command"
        );
        let command = self
            .store
            .get_command(command.id)
            .await?
            .unwrap_or_else(|| command.clone());
        resolution::resolve(
            self.store.as_ref(),
            object,
            &command,
            Resolution::failure(e.to_string()),
        )
        .await?;
        Err(e.into())
    }
}

fn git_ops_sync(
    env: &EnvironmentRecord,
    object: &ManagedObjectRecord,
    sha: &str,
    path: &str,
) -> Result<AgentMessage> {
    let key = match object.kind {
        ObjectKind::Instance => {
            MessageKey::for_release(env.cluster_id, &env.code, env.id, &object.name)
        }
        _ => MessageKey::for_environment(env.cluster_id, &env.code, env.id)
            .with(KIND, object.manifest_kind())
            .with(NAME, object.name.as_str()),
    };
    let payload = GitOpsApplyPayload {
        commit: sha.to_string(),
        file: Some(path.to_string()),
        resource_id: object.sync_tag(),
    };
    Ok(AgentMessage::new(
        &key,
        MessageType::GitOpsSync,
        serde_json::to_value(&payload)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_names() {
        assert!(validate_release_name("web-01").is_ok());
        assert!(validate_release_name("a").is_ok());
        assert!(validate_release_name(&"a".repeat(53)).is_ok());

        assert!(validate_release_name("").is_err());
        assert!(validate_release_name("Web").is_err());
        assert!(validate_release_name("1web").is_err());
        assert!(validate_release_name("web-").is_err());
        assert!(validate_release_name("web_01").is_err());
        assert!(validate_release_name(&"a".repeat(54)).is_err());
    }
}
