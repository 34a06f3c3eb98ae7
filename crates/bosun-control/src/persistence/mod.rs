// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for bosun-control.
//!
//! The store of record for managed objects, their commands, the
//! file-to-objects index of each environment repository, reported apply
//! errors, and the mirrored cluster state.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{CommandStatus, CommandType, ObjectKind, ObjectStatus};

/// Environment record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnvironmentRecord {
    /// Database primary key.
    pub id: i64,
    /// Cluster the environment's agent runs in.
    pub cluster_id: i64,
    /// Namespace code, the `env:` key segment.
    pub code: String,
    /// Repository name inside the GitOps root.
    pub repository: String,
    /// Top-level commit of the last GitOps sync the agent reported.
    pub agent_sync_commit: Option<String>,
    /// When the environment was registered.
    pub created_at: DateTime<Utc>,
}

/// Managed object record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ManagedObjectRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning environment.
    pub env_id: i64,
    /// Object kind.
    pub kind: ObjectKind,
    /// Concrete resource kind for [`ObjectKind::Custom`], empty otherwise.
    pub custom_kind: String,
    /// Object name.
    pub name: String,
    /// Current status.
    pub status: ObjectStatus,
    /// Current command.
    pub command_id: Option<i64>,
    /// Version last requested.
    pub desired_version: Option<String>,
    /// Version the agent reported as installed.
    pub version: Option<String>,
    /// Override document (or manifest body) last requested.
    pub deployed_values: Option<String>,
    /// Service type (`ClusterIP`, `NodePort`, `LoadBalancer`), services only.
    pub service_type: Option<String>,
    /// Load-balancer address, services only.
    pub load_balancer_ip: Option<String>,
    /// Ports as JSON, services only.
    pub ports: Option<String>,
    /// When the object was created.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl ManagedObjectRecord {
    /// Sync tag, `<segment>/<name>`.
    pub fn sync_tag(&self) -> String {
        crate::model::sync_tag(self.kind, &self.custom_kind, &self.name)
    }

    /// `kind:` of the Git document.
    pub fn manifest_kind(&self) -> &str {
        self.kind.manifest_kind(&self.custom_kind)
    }
}

/// Command record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommandRecord {
    /// Database primary key.
    pub id: i64,
    /// Object the command operates on.
    pub object_id: i64,
    /// Requested operation.
    pub command_type: CommandType,
    /// Resolution state.
    pub status: CommandStatus,
    /// Commit the operation expects to see applied.
    pub sha: Option<String>,
    /// Failure text.
    pub error: Option<String>,
    /// Version requested by the command.
    pub version: Option<String>,
    /// Values requested by the command.
    pub deployed_values: Option<String>,
    /// When the command was created.
    pub created_at: DateTime<Utc>,
    /// Last change; in-flight commands use it as a liveness mark.
    pub updated_at: DateTime<Utc>,
}

/// Object together with its current command.
#[derive(Debug, Clone)]
pub struct TrackedCommand {
    /// Owning object.
    pub object: ManagedObjectRecord,
    /// Its current command.
    pub command: CommandRecord,
}

/// One object placed in a repository file.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileResourceRecord {
    /// Database primary key.
    pub id: i64,
    /// Environment.
    pub env_id: i64,
    /// Repository-relative path.
    pub file_path: String,
    /// Object living in the file.
    pub object_id: i64,
    /// Order of the object's document in the file.
    pub position: i64,
}

/// Apply error accumulated for one file.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileErrorRecord {
    /// Database primary key.
    pub id: i64,
    /// Environment.
    pub env_id: i64,
    /// Repository-relative path.
    pub file_path: String,
    /// Commit the latest error was reported at.
    pub commit_sha: Option<String>,
    /// Accumulated error text.
    pub error: String,
    /// Sync tag of the failing object.
    pub resource: Option<String>,
    /// First report.
    pub created_at: DateTime<Utc>,
    /// Latest report.
    pub updated_at: DateTime<Utc>,
}

/// Apply error as reported by the agent.
#[derive(Debug, Clone)]
pub struct FileErrorReport {
    /// Repository-relative path.
    pub file_path: String,
    /// Commit the error was seen at.
    pub commit: Option<String>,
    /// Error text.
    pub error: String,
    /// Sync tag of the failing object.
    pub resource: Option<String>,
}

/// Mirrored cluster resource.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceRecord {
    /// Database primary key.
    pub id: i64,
    /// Environment.
    pub env_id: i64,
    /// Owning object.
    pub object_id: Option<i64>,
    /// Command that produced the resource (jobs).
    pub command_id: Option<i64>,
    /// Kubernetes kind.
    pub kind: String,
    /// Kubernetes name.
    pub name: String,
    /// Cluster-assigned revision token.
    pub revision: Option<String>,
    /// Raw observed document (JSON).
    pub detail: String,
    /// Hook weight (jobs).
    pub weight: Option<i64>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

/// Incoming observation of a cluster resource.
#[derive(Debug, Clone)]
pub struct ResourceObservation {
    /// Environment.
    pub env_id: i64,
    /// Owning object, if any.
    pub object_id: Option<i64>,
    /// Command link.
    pub command_id: Option<i64>,
    /// Kubernetes kind.
    pub kind: String,
    /// Kubernetes name.
    pub name: String,
    /// Revision token.
    pub revision: Option<String>,
    /// Raw document.
    pub detail: String,
    /// Hook weight.
    pub weight: Option<i64>,
    /// Match existing rows on `command_id` as well (per-command job rows).
    pub scope_to_command: bool,
}

/// What a revision-gated upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row matched; one was inserted.
    Inserted,
    /// The revision differed; detail and revision were replaced.
    Updated,
    /// The revision was already stored.
    Unchanged,
}

/// Mirrored pod.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PodRecord {
    /// Database primary key.
    pub id: i64,
    /// Environment.
    pub env_id: i64,
    /// Owning instance.
    pub object_id: Option<i64>,
    /// Pod name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Kubernetes resource version.
    pub resource_version: Option<String>,
    /// Derived status.
    pub status: String,
    /// All containers ready and not pending.
    pub ready: bool,
    /// Pod IP.
    pub ip: Option<String>,
    /// Node the pod runs on.
    pub node_name: Option<String>,
    /// Sum of container restarts.
    pub restart_count: i64,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

/// Incoming pod observation.
#[derive(Debug, Clone)]
pub struct PodObservation {
    /// Environment.
    pub env_id: i64,
    /// Owning instance.
    pub object_id: Option<i64>,
    /// Pod name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Resource version.
    pub resource_version: Option<String>,
    /// Derived status.
    pub status: String,
    /// Readiness.
    pub ready: bool,
    /// Pod IP.
    pub ip: Option<String>,
    /// Node.
    pub node_name: Option<String>,
    /// Restarts.
    pub restart_count: i64,
}

/// Kubernetes event attached to a command.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommandEventRecord {
    /// Database primary key.
    pub id: i64,
    /// Command.
    pub command_id: i64,
    /// Kind of the involved object.
    pub kind: String,
    /// Name of the involved object.
    pub name: String,
    /// Event text.
    pub message: String,
    /// Event time as reported.
    pub event_time: Option<String>,
    /// When the event was stored.
    pub created_at: DateTime<Utc>,
}

/// New object.
#[derive(Debug, Clone)]
pub struct NewObject {
    /// Environment.
    pub env_id: i64,
    /// Kind.
    pub kind: ObjectKind,
    /// Concrete kind for custom resources.
    pub custom_kind: String,
    /// Name.
    pub name: String,
    /// Service type, services only.
    pub service_type: Option<String>,
}

/// New command.
#[derive(Debug, Clone)]
pub struct NewCommand {
    /// Operation.
    pub command_type: CommandType,
    /// Requested version.
    pub version: Option<String>,
    /// Requested values.
    pub deployed_values: Option<String>,
    /// Commit carried over from a previous command (restarts).
    pub sha: Option<String>,
}

/// Conditional resolution of an in-flight command.
#[derive(Debug, Clone)]
pub struct CommandResolution {
    /// Command to resolve.
    pub command_id: i64,
    /// Its object.
    pub object_id: i64,
    /// Terminal status.
    pub status: CommandStatus,
    /// Failure text.
    pub error: Option<String>,
    /// Status to give the object, applied only while the command is current.
    pub object_status: Option<ObjectStatus>,
}

/// Persistence abstraction for the control plane.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ===== Environments =====

    /// Register an environment.
    async fn create_environment(
        &self,
        cluster_id: i64,
        code: &str,
        repository: &str,
    ) -> Result<EnvironmentRecord>;

    /// Fetch an environment by id.
    async fn get_environment(&self, env_id: i64) -> Result<Option<EnvironmentRecord>>;

    /// Fetch an environment by cluster and namespace.
    async fn find_environment(
        &self,
        cluster_id: i64,
        code: &str,
    ) -> Result<Option<EnvironmentRecord>>;

    /// All environments.
    async fn list_environments(&self) -> Result<Vec<EnvironmentRecord>>;

    /// Record the top-level commit of an applied sync.
    async fn set_agent_sync_commit(&self, env_id: i64, commit: &str) -> Result<()>;

    // ===== Objects =====

    /// Fetch an object by id.
    async fn get_object(&self, object_id: i64) -> Result<Option<ManagedObjectRecord>>;

    /// Fetch an object by natural key. `custom_kind` is matched case-insensitively.
    async fn find_object(
        &self,
        env_id: i64,
        kind: ObjectKind,
        custom_kind: &str,
        name: &str,
    ) -> Result<Option<ManagedObjectRecord>>;

    /// All objects of an environment.
    async fn list_objects(&self, env_id: i64) -> Result<Vec<ManagedObjectRecord>>;

    /// Insert an object in OPERATING together with its first command.
    async fn create_object_with_command(
        &self,
        object: &NewObject,
        command: &NewCommand,
    ) -> Result<(ManagedObjectRecord, CommandRecord)>;

    /// Insert a new OPERATING command and repoint the object at it.
    async fn begin_command(&self, object_id: i64, command: &NewCommand)
    -> Result<CommandRecord>;

    /// Set the version the agent reported as installed.
    async fn set_object_version(&self, object_id: i64, version: &str) -> Result<()>;

    /// Overwrite an object's status.
    async fn update_object_status(&self, object_id: i64, status: ObjectStatus) -> Result<()>;

    /// Refresh load-balancer address and ports of a service.
    async fn update_service_endpoints(
        &self,
        object_id: i64,
        load_balancer_ip: Option<&str>,
        ports: Option<&str>,
    ) -> Result<()>;

    /// Remove an object and everything it owns.
    async fn delete_object(&self, object_id: i64) -> Result<()>;

    // ===== Commands =====

    /// Fetch a command.
    async fn get_command(&self, command_id: i64) -> Result<Option<CommandRecord>>;

    /// Command history of an object, oldest first.
    async fn list_commands(&self, object_id: i64) -> Result<Vec<CommandRecord>>;

    /// Store the commit a command expects.
    async fn set_command_sha(&self, command_id: i64, sha: &str) -> Result<()>;

    /// Bump `updated_at` of an in-flight command. Returns false if it is terminal.
    async fn touch_command(&self, command_id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Resolve a command if it is still OPERATING.
    ///
    /// Returns whether this call performed the transition. The object status
    /// is written in the same transaction, and only if the command is still
    /// the object's current one.
    async fn resolve_command(&self, resolution: &CommandResolution) -> Result<bool>;

    /// Resolve a DELETE command to SUCCESS and remove its object.
    async fn resolve_command_and_remove_object(
        &self,
        command_id: i64,
        object_id: i64,
    ) -> Result<bool>;

    /// Objects of an environment that have a current command, with that command.
    async fn list_tracked_commands(&self, env_id: i64) -> Result<Vec<TrackedCommand>>;

    // ===== Repository files =====

    /// File an object lives in.
    async fn get_file_resource(
        &self,
        env_id: i64,
        object_id: i64,
    ) -> Result<Option<FileResourceRecord>>;

    /// Objects living in one file, in document order.
    async fn list_file_resources(
        &self,
        env_id: i64,
        file_path: &str,
    ) -> Result<Vec<FileResourceRecord>>;

    /// Place an object in a file (appended after existing members).
    async fn put_file_resource(
        &self,
        env_id: i64,
        file_path: &str,
        object_id: i64,
    ) -> Result<FileResourceRecord>;

    /// Remove an object from the file index.
    async fn remove_file_resource(&self, env_id: i64, object_id: i64) -> Result<()>;

    /// Record the commit the agent applied for a file.
    async fn set_file_agent_commit(&self, env_id: i64, file_path: &str, commit: &str)
    -> Result<()>;

    /// Commit the agent applied for a file.
    async fn get_file_agent_commit(&self, env_id: i64, file_path: &str)
    -> Result<Option<String>>;

    /// Record an apply error, appending to any text already stored for the path.
    async fn record_file_error(
        &self,
        env_id: i64,
        report: &FileErrorReport,
    ) -> Result<FileErrorRecord>;

    /// Error stored for a path.
    async fn get_file_error(&self, env_id: i64, file_path: &str)
    -> Result<Option<FileErrorRecord>>;

    /// Delete error rows whose path is not in `keep`.
    async fn clear_file_errors_except(&self, env_id: i64, keep: &[String]) -> Result<u64>;

    // ===== Observed state =====

    /// Revision-gated upsert of a mirrored resource.
    async fn upsert_resource(&self, observation: &ResourceObservation) -> Result<UpsertOutcome>;

    /// Resources of a kind with a name in an environment.
    async fn find_resources(&self, env_id: i64, kind: &str, name: &str)
    -> Result<Vec<ResourceRecord>>;

    /// Resources owned by an object.
    async fn list_object_resources(&self, object_id: i64) -> Result<Vec<ResourceRecord>>;

    /// Delete every row for a resource.
    async fn delete_resources(&self, env_id: i64, kind: &str, name: &str) -> Result<u64>;

    /// Delete the link between a resource and one object.
    async fn delete_resource_link(
        &self,
        env_id: i64,
        kind: &str,
        name: &str,
        object_id: i64,
    ) -> Result<u64>;

    /// Delete rows of a kind whose name is not in `keep`.
    async fn prune_resources(&self, env_id: i64, kind: &str, keep: &[String]) -> Result<u64>;

    /// Revision-gated upsert of a pod keyed by (name, namespace).
    async fn upsert_pod(&self, pod: &PodObservation) -> Result<UpsertOutcome>;

    /// Fetch a pod.
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<PodRecord>>;

    /// Pods of an instance.
    async fn list_pods(&self, object_id: i64) -> Result<Vec<PodRecord>>;

    /// Delete a pod.
    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<u64>;

    /// Delete pods of an environment whose name is not in `keep`.
    async fn prune_pods(&self, env_id: i64, keep: &[String]) -> Result<u64>;

    // ===== Command events =====

    /// Attach a Kubernetes event to a command.
    async fn insert_command_event(
        &self,
        command_id: i64,
        kind: &str,
        name: &str,
        message: &str,
        event_time: Option<&str>,
    ) -> Result<()>;

    /// Events of a command, oldest first.
    async fn list_command_events(&self, command_id: i64) -> Result<Vec<CommandEventRecord>>;
}
