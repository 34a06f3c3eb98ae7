// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};

use crate::error::{Error, Result};
use crate::model::{CommandStatus, CommandType, ObjectKind, ObjectStatus};

use super::{
    CommandEventRecord, CommandRecord, CommandResolution, EnvironmentRecord, FileErrorRecord,
    FileErrorReport, FileResourceRecord, ManagedObjectRecord, NewCommand, NewObject, Persistence,
    PodObservation, PodRecord, ResourceObservation, ResourceRecord, TrackedCommand, UpsertOutcome,
};

use crate::migrations::SQLITE as MIGRATOR;

const OBJECT_COLUMNS: &str = "id, env_id, kind, custom_kind, name, status, command_id, \
    desired_version, version, deployed_values, service_type, load_balancer_ip, ports, \
    created_at, updated_at";

const COMMAND_COLUMNS: &str = "id, object_id, command_type, status, sha, error, version, \
    deployed_values, created_at, updated_at";

const RESOURCE_COLUMNS: &str =
    "id, env_id, object_id, command_id, kind, name, revision, detail, weight, updated_at";

/// How long a connection waits for the write lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const POD_COLUMNS: &str = "id, env_id, object_id, name, namespace, resource_version, status, \
    ready, ip, node_name, restart_count, updated_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The pool's schema must already be migrated, see [`crate::migrations::run`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then
    /// runs all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/bosun.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a transaction that holds the write lock from its first statement.
    ///
    /// A deferred transaction that reads before writing cannot wait for a
    /// concurrent writer and fails with `SQLITE_BUSY` instead.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn fetch_object(&self, object_id: i64) -> Result<ManagedObjectRecord> {
        self.get_object(object_id)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(object_id.to_string()))
    }
}

fn map_unique_violation(err: sqlx::Error, object: &NewObject) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::ObjectAlreadyExists {
            kind: object.kind,
            name: object.name.clone(),
        },
        _ => Error::Database(err),
    }
}

/// Whether a command type records its version and values on the object.
fn records_desired_state(command_type: CommandType) -> bool {
    matches!(command_type, CommandType::Create | CommandType::Update)
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_environment(
        &self,
        cluster_id: i64,
        code: &str,
        repository: &str,
    ) -> Result<EnvironmentRecord> {
        let record = sqlx::query_as::<_, EnvironmentRecord>(
            r#"
            INSERT INTO environments (cluster_id, code, repository, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, cluster_id, code, repository, agent_sync_commit, created_at
            "#,
        )
        .bind(cluster_id)
        .bind(code)
        .bind(repository)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_environment(&self, env_id: i64) -> Result<Option<EnvironmentRecord>> {
        let record = sqlx::query_as::<_, EnvironmentRecord>(
            r#"
            SELECT id, cluster_id, code, repository, agent_sync_commit, created_at
            FROM environments
            WHERE id = ?
            "#,
        )
        .bind(env_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_environment(
        &self,
        cluster_id: i64,
        code: &str,
    ) -> Result<Option<EnvironmentRecord>> {
        let record = sqlx::query_as::<_, EnvironmentRecord>(
            r#"
            SELECT id, cluster_id, code, repository, agent_sync_commit, created_at
            FROM environments
            WHERE cluster_id = ? AND code = ?
            "#,
        )
        .bind(cluster_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_environments(&self) -> Result<Vec<EnvironmentRecord>> {
        let records = sqlx::query_as::<_, EnvironmentRecord>(
            r#"
            SELECT id, cluster_id, code, repository, agent_sync_commit, created_at
            FROM environments
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn set_agent_sync_commit(&self, env_id: i64, commit: &str) -> Result<()> {
        sqlx::query("UPDATE environments SET agent_sync_commit = ? WHERE id = ?")
            .bind(commit)
            .bind(env_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_object(&self, object_id: i64) -> Result<Option<ManagedObjectRecord>> {
        let record = sqlx::query_as::<_, ManagedObjectRecord>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM managed_objects WHERE id = ?"
        ))
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_object(
        &self,
        env_id: i64,
        kind: ObjectKind,
        custom_kind: &str,
        name: &str,
    ) -> Result<Option<ManagedObjectRecord>> {
        let record = sqlx::query_as::<_, ManagedObjectRecord>(&format!(
            r#"
            SELECT {OBJECT_COLUMNS}
            FROM managed_objects
            WHERE env_id = ? AND kind = ? AND lower(custom_kind) = lower(?) AND name = ?
            "#
        ))
        .bind(env_id)
        .bind(kind)
        .bind(custom_kind)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_objects(&self, env_id: i64) -> Result<Vec<ManagedObjectRecord>> {
        let records = sqlx::query_as::<_, ManagedObjectRecord>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM managed_objects WHERE env_id = ? ORDER BY id"
        ))
        .bind(env_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn create_object_with_command(
        &self,
        object: &NewObject,
        command: &NewCommand,
    ) -> Result<(ManagedObjectRecord, CommandRecord)> {
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let object_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO managed_objects
                (env_id, kind, custom_kind, name, status, desired_version, deployed_values,
                 service_type, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(object.env_id)
        .bind(object.kind)
        .bind(&object.custom_kind)
        .bind(&object.name)
        .bind(ObjectStatus::Operating)
        .bind(&command.version)
        .bind(&command.deployed_values)
        .bind(&object.service_type)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, object))?;

        let command_record = sqlx::query_as::<_, CommandRecord>(&format!(
            r#"
            INSERT INTO commands
                (object_id, command_type, status, sha, version, deployed_values, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {COMMAND_COLUMNS}
            "#
        ))
        .bind(object_id)
        .bind(command.command_type)
        .bind(CommandStatus::Operating)
        .bind(&command.sha)
        .bind(&command.version)
        .bind(&command.deployed_values)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE managed_objects SET command_id = ? WHERE id = ?")
            .bind(command_record.id)
            .bind(object_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let object_record = self.fetch_object(object_id).await?;
        Ok((object_record, command_record))
    }

    async fn begin_command(
        &self,
        object_id: i64,
        command: &NewCommand,
    ) -> Result<CommandRecord> {
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let record = sqlx::query_as::<_, CommandRecord>(&format!(
            r#"
            INSERT INTO commands
                (object_id, command_type, status, sha, version, deployed_values, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {COMMAND_COLUMNS}
            "#
        ))
        .bind(object_id)
        .bind(command.command_type)
        .bind(CommandStatus::Operating)
        .bind(&command.sha)
        .bind(&command.version)
        .bind(&command.deployed_values)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        if records_desired_state(command.command_type) {
            sqlx::query(
                r#"
                UPDATE managed_objects
                SET command_id = ?, status = ?, desired_version = ?, deployed_values = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(record.id)
            .bind(ObjectStatus::Operating)
            .bind(&command.version)
            .bind(&command.deployed_values)
            .bind(now)
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE managed_objects
                SET command_id = ?, status = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(record.id)
            .bind(ObjectStatus::Operating)
            .bind(now)
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(record)
    }

    async fn set_object_version(&self, object_id: i64, version: &str) -> Result<()> {
        sqlx::query("UPDATE managed_objects SET version = ?, updated_at = ? WHERE id = ?")
            .bind(version)
            .bind(Utc::now())
            .bind(object_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_object_status(&self, object_id: i64, status: ObjectStatus) -> Result<()> {
        sqlx::query("UPDATE managed_objects SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(object_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_service_endpoints(
        &self,
        object_id: i64,
        load_balancer_ip: Option<&str>,
        ports: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE managed_objects
            SET load_balancer_ip = COALESCE(?, load_balancer_ip),
                ports = COALESCE(?, ports),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(load_balancer_ip)
        .bind(ports)
        .bind(Utc::now())
        .bind(object_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_object(&self, object_id: i64) -> Result<()> {
        let mut tx = self.begin_write().await?;
        delete_object_tx(&mut tx, object_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_command(&self, command_id: i64) -> Result<Option<CommandRecord>> {
        let record = sqlx::query_as::<_, CommandRecord>(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?"
        ))
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_commands(&self, object_id: i64) -> Result<Vec<CommandRecord>> {
        let records = sqlx::query_as::<_, CommandRecord>(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE object_id = ? ORDER BY id"
        ))
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn set_command_sha(&self, command_id: i64, sha: &str) -> Result<()> {
        sqlx::query("UPDATE commands SET sha = ?, updated_at = ? WHERE id = ?")
            .bind(sha)
            .bind(Utc::now())
            .bind(command_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn touch_command(&self, command_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result =
            sqlx::query("UPDATE commands SET updated_at = ? WHERE id = ? AND status = ?")
                .bind(now)
                .bind(command_id)
                .bind(CommandStatus::Operating)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn resolve_command(&self, resolution: &CommandResolution) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let result = sqlx::query(
            r#"
            UPDATE commands
            SET status = ?1,
                error = COALESCE(?2, error),
                updated_at = ?3
            WHERE id = ?4
              AND object_id = ?5
              AND status = ?6
            "#,
        )
        .bind(resolution.status)
        .bind(&resolution.error)
        .bind(now)
        .bind(resolution.command_id)
        .bind(resolution.object_id)
        .bind(CommandStatus::Operating)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(status) = resolution.object_status {
            sqlx::query(
                r#"
                UPDATE managed_objects
                SET status = ?, updated_at = ?
                WHERE id = ? AND command_id = ?
                "#,
            )
            .bind(status)
            .bind(now)
            .bind(resolution.object_id)
            .bind(resolution.command_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn resolve_command_and_remove_object(
        &self,
        command_id: i64,
        object_id: i64,
    ) -> Result<bool> {
        let mut tx = self.begin_write().await?;

        let result = sqlx::query(
            r#"
            UPDATE commands
            SET status = ?, updated_at = ?
            WHERE id = ? AND object_id = ? AND status = ?
              AND id = (SELECT command_id FROM managed_objects WHERE id = ?)
            "#,
        )
        .bind(CommandStatus::Success)
        .bind(Utc::now())
        .bind(command_id)
        .bind(object_id)
        .bind(CommandStatus::Operating)
        .bind(object_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        delete_object_tx(&mut tx, object_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_tracked_commands(&self, env_id: i64) -> Result<Vec<TrackedCommand>> {
        let objects = sqlx::query_as::<_, ManagedObjectRecord>(&format!(
            r#"
            SELECT {OBJECT_COLUMNS}
            FROM managed_objects
            WHERE env_id = ? AND command_id IS NOT NULL
            ORDER BY id
            "#
        ))
        .bind(env_id)
        .fetch_all(&self.pool)
        .await?;

        let commands = sqlx::query_as::<_, CommandRecord>(&format!(
            r#"
            SELECT {COMMAND_COLUMNS}
            FROM commands
            WHERE id IN (SELECT command_id FROM managed_objects WHERE env_id = ?)
            "#
        ))
        .bind(env_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_id: HashMap<i64, CommandRecord> =
            commands.into_iter().map(|c| (c.id, c)).collect();

        Ok(objects
            .into_iter()
            .filter_map(|object| {
                let command = by_id.remove(&object.command_id?)?;
                Some(TrackedCommand { object, command })
            })
            .collect())
    }

    async fn get_file_resource(
        &self,
        env_id: i64,
        object_id: i64,
    ) -> Result<Option<FileResourceRecord>> {
        let record = sqlx::query_as::<_, FileResourceRecord>(
            r#"
            SELECT id, env_id, file_path, object_id, position
            FROM file_resources
            WHERE env_id = ? AND object_id = ?
            "#,
        )
        .bind(env_id)
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_file_resources(
        &self,
        env_id: i64,
        file_path: &str,
    ) -> Result<Vec<FileResourceRecord>> {
        let records = sqlx::query_as::<_, FileResourceRecord>(
            r#"
            SELECT id, env_id, file_path, object_id, position
            FROM file_resources
            WHERE env_id = ? AND file_path = ?
            ORDER BY position, id
            "#,
        )
        .bind(env_id)
        .bind(file_path)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn put_file_resource(
        &self,
        env_id: i64,
        file_path: &str,
        object_id: i64,
    ) -> Result<FileResourceRecord> {
        if let Some(existing) = self.get_file_resource(env_id, object_id).await?
            && existing.file_path == file_path
        {
            return Ok(existing);
        }

        let record = sqlx::query_as::<_, FileResourceRecord>(
            r#"
            INSERT INTO file_resources (env_id, file_path, object_id, position)
            VALUES (?1, ?2, ?3,
                    (SELECT COALESCE(MAX(position) + 1, 0)
                     FROM file_resources WHERE env_id = ?1 AND file_path = ?2))
            ON CONFLICT (env_id, object_id) DO UPDATE
                SET file_path = excluded.file_path, position = excluded.position
            RETURNING id, env_id, file_path, object_id, position
            "#,
        )
        .bind(env_id)
        .bind(file_path)
        .bind(object_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn remove_file_resource(&self, env_id: i64, object_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM file_resources WHERE env_id = ? AND object_id = ?")
            .bind(env_id)
            .bind(object_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_file_agent_commit(
        &self,
        env_id: i64,
        file_path: &str,
        commit: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO env_files (env_id, file_path, agent_commit)
            VALUES (?, ?, ?)
            ON CONFLICT (env_id, file_path) DO UPDATE SET agent_commit = excluded.agent_commit
            "#,
        )
        .bind(env_id)
        .bind(file_path)
        .bind(commit)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_file_agent_commit(
        &self,
        env_id: i64,
        file_path: &str,
    ) -> Result<Option<String>> {
        let commit = sqlx::query_scalar::<_, String>(
            "SELECT agent_commit FROM env_files WHERE env_id = ? AND file_path = ?",
        )
        .bind(env_id)
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(commit)
    }

    async fn record_file_error(
        &self,
        env_id: i64,
        report: &FileErrorReport,
    ) -> Result<FileErrorRecord> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, FileErrorRecord>(
            r#"
            INSERT INTO file_errors (env_id, file_path, commit_sha, error, resource, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT (env_id, file_path) DO UPDATE
                SET error = file_errors.error || char(10) || excluded.error,
                    commit_sha = COALESCE(excluded.commit_sha, file_errors.commit_sha),
                    resource = COALESCE(excluded.resource, file_errors.resource),
                    updated_at = excluded.updated_at
            RETURNING id, env_id, file_path, commit_sha, error, resource, created_at, updated_at
            "#,
        )
        .bind(env_id)
        .bind(&report.file_path)
        .bind(&report.commit)
        .bind(&report.error)
        .bind(&report.resource)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_file_error(
        &self,
        env_id: i64,
        file_path: &str,
    ) -> Result<Option<FileErrorRecord>> {
        let record = sqlx::query_as::<_, FileErrorRecord>(
            r#"
            SELECT id, env_id, file_path, commit_sha, error, resource, created_at, updated_at
            FROM file_errors
            WHERE env_id = ? AND file_path = ?
            "#,
        )
        .bind(env_id)
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn clear_file_errors_except(&self, env_id: i64, keep: &[String]) -> Result<u64> {
        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM file_errors WHERE env_id = ");
        query.push_bind(env_id);
        push_not_in(&mut query, "file_path", keep);

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn upsert_resource(&self, observation: &ResourceObservation) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let mut lookup = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE env_id = "
        ));
        lookup.push_bind(observation.env_id);
        lookup.push(" AND kind = ").push_bind(&observation.kind);
        lookup.push(" AND name = ").push_bind(&observation.name);
        lookup.push(" AND object_id IS ").push_bind(observation.object_id);
        if observation.scope_to_command {
            lookup.push(" AND command_id IS ").push_bind(observation.command_id);
        }
        lookup.push(" ORDER BY id LIMIT 1");

        let existing = lookup
            .build_query_as::<ResourceRecord>()
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO resources
                        (env_id, object_id, command_id, kind, name, revision, detail, weight, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(observation.env_id)
                .bind(observation.object_id)
                .bind(observation.command_id)
                .bind(&observation.kind)
                .bind(&observation.name)
                .bind(&observation.revision)
                .bind(&observation.detail)
                .bind(observation.weight)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted
            }
            Some(existing) if existing.revision == observation.revision => {
                // Links follow the latest report even when the content is unchanged.
                sqlx::query("UPDATE resources SET command_id = COALESCE(?, command_id) WHERE id = ?")
                    .bind(observation.command_id)
                    .bind(existing.id)
                    .execute(&mut *tx)
                    .await?;
                UpsertOutcome::Unchanged
            }
            Some(existing) => {
                sqlx::query(
                    r#"
                    UPDATE resources
                    SET detail = ?, revision = ?, weight = COALESCE(?, weight),
                        command_id = COALESCE(?, command_id), updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&observation.detail)
                .bind(&observation.revision)
                .bind(observation.weight)
                .bind(observation.command_id)
                .bind(now)
                .bind(existing.id)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Updated
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn find_resources(
        &self,
        env_id: i64,
        kind: &str,
        name: &str,
    ) -> Result<Vec<ResourceRecord>> {
        let records = sqlx::query_as::<_, ResourceRecord>(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE env_id = ? AND kind = ? AND name = ? ORDER BY id"
        ))
        .bind(env_id)
        .bind(kind)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_object_resources(&self, object_id: i64) -> Result<Vec<ResourceRecord>> {
        let records = sqlx::query_as::<_, ResourceRecord>(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE object_id = ? ORDER BY id"
        ))
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_resources(&self, env_id: i64, kind: &str, name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM resources WHERE env_id = ? AND kind = ? AND name = ?")
            .bind(env_id)
            .bind(kind)
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_resource_link(
        &self,
        env_id: i64,
        kind: &str,
        name: &str,
        object_id: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM resources WHERE env_id = ? AND kind = ? AND name = ? AND object_id = ?",
        )
        .bind(env_id)
        .bind(kind)
        .bind(name)
        .bind(object_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn prune_resources(&self, env_id: i64, kind: &str, keep: &[String]) -> Result<u64> {
        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM resources WHERE env_id = ");
        query.push_bind(env_id);
        query.push(" AND kind = ").push_bind(kind);
        push_not_in(&mut query, "name", keep);

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn upsert_pod(&self, pod: &PodObservation) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let existing = sqlx::query_as::<_, PodRecord>(&format!(
            "SELECT {POD_COLUMNS} FROM pods WHERE name = ? AND namespace = ?"
        ))
        .bind(&pod.name)
        .bind(&pod.namespace)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO pods
                        (env_id, object_id, name, namespace, resource_version, status, ready,
                         ip, node_name, restart_count, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(pod.env_id)
                .bind(pod.object_id)
                .bind(&pod.name)
                .bind(&pod.namespace)
                .bind(&pod.resource_version)
                .bind(&pod.status)
                .bind(pod.ready)
                .bind(&pod.ip)
                .bind(&pod.node_name)
                .bind(pod.restart_count)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted
            }
            Some(existing) if existing.resource_version == pod.resource_version => {
                UpsertOutcome::Unchanged
            }
            Some(existing) => {
                sqlx::query(
                    r#"
                    UPDATE pods
                    SET object_id = ?, resource_version = ?, status = ?, ready = ?, ip = ?,
                        node_name = ?, restart_count = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(pod.object_id)
                .bind(&pod.resource_version)
                .bind(&pod.status)
                .bind(pod.ready)
                .bind(&pod.ip)
                .bind(&pod.node_name)
                .bind(pod.restart_count)
                .bind(now)
                .bind(existing.id)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Updated
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<PodRecord>> {
        let record = sqlx::query_as::<_, PodRecord>(&format!(
            "SELECT {POD_COLUMNS} FROM pods WHERE name = ? AND namespace = ?"
        ))
        .bind(name)
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_pods(&self, object_id: i64) -> Result<Vec<PodRecord>> {
        let records = sqlx::query_as::<_, PodRecord>(&format!(
            "SELECT {POD_COLUMNS} FROM pods WHERE object_id = ? ORDER BY name"
        ))
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pods WHERE name = ? AND namespace = ?")
            .bind(name)
            .bind(namespace)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn prune_pods(&self, env_id: i64, keep: &[String]) -> Result<u64> {
        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM pods WHERE env_id = ");
        query.push_bind(env_id);
        push_not_in(&mut query, "name", keep);

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_command_event(
        &self,
        command_id: i64,
        kind: &str,
        name: &str,
        message: &str,
        event_time: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO command_events (command_id, kind, name, message, event_time, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(command_id)
        .bind(kind)
        .bind(name)
        .bind(message)
        .bind(event_time)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_command_events(&self, command_id: i64) -> Result<Vec<CommandEventRecord>> {
        let records = sqlx::query_as::<_, CommandEventRecord>(
            r#"
            SELECT id, command_id, kind, name, message, event_time, created_at
            FROM command_events
            WHERE command_id = ?
            ORDER BY id
            "#,
        )
        .bind(command_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

/// Append `AND <column> NOT IN (...)` unless `keep` is empty.
fn push_not_in<'a>(query: &mut QueryBuilder<'a, Sqlite>, column: &str, keep: &'a [String]) {
    if keep.is_empty() {
        return;
    }
    query.push(format!(" AND {column} NOT IN ("));
    let mut values = query.separated(", ");
    for value in keep {
        values.push_bind(value.as_str());
    }
    values.push_unseparated(")");
}

/// Remove an object and everything that hangs off it.
async fn delete_object_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    object_id: i64,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM command_events WHERE command_id IN (SELECT id FROM commands WHERE object_id = ?)",
    )
    .bind(object_id)
    .execute(&mut **tx)
    .await?;

    for table in ["resources", "pods", "file_resources", "commands"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE object_id = ?"))
            .bind(object_id)
            .execute(&mut **tx)
            .await?;
    }

    sqlx::query("DELETE FROM managed_objects WHERE id = ?")
        .bind(object_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    fn new_instance(env_id: i64, name: &str) -> NewObject {
        NewObject {
            env_id,
            kind: ObjectKind::Instance,
            custom_kind: String::new(),
            name: name.to_string(),
            service_type: None,
        }
    }

    fn create_command(values: &str) -> NewCommand {
        NewCommand {
            command_type: CommandType::Create,
            version: Some("1.0.0".to_string()),
            deployed_values: Some(values.to_string()),
            sha: None,
        }
    }

    async fn seeded() -> (SqlitePersistence, EnvironmentRecord) {
        let persistence = SqlitePersistence::new(test_pool().await);
        let env = persistence
            .create_environment(1, "staging", "staging-repo")
            .await
            .expect("Failed to create environment");
        (persistence, env)
    }

    #[tokio::test]
    async fn test_create_and_find_environment() {
        let (persistence, env) = seeded().await;

        let found = persistence
            .find_environment(1, "staging")
            .await
            .unwrap()
            .expect("Environment should exist");
        assert_eq!(found.id, env.id);
        assert_eq!(found.repository, "staging-repo");
        assert!(found.agent_sync_commit.is_none());

        persistence.set_agent_sync_commit(env.id, "c1").await.unwrap();
        let found = persistence.get_environment(env.id).await.unwrap().unwrap();
        assert_eq!(found.agent_sync_commit.as_deref(), Some("c1"));

        assert!(persistence.find_environment(2, "staging").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_object_with_command() {
        let (persistence, env) = seeded().await;

        let (object, command) = persistence
            .create_object_with_command(&new_instance(env.id, "web-01"), &create_command("a: 1"))
            .await
            .unwrap();

        assert_eq!(object.status, ObjectStatus::Operating);
        assert_eq!(object.command_id, Some(command.id));
        assert_eq!(object.desired_version.as_deref(), Some("1.0.0"));
        assert_eq!(command.status, CommandStatus::Operating);
        assert_eq!(command.command_type, CommandType::Create);
        assert!(command.sha.is_none());

        let err = persistence
            .create_object_with_command(&new_instance(env.id, "web-01"), &create_command("a: 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_begin_command_supersedes_and_keeps_history() {
        let (persistence, env) = seeded().await;
        let (object, first) = persistence
            .create_object_with_command(&new_instance(env.id, "web-01"), &create_command("a: 1"))
            .await
            .unwrap();

        let stop = persistence
            .begin_command(
                object.id,
                &NewCommand {
                    command_type: CommandType::Stop,
                    version: None,
                    deployed_values: None,
                    sha: None,
                },
            )
            .await
            .unwrap();

        let object = persistence.get_object(object.id).await.unwrap().unwrap();
        assert_eq!(object.command_id, Some(stop.id));
        // Stop leaves the desired state alone.
        assert_eq!(object.deployed_values.as_deref(), Some("a: 1"));

        let history = persistence.list_commands(object.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, first.id);
        assert_eq!(history[0].status, CommandStatus::Operating);
    }

    #[tokio::test]
    async fn test_resolve_command_is_compare_and_set() {
        let (persistence, env) = seeded().await;
        let (object, command) = persistence
            .create_object_with_command(&new_instance(env.id, "web-01"), &create_command("a: 1"))
            .await
            .unwrap();

        let success = CommandResolution {
            command_id: command.id,
            object_id: object.id,
            status: CommandStatus::Success,
            error: None,
            object_status: Some(ObjectStatus::Running),
        };
        assert!(persistence.resolve_command(&success).await.unwrap());

        let late_failure = CommandResolution {
            status: CommandStatus::Failed,
            error: Some("late".to_string()),
            object_status: Some(ObjectStatus::Failed),
            ..success.clone()
        };
        assert!(!persistence.resolve_command(&late_failure).await.unwrap());

        let command = persistence.get_command(command.id).await.unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Success);
        assert!(command.error.is_none());
        let object = persistence.get_object(object.id).await.unwrap().unwrap();
        assert_eq!(object.status, ObjectStatus::Running);
    }

    #[tokio::test]
    async fn test_resolving_superseded_command_leaves_object_alone() {
        let (persistence, env) = seeded().await;
        let (object, first) = persistence
            .create_object_with_command(&new_instance(env.id, "web-01"), &create_command("a: 1"))
            .await
            .unwrap();
        persistence
            .begin_command(object.id, &create_command("a: 2"))
            .await
            .unwrap();

        let applied = persistence
            .resolve_command(&CommandResolution {
                command_id: first.id,
                object_id: object.id,
                status: CommandStatus::Failed,
                error: Some("boom".to_string()),
                object_status: Some(ObjectStatus::Failed),
            })
            .await
            .unwrap();
        assert!(applied);

        let object = persistence.get_object(object.id).await.unwrap().unwrap();
        assert_eq!(object.status, ObjectStatus::Operating);
    }

    #[tokio::test]
    async fn test_touch_command_only_in_flight() {
        let (persistence, env) = seeded().await;
        let (object, command) = persistence
            .create_object_with_command(&new_instance(env.id, "web-01"), &create_command("a: 1"))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(30);
        assert!(persistence.touch_command(command.id, later).await.unwrap());
        let touched = persistence.get_command(command.id).await.unwrap().unwrap();
        assert_eq!(touched.updated_at.timestamp(), later.timestamp());

        persistence
            .resolve_command(&CommandResolution {
                command_id: command.id,
                object_id: object.id,
                status: CommandStatus::Success,
                error: None,
                object_status: None,
            })
            .await
            .unwrap();
        assert!(!persistence.touch_command(command.id, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_delete_removes_object() {
        let (persistence, env) = seeded().await;
        let (object, _) = persistence
            .create_object_with_command(&new_instance(env.id, "web-01"), &create_command("a: 1"))
            .await
            .unwrap();
        persistence
            .put_file_resource(env.id, "release-web-01.yaml", object.id)
            .await
            .unwrap();
        let delete = persistence
            .begin_command(
                object.id,
                &NewCommand {
                    command_type: CommandType::Delete,
                    version: None,
                    deployed_values: None,
                    sha: Some("s9".to_string()),
                },
            )
            .await
            .unwrap();

        assert!(
            persistence
                .resolve_command_and_remove_object(delete.id, object.id)
                .await
                .unwrap()
        );
        assert!(persistence.get_object(object.id).await.unwrap().is_none());
        assert!(persistence.list_commands(object.id).await.unwrap().is_empty());
        assert!(
            persistence
                .get_file_resource(env.id, object.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_file_resources_keep_document_order() {
        let (persistence, env) = seeded().await;
        let (a, _) = persistence
            .create_object_with_command(&new_instance(env.id, "web-01"), &create_command(""))
            .await
            .unwrap();
        let (b, _) = persistence
            .create_object_with_command(&new_instance(env.id, "web-02"), &create_command(""))
            .await
            .unwrap();

        persistence.put_file_resource(env.id, "shared.yaml", a.id).await.unwrap();
        persistence.put_file_resource(env.id, "shared.yaml", b.id).await.unwrap();
        // Re-placing a member is idempotent.
        persistence.put_file_resource(env.id, "shared.yaml", a.id).await.unwrap();

        let members = persistence.list_file_resources(env.id, "shared.yaml").await.unwrap();
        let ids: Vec<i64> = members.iter().map(|m| m.object_id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        persistence.remove_file_resource(env.id, a.id).await.unwrap();
        let members = persistence.list_file_resources(env.id, "shared.yaml").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].object_id, b.id);
    }

    #[tokio::test]
    async fn test_file_errors_accumulate_and_clear() {
        let (persistence, env) = seeded().await;

        let report = FileErrorReport {
            file_path: "release-web-01.yaml".to_string(),
            commit: Some("c1".to_string()),
            error: "first".to_string(),
            resource: Some("release/web-01".to_string()),
        };
        persistence.record_file_error(env.id, &report).await.unwrap();
        let record = persistence
            .record_file_error(
                env.id,
                &FileErrorReport {
                    commit: Some("c2".to_string()),
                    error: "second".to_string(),
                    ..report.clone()
                },
            )
            .await
            .unwrap();

        assert_eq!(record.error, "first\nsecond");
        assert_eq!(record.commit_sha.as_deref(), Some("c2"));

        persistence
            .record_file_error(
                env.id,
                &FileErrorReport {
                    file_path: "svc-api.yaml".to_string(),
                    ..report.clone()
                },
            )
            .await
            .unwrap();

        let cleared = persistence
            .clear_file_errors_except(env.id, &["svc-api.yaml".to_string()])
            .await
            .unwrap();
        assert_eq!(cleared, 1);
        assert!(
            persistence
                .get_file_error(env.id, "release-web-01.yaml")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(persistence.clear_file_errors_except(env.id, &[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resource_upsert_is_revision_gated() {
        let (persistence, env) = seeded().await;

        let mut observation = ResourceObservation {
            env_id: env.id,
            object_id: None,
            command_id: None,
            kind: "Ingress".to_string(),
            name: "web".to_string(),
            revision: Some("100".to_string()),
            detail: r#"{"v":1}"#.to_string(),
            weight: None,
            scope_to_command: false,
        };

        assert_eq!(
            persistence.upsert_resource(&observation).await.unwrap(),
            UpsertOutcome::Inserted
        );

        observation.detail = r#"{"v":2}"#.to_string();
        assert_eq!(
            persistence.upsert_resource(&observation).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        let stored = persistence.find_resources(env.id, "Ingress", "web").await.unwrap();
        assert_eq!(stored[0].detail, r#"{"v":1}"#);

        observation.revision = Some("101".to_string());
        assert_eq!(
            persistence.upsert_resource(&observation).await.unwrap(),
            UpsertOutcome::Updated
        );
        let stored = persistence.find_resources(env.id, "Ingress", "web").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].detail, r#"{"v":2}"#);
        assert_eq!(stored[0].revision.as_deref(), Some("101"));
    }

    #[tokio::test]
    async fn test_prune_resources_and_pods() {
        let (persistence, env) = seeded().await;
        for name in ["a", "b", "c"] {
            persistence
                .upsert_resource(&ResourceObservation {
                    env_id: env.id,
                    object_id: None,
                    command_id: None,
                    kind: "Pod".to_string(),
                    name: name.to_string(),
                    revision: Some("1".to_string()),
                    detail: "{}".to_string(),
                    weight: None,
                    scope_to_command: false,
                })
                .await
                .unwrap();
            persistence
                .upsert_pod(&PodObservation {
                    env_id: env.id,
                    object_id: None,
                    name: name.to_string(),
                    namespace: "staging".to_string(),
                    resource_version: Some("1".to_string()),
                    status: "Running".to_string(),
                    ready: true,
                    ip: None,
                    node_name: None,
                    restart_count: 0,
                })
                .await
                .unwrap();
        }

        let keep = vec!["b".to_string()];
        assert_eq!(persistence.prune_resources(env.id, "Pod", &keep).await.unwrap(), 2);
        assert_eq!(persistence.prune_pods(env.id, &keep).await.unwrap(), 2);
        assert!(persistence.get_pod("b", "staging").await.unwrap().is_some());
        assert!(persistence.get_pod("a", "staging").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tracked_commands() {
        let (persistence, env) = seeded().await;
        let (object, command) = persistence
            .create_object_with_command(&new_instance(env.id, "web-01"), &create_command(""))
            .await
            .unwrap();

        let tracked = persistence.list_tracked_commands(env.id).await.unwrap();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].object.id, object.id);
        assert_eq!(tracked[0].command.id, command.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_on_file_database() {
        let temp = tempfile::TempDir::new().unwrap();
        let persistence = SqlitePersistence::from_path(temp.path().join("bosun.db"))
            .await
            .unwrap();
        let env = persistence
            .create_environment(1, "staging", "staging-repo")
            .await
            .unwrap();
        let env_id = env.id;

        let mut handles = Vec::new();
        for i in 0..40 {
            let store = persistence.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("svc-{}", i % 4);
                store
                    .upsert_resource(&ResourceObservation {
                        env_id,
                        object_id: None,
                        command_id: None,
                        kind: "Service".to_string(),
                        name: name.clone(),
                        revision: Some(i.to_string()),
                        detail: "{}".to_string(),
                        weight: None,
                        scope_to_command: false,
                    })
                    .await?;
                store
                    .upsert_pod(&PodObservation {
                        env_id,
                        object_id: None,
                        name,
                        namespace: "staging".to_string(),
                        resource_version: Some(i.to_string()),
                        status: "Running".to_string(),
                        ready: true,
                        ip: None,
                        node_name: None,
                        restart_count: 0,
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        for i in 0..4 {
            let name = format!("svc-{}", i);
            let rows = persistence
                .find_resources(env.id, "Service", &name)
                .await
                .unwrap();
            assert_eq!(rows.len(), 1);
            assert!(persistence.get_pod(&name, "staging").await.unwrap().is_some());
        }
    }
}
