// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for bosun-control integration tests.
//!
//! Provides TestContext wiring an in-memory store, a mock repository, and
//! a mock agent channel into the lifecycle manager and the message handler.

#![allow(dead_code)]

use std::sync::Arc;

use bosun_control::dispatch::MockAgentChannel;
use bosun_control::git::MockGitRepository;
use bosun_control::ingest::AgentMessageHandler;
use bosun_control::lifecycle::{AppVersion, CommandLifecycle, DeployRequest};
use bosun_control::manifest_writer::ManifestWriter;
use bosun_control::model::{CommandType, ObjectKind};
use bosun_control::persistence::{
    CommandRecord, EnvironmentRecord, ManagedObjectRecord, Persistence, SqlitePersistence,
};
use bosun_control::timeout_sweep::{TimeoutSweep, TimeoutSweepConfig};
use bosun_protocol::{AgentMessage, MessageKey, MessageType};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;

/// Baseline values of the test chart.
pub const BASELINE: &str = "image:\n  repository: nginx\n  tag: '1.25'\nreplicas: 1\n";

/// Test context holding every collaborator of the engine.
pub struct TestContext {
    pub store: Arc<SqlitePersistence>,
    pub git: Arc<MockGitRepository>,
    pub channel: Arc<MockAgentChannel>,
    pub lifecycle: CommandLifecycle,
    pub sweep: Arc<TimeoutSweep>,
    pub handler: AgentMessageHandler,
    pub env: EnvironmentRecord,
}

impl TestContext {
    /// Create a context with one environment (`cluster 1`, namespace `prod`).
    pub async fn new() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        bosun_control::migrations::run(&pool)
            .await
            .expect("Failed to run migrations");

        let store = Arc::new(SqlitePersistence::new(pool));
        let git = Arc::new(MockGitRepository::new());
        let channel = Arc::new(MockAgentChannel::new());

        let writer = ManifestWriter::new(git.clone(), store.clone());
        let lifecycle = CommandLifecycle::new(store.clone(), writer, channel.clone());
        let sweep = Arc::new(TimeoutSweep::new(
            store.clone(),
            channel.clone(),
            TimeoutSweepConfig::default(),
        ));
        let handler = AgentMessageHandler::new(store.clone(), sweep.clone());

        let env = store
            .create_environment(1, "prod", "prod")
            .await
            .expect("Failed to create environment");

        Self {
            store,
            git,
            channel,
            lifecycle,
            sweep,
            handler,
            env,
        }
    }

    /// Application version of the test chart.
    pub fn version(version: &str) -> AppVersion {
        AppVersion {
            chart_name: "web".to_string(),
            version: version.to_string(),
            repo_url: Some("https://charts.example.com".to_string()),
            values: BASELINE.to_string(),
        }
    }

    /// Deploy request for `name` at `version` with `values` as override.
    pub fn deploy_request(&self, name: &str, version: &str, values: &str) -> DeployRequest {
        DeployRequest {
            env_id: self.env.id,
            name: name.to_string(),
            version: Self::version(version),
            values: values.to_string(),
        }
    }

    /// Create an instance and return the sha of its first command.
    pub async fn create_instance(&self, name: &str, values: &str) -> String {
        let outcome = self
            .lifecycle
            .deploy_instance(
                &self.deploy_request(name, "1.0.0", values),
                CommandType::Create,
            )
            .await
            .expect("Failed to create instance");
        match outcome {
            bosun_control::lifecycle::OperationOutcome::Accepted { sha: Some(sha), .. } => sha,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    /// Create an instance and confirm its install, leaving it RUNNING.
    pub async fn running_instance(&self, name: &str) -> ManagedObjectRecord {
        self.create_instance(name, "replicas: 2\n").await;
        let disposition = self
            .handle(self.install_success(name, "1.0.0"))
            .await;
        assert_eq!(disposition, bosun_control::ingest::Disposition::Applied);
        self.instance(name).await
    }

    /// Fetch an instance by name.
    pub async fn instance(&self, name: &str) -> ManagedObjectRecord {
        self.object(ObjectKind::Instance, name)
            .await
            .unwrap_or_else(|| panic!("instance {} not found", name))
    }

    /// Fetch any object by kind and name.
    pub async fn object(&self, kind: ObjectKind, name: &str) -> Option<ManagedObjectRecord> {
        self.store
            .find_object(self.env.id, kind, "", name)
            .await
            .expect("Failed to query object")
    }

    /// Current command of an object.
    pub async fn current_command(&self, object: &ManagedObjectRecord) -> CommandRecord {
        let id = object.command_id.expect("object has no current command");
        self.store
            .get_command(id)
            .await
            .expect("Failed to query command")
            .expect("current command missing")
    }

    /// Command by id.
    pub async fn command(&self, id: i64) -> CommandRecord {
        self.store
            .get_command(id)
            .await
            .expect("Failed to query command")
            .expect("command missing")
    }

    /// Environment-scoped key.
    pub fn env_key(&self) -> MessageKey {
        MessageKey::for_environment(self.env.cluster_id, &self.env.code, self.env.id)
    }

    /// Release-scoped key.
    pub fn release_key(&self, name: &str) -> MessageKey {
        MessageKey::for_release(self.env.cluster_id, &self.env.code, self.env.id, name)
    }

    /// `helm_install_resource_info` for `name` reporting `version`.
    pub fn install_success(&self, name: &str, version: &str) -> AgentMessage {
        AgentMessage::new(
            &self.release_key(name),
            MessageType::HelmInstallResourceInfo,
            serde_json::json!({
                "releaseName": name,
                "chartVersion": version,
                "resources": [],
            }),
        )
    }

    /// A message on the release key.
    pub fn release_message(&self, name: &str, message_type: MessageType, payload: Value) -> AgentMessage {
        AgentMessage::new(&self.release_key(name), message_type, payload)
    }

    /// A message on the environment key.
    pub fn env_message(&self, message_type: MessageType, payload: Value) -> AgentMessage {
        AgentMessage::new(&self.env_key(), message_type, payload)
    }

    /// Run one message through the handler.
    pub async fn handle(&self, message: AgentMessage) -> bosun_control::ingest::Disposition {
        self.handler
            .handle(&message)
            .await
            .expect("Failed to handle message")
    }

    /// `git_ops_sync_event` ledger reporting `commit` for each tag.
    pub fn sync_event(&self, commit: &str, resources: &[(&str, &str)], errors: Value) -> AgentMessage {
        let resource_commits: Vec<Value> = resources
            .iter()
            .map(|(tag, file)| {
                serde_json::json!({
                    "resourceId": tag,
                    "commit": commit,
                    "file": file,
                })
            })
            .collect();
        let files_commit: Vec<Value> = resources
            .iter()
            .map(|(_, file)| serde_json::json!({"file": file, "commit": commit}))
            .collect();
        self.env_message(
            MessageType::GitOpsSyncEvent,
            serde_json::json!({
                "metadata": {
                    "commit": commit,
                    "filesCommit": files_commit,
                    "resourceCommits": resource_commits,
                },
                "errors": errors,
            }),
        )
    }
}
