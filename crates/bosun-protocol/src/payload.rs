// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed payloads carried by [`AgentMessage`](crate::AgentMessage).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Annotation listing the releases a service routes to, `+`-separated.
pub const SERVICE_INSTANCES_ANNOTATION: &str = "bosun.dev/network-service-instances";

/// Install/upgrade result for one release.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleasePayload {
    /// Release name.
    pub release_name: String,
    /// Chart version the agent actually installed.
    #[serde(default)]
    pub chart_version: Option<String>,
    /// Cluster resources created by the release.
    #[serde(default)]
    pub resources: Vec<ReleaseResource>,
}

/// One cluster resource created by a release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResource {
    /// Resource kind (Pod, Deployment, Service, ...).
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Raw Kubernetes object.
    #[serde(default)]
    pub object: Value,
}

/// Job created by a pre-install or pre-upgrade hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    /// Job name.
    pub name: String,
    /// Resource kind, normally `Job`.
    pub kind: String,
    /// Release the hook belongs to.
    pub release_name: String,
    /// Hook weight.
    #[serde(default)]
    pub weight: Option<i64>,
    /// Job manifest as YAML or JSON text.
    #[serde(default)]
    pub manifest: String,
}

/// Commit ledger reported after one GitOps sync cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitOpsSyncPayload {
    /// What was applied.
    pub metadata: SyncMetadata,
    /// File-level apply errors.
    #[serde(default)]
    pub errors: Vec<SyncError>,
}

/// Applied commits for a sync cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// Top-level commit of the sync.
    pub commit: String,
    /// Commit applied per file.
    #[serde(default)]
    pub files_commit: Vec<FileCommit>,
    /// Commit applied per object.
    #[serde(default)]
    pub resource_commits: Vec<ResourceCommit>,
}

/// Commit applied for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCommit {
    /// Repository-relative path.
    pub file: String,
    /// Commit sha.
    pub commit: String,
}

/// Commit applied for one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCommit {
    /// Sync tag, `<segment>/<name>`.
    pub resource_id: String,
    /// Commit sha.
    pub commit: String,
    /// File the object lives in.
    #[serde(default)]
    pub file: Option<String>,
}

/// Apply or parse error for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncError {
    /// Repository-relative path.
    pub path: String,
    /// Commit the error was seen at.
    #[serde(default)]
    pub commit: Option<String>,
    /// Error text.
    pub error: String,
    /// Sync tag of the object that failed, `<segment>/<name>`.
    #[serde(default)]
    pub id: Option<String>,
}

/// Entry of a command status snapshot, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSyncEntry {
    /// Command id.
    pub id: i64,
    /// Object kind segment (`release`, `service`, ...).
    pub resource_type: String,
    /// Object name.
    pub resource_name: String,
    /// Commit the command expects (outbound) or the agent has applied (reply).
    #[serde(default)]
    pub commit: Option<String>,
}

/// Full listing of live resources of one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncPayload {
    /// Pod, Deployment or ReplicaSet.
    pub resource_type: String,
    /// Names that still exist.
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Kubernetes event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeEvent {
    /// Object the event is about.
    pub involved_object: InvolvedObject,
    /// Short reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
    /// Last time the event fired.
    #[serde(default)]
    pub last_timestamp: Option<String>,
}

/// Reference carried by a [`KubeEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvolvedObject {
    /// Kind.
    pub kind: String,
    /// Name.
    pub name: String,
}

/// Outbound start/stop/restart request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseCommandPayload {
    /// Release name.
    pub release_name: String,
    /// Chart version to redeploy, for restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,
    /// Override values to redeploy, for restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
}

/// Outbound request to apply the environment repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsApplyPayload {
    /// Commit to apply.
    pub commit: String,
    /// File touched by the write, if any.
    #[serde(default)]
    pub file: Option<String>,
    /// Sync tag of the object the write was for.
    pub resource_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gitops_sync_payload_shape() {
        let payload: GitOpsSyncPayload = serde_json::from_value(json!({
            "metadata": {
                "commit": "c2",
                "filesCommit": [{"file": "release-web-01.yaml", "commit": "c2"}],
                "resourceCommits": [{"resourceId": "release/web-01", "commit": "c2", "file": "release-web-01.yaml"}]
            },
            "errors": [{"path": "release-web-01.yaml", "commit": "c2", "error": "bad", "id": "release/web-01"}]
        }))
        .unwrap();

        assert_eq!(payload.metadata.commit, "c2");
        assert_eq!(payload.metadata.files_commit.len(), 1);
        assert_eq!(payload.metadata.resource_commits[0].resource_id, "release/web-01");
        assert_eq!(payload.errors[0].id.as_deref(), Some("release/web-01"));
    }

    #[test]
    fn test_gitops_sync_payload_defaults() {
        let payload: GitOpsSyncPayload =
            serde_json::from_value(json!({"metadata": {"commit": "c1"}})).unwrap();
        assert!(payload.errors.is_empty());
        assert!(payload.metadata.resource_commits.is_empty());
    }

    #[test]
    fn test_command_sync_entry_wire_names() {
        let entry = CommandSyncEntry {
            id: 4,
            resource_type: "release".to_string(),
            resource_name: "web-01".to_string(),
            commit: Some("abc".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"id": 4, "resourceType": "release", "resourceName": "web-01", "commit": "abc"})
        );
    }

    #[test]
    fn test_release_payload_without_resources() {
        let payload: ReleasePayload =
            serde_json::from_value(json!({"releaseName": "web-01", "chartVersion": "1.2.0"}))
                .unwrap();
        assert!(payload.resources.is_empty());
        assert_eq!(payload.chart_version.as_deref(), Some("1.2.0"));
    }
}
