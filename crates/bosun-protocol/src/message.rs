// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message envelope exchanged with the cluster agent.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;
use crate::key::MessageKey;

/// Message type tag.
///
/// The same vocabulary is used in both directions; [`MessageType::is_outbound`]
/// tells which side emits a given type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Agent -> control plane: release lifecycle
    /// Job resources created before a release install.
    HelmReleasePreInstall,
    /// Job resources created before a release upgrade.
    HelmReleasePreUpgrade,
    /// Release installed; payload lists the created resources.
    HelmInstallResourceInfo,
    /// Release upgraded; payload lists the resources.
    HelmUpgradeResourceInfo,
    /// Install failed.
    HelmReleaseInstallFailed,
    /// Upgrade failed.
    HelmReleaseUpgradeFailed,
    /// Start failed.
    HelmReleaseStartFailed,
    /// Stop failed.
    HelmReleaseStopFailed,
    /// Delete failed.
    HelmReleaseDeleteFailed,
    /// Release scaled back up.
    HelmReleaseStarted,
    /// Release scaled to zero.
    HelmReleaseStopped,
    /// Release removed from the cluster.
    HelmReleaseDeleted,

    // Agent -> control plane: observed state
    /// A live resource was created or changed.
    ResourceUpdate,
    /// A live resource was removed.
    ResourceDelete,
    /// Full listing of one resource type, used to prune stale rows.
    ResourceSync,
    /// Kubernetes event for a job.
    JobEvent,
    /// Kubernetes event for a release pod.
    ReleasePodEvent,
    /// Service created by the agent.
    NetworkService,
    /// Ingress created by the agent.
    NetworkIngress,
    /// Certificate issued.
    CertIssued,
    /// Certificate issuance failed.
    CertFailed,
    /// Commit ledger for one GitOps sync cycle.
    GitOpsSyncEvent,
    /// Agent asks the control plane to run a status sweep.
    CommandStatusSyncRequest,
    /// Agent's answer to [`MessageType::CommandStatusSync`].
    CommandStatusSyncResult,

    // Control plane -> agent
    /// Apply the environment repository at a given commit.
    GitOpsSync,
    /// Scale a release back up.
    HelmReleaseStart,
    /// Scale a release to zero.
    HelmReleaseStop,
    /// Redeploy a release with its current manifest.
    HelmReleaseRestart,
    /// Request a status snapshot for in-flight commands.
    CommandStatusSync,

    /// Any tag this build does not know.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Whether the control plane emits this type.
    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            MessageType::GitOpsSync
                | MessageType::HelmReleaseStart
                | MessageType::HelmReleaseStop
                | MessageType::HelmReleaseRestart
                | MessageType::CommandStatusSync
        )
    }

    /// Wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::HelmReleasePreInstall => "helm_release_pre_install",
            MessageType::HelmReleasePreUpgrade => "helm_release_pre_upgrade",
            MessageType::HelmInstallResourceInfo => "helm_install_resource_info",
            MessageType::HelmUpgradeResourceInfo => "helm_upgrade_resource_info",
            MessageType::HelmReleaseInstallFailed => "helm_release_install_failed",
            MessageType::HelmReleaseUpgradeFailed => "helm_release_upgrade_failed",
            MessageType::HelmReleaseStartFailed => "helm_release_start_failed",
            MessageType::HelmReleaseStopFailed => "helm_release_stop_failed",
            MessageType::HelmReleaseDeleteFailed => "helm_release_delete_failed",
            MessageType::HelmReleaseStarted => "helm_release_started",
            MessageType::HelmReleaseStopped => "helm_release_stopped",
            MessageType::HelmReleaseDeleted => "helm_release_deleted",
            MessageType::ResourceUpdate => "resource_update",
            MessageType::ResourceDelete => "resource_delete",
            MessageType::ResourceSync => "resource_sync",
            MessageType::JobEvent => "job_event",
            MessageType::ReleasePodEvent => "release_pod_event",
            MessageType::NetworkService => "network_service",
            MessageType::NetworkIngress => "network_ingress",
            MessageType::CertIssued => "cert_issued",
            MessageType::CertFailed => "cert_failed",
            MessageType::GitOpsSyncEvent => "git_ops_sync_event",
            MessageType::CommandStatusSyncRequest => "command_status_sync_request",
            MessageType::CommandStatusSyncResult => "command_status_sync_result",
            MessageType::GitOpsSync => "git_ops_sync",
            MessageType::HelmReleaseStart => "helm_release_start",
            MessageType::HelmReleaseStop => "helm_release_stop",
            MessageType::HelmReleaseRestart => "helm_release_restart",
            MessageType::CommandStatusSync => "command_status_sync",
            MessageType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the agent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Routing key, see [`MessageKey`].
    pub key: String,
    /// Message type tag.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// JSON payload. Some agents send it as a JSON-encoded string.
    #[serde(default)]
    pub payload: Value,
    /// Command this message answers or carries, when correlated.
    #[serde(
        default,
        rename = "commandId",
        skip_serializing_if = "Option::is_none"
    )]
    pub command_id: Option<i64>,
}

impl AgentMessage {
    /// Build a message.
    pub fn new(key: &MessageKey, message_type: MessageType, payload: Value) -> Self {
        Self {
            key: key.to_string(),
            message_type,
            payload,
            command_id: None,
        }
    }

    /// Attach a command id.
    pub fn with_command(mut self, command_id: i64) -> Self {
        self.command_id = Some(command_id);
        self
    }

    /// Parse the routing key.
    pub fn parsed_key(&self) -> Result<MessageKey, ProtocolError> {
        MessageKey::parse(&self.key)
    }

    /// Whether the payload carries nothing.
    pub fn payload_is_empty(&self) -> bool {
        match &self.payload {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty() || s.trim() == "null",
            _ => false,
        }
    }

    /// Decode the payload into a typed structure.
    ///
    /// A string payload is first parsed as JSON text.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = match &self.payload {
            Value::String(text) => {
                serde_json::from_str::<Value>(text).map_err(|source| {
                    ProtocolError::InvalidPayload {
                        message_type: self.message_type,
                        source,
                    }
                })?
            }
            other => other.clone(),
        };

        serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
            message_type: self.message_type,
            source,
        })
    }

    /// Payload as free text, used by failure notifications.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("message")
                .or_else(|| map.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.payload.to_string()),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_tags() {
        let parsed: MessageType = serde_json::from_str("\"git_ops_sync_event\"").unwrap();
        assert_eq!(parsed, MessageType::GitOpsSyncEvent);
        assert_eq!(
            serde_json::to_string(&MessageType::CommandStatusSync).unwrap(),
            "\"command_status_sync\""
        );

        let unknown: MessageType = serde_json::from_str("\"helm_release_rollback\"").unwrap();
        assert_eq!(unknown, MessageType::Unknown);
    }

    #[test]
    fn test_as_str_matches_serde_tag() {
        for ty in [
            MessageType::HelmReleasePreInstall,
            MessageType::HelmInstallResourceInfo,
            MessageType::ResourceSync,
            MessageType::CertIssued,
            MessageType::GitOpsSync,
            MessageType::HelmReleaseRestart,
        ] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn test_decode_string_payload() {
        let msg = AgentMessage {
            key: "cluster:1.env:prod".to_string(),
            message_type: MessageType::ResourceSync,
            payload: Value::String(r#"{"resourceType":"Pod","resources":["a"]}"#.to_string()),
            command_id: None,
        };

        let value: Value = msg.decode_payload().unwrap();
        assert_eq!(value["resourceType"], "Pod");
    }

    #[test]
    fn test_payload_text() {
        let key = MessageKey::parse("cluster:1.env:prod").unwrap();
        let msg = AgentMessage::new(
            &key,
            MessageType::HelmReleaseInstallFailed,
            json!("image pull backoff"),
        );
        assert_eq!(msg.payload_text(), "image pull backoff");

        let msg = AgentMessage::new(
            &key,
            MessageType::CertFailed,
            json!({"message": "acme challenge failed"}),
        );
        assert_eq!(msg.payload_text(), "acme challenge failed");
    }

    #[test]
    fn test_envelope_round_trip_keeps_command_id() {
        let key = MessageKey::for_release(1, "prod", 2, "web");
        let msg = AgentMessage::new(&key, MessageType::HelmReleaseStop, json!({})).with_command(9);
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"commandId\":9"));
        assert!(text.contains("\"type\":\"helm_release_stop\""));

        let back: AgentMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_empty_payload() {
        let key = MessageKey::parse("cluster:1.env:prod").unwrap();
        let msg = AgentMessage::new(&key, MessageType::HelmReleasePreInstall, json!("null"));
        assert!(msg.payload_is_empty());
    }
}
