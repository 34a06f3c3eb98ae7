// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain vocabulary: object kinds, statuses, and command types.
//!
//! [`ObjectKind`] carries every per-kind rule the engine needs (file
//! naming, sync tags, steady/failure statuses, permitted operations), so
//! the ingestion and reconciliation paths never branch on kinds themselves.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of a GitOps-managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ObjectKind {
    /// Helm release of an application version.
    Instance,
    /// Kubernetes Service.
    Service,
    /// Kubernetes Ingress.
    Ingress,
    /// cert-manager Certificate.
    Certificate,
    /// ConfigMap.
    ConfigMap,
    /// Secret.
    Secret,
    /// Any other resource; the concrete kind lives in `custom_kind`.
    Custom,
}

impl ObjectKind {
    /// All kinds.
    pub const ALL: [ObjectKind; 7] = [
        ObjectKind::Instance,
        ObjectKind::Service,
        ObjectKind::Ingress,
        ObjectKind::Certificate,
        ObjectKind::ConfigMap,
        ObjectKind::Secret,
        ObjectKind::Custom,
    ];

    /// Storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Instance => "instance",
            ObjectKind::Service => "service",
            ObjectKind::Ingress => "ingress",
            ObjectKind::Certificate => "certificate",
            ObjectKind::ConfigMap => "config_map",
            ObjectKind::Secret => "secret",
            ObjectKind::Custom => "custom",
        }
    }

    /// Prefix of the manifest file name, `<prefix>-<name>.yaml`.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            ObjectKind::Instance => "release",
            ObjectKind::Service => "svc",
            ObjectKind::Ingress => "ing",
            ObjectKind::Certificate => "cert",
            ObjectKind::ConfigMap => "configMap",
            ObjectKind::Secret => "secret",
            ObjectKind::Custom => "custom",
        }
    }

    /// Path segment used in agent sync tags (`<segment>/<name>`).
    pub fn sync_segment(&self, custom_kind: &str) -> String {
        match self {
            ObjectKind::Instance => "release".to_string(),
            ObjectKind::Service => "service".to_string(),
            ObjectKind::Ingress => "ingress".to_string(),
            ObjectKind::Certificate => "certificate".to_string(),
            ObjectKind::ConfigMap => "configmap".to_string(),
            ObjectKind::Secret => "secret".to_string(),
            ObjectKind::Custom => custom_kind.to_ascii_lowercase(),
        }
    }

    /// Resolve a sync tag segment. Unrecognized segments are custom kinds.
    pub fn from_sync_segment(segment: &str) -> ObjectKind {
        match segment {
            "release" => ObjectKind::Instance,
            "service" => ObjectKind::Service,
            "ingress" => ObjectKind::Ingress,
            "certificate" => ObjectKind::Certificate,
            "configmap" => ObjectKind::ConfigMap,
            "secret" => ObjectKind::Secret,
            _ => ObjectKind::Custom,
        }
    }

    /// `kind:` of the document written to Git.
    pub fn manifest_kind<'a>(&self, custom_kind: &'a str) -> &'a str {
        match self {
            ObjectKind::Instance => "HelmRelease",
            ObjectKind::Service => "Service",
            ObjectKind::Ingress => "Ingress",
            ObjectKind::Certificate => "Certificate",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::Secret => "Secret",
            ObjectKind::Custom => custom_kind,
        }
    }

    /// Status an object settles in once its manifest is applied.
    pub fn steady_status(&self) -> ObjectStatus {
        match self {
            ObjectKind::Certificate => ObjectStatus::Applying,
            _ => ObjectStatus::Running,
        }
    }

    /// Status an object takes when its command fails.
    pub fn failure_status(&self) -> ObjectStatus {
        ObjectStatus::Failed
    }

    /// Whether `operation` may start while the object is in `status`.
    ///
    /// `None` means the object does not exist yet.
    pub fn permits(&self, operation: CommandType, status: Option<ObjectStatus>) -> bool {
        use CommandType::*;
        use ObjectStatus::*;

        let Some(status) = status else {
            return operation == Create;
        };

        match self {
            ObjectKind::Instance => match operation {
                Create => false,
                Update | Restart => matches!(status, Running | Failed),
                Stop => status == Running,
                Start => status == Stopped,
                Delete => matches!(status, Running | Stopped | Failed),
            },
            _ => match operation {
                Create | Stop | Start | Restart => false,
                Update => matches!(status, Running | Applying | Active | Failed),
                Delete => status != Operating,
            },
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown object kind '{}'", s))
    }
}

/// Object status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ObjectStatus {
    /// A command is in flight.
    Operating,
    /// Applied and serving.
    Running,
    /// Instance scaled to zero.
    Stopped,
    /// Last command failed.
    Failed,
    /// Logically removed.
    Deleted,
    /// Certificate manifest applied, issuance pending.
    Applying,
    /// Certificate issued.
    Active,
}

impl ObjectStatus {
    /// Storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Operating => "operating",
            ObjectStatus::Running => "running",
            ObjectStatus::Stopped => "stopped",
            ObjectStatus::Failed => "failed",
            ObjectStatus::Deleted => "deleted",
            ObjectStatus::Applying => "applying",
            ObjectStatus::Active => "active",
        }
    }
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CommandType {
    /// First deploy.
    Create,
    /// New version or values.
    Update,
    /// Removal.
    Delete,
    /// Scale to zero.
    Stop,
    /// Scale back up.
    Start,
    /// Redeploy the current manifest.
    Restart,
}

impl CommandType {
    /// Storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Create => "create",
            CommandType::Update => "update",
            CommandType::Delete => "delete",
            CommandType::Stop => "stop",
            CommandType::Start => "start",
            CommandType::Restart => "restart",
        }
    }

    /// Whether the operation is realized through a Git write.
    pub fn writes_git(&self) -> bool {
        matches!(
            self,
            CommandType::Create | CommandType::Update | CommandType::Delete
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command resolution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CommandStatus {
    /// In flight.
    Operating,
    /// Resolved successfully.
    Success,
    /// Resolved with an error.
    Failed,
}

impl CommandStatus {
    /// Storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Operating => "operating",
            CommandStatus::Success => "success",
            CommandStatus::Failed => "failed",
        }
    }

    /// Whether the command can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Operating)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync tag of an object, `<segment>/<name>`.
pub fn sync_tag(kind: ObjectKind, custom_kind: &str, name: &str) -> String {
    format!("{}/{}", kind.sync_segment(custom_kind), name)
}

/// Split a sync tag into segment and name.
pub fn split_sync_tag(tag: &str) -> Option<(&str, &str)> {
    tag.split_once('/')
        .filter(|(segment, name)| !segment.is_empty() && !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_transitions() {
        let k = ObjectKind::Instance;
        assert!(k.permits(CommandType::Create, None));
        assert!(!k.permits(CommandType::Update, None));

        assert!(k.permits(CommandType::Stop, Some(ObjectStatus::Running)));
        assert!(!k.permits(CommandType::Stop, Some(ObjectStatus::Stopped)));
        assert!(!k.permits(CommandType::Stop, Some(ObjectStatus::Failed)));

        assert!(k.permits(CommandType::Start, Some(ObjectStatus::Stopped)));
        assert!(!k.permits(CommandType::Start, Some(ObjectStatus::Running)));

        assert!(k.permits(CommandType::Restart, Some(ObjectStatus::Failed)));
        assert!(k.permits(CommandType::Restart, Some(ObjectStatus::Running)));
        assert!(!k.permits(CommandType::Restart, Some(ObjectStatus::Stopped)));

        assert!(k.permits(CommandType::Delete, Some(ObjectStatus::Stopped)));
        assert!(!k.permits(CommandType::Delete, Some(ObjectStatus::Operating)));
        assert!(!k.permits(CommandType::Create, Some(ObjectStatus::Running)));
    }

    #[test]
    fn test_other_kind_transitions() {
        let k = ObjectKind::Certificate;
        assert!(k.permits(CommandType::Update, Some(ObjectStatus::Active)));
        assert!(k.permits(CommandType::Update, Some(ObjectStatus::Failed)));
        assert!(!k.permits(CommandType::Update, Some(ObjectStatus::Operating)));
        assert!(!k.permits(CommandType::Stop, Some(ObjectStatus::Active)));
        assert!(k.permits(CommandType::Delete, Some(ObjectStatus::Applying)));
    }

    #[test]
    fn test_sync_segments() {
        for kind in ObjectKind::ALL {
            if kind == ObjectKind::Custom {
                continue;
            }
            assert_eq!(ObjectKind::from_sync_segment(&kind.sync_segment("")), kind);
        }
        assert_eq!(ObjectKind::Custom.sync_segment("SealedSecret"), "sealedsecret");
        assert_eq!(
            ObjectKind::from_sync_segment("sealedsecret"),
            ObjectKind::Custom
        );
    }

    #[test]
    fn test_sync_tag() {
        assert_eq!(sync_tag(ObjectKind::Instance, "", "web-01"), "release/web-01");
        assert_eq!(split_sync_tag("release/web-01"), Some(("release", "web-01")));
        assert_eq!(split_sync_tag("release/"), None);
        assert_eq!(split_sync_tag("nope"), None);
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("config_map".parse::<ObjectKind>(), Ok(ObjectKind::ConfigMap));
        assert!("pod".parse::<ObjectKind>().is_err());
    }
}
