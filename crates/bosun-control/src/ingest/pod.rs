// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pod status derivation from raw Kubernetes pod documents.

use serde_json::Value;

/// Fields the control plane mirrors for a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    /// Pod name.
    pub name: String,
    /// Namespace, if the document carries one.
    pub namespace: Option<String>,
    /// `metadata.resourceVersion`.
    pub resource_version: Option<String>,
    /// Derived status.
    pub status: String,
    /// Readiness, see [`is_ready`].
    pub ready: bool,
    /// `status.podIP`.
    pub ip: Option<String>,
    /// `spec.nodeName`.
    pub node_name: Option<String>,
    /// Sum of container restarts.
    pub restart_count: i64,
}

/// Summarize a pod document.
///
/// Returns `None` for pods that are not mirrored: those without owner
/// references and those owned by a Job.
pub fn summarize(pod: &Value) -> Option<PodSummary> {
    let metadata = pod.get("metadata")?;
    let owners = metadata
        .get("ownerReferences")
        .and_then(Value::as_array)
        .filter(|owners| !owners.is_empty())?;
    if owners
        .iter()
        .any(|o| o.get("kind").and_then(Value::as_str) == Some("Job"))
    {
        return None;
    }

    let name = metadata.get("name").and_then(Value::as_str)?.to_string();
    let status = pod.get("status");
    let containers = container_statuses(pod);

    let restart_count = containers
        .iter()
        .filter_map(|c| c.get("restartCount").and_then(Value::as_i64))
        .sum();

    Some(PodSummary {
        name,
        namespace: str_field(metadata, "namespace"),
        resource_version: str_field(metadata, "resourceVersion"),
        status: derive_status(pod),
        ready: is_ready(pod),
        ip: status.and_then(|s| str_field(s, "podIP")),
        node_name: pod.get("spec").and_then(|s| str_field(s, "nodeName")),
        restart_count,
    })
}

/// Status shown for a pod.
///
/// A deletion timestamp wins, then the first container waiting or
/// terminated reason, then the pod phase.
pub fn derive_status(pod: &Value) -> String {
    if pod
        .get("metadata")
        .and_then(|m| m.get("deletionTimestamp"))
        .is_some_and(|t| !t.is_null())
    {
        return "Terminating".to_string();
    }

    let reason = container_statuses(pod).iter().find_map(|c| {
        let state = c.get("state")?;
        ["waiting", "terminated"]
            .iter()
            .find_map(|s| state.get(*s)?.get("reason")?.as_str())
            .map(str::to_string)
    });
    if let Some(reason) = reason {
        return reason;
    }

    phase(pod).unwrap_or("Unknown").to_string()
}

/// Pod readiness: the phase is not `Pending` and every container reports
/// ready. A missing flag counts as not ready, and a pod with no container
/// statuses is not ready.
pub fn is_ready(pod: &Value) -> bool {
    if phase(pod) == Some("Pending") {
        return false;
    }
    let containers = container_statuses(pod);
    !containers.is_empty()
        && containers
            .iter()
            .all(|c| c.get("ready").and_then(Value::as_bool).unwrap_or(false))
}

fn phase(pod: &Value) -> Option<&str> {
    pod.get("status")?.get("phase")?.as_str()
}

fn container_statuses(pod: &Value) -> &[Value] {
    pod.get("status")
        .and_then(|s| s.get("containerStatuses"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn str_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}
