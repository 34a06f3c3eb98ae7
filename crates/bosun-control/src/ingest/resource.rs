// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live resource updates, deletions, listings, events, and service networking.

use std::collections::HashSet;

use bosun_protocol::MessageType;
use bosun_protocol::payload::{KubeEvent, ResourceSyncPayload, SERVICE_INSTANCES_ANNOTATION};
use serde_json::Value;
use tracing::{debug, info};

use super::{AgentMessageHandler, Disposition, MessageContext, decode_many, pod};
use crate::error::Result;
use crate::model::{CommandType, ObjectKind};
use crate::persistence::{
    ManagedObjectRecord, PodObservation, ResourceObservation, UpsertOutcome,
};
use crate::resolution::{self, Resolution};

/// Label carrying the owning release on Helm-managed resources.
const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

impl AgentMessageHandler {
    /// A live resource was created or changed.
    pub(super) async fn handle_resource_update(
        &self,
        ctx: &MessageContext<'_>,
    ) -> Result<Disposition> {
        let doc: Value = ctx.message.decode_payload()?;
        let Some((kind, name)) = identity(ctx, &doc) else {
            return Ok(Self::dropped(ctx, "resource identity"));
        };

        if kind == "Pod" {
            let Some(owner) = self.find_instance(ctx, instance_label(&doc)).await? else {
                return Ok(Self::dropped(ctx, "owning release"));
            };
            return Ok(match self.mirror_pod(ctx, Some(owner.id), &doc).await? {
                Some(UpsertOutcome::Unchanged) | None => Disposition::Stale,
                Some(_) => Disposition::Applied,
            });
        }

        let Some(owner) = self.resolve_owner(ctx, &kind, &name, &doc).await? else {
            return Ok(Self::dropped(ctx, "owning object"));
        };

        let outcome = self
            .mirror_resource(ctx, Some(owner.id), &kind, &name, &doc)
            .await?;
        if outcome == UpsertOutcome::Unchanged {
            return Ok(Disposition::Stale);
        }

        if kind == "Service" {
            if owner.kind == ObjectKind::Service {
                self.refresh_service_endpoints(&owner, &doc).await?;
            }
            self.sync_service_links(ctx, &name, &doc).await?;
        }

        Ok(Disposition::Applied)
    }

    /// A live resource was removed.
    pub(super) async fn handle_resource_delete(
        &self,
        ctx: &MessageContext<'_>,
    ) -> Result<Disposition> {
        let doc: Value = if ctx.message.payload_is_empty() {
            Value::Null
        } else {
            ctx.message.decode_payload()?
        };
        let Some((kind, name)) = identity(ctx, &doc) else {
            return Ok(Self::dropped(ctx, "resource identity"));
        };

        let mut removed = self.store.delete_resources(ctx.env.id, &kind, &name).await?;
        if kind == "Pod" {
            let namespace = doc
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .unwrap_or(&ctx.env.code);
            removed += self.store.delete_pod(&name, namespace).await?;
        }

        debug!(env_id = ctx.env.id, kind = %kind, name = %name, removed, "Resource removed");
        Ok(if removed > 0 {
            Disposition::Applied
        } else {
            Disposition::Stale
        })
    }

    /// Full listing of one resource type; rows not listed are pruned.
    pub(super) async fn handle_resource_sync(
        &self,
        ctx: &MessageContext<'_>,
    ) -> Result<Disposition> {
        let payload: ResourceSyncPayload = ctx.message.decode_payload()?;

        let mut pruned = self
            .store
            .prune_resources(ctx.env.id, &payload.resource_type, &payload.resources)
            .await?;
        if payload.resource_type == "Pod" {
            pruned += self.store.prune_pods(ctx.env.id, &payload.resources).await?;
        }

        info!(
            env_id = ctx.env.id,
            resource_type = %payload.resource_type,
            listed = payload.resources.len(),
            pruned,
            "Resource listing applied"
        );
        Ok(Disposition::Applied)
    }

    /// Kubernetes events about a release's jobs or pods.
    pub(super) async fn handle_kube_event(&self, ctx: &MessageContext<'_>) -> Result<Disposition> {
        let events: Vec<KubeEvent> = decode_many(ctx.message)?;
        let Some(object) = self.find_instance(ctx, None).await? else {
            return Ok(Self::dropped(ctx, "release"));
        };

        let command = match ctx.message.command_id {
            Some(id) => self
                .store
                .get_command(id)
                .await?
                .filter(|c| c.object_id == object.id),
            None => resolution::current_command(self.store.as_ref(), &object).await?,
        };
        let Some(command) = command else {
            return Ok(Disposition::Stale);
        };

        for event in &events {
            let (kind, name) = event_subject(ctx.message.message_type, event);
            let text = event
                .message
                .as_deref()
                .or(event.reason.as_deref())
                .unwrap_or_default();
            self.store
                .insert_command_event(
                    command.id,
                    kind,
                    name,
                    text,
                    event.last_timestamp.as_deref(),
                )
                .await?;
        }

        Ok(Disposition::Applied)
    }

    /// The agent created a service or ingress; this confirms the command.
    pub(super) async fn handle_network_created(
        &self,
        ctx: &MessageContext<'_>,
        kind: ObjectKind,
    ) -> Result<Disposition> {
        let doc: Value = if ctx.message.payload_is_empty() {
            Value::Null
        } else {
            ctx.message.decode_payload()?
        };
        let name = ctx
            .key
            .name()
            .or_else(|| doc.pointer("/metadata/name").and_then(Value::as_str));
        let Some(name) = name else {
            return Ok(Self::dropped(ctx, "object name"));
        };
        let Some(object) = self.store.find_object(ctx.env.id, kind, "", name).await? else {
            return Ok(Self::dropped(ctx, "object"));
        };

        if doc.is_object() {
            let manifest_kind = kind.manifest_kind("");
            self.mirror_resource(ctx, Some(object.id), manifest_kind, name, &doc)
                .await?;
            if kind == ObjectKind::Service {
                self.refresh_service_endpoints(&object, &doc).await?;
            }
        }

        let accepts = [CommandType::Create, CommandType::Update];
        let Some(command) = self.correlate(ctx, &object, &accepts).await? else {
            return Ok(Disposition::Stale);
        };
        let resolved = resolution::resolve(
            self.store.as_ref(),
            &object,
            &command,
            Resolution::success(),
        )
        .await?;
        Ok(if resolved {
            Disposition::Applied
        } else {
            Disposition::Stale
        })
    }

    /// Revision-gated upsert of a generic resource row.
    pub(super) async fn mirror_resource(
        &self,
        ctx: &MessageContext<'_>,
        object_id: Option<i64>,
        kind: &str,
        name: &str,
        doc: &Value,
    ) -> Result<UpsertOutcome> {
        self.store
            .upsert_resource(&ResourceObservation {
                env_id: ctx.env.id,
                object_id,
                command_id: None,
                kind: kind.to_string(),
                name: name.to_string(),
                revision: resource_version(doc),
                detail: doc.to_string(),
                weight: None,
                scope_to_command: false,
            })
            .await
    }

    /// Mirror a pod into the pod table and the resource table.
    ///
    /// Returns `None` for pods that are not mirrored.
    pub(super) async fn mirror_pod(
        &self,
        ctx: &MessageContext<'_>,
        object_id: Option<i64>,
        doc: &Value,
    ) -> Result<Option<UpsertOutcome>> {
        let Some(summary) = pod::summarize(doc) else {
            return Ok(None);
        };

        let outcome = self
            .store
            .upsert_pod(&PodObservation {
                env_id: ctx.env.id,
                object_id,
                name: summary.name.clone(),
                namespace: summary
                    .namespace
                    .clone()
                    .unwrap_or_else(|| ctx.env.code.clone()),
                resource_version: summary.resource_version.clone(),
                status: summary.status.clone(),
                ready: summary.ready,
                ip: summary.ip.clone(),
                node_name: summary.node_name.clone(),
                restart_count: summary.restart_count,
            })
            .await?;
        self.mirror_resource(ctx, object_id, "Pod", &summary.name, doc)
            .await?;

        Ok(Some(outcome))
    }

    async fn resolve_owner(
        &self,
        ctx: &MessageContext<'_>,
        kind: &str,
        name: &str,
        doc: &Value,
    ) -> Result<Option<ManagedObjectRecord>> {
        let (object_kind, custom_kind) = match kind {
            "Service" => (ObjectKind::Service, ""),
            "Ingress" => (ObjectKind::Ingress, ""),
            "Certificate" => (ObjectKind::Certificate, ""),
            "ConfigMap" => (ObjectKind::ConfigMap, ""),
            "Secret" => (ObjectKind::Secret, ""),
            _ => (ObjectKind::Custom, kind),
        };
        if let Some(object) = self
            .store
            .find_object(ctx.env.id, object_kind, custom_kind, name)
            .await?
        {
            return Ok(Some(object));
        }

        self.find_instance(ctx, instance_label(doc)).await
    }

    async fn refresh_service_endpoints(
        &self,
        service: &ManagedObjectRecord,
        doc: &Value,
    ) -> Result<()> {
        let service_type = doc
            .pointer("/spec/type")
            .and_then(Value::as_str)
            .or(service.service_type.as_deref());
        let ports = doc.pointer("/spec/ports").map(Value::to_string);

        match service_type {
            Some("LoadBalancer") => {
                let ip = doc
                    .pointer("/status/loadBalancer/ingress/0/ip")
                    .and_then(Value::as_str);
                self.store
                    .update_service_endpoints(service.id, ip, ports.as_deref())
                    .await
            }
            Some("NodePort") => {
                self.store
                    .update_service_endpoints(
                        service.id,
                        service.load_balancer_ip.as_deref(),
                        ports.as_deref(),
                    )
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Link a service to the instances its annotation lists and drop links
    /// to instances no longer listed.
    async fn sync_service_links(
        &self,
        ctx: &MessageContext<'_>,
        service_name: &str,
        doc: &Value,
    ) -> Result<()> {
        let Some(annotation) = doc
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(SERVICE_INSTANCES_ANNOTATION))
            .and_then(Value::as_str)
        else {
            return Ok(());
        };

        let mut linked = HashSet::new();
        for release in annotation.split('+').map(str::trim).filter(|s| !s.is_empty()) {
            let Some(instance) = self
                .store
                .find_object(ctx.env.id, ObjectKind::Instance, "", release)
                .await?
            else {
                debug!(release, "Service lists an unknown instance");
                continue;
            };
            self.mirror_resource(ctx, Some(instance.id), "Service", service_name, doc)
                .await?;
            linked.insert(instance.id);
        }

        for row in self
            .store
            .find_resources(ctx.env.id, "Service", service_name)
            .await?
        {
            let Some(object_id) = row.object_id else {
                continue;
            };
            if linked.contains(&object_id) {
                continue;
            }
            let is_instance = self
                .store
                .get_object(object_id)
                .await?
                .is_some_and(|o| o.kind == ObjectKind::Instance);
            if is_instance {
                self.store
                    .delete_resource_link(ctx.env.id, "Service", service_name, object_id)
                    .await?;
                debug!(service = service_name, object_id, "Removed stale service link");
            }
        }

        Ok(())
    }
}

/// Kind and name of a resource from the document, falling back to the key.
fn identity(ctx: &MessageContext<'_>, doc: &Value) -> Option<(String, String)> {
    let kind = doc
        .get("kind")
        .and_then(Value::as_str)
        .or(ctx.key.kind())?;
    let name = doc
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .or(ctx.key.name())?;
    Some((kind.to_string(), name.to_string()))
}

fn resource_version(doc: &Value) -> Option<String> {
    doc.pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn instance_label(doc: &Value) -> Option<&str> {
    doc.pointer("/metadata/labels")
        .and_then(|l| l.get(INSTANCE_LABEL))
        .and_then(Value::as_str)
}

/// Kind and name an event is recorded under. Job events about a pod are
/// attributed to the pod's job.
fn event_subject(message_type: MessageType, event: &KubeEvent) -> (&str, &str) {
    let involved = &event.involved_object;
    if message_type == MessageType::JobEvent
        && involved.kind == "Pod"
        && let Some((job, _)) = involved.name.rsplit_once('-')
    {
        return ("Job", job);
    }
    (involved.kind.as_str(), involved.name.as_str())
}
