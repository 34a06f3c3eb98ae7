// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the timeout sweep: overdue detection, status requests, replies.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bosun_control::ingest::Disposition;
use bosun_control::lifecycle::{ApplyRequest, OperationOutcome};
use bosun_control::model::{CommandStatus, CommandType, ObjectKind, ObjectStatus};
use bosun_control::persistence::Persistence;
use bosun_control::timeout_sweep::{TIMEOUT_ERROR, TimeoutSweep, TimeoutSweepConfig};
use bosun_protocol::MessageType;
use bosun_protocol::payload::CommandSyncEntry;
use chrono::{Duration as ChronoDuration, Utc};
use common::TestContext;
use serde_json::json;

fn reply(id: i64, name: &str, commit: Option<&str>) -> CommandSyncEntry {
    CommandSyncEntry {
        id,
        resource_type: "release".to_string(),
        resource_name: name.to_string(),
        commit: commit.map(str::to_string),
    }
}

#[tokio::test]
async fn test_grace_window_is_180_seconds() {
    let ctx = TestContext::new().await;
    ctx.create_instance("web-01", "").await;
    let command = ctx.current_command(&ctx.instance("web-01").await).await;

    let at = |secs: i64| command.updated_at + ChronoDuration::seconds(secs);

    assert!(ctx.sweep.stale_commands(ctx.env.id, at(0)).await.unwrap().is_empty());
    assert!(ctx.sweep.stale_commands(ctx.env.id, at(179)).await.unwrap().is_empty());
    assert!(ctx.sweep.stale_commands(ctx.env.id, at(180)).await.unwrap().is_empty());

    let stale = ctx.sweep.stale_commands(ctx.env.id, at(181)).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].command.id, command.id);
}

#[tokio::test]
async fn test_settled_commands_are_never_overdue() {
    let ctx = TestContext::new().await;
    ctx.running_instance("web-01").await;

    let later = Utc::now() + ChronoDuration::hours(1);
    assert!(ctx.sweep.stale_commands(ctx.env.id, later).await.unwrap().is_empty());
    assert_eq!(ctx.sweep.sweep_all(later).await.unwrap(), 0);
    assert!(ctx.channel.sent_of(MessageType::CommandStatusSync).await.is_empty());
}

#[tokio::test]
async fn test_request_status_lists_overdue_commands() {
    let ctx = TestContext::new().await;
    let sha = ctx.create_instance("web-01", "").await;
    ctx.create_instance("web-02", "").await;

    let later = Utc::now() + ChronoDuration::minutes(4);
    assert_eq!(ctx.sweep.request_status(&ctx.env, later).await.unwrap(), 2);

    let sent = ctx.channel.sent_of(MessageType::CommandStatusSync).await;
    assert_eq!(sent.len(), 1);
    let key = sent[0].parsed_key().unwrap();
    assert_eq!(key.env_id(), Some(ctx.env.id));

    let entries: Vec<CommandSyncEntry> = sent[0].decode_payload().unwrap();
    let web1 = entries.iter().find(|e| e.resource_name == "web-01").unwrap();
    assert_eq!(web1.resource_type, "release");
    assert_eq!(web1.commit.as_deref(), Some(sha.as_str()));
}

#[tokio::test]
async fn test_reply_with_matching_commit_succeeds() {
    let ctx = TestContext::new().await;
    let sha = ctx.create_instance("web-01", "").await;
    let command = ctx.current_command(&ctx.instance("web-01").await).await;

    let report = ctx
        .sweep
        .handle_status_result(ctx.env.id, &[reply(command.id, "web-01", Some(&sha))])
        .await
        .unwrap();

    assert_eq!(report.succeeded, vec![command.id]);
    assert_eq!(ctx.instance("web-01").await.status, ObjectStatus::Running);
    assert_eq!(ctx.command(command.id).await.status, CommandStatus::Success);
}

#[tokio::test]
async fn test_reply_with_other_commit_fails_with_timeout() {
    let ctx = TestContext::new().await;
    ctx.create_instance("web-01", "").await;
    let command = ctx.current_command(&ctx.instance("web-01").await).await;

    let report = ctx
        .sweep
        .handle_status_result(ctx.env.id, &[reply(command.id, "web-01", Some("0ld"))])
        .await
        .unwrap();

    assert_eq!(report.failed, vec![command.id]);
    let command = ctx.command(command.id).await;
    assert_eq!(command.status, CommandStatus::Failed);
    assert_eq!(command.error.as_deref(), Some(TIMEOUT_ERROR));
    assert_eq!(ctx.instance("web-01").await.status, ObjectStatus::Failed);
}

#[tokio::test]
async fn test_reply_without_commit_fails_commands_that_never_wrote() {
    let ctx = TestContext::new().await;
    ctx.git.set_failing(true);
    let _ = ctx
        .lifecycle
        .deploy_instance(
            &ctx.deploy_request("web-01", "1.0.0", ""),
            CommandType::Create,
        )
        .await;
    let command = ctx.current_command(&ctx.instance("web-01").await).await;
    assert!(command.sha.is_none());

    let report = ctx
        .sweep
        .handle_status_result(ctx.env.id, &[reply(command.id, "web-01", None)])
        .await
        .unwrap();
    assert_eq!(report.failed, vec![command.id]);
}

#[tokio::test]
async fn test_reply_for_superseded_or_settled_command_is_skipped() {
    let ctx = TestContext::new().await;
    let object = ctx.running_instance("web-01").await;
    let settled = ctx.current_command(&object).await;

    let report = ctx
        .sweep
        .handle_status_result(
            ctx.env.id,
            &[
                reply(settled.id, "web-01", None),
                reply(9999, "web-01", None),
            ],
        )
        .await
        .unwrap();
    assert_eq!(report.skipped, vec![settled.id, 9999]);
    assert_eq!(ctx.command(settled.id).await.status, CommandStatus::Success);

    let other = ctx.store.create_environment(1, "dev", "dev").await.unwrap();
    ctx.lifecycle
        .restart_instance(ctx.env.id, "web-01")
        .await
        .unwrap();
    let current = ctx.current_command(&ctx.instance("web-01").await).await;
    let report = ctx
        .sweep
        .handle_status_result(other.id, &[reply(current.id, "web-01", None)])
        .await
        .unwrap();
    assert_eq!(report.skipped, vec![current.id]);
    assert_eq!(ctx.command(current.id).await.status, CommandStatus::Operating);
}

#[tokio::test]
async fn test_certificate_confirmed_by_reply_is_active() {
    let ctx = TestContext::new().await;
    let outcome = ctx
        .lifecycle
        .apply_object(
            &ApplyRequest {
                env_id: ctx.env.id,
                kind: ObjectKind::Certificate,
                custom_kind: String::new(),
                name: "web-tls".to_string(),
                manifest: String::new(),
                service_type: None,
            },
            CommandType::Create,
        )
        .await
        .unwrap();
    let OperationOutcome::Accepted { command_id, sha, .. } = outcome else {
        panic!("expected an accepted apply");
    };

    let entry = CommandSyncEntry {
        id: command_id,
        resource_type: "certificate".to_string(),
        resource_name: "web-tls".to_string(),
        commit: sha,
    };
    ctx.sweep
        .handle_status_result(ctx.env.id, &[entry])
        .await
        .unwrap();

    let cert = ctx.object(ObjectKind::Certificate, "web-tls").await.unwrap();
    assert_eq!(cert.status, ObjectStatus::Active);
}

#[tokio::test]
async fn test_status_messages_through_handler() {
    let ctx = TestContext::new().await;
    let sha = ctx.create_instance("web-01", "").await;
    let command = ctx.current_command(&ctx.instance("web-01").await).await;

    // Nothing is overdue yet, so the agent's request yields no snapshot.
    let request = ctx.env_message(MessageType::CommandStatusSyncRequest, serde_json::Value::Null);
    assert_eq!(ctx.handle(request).await, Disposition::Applied);
    assert!(ctx.channel.sent_of(MessageType::CommandStatusSync).await.is_empty());

    let result = ctx.env_message(
        MessageType::CommandStatusSyncResult,
        json!([{"id": command.id, "resourceType": "release", "resourceName": "web-01", "commit": sha}]),
    );
    assert_eq!(ctx.handle(result).await, Disposition::Applied);
    assert_eq!(ctx.instance("web-01").await.status, ObjectStatus::Running);
}

#[tokio::test]
async fn test_sweep_loop_requests_status_and_stops_on_shutdown() {
    let ctx = TestContext::new().await;
    ctx.create_instance("web-01", "").await;

    let sweep = Arc::new(TimeoutSweep::new(
        ctx.store.clone(),
        ctx.channel.clone(),
        TimeoutSweepConfig {
            poll_interval: Duration::from_millis(20),
            grace: Duration::ZERO,
        },
    ));
    let shutdown = sweep.shutdown_handle();
    let task = sweep.clone();
    let handle = tokio::spawn(async move { task.run().await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("sweep did not stop")
        .expect("sweep task panicked");

    assert!(!ctx.channel.sent_of(MessageType::CommandStatusSync).await.is_empty());
}
