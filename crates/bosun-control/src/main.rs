// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bosun Control - standalone control plane
//!
//! Reads agent messages as JSON lines on stdin and writes outbound agent
//! messages as JSON lines on stdout. Whatever process sits on the other
//! end of the pipes owns the actual transport.

use std::sync::Arc;

use bosun_control::config::Config;
use bosun_control::dispatch::{AgentChannel, StdioAgentChannel};
use bosun_control::git::{CliGitRepository, GitRepository};
use bosun_control::persistence::SqlitePersistence;
use bosun_control::runtime::ControlRuntime;
use bosun_protocol::frame::{FrameError, read_message};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries agent traffic.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bosun_control=debug".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        database = %config.database_path.display(),
        gitops_dir = %config.gitops_dir.display(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        command_grace_ms = config.command_grace.as_millis() as u64,
        "Starting Bosun control plane"
    );

    let persistence = Arc::new(SqlitePersistence::from_path(&config.database_path).await?);
    info!("Database ready");

    let git = Arc::new(CliGitRepository::new(&config.gitops_dir, &config.git_author));
    let channel = Arc::new(StdioAgentChannel::stdout());
    info!(
        git_backend = git.backend_type(),
        channel = channel.channel_type(),
        "Backends initialized"
    );

    let (tx, rx) = mpsc::channel(config.max_concurrent_messages.max(1) * 4);

    let runtime = ControlRuntime::builder()
        .persistence(persistence)
        .git(git)
        .channel(channel)
        .sweep_poll_interval(config.sweep_interval)
        .command_grace(config.command_grace)
        .max_concurrent_messages(config.max_concurrent_messages)
        .build()?
        .start(rx)
        .await?;

    let reader = tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin());
        loop {
            match read_message(&mut stdin).await {
                Ok(Some(message)) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("Agent input closed");
                    break;
                }
                Err(FrameError::Decode(e)) => warn!(error = %e, "Skipping undecodable agent message"),
                Err(FrameError::FrameTooLarge(size)) => warn!(size, "Skipping oversized agent message"),
                Err(e) => {
                    error!(error = %e, "Agent input failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
        _ = reader => {}
    }

    runtime.shutdown().await?;

    info!("Bosun control plane stopped");
    Ok(())
}
