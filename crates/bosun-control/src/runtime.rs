// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for bosun-control.
//!
//! [`ControlRuntime`] wires the store, the repository backend, and the agent
//! channel together, then runs the two long-lived tasks of the control
//! plane: the inbound message loop and the timeout sweep.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bosun_control::runtime::ControlRuntime;
//!
//! let (tx, rx) = tokio::sync::mpsc::channel(1024);
//! let runtime = ControlRuntime::builder()
//!     .persistence(store)
//!     .git(Arc::new(CliGitRepository::new("/srv/gitops", "bosun <bosun@localhost>")))
//!     .channel(Arc::new(StdioAgentChannel::stdout()))
//!     .build()?
//!     .start(rx)
//!     .await?;
//!
//! runtime.lifecycle().stop_instance(env_id, "web-01").await?;
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bosun_protocol::AgentMessage;
use tokio::sync::{Notify, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dispatch::AgentChannel;
use crate::git::GitRepository;
use crate::ingest::AgentMessageHandler;
use crate::lifecycle::CommandLifecycle;
use crate::manifest_writer::ManifestWriter;
use crate::persistence::Persistence;
use crate::timeout_sweep::{DEFAULT_COMMAND_GRACE, TimeoutSweep, TimeoutSweepConfig};

/// Builder for creating a [`ControlRuntime`].
pub struct ControlRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    git: Option<Arc<dyn GitRepository>>,
    channel: Option<Arc<dyn AgentChannel>>,
    sweep_poll_interval: Duration,
    command_grace: Duration,
    max_concurrent_messages: usize,
}

impl Default for ControlRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            git: None,
            channel: None,
            sweep_poll_interval: Duration::from_secs(60),
            command_grace: DEFAULT_COMMAND_GRACE,
            max_concurrent_messages: 64,
        }
    }
}

impl ControlRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store of record.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the repository backend.
    pub fn git(mut self, git: Arc<dyn GitRepository>) -> Self {
        self.git = Some(git);
        self
    }

    /// Set the outbound agent channel.
    pub fn channel(mut self, channel: Arc<dyn AgentChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Set how often the timeout sweep runs.
    pub fn sweep_poll_interval(mut self, interval: Duration) -> Self {
        self.sweep_poll_interval = interval;
        self
    }

    /// Set the grace window for in-flight commands.
    pub fn command_grace(mut self, grace: Duration) -> Self {
        self.command_grace = grace;
        self
    }

    /// Set the maximum number of messages handled concurrently.
    pub fn max_concurrent_messages(mut self, max: usize) -> Self {
        self.max_concurrent_messages = max.max(1);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControlRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let git = self
            .git
            .ok_or_else(|| anyhow::anyhow!("git is required"))?;
        let channel = self
            .channel
            .ok_or_else(|| anyhow::anyhow!("channel is required"))?;

        Ok(ControlRuntimeConfig {
            persistence,
            git,
            channel,
            sweep: TimeoutSweepConfig {
                poll_interval: self.sweep_poll_interval,
                grace: self.command_grace,
            },
            max_concurrent_messages: self.max_concurrent_messages,
        })
    }
}

/// Configuration for a [`ControlRuntime`].
pub struct ControlRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    git: Arc<dyn GitRepository>,
    channel: Arc<dyn AgentChannel>,
    sweep: TimeoutSweepConfig,
    max_concurrent_messages: usize,
}

impl ControlRuntimeConfig {
    /// Start the runtime, consuming inbound agent messages from `inbound`.
    pub async fn start(self, inbound: mpsc::Receiver<AgentMessage>) -> Result<ControlRuntime> {
        let sweep = Arc::new(TimeoutSweep::new(
            self.persistence.clone(),
            self.channel.clone(),
            self.sweep.clone(),
        ));
        let sweep_shutdown = sweep.shutdown_handle();
        let sweep_task = sweep.clone();
        let sweep_handle = tokio::spawn(async move {
            sweep_task.run().await;
        });

        let handler = Arc::new(AgentMessageHandler::new(
            self.persistence.clone(),
            sweep.clone(),
        ));
        let (inbound_shutdown_tx, inbound_shutdown_rx) = watch::channel(false);
        let inbound_handle = tokio::spawn(run_inbound_loop(
            inbound,
            handler,
            self.max_concurrent_messages,
            inbound_shutdown_rx,
        ));

        let writer = ManifestWriter::new(self.git.clone(), self.persistence.clone());
        let lifecycle = Arc::new(CommandLifecycle::new(
            self.persistence.clone(),
            writer,
            self.channel.clone(),
        ));

        info!(
            git_backend = self.git.backend_type(),
            channel = self.channel.channel_type(),
            max_concurrent_messages = self.max_concurrent_messages,
            "ControlRuntime started"
        );

        Ok(ControlRuntime {
            inbound_handle,
            sweep_handle,
            inbound_shutdown_tx,
            sweep_shutdown,
            lifecycle,
            sweep,
        })
    }
}

/// A running control plane.
///
/// The runtime manages:
/// - the inbound loop, handling each agent message in its own task
/// - the timeout sweep, re-requesting status for overdue commands
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControlRuntime {
    inbound_handle: JoinHandle<()>,
    sweep_handle: JoinHandle<()>,
    inbound_shutdown_tx: watch::Sender<bool>,
    sweep_shutdown: Arc<Notify>,
    lifecycle: Arc<CommandLifecycle>,
    sweep: Arc<TimeoutSweep>,
}

impl ControlRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControlRuntimeBuilder {
        ControlRuntimeBuilder::new()
    }

    /// Entry point for user operations.
    pub fn lifecycle(&self) -> &Arc<CommandLifecycle> {
        &self.lifecycle
    }

    /// The timeout sweep, for triggering a sweep out of schedule.
    pub fn sweep(&self) -> &Arc<TimeoutSweep> {
        &self.sweep
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting inbound messages, waits for in-flight handlers, and
    /// stops the sweep.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControlRuntime shutting down...");

        let _ = self.inbound_shutdown_tx.send(true);
        self.sweep_shutdown.notify_one();

        if let Err(e) = self.inbound_handle.await {
            error!("Inbound loop task panicked: {}", e);
        }
        if let Err(e) = self.sweep_handle.await {
            error!("Timeout sweep task panicked: {}", e);
        }

        info!("ControlRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.inbound_handle.is_finished() && !self.sweep_handle.is_finished()
    }
}

async fn run_inbound_loop(
    mut inbound: mpsc::Receiver<AgentMessage>,
    handler: Arc<AgentMessageHandler>,
    max_concurrent: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent));

    loop {
        let message = tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                info!("Inbound loop received shutdown signal");
                break;
            }

            message = inbound.recv() => match message {
                Some(message) => message,
                None => {
                    info!("Inbound channel closed");
                    break;
                }
            },
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match handler.handle(&message).await {
                Ok(disposition) => debug!(
                    message_type = %message.message_type,
                    ?disposition,
                    "Agent message handled"
                ),
                Err(e) => error!(
                    key = %message.key,
                    message_type = %message.message_type,
                    error = %e,
                    "Failed to handle agent message"
                ),
            }
        });
    }

    // Wait for in-flight handlers.
    let max = u32::try_from(max_concurrent).unwrap_or(u32::MAX);
    if let Ok(all) = permits.acquire_many(max).await {
        drop(all);
    }
    info!("Inbound loop stopped");
}
