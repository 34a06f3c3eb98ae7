// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent channel trait definitions.

use async_trait::async_trait;
use bosun_protocol::AgentMessage;
use thiserror::Error;

/// Errors from sending to the agent.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The agent for the target cluster is not connected.
    #[error("Agent unreachable: {0}")]
    Unreachable(String),

    /// The transport rejected the message.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Trait for outbound agent transports.
///
/// Delivery is at-least-once at best; callers must tolerate duplicates.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Channel type identifier (e.g., "stdio", "mock")
    fn channel_type(&self) -> &'static str;

    /// Hand a message to the transport.
    async fn send(&self, message: AgentMessage) -> Result<(), DispatchError>;
}
