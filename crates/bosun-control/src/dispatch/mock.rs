// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock agent channel for testing.
//!
//! Records every message it is handed instead of delivering it.

use async_trait::async_trait;
use bosun_protocol::{AgentMessage, MessageType};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::traits::*;

/// Mock agent channel for testing.
pub struct MockAgentChannel {
    sent: Arc<Mutex<Vec<AgentMessage>>>,
    unreachable: AtomicBool,
}

impl Default for MockAgentChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAgentChannel {
    /// Create a channel that accepts everything.
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Create a channel whose agent is unreachable.
    pub fn failing() -> Self {
        let channel = Self::new();
        channel.set_unreachable(true);
        channel
    }

    /// Toggle reachability.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Messages accepted so far.
    pub async fn sent(&self) -> Vec<AgentMessage> {
        self.sent.lock().await.clone()
    }

    /// Messages of one type accepted so far.
    pub async fn sent_of(&self, message_type: MessageType) -> Vec<AgentMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|m| m.message_type == message_type)
            .cloned()
            .collect()
    }

    /// Forget recorded messages.
    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl AgentChannel for MockAgentChannel {
    fn channel_type(&self) -> &'static str {
        "mock"
    }

    async fn send(&self, message: AgentMessage) -> Result<(), DispatchError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DispatchError::Unreachable(message.key));
        }
        self.sent.lock().await.push(message);
        Ok(())
    }
}
