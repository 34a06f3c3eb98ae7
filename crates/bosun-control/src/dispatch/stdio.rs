// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent channel writing newline-delimited JSON to an async writer.
//!
//! The standalone binary uses it over stdout, leaving transport to
//! whatever process is piped to it.

use async_trait::async_trait;
use bosun_protocol::AgentMessage;
use bosun_protocol::frame::write_message;
use tokio::io::{AsyncWrite, Stdout};
use tokio::sync::Mutex;

use super::traits::*;

/// Line-framed agent channel over any writer.
pub struct StdioAgentChannel<W = Stdout> {
    writer: Mutex<W>,
}

impl StdioAgentChannel<Stdout> {
    /// Channel over the process's standard output.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> StdioAgentChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Channel over an arbitrary writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Take the writer back.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> AgentChannel for StdioAgentChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn channel_type(&self) -> &'static str {
        "stdio"
    }

    async fn send(&self, message: AgentMessage) -> Result<(), DispatchError> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, &message)
            .await
            .map_err(|e| DispatchError::SendFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_protocol::{MessageKey, MessageType};
    use serde_json::json;

    #[tokio::test]
    async fn test_writes_one_line_per_message() {
        let channel = StdioAgentChannel::new(Vec::<u8>::new());
        let key = MessageKey::for_environment(1, "prod", 2);

        channel
            .send(AgentMessage::new(&key, MessageType::CommandStatusSync, json!([])))
            .await
            .unwrap();
        channel
            .send(AgentMessage::new(&key, MessageType::GitOpsSync, json!({"commit": "c"})))
            .await
            .unwrap();

        let text = String::from_utf8(channel.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("command_status_sync"));
    }
}
