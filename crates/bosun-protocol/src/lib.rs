// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bosun Protocol - message vocabulary shared with the cluster agent
//!
//! The control plane and the in-cluster agent talk over an at-least-once
//! pub/sub channel. Every message is an [`AgentMessage`] envelope:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ key      cluster:3.env:staging.envId:12.release:web-01       │
//! │ type     helm_install_resource_info                          │
//! │ payload  { "releaseName": "web-01", "resources": [...] }     │
//! │ commandId 41   (optional correlation)                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`key`]: routing key parsing and construction
//! - [`message`]: envelope and [`MessageType`] tags
//! - [`payload`]: typed payload structures
//! - [`frame`]: newline-delimited JSON framing for stream transports

#![deny(missing_docs)]

pub mod frame;
pub mod key;
pub mod message;
pub mod payload;

pub use key::MessageKey;
pub use message::{AgentMessage, MessageType};

use thiserror::Error;

/// Errors raised while interpreting agent messages.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The routing key is malformed.
    #[error("invalid message key: {0}")]
    InvalidKey(String),

    /// A required key segment is absent.
    #[error("message key has no '{0}' segment")]
    MissingSegment(&'static str),

    /// The payload does not match the shape its type requires.
    #[error("invalid {message_type} payload: {source}")]
    InvalidPayload {
        /// Type tag of the offending message.
        message_type: MessageType,
        /// Decode failure.
        #[source]
        source: serde_json::Error,
    },
}
