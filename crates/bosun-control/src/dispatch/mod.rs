// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound agent channels.

pub mod mock;
pub mod stdio;
mod traits;

pub use mock::MockAgentChannel;
pub use stdio::StdioAgentChannel;
pub use traits::*;
