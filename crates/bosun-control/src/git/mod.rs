// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Git repository backends for environment manifests.

pub mod cli;
pub mod mock;
mod traits;

pub use cli::CliGitRepository;
pub use mock::MockGitRepository;
pub use traits::*;
