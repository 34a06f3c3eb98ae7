// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bosun Control - GitOps Reconciliation Engine
//!
//! This crate is the control plane of a GitOps deployment manager. It turns
//! deploy, start, stop, restart, and delete requests into manifests
//! committed to an environment's repository, hands them to the cluster
//! agent, and reconciles the agent's asynchronous reports into durable
//! status for every managed object.
//!
//! # Architecture
//!
//! ```text
//!        user intent                                   cluster agent
//!            │                                        ▲            │
//!            ▼                                        │            │ reports
//! ┌─────────────────────┐   ┌──────────────────┐      │            ▼
//! │  CommandLifecycle   │──►│  ManifestWriter  │      │   ┌──────────────────────┐
//! │  (compose, command) │   │  (file index)    │      │   │ AgentMessageHandler  │
//! └─────────────────────┘   └──────────────────┘      │   │  ├─ release results  │
//!            │                       │                │   │  ├─ resources, pods  │
//!            │ dispatch              ▼                │   │  ├─ certificates     │
//!            └──────────────►  environment repo ──────┘   │  ├─ DriftReconciler  │
//!                                                         │  └─ TimeoutSweep ◄───┼── every poll
//!                                                         └──────────────────────┘
//!            │                                                      │
//!            ▼                                                      ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                SQLite                                    │
//! │     (objects, commands, file index, file errors, resources, pods)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Command Lifecycle
//!
//! Every operation inserts a new OPERATING command and repoints its object
//! at it. Exactly one resolver settles it afterwards:
//!
//! | Resolver | Trigger | Outcome |
//! |----------|---------|---------|
//! | [`ingest`] | install/upgrade result, explicit failure, confirmation | SUCCESS or FAILED |
//! | [`drift`] | GitOps sync ledger | SUCCESS on sha match, FAILED on tagged file error |
//! | [`timeout_sweep`] | status reply for overdue commands | SUCCESS on sha match, FAILED otherwise |
//! | [`lifecycle`] | dispatch failure | FAILED |
//!
//! Resolution is a compare-and-set on "still OPERATING", so a command never
//! changes after reaching a terminal status.
//!
//! # Modules
//!
//! - [`compose`]: baseline + override merge producing the stored manifest and delta
//! - [`manifest_writer`]: multi-document files in the environment repository
//! - [`lifecycle`]: user-facing operations
//! - [`ingest`]: inbound agent messages
//! - [`drift`]: commit-ledger reconciliation
//! - [`timeout_sweep`]: status re-requests for overdue commands
//! - [`runtime`]: embeddable runtime wiring everything together
//!
//! # Configuration
//!
//! See [`config::Config`] for the environment variables read by the binary.

#![deny(missing_docs)]

pub mod compose;
pub mod config;
pub mod dispatch;
pub mod drift;
pub mod error;
pub mod git;
pub mod ingest;
pub mod lifecycle;
pub mod manifest_writer;
pub mod migrations;
pub mod model;
pub mod persistence;
pub mod resolution;
pub mod runtime;
pub mod timeout_sweep;

pub use error::{Error, Result};
