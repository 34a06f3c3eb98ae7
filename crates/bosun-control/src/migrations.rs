// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for bosun-control.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use bosun_control::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:bosun.db?mode=rwc").await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::SqlitePool;
use sqlx::migrate::{MigrateError, Migrator};

/// SQLite migrations embedded at compile time.
pub static SQLITE: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run all migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
