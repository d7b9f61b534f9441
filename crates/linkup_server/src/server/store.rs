#![forbid(unsafe_code)]

use anyhow::Context;
use sqlx::sqlite::SqlitePoolOptions;

/// Build a sqlite pool. A single connection keeps `sqlite::memory:` databases
/// coherent (every pooled connection would otherwise open its own empty
/// database) and serializes writers, which sqlite wants anyway.
pub async fn sqlite_pool(database_url: &str) -> anyhow::Result<sqlx::SqlitePool> {
	SqlitePoolOptions::new()
		.max_connections(1)
		.connect(database_url)
		.await
		.context("connect sqlite")
}
