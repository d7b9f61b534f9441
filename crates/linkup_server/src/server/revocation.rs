#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use linkup_domain::{ApiError, UserId};

use crate::util::time::unix_ms_now;

/// Persistent set of revoked token ids. A token whose `jti` appears here is
/// void even while cryptographically valid; rows are pruned lazily once the
/// token's own expiry window has passed, never before.
#[derive(Clone)]
pub struct RevocationStore {
	backend: RevocationBackend,
}

#[derive(Clone)]
enum RevocationBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl RevocationStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = crate::server::store::sqlite_pool(database_url).await?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Self {
				backend: RevocationBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self {
				backend: RevocationBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	/// Build a store over an already-connected sqlite pool (tests).
	pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
		Self {
			backend: RevocationBackend::Sqlite(pool),
		}
	}

	/// Record a token id as revoked until its natural expiry. Inserting the
	/// same id twice is a no-op.
	pub async fn revoke(&self, jti: &str, subject: UserId, natural_expiry_ms: i64) -> Result<(), ApiError> {
		let now = unix_ms_now();
		match &self.backend {
			RevocationBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO revoked_tokens (jti, subject_id, revoked_at, natural_expiry) VALUES (?, ?, ?, ?) \
					ON CONFLICT(jti) DO NOTHING",
				)
				.bind(jti)
				.bind(subject.to_string())
				.bind(now)
				.bind(natural_expiry_ms)
				.execute(pool)
				.await
				.map_err(ApiError::upstream)?;

				// Lazy prune: records past their token's own expiry can no
				// longer be replayed against.
				sqlx::query("DELETE FROM revoked_tokens WHERE natural_expiry < ?")
					.bind(now)
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
			RevocationBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO revoked_tokens (jti, subject_id, revoked_at, natural_expiry) VALUES ($1, $2, $3, $4) \
					ON CONFLICT (jti) DO NOTHING",
				)
				.bind(jti)
				.bind(subject.to_string())
				.bind(now)
				.bind(natural_expiry_ms)
				.execute(pool)
				.await
				.map_err(ApiError::upstream)?;

				sqlx::query("DELETE FROM revoked_tokens WHERE natural_expiry < $1")
					.bind(now)
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
		}

		Ok(())
	}

	/// Whether a token id has been revoked.
	pub async fn is_revoked(&self, jti: &str) -> Result<bool, ApiError> {
		let row: Option<(String,)> = match &self.backend {
			RevocationBackend::Sqlite(pool) => sqlx::query_as("SELECT jti FROM revoked_tokens WHERE jti = ?")
				.bind(jti)
				.fetch_optional(pool)
				.await
				.map_err(ApiError::upstream)?,
			RevocationBackend::Postgres(pool) => sqlx::query_as("SELECT jti FROM revoked_tokens WHERE jti = $1")
				.bind(jti)
				.fetch_optional(pool)
				.await
				.map_err(ApiError::upstream)?,
		};

		Ok(row.is_some())
	}
}
