#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use linkup_domain::{ApiError, Role, UserId};

use crate::util::time::unix_ms_now;

/// The subset of a user document the core needs for authorization decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSnapshot {
	pub id: UserId,
	pub username: String,
	pub role: Role,
	/// Unix ms of the last credentials change, if any. Tokens issued before
	/// this instant are stale.
	pub credentials_changed_at: Option<i64>,
	pub two_step_enabled: bool,
}

/// Snapshot plus the secret material needed by the login flow.
#[derive(Debug, Clone)]
pub struct AuthRecord {
	pub snapshot: UserSnapshot,
	pub email: String,
	pub password_hash: String,
	pub login_code_hash: Option<String>,
	pub login_code_expires_at: Option<i64>,
}

/// Fields required to create an account.
#[derive(Debug, Clone)]
pub struct NewUser {
	pub username: String,
	pub email: String,
	pub password_hash: String,
	pub role: Role,
}

/// Store over the `users` and `contacts` tables.
#[derive(Clone)]
pub struct UserStore {
	backend: UserBackend,
}

#[derive(Clone)]
enum UserBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// Raw snapshot columns: id, username, role, credentials_changed_at,
/// two_step_enabled.
type SnapshotColumns = (String, String, String, Option<i64>, bool);

/// Snapshot columns plus email, password_hash, login_code_hash,
/// login_code_expires_at.
type AuthColumns = (String, String, String, Option<i64>, bool, String, String, Option<String>, Option<i64>);

fn snapshot_from_columns(cols: SnapshotColumns) -> Result<UserSnapshot, ApiError> {
	let (id, username, role, credentials_changed_at, two_step_enabled) = cols;
	Ok(UserSnapshot {
		id: UserId::parse(&id).map_err(ApiError::upstream)?,
		username,
		role: role.parse().map_err(ApiError::upstream)?,
		credentials_changed_at,
		two_step_enabled,
	})
}

impl UserStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = crate::server::store::sqlite_pool(database_url).await?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Self {
				backend: UserBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self {
				backend: UserBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	/// Build a store over an already-connected sqlite pool (tests).
	pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
		Self {
			backend: UserBackend::Sqlite(pool),
		}
	}

	/// Create an account. A duplicate email is a `Conflict`.
	pub async fn create(&self, new: NewUser) -> Result<UserSnapshot, ApiError> {
		let id = UserId::new_v4();
		let now = unix_ms_now();

		let result = match &self.backend {
			UserBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO users (id, username, email, password_hash, role, two_step_enabled, created_at) \
					VALUES (?, ?, ?, ?, ?, 0, ?)",
				)
				.bind(id.to_string())
				.bind(&new.username)
				.bind(&new.email)
				.bind(&new.password_hash)
				.bind(new.role.as_str())
				.bind(now)
				.execute(pool)
				.await
			}
			UserBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO users (id, username, email, password_hash, role, two_step_enabled, created_at) \
					VALUES ($1, $2, $3, $4, $5, FALSE, $6)",
				)
				.bind(id.to_string())
				.bind(&new.username)
				.bind(&new.email)
				.bind(&new.password_hash)
				.bind(new.role.as_str())
				.bind(now)
				.execute(pool)
				.await
			}
		};

		match result {
			Ok(_) => Ok(UserSnapshot {
				id,
				username: new.username,
				role: new.role,
				credentials_changed_at: None,
				two_step_enabled: false,
			}),
			Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
				Err(ApiError::conflict("email already registered"))
			}
			Err(e) => Err(ApiError::upstream(e)),
		}
	}

	/// Load a snapshot by id. Frozen accounts are excluded unless the caller
	/// explicitly opts in.
	pub async fn find_by_id(&self, id: UserId, include_frozen: bool) -> Result<Option<UserSnapshot>, ApiError> {
		let frozen_clause = if include_frozen { "" } else { " AND frozen_at IS NULL" };

		let row: Option<SnapshotColumns> = match &self.backend {
			UserBackend::Sqlite(pool) => {
				let sql = format!(
					"SELECT id, username, role, credentials_changed_at, two_step_enabled FROM users \
					WHERE id = ?{frozen_clause}"
				);
				sqlx::query_as(&sql)
					.bind(id.to_string())
					.fetch_optional(pool)
					.await
					.map_err(ApiError::upstream)?
			}
			UserBackend::Postgres(pool) => {
				let sql = format!(
					"SELECT id, username, role, credentials_changed_at, two_step_enabled FROM users \
					WHERE id = $1{frozen_clause}"
				);
				sqlx::query_as(&sql)
					.bind(id.to_string())
					.fetch_optional(pool)
					.await
					.map_err(ApiError::upstream)?
			}
		};

		row.map(snapshot_from_columns).transpose()
	}

	/// Load the full auth record for the login flow.
	pub async fn find_auth_by_email(&self, email: &str, include_frozen: bool) -> Result<Option<AuthRecord>, ApiError> {
		let frozen_clause = if include_frozen { "" } else { " AND frozen_at IS NULL" };

		let row: Option<AuthColumns> = match &self.backend {
			UserBackend::Sqlite(pool) => {
				let sql = format!(
					"SELECT id, username, role, credentials_changed_at, two_step_enabled, email, password_hash, \
					login_code_hash, login_code_expires_at FROM users WHERE email = ?{frozen_clause}"
				);
				sqlx::query_as(&sql)
					.bind(email)
					.fetch_optional(pool)
					.await
					.map_err(ApiError::upstream)?
			}
			UserBackend::Postgres(pool) => {
				let sql = format!(
					"SELECT id, username, role, credentials_changed_at, two_step_enabled, email, password_hash, \
					login_code_hash, login_code_expires_at FROM users WHERE email = $1{frozen_clause}"
				);
				sqlx::query_as(&sql)
					.bind(email)
					.fetch_optional(pool)
					.await
					.map_err(ApiError::upstream)?
			}
		};

		row.map(|cols| {
			let (id, username, role, credentials_changed_at, two_step_enabled, email, password_hash, login_code_hash, login_code_expires_at) =
				cols;
			let snapshot = snapshot_from_columns((id, username, role, credentials_changed_at, two_step_enabled))?;
			Ok(AuthRecord {
				snapshot,
				email,
				password_hash,
				login_code_hash,
				login_code_expires_at,
			})
		})
		.transpose()
	}

	/// Invalidate every outstanding token issued before `at_ms`.
	pub async fn bump_credentials_changed(&self, id: UserId, at_ms: i64) -> Result<(), ApiError> {
		match &self.backend {
			UserBackend::Sqlite(pool) => {
				sqlx::query("UPDATE users SET credentials_changed_at = ? WHERE id = ?")
					.bind(at_ms)
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
			UserBackend::Postgres(pool) => {
				sqlx::query("UPDATE users SET credentials_changed_at = $1 WHERE id = $2")
					.bind(at_ms)
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
		}
		Ok(())
	}

	pub async fn set_login_code(&self, id: UserId, code_hash: &str, expires_at_ms: i64) -> Result<(), ApiError> {
		match &self.backend {
			UserBackend::Sqlite(pool) => {
				sqlx::query("UPDATE users SET login_code_hash = ?, login_code_expires_at = ? WHERE id = ?")
					.bind(code_hash)
					.bind(expires_at_ms)
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
			UserBackend::Postgres(pool) => {
				sqlx::query("UPDATE users SET login_code_hash = $1, login_code_expires_at = $2 WHERE id = $3")
					.bind(code_hash)
					.bind(expires_at_ms)
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
		}
		Ok(())
	}

	pub async fn clear_login_code(&self, id: UserId) -> Result<(), ApiError> {
		match &self.backend {
			UserBackend::Sqlite(pool) => {
				sqlx::query("UPDATE users SET login_code_hash = NULL, login_code_expires_at = NULL WHERE id = ?")
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
			UserBackend::Postgres(pool) => {
				sqlx::query("UPDATE users SET login_code_hash = NULL, login_code_expires_at = NULL WHERE id = $1")
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
		}
		Ok(())
	}

	pub async fn set_two_step(&self, id: UserId, enabled: bool) -> Result<(), ApiError> {
		match &self.backend {
			UserBackend::Sqlite(pool) => {
				sqlx::query("UPDATE users SET two_step_enabled = ? WHERE id = ?")
					.bind(enabled)
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
			UserBackend::Postgres(pool) => {
				sqlx::query("UPDATE users SET two_step_enabled = $1 WHERE id = $2")
					.bind(enabled)
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
		}
		Ok(())
	}

	pub async fn freeze(&self, id: UserId) -> Result<(), ApiError> {
		let now = unix_ms_now();
		match &self.backend {
			UserBackend::Sqlite(pool) => {
				sqlx::query("UPDATE users SET frozen_at = ? WHERE id = ?")
					.bind(now)
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
			UserBackend::Postgres(pool) => {
				sqlx::query("UPDATE users SET frozen_at = $1 WHERE id = $2")
					.bind(now)
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
			}
		}
		Ok(())
	}

	/// Record a mutual contact. Idempotent.
	pub async fn add_contact(&self, a: UserId, b: UserId) -> Result<(), ApiError> {
		match &self.backend {
			UserBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO contacts (user_id, contact_id) VALUES (?, ?), (?, ?) \
					ON CONFLICT(user_id, contact_id) DO NOTHING",
				)
				.bind(a.to_string())
				.bind(b.to_string())
				.bind(b.to_string())
				.bind(a.to_string())
				.execute(pool)
				.await
				.map_err(ApiError::upstream)?;
			}
			UserBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO contacts (user_id, contact_id) VALUES ($1, $2), ($2, $1) \
					ON CONFLICT (user_id, contact_id) DO NOTHING",
				)
				.bind(a.to_string())
				.bind(b.to_string())
				.execute(pool)
				.await
				.map_err(ApiError::upstream)?;
			}
		}
		Ok(())
	}

	/// Whether `contact` is a permitted contact of `owner` (and still exists,
	/// unfrozen).
	pub async fn is_contact(&self, owner: UserId, contact: UserId) -> Result<bool, ApiError> {
		let row: Option<(String,)> = match &self.backend {
			UserBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT c.contact_id FROM contacts c JOIN users u ON u.id = c.contact_id \
				WHERE c.user_id = ? AND c.contact_id = ? AND u.frozen_at IS NULL",
			)
			.bind(owner.to_string())
			.bind(contact.to_string())
			.fetch_optional(pool)
			.await
			.map_err(ApiError::upstream)?,
			UserBackend::Postgres(pool) => sqlx::query_as(
				"SELECT c.contact_id FROM contacts c JOIN users u ON u.id = c.contact_id \
				WHERE c.user_id = $1 AND c.contact_id = $2 AND u.frozen_at IS NULL",
			)
			.bind(owner.to_string())
			.bind(contact.to_string())
			.fetch_optional(pool)
			.await
			.map_err(ApiError::upstream)?,
		};

		Ok(row.is_some())
	}

	/// How many of `candidates` are contacts of `owner`. Group creation
	/// compares this against the list length.
	pub async fn count_contacts_among(&self, owner: UserId, candidates: &[UserId]) -> Result<usize, ApiError> {
		let mut count = 0usize;
		for candidate in candidates {
			if self.is_contact(owner, *candidate).await? {
				count += 1;
			}
		}
		Ok(count)
	}
}
