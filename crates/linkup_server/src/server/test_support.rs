#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use linkup_domain::{Role, UserId};
use linkup_protocol::ServerFrame;
use linkup_util::secret::SecretString;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc;

use crate::server::auth::{SecretPair, TokenSecrets, TokenTtls};
use crate::server::chat_store::ChatStore;
use crate::server::presence::ConnectionHandle;
use crate::server::revocation::RevocationStore;
use crate::server::storage::ObjectStore;
use crate::server::users::{NewUser, UserSnapshot, UserStore};

/// Fresh in-memory sqlite pool with the schema applied.
pub(crate) async fn memory_pool() -> sqlx::SqlitePool {
	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect("sqlite::memory:")
		.await
		.expect("connect in-memory sqlite");
	sqlx::migrate!("migrations/sqlite").run(&pool).await.expect("run migrations");
	pool
}

pub(crate) struct TestStores {
	pub pool: sqlx::SqlitePool,
	pub users: Arc<UserStore>,
	pub chats: Arc<ChatStore>,
	pub revocations: Arc<RevocationStore>,
}

pub(crate) async fn stores() -> TestStores {
	let pool = memory_pool().await;
	TestStores {
		users: Arc::new(UserStore::from_sqlite(pool.clone())),
		chats: Arc::new(ChatStore::from_sqlite(pool.clone())),
		revocations: Arc::new(RevocationStore::from_sqlite(pool.clone())),
		pool,
	}
}

pub(crate) fn test_secrets() -> TokenSecrets {
	TokenSecrets {
		bearer: SecretPair {
			access: SecretString::new("bearer-access-secret"),
			refresh: SecretString::new("bearer-refresh-secret"),
		},
		system: SecretPair {
			access: SecretString::new("system-access-secret"),
			refresh: SecretString::new("system-refresh-secret"),
		},
	}
}

pub(crate) fn test_ttls() -> TokenTtls {
	TokenTtls::default()
}

/// Minimum-cost bcrypt hash; tests only care that verification matches.
pub(crate) fn weak_hash(plaintext: &str) -> String {
	bcrypt::hash(plaintext, 4).expect("bcrypt hash")
}

pub(crate) async fn new_user(users: &UserStore, name: &str) -> UserSnapshot {
	users
		.create(NewUser {
			username: name.to_string(),
			email: format!("{name}@example.com"),
			password_hash: weak_hash("correct horse"),
			role: Role::User,
		})
		.await
		.expect("create user")
}

/// A fake connection: a handle plus the receiving end of its frame queue.
pub(crate) fn fake_connection(conn_id: u64) -> (ConnectionHandle, mpsc::Receiver<ServerFrame>) {
	let (tx, rx) = mpsc::channel(32);
	(ConnectionHandle::new(conn_id, tx), rx)
}

/// Drain whatever frames are immediately available.
pub(crate) fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
	let mut frames = Vec::new();
	while let Ok(frame) = rx.try_recv() {
		frames.push(frame);
	}
	frames
}

/// Object store that records keys instead of touching disk.
#[derive(Default)]
pub(crate) struct RecordingObjectStore {
	pub puts: Mutex<Vec<String>>,
	pub deletes: Mutex<Vec<String>>,
}

#[async_trait]
impl ObjectStore for RecordingObjectStore {
	async fn put(&self, key: &str, _bytes: &[u8]) -> anyhow::Result<()> {
		self.puts.lock().expect("puts lock").push(key.to_string());
		Ok(())
	}

	async fn delete(&self, key: &str) -> anyhow::Result<()> {
		self.deletes.lock().expect("deletes lock").push(key.to_string());
		Ok(())
	}
}

/// Two users that already know each other.
pub(crate) async fn contact_pair(users: &UserStore) -> (UserSnapshot, UserSnapshot) {
	let a = new_user(users, "alice").await;
	let b = new_user(users, "bob").await;
	users.add_contact(a.id, b.id).await.expect("add contact");
	(a, b)
}

pub(crate) fn other_user_id() -> UserId {
	UserId::new_v4()
}
