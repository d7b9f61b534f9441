#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use linkup_domain::{ApiError, GroupId, RoomId, UserId};

use crate::util::time::unix_ms_now;

/// Conversation kind discriminator as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
	Direct,
	Group,
}

impl ConversationKind {
	const fn as_str(self) -> &'static str {
		match self {
			ConversationKind::Direct => "direct",
			ConversationKind::Group => "group",
		}
	}
}

/// A persisted conversation, direct or group.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
	pub id: GroupId,
	pub kind: ConversationKind,
	pub group_name: Option<String>,
	pub group_image: Option<String>,
	pub room_id: Option<RoomId>,
	pub created_by: UserId,
	pub participants: Vec<UserId>,
}

/// One appended message.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
	pub id: uuid::Uuid,
	pub author: UserId,
	pub content: String,
	pub created_at: i64,
}

/// A page selector. `All` is the unpaginated sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
	All,
	Numbered { page: u32, size: u32 },
}

impl Page {
	pub const DEFAULT_SIZE: u32 = 20;

	/// Parse `page`/`size` query parameters; `page=all` selects everything.
	/// Unparsable values fall back to the defaults.
	pub fn from_query(page: Option<&str>, size: Option<&str>) -> Self {
		let size = size
			.and_then(|s| s.trim().parse::<u32>().ok())
			.filter(|s| *s > 0)
			.unwrap_or(Self::DEFAULT_SIZE);

		match page {
			Some(p) if p.trim().eq_ignore_ascii_case("all") => Page::All,
			Some(p) => {
				let page = p.trim().parse::<u32>().ok().filter(|p| *p > 0).unwrap_or(1);
				Page::Numbered { page, size }
			}
			None => Page::Numbered { page: 1, size },
		}
	}

	fn limit_offset(&self) -> Option<(i64, i64)> {
		match self {
			Page::All => None,
			Page::Numbered { page, size } => Some((*size as i64, ((*page as i64) - 1) * (*size as i64))),
		}
	}
}

/// A conversation plus one page of its ordered messages.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
	pub conversation: Conversation,
	pub messages: Vec<StoredMessage>,
}

/// The unordered participant pair key that makes direct conversations unique.
fn direct_pair_key(a: UserId, b: UserId) -> String {
	let (lo, hi) = if a.to_string() <= b.to_string() { (a, b) } else { (b, a) };
	format!("{lo}:{hi}")
}

/// Raw conversation columns before id parsing and participant hydration.
type ConversationColumns = (String, String, Option<String>, Option<String>, Option<String>, String);

/// Raw message columns.
type MessageColumns = (String, String, String, i64);

/// Store over the `conversations`, `conversation_participants` and `messages`
/// tables.
#[derive(Clone)]
pub struct ChatStore {
	backend: ChatBackend,
}

#[derive(Clone)]
enum ChatBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

const CONVERSATION_COLS: &str = "c.id, c.kind, c.group_name, c.group_image, c.room_id, c.created_by";

impl ChatStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = crate::server::store::sqlite_pool(database_url).await?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Self {
				backend: ChatBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self {
				backend: ChatBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	/// Build a store over an already-connected sqlite pool (tests).
	pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
		Self {
			backend: ChatBackend::Sqlite(pool),
		}
	}

	/// Find the direct conversation for an unordered pair, creating it if
	/// absent. The UNIQUE `pair_key` makes creation idempotent: a race
	/// resolves to the row the other writer inserted.
	pub async fn find_or_create_direct(&self, a: UserId, b: UserId) -> Result<Conversation, ApiError> {
		if let Some(existing) = self.find_direct(a, b).await? {
			return Ok(existing);
		}

		let pair_key = direct_pair_key(a, b);
		let id = GroupId::new_v4();
		let now = unix_ms_now();

		match &self.backend {
			ChatBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO conversations (id, kind, pair_key, created_by, created_at) VALUES (?, ?, ?, ?, ?) \
					ON CONFLICT(pair_key) DO NOTHING",
				)
				.bind(id.to_string())
				.bind(ConversationKind::Direct.as_str())
				.bind(&pair_key)
				.bind(a.to_string())
				.bind(now)
				.execute(pool)
				.await
				.map_err(ApiError::upstream)?;
			}
			ChatBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO conversations (id, kind, pair_key, created_by, created_at) VALUES ($1, $2, $3, $4, $5) \
					ON CONFLICT (pair_key) DO NOTHING",
				)
				.bind(id.to_string())
				.bind(ConversationKind::Direct.as_str())
				.bind(&pair_key)
				.bind(a.to_string())
				.bind(now)
				.execute(pool)
				.await
				.map_err(ApiError::upstream)?;
			}
		}

		// Re-read so a lost race still lands on the surviving row.
		let conversation = self
			.find_direct(a, b)
			.await?
			.ok_or_else(|| ApiError::upstream("direct conversation missing after insert"))?;

		self.insert_participants(conversation.id, &[a, b]).await?;

		let participants = self.participants_of(conversation.id).await?;
		Ok(Conversation {
			participants,
			..conversation
		})
	}

	/// Look up the direct conversation for an unordered pair.
	pub async fn find_direct(&self, a: UserId, b: UserId) -> Result<Option<Conversation>, ApiError> {
		let pair_key = direct_pair_key(a, b);
		let sql_sqlite =
			format!("SELECT {CONVERSATION_COLS} FROM conversations c WHERE c.pair_key = ?");
		let sql_pg = format!("SELECT {CONVERSATION_COLS} FROM conversations c WHERE c.pair_key = $1");

		let row: Option<ConversationColumns> = match &self.backend {
			ChatBackend::Sqlite(pool) => sqlx::query_as(&sql_sqlite)
				.bind(&pair_key)
				.fetch_optional(pool)
				.await
				.map_err(ApiError::upstream)?,
			ChatBackend::Postgres(pool) => sqlx::query_as(&sql_pg)
				.bind(&pair_key)
				.fetch_optional(pool)
				.await
				.map_err(ApiError::upstream)?,
		};

		match row {
			Some(cols) => Ok(Some(self.hydrate_conversation(cols).await?)),
			None => Ok(None),
		}
	}

	/// Create a group conversation with an explicit participant list. The
	/// creator is always included.
	pub async fn create_group(
		&self,
		name: &str,
		room_id: &RoomId,
		group_image: Option<&str>,
		created_by: UserId,
		participants: &[UserId],
	) -> Result<Conversation, ApiError> {
		let id = GroupId::new_v4();
		let now = unix_ms_now();

		let result = match &self.backend {
			ChatBackend::Sqlite(pool) => sqlx::query(
				"INSERT INTO conversations (id, kind, group_name, group_image, room_id, created_by, created_at) \
				VALUES (?, ?, ?, ?, ?, ?, ?)",
			)
			.bind(id.to_string())
			.bind(ConversationKind::Group.as_str())
			.bind(name)
			.bind(group_image)
			.bind(room_id.as_str())
			.bind(created_by.to_string())
			.bind(now)
			.execute(pool)
			.await,
			ChatBackend::Postgres(pool) => sqlx::query(
				"INSERT INTO conversations (id, kind, group_name, group_image, room_id, created_by, created_at) \
				VALUES ($1, $2, $3, $4, $5, $6, $7)",
			)
			.bind(id.to_string())
			.bind(ConversationKind::Group.as_str())
			.bind(name)
			.bind(group_image)
			.bind(room_id.as_str())
			.bind(created_by.to_string())
			.bind(now)
			.execute(pool)
			.await,
		};

		match result {
			Ok(_) => {}
			Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
				return Err(ApiError::conflict("room id already exists"));
			}
			Err(e) => return Err(ApiError::upstream(e)),
		}

		let mut members: Vec<UserId> = Vec::with_capacity(participants.len() + 1);
		members.push(created_by);
		for p in participants {
			if !members.contains(p) {
				members.push(*p);
			}
		}

		self.insert_participants(id, &members).await?;

		Ok(Conversation {
			id,
			kind: ConversationKind::Group,
			group_name: Some(name.to_string()),
			group_image: group_image.map(str::to_string),
			room_id: Some(room_id.clone()),
			created_by,
			participants: members,
		})
	}

	/// Look up a group by id, visible only to its participants.
	pub async fn find_group(&self, group: GroupId, member: UserId) -> Result<Option<Conversation>, ApiError> {
		let sql_sqlite = format!(
			"SELECT {CONVERSATION_COLS} FROM conversations c \
			JOIN conversation_participants p ON p.conversation_id = c.id \
			WHERE c.id = ? AND c.kind = 'group' AND p.user_id = ?"
		);
		let sql_pg = format!(
			"SELECT {CONVERSATION_COLS} FROM conversations c \
			JOIN conversation_participants p ON p.conversation_id = c.id \
			WHERE c.id = $1 AND c.kind = 'group' AND p.user_id = $2"
		);

		let row: Option<ConversationColumns> = match &self.backend {
			ChatBackend::Sqlite(pool) => sqlx::query_as(&sql_sqlite)
				.bind(group.to_string())
				.bind(member.to_string())
				.fetch_optional(pool)
				.await
				.map_err(ApiError::upstream)?,
			ChatBackend::Postgres(pool) => sqlx::query_as(&sql_pg)
				.bind(group.to_string())
				.bind(member.to_string())
				.fetch_optional(pool)
				.await
				.map_err(ApiError::upstream)?,
		};

		match row {
			Some(cols) => Ok(Some(self.hydrate_conversation(cols).await?)),
			None => Ok(None),
		}
	}

	/// Look up a group by room id, visible only to its participants.
	pub async fn find_group_by_room(&self, room: &RoomId, member: UserId) -> Result<Option<Conversation>, ApiError> {
		let sql_sqlite = format!(
			"SELECT {CONVERSATION_COLS} FROM conversations c \
			JOIN conversation_participants p ON p.conversation_id = c.id \
			WHERE c.room_id = ? AND c.kind = 'group' AND p.user_id = ?"
		);
		let sql_pg = format!(
			"SELECT {CONVERSATION_COLS} FROM conversations c \
			JOIN conversation_participants p ON p.conversation_id = c.id \
			WHERE c.room_id = $1 AND c.kind = 'group' AND p.user_id = $2"
		);

		let row: Option<ConversationColumns> = match &self.backend {
			ChatBackend::Sqlite(pool) => sqlx::query_as(&sql_sqlite)
				.bind(room.as_str())
				.bind(member.to_string())
				.fetch_optional(pool)
				.await
				.map_err(ApiError::upstream)?,
			ChatBackend::Postgres(pool) => sqlx::query_as(&sql_pg)
				.bind(room.as_str())
				.bind(member.to_string())
				.fetch_optional(pool)
				.await
				.map_err(ApiError::upstream)?,
		};

		match row {
			Some(cols) => Ok(Some(self.hydrate_conversation(cols).await?)),
			None => Ok(None),
		}
	}

	/// Append one message. Messages are never edited or removed here.
	pub async fn append_message(
		&self,
		conversation: GroupId,
		author: UserId,
		content: &str,
	) -> Result<StoredMessage, ApiError> {
		let id = uuid::Uuid::new_v4();
		let now = unix_ms_now();

		match &self.backend {
			ChatBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, conversation_id, author_id, content, created_at) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(id.to_string())
				.bind(conversation.to_string())
				.bind(author.to_string())
				.bind(content)
				.bind(now)
				.execute(pool)
				.await
				.map_err(ApiError::upstream)?;
			}
			ChatBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, conversation_id, author_id, content, created_at) VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(id.to_string())
				.bind(conversation.to_string())
				.bind(author.to_string())
				.bind(content)
				.bind(now)
				.execute(pool)
				.await
				.map_err(ApiError::upstream)?;
			}
		}

		Ok(StoredMessage {
			id,
			author,
			content: content.to_string(),
			created_at: now,
		})
	}

	/// One page of the direct conversation between an unordered pair, `None`
	/// if no conversation exists yet.
	pub async fn direct_history(&self, a: UserId, b: UserId, page: Page) -> Result<Option<ConversationHistory>, ApiError> {
		let Some(conversation) = self.find_direct(a, b).await? else {
			return Ok(None);
		};

		let messages = self.messages_page(conversation.id, page).await?;
		Ok(Some(ConversationHistory { conversation, messages }))
	}

	/// One page of a group's history, visible only to participants.
	pub async fn group_history(
		&self,
		group: GroupId,
		member: UserId,
		page: Page,
	) -> Result<Option<ConversationHistory>, ApiError> {
		let Some(conversation) = self.find_group(group, member).await? else {
			return Ok(None);
		};

		let messages = self.messages_page(conversation.id, page).await?;
		Ok(Some(ConversationHistory { conversation, messages }))
	}

	async fn messages_page(&self, conversation: GroupId, page: Page) -> Result<Vec<StoredMessage>, ApiError> {
		let rows: Vec<MessageColumns> = match (&self.backend, page.limit_offset()) {
			(ChatBackend::Sqlite(pool), None) => sqlx::query_as(
				"SELECT id, author_id, content, created_at FROM messages WHERE conversation_id = ? ORDER BY seq ASC",
			)
			.bind(conversation.to_string())
			.fetch_all(pool)
			.await
			.map_err(ApiError::upstream)?,
			(ChatBackend::Sqlite(pool), Some((limit, offset))) => sqlx::query_as(
				"SELECT id, author_id, content, created_at FROM messages WHERE conversation_id = ? \
				ORDER BY seq ASC LIMIT ? OFFSET ?",
			)
			.bind(conversation.to_string())
			.bind(limit)
			.bind(offset)
			.fetch_all(pool)
			.await
			.map_err(ApiError::upstream)?,
			(ChatBackend::Postgres(pool), None) => sqlx::query_as(
				"SELECT id, author_id, content, created_at FROM messages WHERE conversation_id = $1 ORDER BY seq ASC",
			)
			.bind(conversation.to_string())
			.fetch_all(pool)
			.await
			.map_err(ApiError::upstream)?,
			(ChatBackend::Postgres(pool), Some((limit, offset))) => sqlx::query_as(
				"SELECT id, author_id, content, created_at FROM messages WHERE conversation_id = $1 \
				ORDER BY seq ASC LIMIT $2 OFFSET $3",
			)
			.bind(conversation.to_string())
			.bind(limit)
			.bind(offset)
			.fetch_all(pool)
			.await
			.map_err(ApiError::upstream)?,
		};

		rows.into_iter()
			.map(|(id, author, content, created_at)| {
				Ok(StoredMessage {
					id: uuid::Uuid::parse_str(&id).map_err(ApiError::upstream)?,
					author: UserId::parse(&author).map_err(ApiError::upstream)?,
					content,
					created_at,
				})
			})
			.collect()
	}

	async fn insert_participants(&self, conversation: GroupId, users: &[UserId]) -> Result<(), ApiError> {
		for user in users {
			match &self.backend {
				ChatBackend::Sqlite(pool) => {
					sqlx::query(
						"INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?, ?) \
						ON CONFLICT(conversation_id, user_id) DO NOTHING",
					)
					.bind(conversation.to_string())
					.bind(user.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
				}
				ChatBackend::Postgres(pool) => {
					sqlx::query(
						"INSERT INTO conversation_participants (conversation_id, user_id) VALUES ($1, $2) \
						ON CONFLICT (conversation_id, user_id) DO NOTHING",
					)
					.bind(conversation.to_string())
					.bind(user.to_string())
					.execute(pool)
					.await
					.map_err(ApiError::upstream)?;
				}
			}
		}
		Ok(())
	}

	async fn participants_of(&self, conversation: GroupId) -> Result<Vec<UserId>, ApiError> {
		let rows: Vec<(String,)> = match &self.backend {
			ChatBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id FROM conversation_participants WHERE conversation_id = ?")
					.bind(conversation.to_string())
					.fetch_all(pool)
					.await
					.map_err(ApiError::upstream)?
			}
			ChatBackend::Postgres(pool) => {
				sqlx::query_as("SELECT user_id FROM conversation_participants WHERE conversation_id = $1")
					.bind(conversation.to_string())
					.fetch_all(pool)
					.await
					.map_err(ApiError::upstream)?
			}
		};

		rows.into_iter()
			.map(|(id,)| UserId::parse(&id).map_err(ApiError::upstream))
			.collect()
	}

	async fn hydrate_conversation(&self, cols: ConversationColumns) -> Result<Conversation, ApiError> {
		let (id, kind, group_name, group_image, room_id, created_by) = cols;

		let id = GroupId::parse(&id).map_err(ApiError::upstream)?;
		let kind = match kind.as_str() {
			"group" => ConversationKind::Group,
			_ => ConversationKind::Direct,
		};
		let room_id = room_id.map(RoomId::new).transpose().map_err(ApiError::upstream)?;
		let created_by = UserId::parse(&created_by).map_err(ApiError::upstream)?;

		let participants = self.participants_of(id).await?;

		Ok(Conversation {
			id,
			kind,
			group_name,
			group_image,
			room_id,
			created_by,
			participants,
		})
	}
}
