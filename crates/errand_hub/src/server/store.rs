#![forbid(unsafe_code)]

use async_trait::async_trait;
use errand_domain::{IdentityId, Role, RoomId};
use errand_protocol::OutboundEnvelope;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("unsupported database_url scheme: {0}")]
	UnsupportedUrl(String),

	#[error("{context}: {source}")]
	Database {
		context: &'static str,
		#[source]
		source: sqlx::Error,
	},
}

/// One chat message as written to the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub room: RoomId,
	pub sender_id: IdentityId,
	pub sender_role: Role,
	pub body: String,
	pub created_at_ms: i64,
}

impl StoredMessage {
	/// Build from a stamped chat envelope. `None` when it has no room or text.
	pub fn from_envelope(env: &OutboundEnvelope) -> Option<Self> {
		Some(Self {
			room: env.room?,
			sender_id: env.sender.id.clone(),
			sender_role: env.sender.role,
			body: env.message.clone()?,
			created_at_ms: env.timestamp,
		})
	}

	/// Legacy integer key for the `room_id` column, when the room has one that fits.
	fn legacy_key(&self) -> Option<i64> {
		self.room.legacy_id().and_then(|n| i64::try_from(n).ok())
	}
}

#[async_trait]
pub trait MessageStore: Send + Sync {
	async fn persist(&self, msg: &StoredMessage) -> Result<(), StoreError>;
}

/// Store used when persistence is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledStore;

#[async_trait]
impl MessageStore for DisabledStore {
	async fn persist(&self, _msg: &StoredMessage) -> Result<(), StoreError> {
		Ok(())
	}
}

#[derive(Clone)]
pub struct SqlMessageStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

fn db(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
	move |source| StoreError::Database { context, source }
}

impl SqlMessageStore {
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		let backend = if database_url.starts_with("sqlite:") {
			// Every connection to an in-memory sqlite database sees a different database.
			let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
			let pool = sqlx::sqlite::SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.map_err(db("connect sqlite"))?;
			SqlBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.map_err(db("connect postgres"))?;
			SqlBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.map_err(db("connect mysql"))?;
			SqlBackend::Mysql(pool)
		} else {
			let scheme = database_url.split(':').next().unwrap_or_default().to_string();
			return Err(StoreError::UnsupportedUrl(scheme));
		};

		let store = Self { backend };
		store.ensure_schema().await?;
		Ok(store)
	}

	async fn ensure_schema(&self) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS chat_messages (\
					id INTEGER PRIMARY KEY AUTOINCREMENT, \
					room_id INTEGER NULL, \
					room_key TEXT NOT NULL, \
					sender_id TEXT NOT NULL, \
					sender_role TEXT NOT NULL, \
					body TEXT NOT NULL, \
					created_at_ms INTEGER NOT NULL)",
				)
				.execute(pool)
				.await
				.map_err(db("create chat_messages (sqlite)"))?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS chat_messages (\
					id BIGSERIAL PRIMARY KEY, \
					room_id BIGINT NULL, \
					room_key TEXT NOT NULL, \
					sender_id TEXT NOT NULL, \
					sender_role TEXT NOT NULL, \
					body TEXT NOT NULL, \
					created_at_ms BIGINT NOT NULL)",
				)
				.execute(pool)
				.await
				.map_err(db("create chat_messages (postgres)"))?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS chat_messages (\
					id BIGINT AUTO_INCREMENT PRIMARY KEY, \
					room_id BIGINT NULL, \
					room_key VARCHAR(36) NOT NULL, \
					sender_id VARCHAR(255) NOT NULL, \
					sender_role VARCHAR(16) NOT NULL, \
					body TEXT NOT NULL, \
					created_at_ms BIGINT NOT NULL)",
				)
				.execute(pool)
				.await
				.map_err(db("create chat_messages (mysql)"))?;
			}
		}

		info!("message store: schema ready");
		Ok(())
	}

	#[cfg(test)]
	pub(crate) async fn count_for_room(&self, room: &RoomId) -> Result<i64, StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chat_messages WHERE room_key = ?")
					.bind(room.to_string())
					.fetch_one(pool)
					.await
					.map_err(db("count chat_messages (sqlite)"))?;
				Ok(row.0)
			}
			_ => Ok(0),
		}
	}
}

#[async_trait]
impl MessageStore for SqlMessageStore {
	async fn persist(&self, msg: &StoredMessage) -> Result<(), StoreError> {
		let room_key = msg.room.to_string();
		let legacy = msg.legacy_key();

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO chat_messages (room_id, room_key, sender_id, sender_role, body, created_at_ms) \
					VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(legacy)
				.bind(&room_key)
				.bind(msg.sender_id.as_str())
				.bind(msg.sender_role.as_str())
				.bind(&msg.body)
				.bind(msg.created_at_ms)
				.execute(pool)
				.await
				.map_err(db("insert chat_messages (sqlite)"))?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO chat_messages (room_id, room_key, sender_id, sender_role, body, created_at_ms) \
					VALUES ($1, $2, $3, $4, $5, $6)",
				)
				.bind(legacy)
				.bind(&room_key)
				.bind(msg.sender_id.as_str())
				.bind(msg.sender_role.as_str())
				.bind(&msg.body)
				.bind(msg.created_at_ms)
				.execute(pool)
				.await
				.map_err(db("insert chat_messages (postgres)"))?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO chat_messages (room_id, room_key, sender_id, sender_role, body, created_at_ms) \
					VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(legacy)
				.bind(&room_key)
				.bind(msg.sender_id.as_str())
				.bind(msg.sender_role.as_str())
				.bind(&msg.body)
				.bind(msg.created_at_ms)
				.execute(pool)
				.await
				.map_err(db("insert chat_messages (mysql)"))?;
			}
		}

		Ok(())
	}
}

/// In-memory store for tests; can be switched into a failing mode.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
	messages: std::sync::Mutex<Vec<StoredMessage>>,
	fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryStore {
	pub(crate) fn failing() -> Self {
		let store = Self::default();
		store.fail.store(true, std::sync::atomic::Ordering::Relaxed);
		store
	}

	pub(crate) fn messages(&self) -> Vec<StoredMessage> {
		self.messages.lock().unwrap().clone()
	}
}

#[cfg(test)]
#[async_trait]
impl MessageStore for MemoryStore {
	async fn persist(&self, msg: &StoredMessage) -> Result<(), StoreError> {
		if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
			return Err(StoreError::Database {
				context: "memory store",
				source: sqlx::Error::PoolClosed,
			});
		}
		self.messages.lock().unwrap().push(msg.clone());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use errand_domain::{RoomRef, WellKnownRoom, normalize};

	fn message(room: RoomId, body: &str) -> StoredMessage {
		StoredMessage {
			room,
			sender_id: IdentityId::new("cust-1").unwrap(),
			sender_role: Role::Customer,
			body: body.to_string(),
			created_at_ms: 1_700_000_000_000,
		}
	}

	#[tokio::test]
	async fn sqlite_store_persists_rows() {
		let store = SqlMessageStore::connect("sqlite::memory:").await.expect("connect");

		let support = WellKnownRoom::SupportChat.room_id();
		let labelled = normalize(&RoomRef::Label("late delivery".to_string())).unwrap();

		store.persist(&message(support, "hello")).await.unwrap();
		store.persist(&message(support, "again")).await.unwrap();
		store.persist(&message(labelled, "label room")).await.unwrap();

		assert_eq!(store.count_for_room(&support).await.unwrap(), 2);
		assert_eq!(store.count_for_room(&labelled).await.unwrap(), 1);
	}

	#[tokio::test]
	async fn unsupported_scheme_is_rejected() {
		let err = SqlMessageStore::connect("redis://localhost").await.err().expect("error");
		assert!(matches!(err, StoreError::UnsupportedUrl(ref s) if s == "redis"), "{err}");
	}

	#[test]
	fn legacy_key_only_for_legacy_rooms() {
		let support = WellKnownRoom::SupportChat.room_id();
		assert_eq!(message(support, "x").legacy_key(), Some(1));

		let labelled = normalize(&RoomRef::Label("x".to_string())).unwrap();
		assert_eq!(message(labelled, "x").legacy_key(), None);

		let huge = normalize(&RoomRef::Legacy(u64::MAX)).unwrap();
		assert_eq!(message(huge, "x").legacy_key(), None);
	}
}
