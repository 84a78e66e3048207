#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parley_domain::{ChannelId, ConversationId, UserId};

/// Read path into the persisted membership tables, used to gate room
/// joins, plus the presence side-effect write on the user entity.
///
/// Results are never cached here: membership can change between
/// requests, so every join re-checks authorization.
#[async_trait]
pub trait Directory: Send + Sync {
	async fn is_channel_member(&self, user: &UserId, channel: &ChannelId) -> anyhow::Result<bool>;

	async fn is_conversation_member(&self, user: &UserId, conversation: &ConversationId) -> anyhow::Result<bool>;

	/// Persist the aggregate online flag and last-seen timestamp (Unix
	/// milliseconds) on the external user entity.
	async fn update_user_presence(&self, user: &UserId, is_online: bool, last_seen_ms: i64) -> anyhow::Result<()>;
}

/// sqlx-backed directory over the external relational schema.
#[derive(Clone)]
pub struct SqlDirectory {
	backend: Option<DirectoryBackend>,
}

#[derive(Clone)]
enum DirectoryBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlDirectory {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			Ok(Self {
				backend: Some(DirectoryBackend::Sqlite(pool)),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			Ok(Self {
				backend: Some(DirectoryBackend::Postgres(pool)),
			})
		} else {
			Err(anyhow!("unsupported database_url for membership directory"))
		}
	}

	/// Directory with no backing store: every membership check denies and
	/// presence writes are skipped.
	pub fn disabled() -> Self {
		Self { backend: None }
	}
}

#[async_trait]
impl Directory for SqlDirectory {
	async fn is_channel_member(&self, user: &UserId, channel: &ChannelId) -> anyhow::Result<bool> {
		let Some(backend) = &self.backend else {
			return Ok(false);
		};

		let found = match backend {
			DirectoryBackend::Sqlite(pool) => {
				sqlx::query("SELECT 1 FROM channel_members WHERE channel_id = ? AND user_id = ? LIMIT 1")
					.bind(channel.as_str())
					.bind(user.as_str())
					.fetch_optional(pool)
					.await
					.context("query channel_members (sqlite)")?
					.is_some()
			}
			DirectoryBackend::Postgres(pool) => {
				sqlx::query("SELECT 1 FROM channel_members WHERE channel_id = $1 AND user_id = $2 LIMIT 1")
					.bind(channel.as_str())
					.bind(user.as_str())
					.fetch_optional(pool)
					.await
					.context("query channel_members (postgres)")?
					.is_some()
			}
		};

		Ok(found)
	}

	async fn is_conversation_member(&self, user: &UserId, conversation: &ConversationId) -> anyhow::Result<bool> {
		let Some(backend) = &self.backend else {
			return Ok(false);
		};

		let found = match backend {
			DirectoryBackend::Sqlite(pool) => {
				sqlx::query("SELECT 1 FROM conversation_members WHERE conversation_id = ? AND user_id = ? LIMIT 1")
					.bind(conversation.as_str())
					.bind(user.as_str())
					.fetch_optional(pool)
					.await
					.context("query conversation_members (sqlite)")?
					.is_some()
			}
			DirectoryBackend::Postgres(pool) => {
				sqlx::query("SELECT 1 FROM conversation_members WHERE conversation_id = $1 AND user_id = $2 LIMIT 1")
					.bind(conversation.as_str())
					.bind(user.as_str())
					.fetch_optional(pool)
					.await
					.context("query conversation_members (postgres)")?
					.is_some()
			}
		};

		Ok(found)
	}

	async fn update_user_presence(&self, user: &UserId, is_online: bool, last_seen_ms: i64) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		match backend {
			DirectoryBackend::Sqlite(pool) => {
				sqlx::query("UPDATE users SET is_online = ?, last_seen_at = ? WHERE id = ?")
					.bind(is_online)
					.bind(last_seen_ms)
					.bind(user.as_str())
					.execute(pool)
					.await
					.context("update user presence (sqlite)")?;
			}
			DirectoryBackend::Postgres(pool) => {
				sqlx::query("UPDATE users SET is_online = $1, last_seen_at = $2 WHERE id = $3")
					.bind(is_online)
					.bind(last_seen_ms)
					.bind(user.as_str())
					.execute(pool)
					.await
					.context("update user presence (postgres)")?;
			}
		}

		Ok(())
	}
}
