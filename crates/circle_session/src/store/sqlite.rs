#![forbid(unsafe_code)]

use anyhow::{Context as _, anyhow};
use circle_domain::{ClientId, Message, MessageId, ProfileSummary, Reaction, RoomId, UserId};
use sqlx::SqlitePool;

use super::{MessagePatch, MessageStore, Room, StoreError};
use crate::util::time;

/// Sqlite-backed [`MessageStore`].
#[derive(Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

type MessageRow = (
	i64,
	Option<String>,
	String,
	String,
	String,
	String,
	Option<String>,
	bool,
	bool,
	Option<i64>,
	Option<String>,
);

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, recipient_id, content, timestamp, client_id, deleted, edited, reply_to, reactions";

impl SqliteStore {
	/// Connect and run migrations.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (expected sqlite:)"));
		}

		let pool = SqlitePool::connect(database_url).await.context("connect sqlite")?;
		sqlx::migrate!("./migrations").run(&pool).await.context("run migrations")?;

		Ok(Self { pool })
	}

	/// Insert or replace a profile row.
	pub async fn upsert_profile(
		&self,
		user: &UserId,
		first_name: Option<&str>,
		last_name: Option<&str>,
		profile_picture: Option<&str>,
		age: Option<u32>,
		location: Option<&str>,
		gender: Option<&str>,
	) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO user_profiles (user_id, first_name, last_name, profile_picture, age, location, gender) \
			VALUES (?, ?, ?, ?, ?, ?, ?) \
			ON CONFLICT(user_id) DO UPDATE SET \
				first_name = excluded.first_name, last_name = excluded.last_name, \
				profile_picture = excluded.profile_picture, age = excluded.age, \
				location = excluded.location, gender = excluded.gender",
		)
		.bind(user.as_str())
		.bind(first_name)
		.bind(last_name)
		.bind(profile_picture)
		.bind(age.map(|a| a as i64))
		.bind(location)
		.bind(gender)
		.execute(&self.pool)
		.await
		.context("upsert user_profiles")?;

		Ok(())
	}
}

#[async_trait::async_trait]
impl MessageStore for SqliteStore {
	async fn find_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
		let row: Option<(String, String, String)> =
			sqlx::query_as("SELECT room_identifier, user_a, user_b FROM chat_rooms WHERE room_identifier = ?")
				.bind(id.as_str())
				.fetch_optional(&self.pool)
				.await
				.context("select chat_rooms")?;

		match row {
			Some((identifier, a, b)) => Ok(Some(decode_room(&identifier, &a, &b)?)),
			None => Ok(None),
		}
	}

	async fn create_room(&self, id: &RoomId, a: &UserId, b: &UserId) -> Result<Room, StoreError> {
		// The unique constraint on room_identifier arbitrates concurrent
		// first contact; a losing insert rereads the winning row.
		let result = sqlx::query(
			"INSERT INTO chat_rooms (room_identifier, user_a, user_b) VALUES (?, ?, ?) \
			ON CONFLICT(room_identifier) DO NOTHING",
		)
		.bind(id.as_str())
		.bind(a.as_str())
		.bind(b.as_str())
		.execute(&self.pool)
		.await
		.context("insert chat_rooms")?;

		if result.rows_affected() == 0 {
			return self.find_room(id).await?.ok_or(StoreError::NotFound);
		}

		Ok(Room {
			identifier: id.clone(),
			user_a: a.clone(),
			user_b: b.clone(),
		})
	}

	async fn insert_message(&self, msg: &Message) -> Result<Message, StoreError> {
		let reactions = encode_reactions(&msg.reactions)?;

		let result = sqlx::query(
			"INSERT INTO messages (room_id, sender_id, recipient_id, content, timestamp, client_id, deleted, edited, reply_to, reactions) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(msg.room.as_str())
		.bind(msg.sender.as_str())
		.bind(msg.recipient.as_str())
		.bind(&msg.content)
		.bind(time::encode_ts(msg.timestamp))
		.bind(msg.client_id.as_ref().map(|c| c.as_str()))
		.bind(msg.deleted)
		.bind(msg.edited)
		.bind(msg.reply_to.map(|r| r.0))
		.bind(reactions)
		.execute(&self.pool)
		.await
		.context("insert message")?;

		let mut persisted = msg.clone();
		persisted.id = Some(MessageId(result.last_insert_rowid()));
		Ok(persisted)
	}

	async fn update_message(&self, id: MessageId, patch: MessagePatch) -> Result<(), StoreError> {
		let reactions = match &patch.reactions {
			Some(r) => Some(encode_reactions(r)?),
			None => None,
		};

		let result = sqlx::query(
			"UPDATE messages SET \
				content = COALESCE(?, content), \
				deleted = COALESCE(?, deleted), \
				edited = COALESCE(?, edited), \
				reactions = COALESCE(?, reactions) \
			WHERE id = ?",
		)
		.bind(patch.content)
		.bind(patch.deleted)
		.bind(patch.edited)
		.bind(reactions)
		.bind(id.0)
		.execute(&self.pool)
		.await
		.context("update message")?;

		if result.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn messages_for_user(&self, user: &UserId) -> Result<Vec<Message>, StoreError> {
		let rows: Vec<MessageRow> = sqlx::query_as(&format!(
			"SELECT {MESSAGE_COLUMNS} FROM messages WHERE sender_id = ?1 OR recipient_id = ?1 ORDER BY timestamp ASC, id ASC"
		))
		.bind(user.as_str())
		.fetch_all(&self.pool)
		.await
		.context("select messages for user")?;

		rows.into_iter().map(decode_message).collect()
	}

	async fn messages_for_room(&self, room: &RoomId) -> Result<Vec<Message>, StoreError> {
		let rows: Vec<MessageRow> = sqlx::query_as(&format!(
			"SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ? ORDER BY timestamp ASC, id ASC"
		))
		.bind(room.as_str())
		.fetch_all(&self.pool)
		.await
		.context("select messages for room")?;

		rows.into_iter().map(decode_message).collect()
	}

	async fn profile_summary(&self, user: &UserId) -> Result<Option<ProfileSummary>, StoreError> {
		let row: Option<(
			Option<String>,
			Option<String>,
			Option<String>,
			Option<i64>,
			Option<String>,
			Option<String>,
		)> = sqlx::query_as(
			"SELECT first_name, last_name, profile_picture, age, location, gender FROM user_profiles WHERE user_id = ?",
		)
		.bind(user.as_str())
		.fetch_optional(&self.pool)
		.await
		.context("select user_profiles")?;

		let Some((first, last, picture, age, location, gender)) = row else {
			return Ok(None);
		};

		let display_name = assemble_display_name(first.as_deref(), last.as_deref(), user);
		let avatar = picture
			.filter(|p| !p.trim().is_empty())
			.unwrap_or_else(|| ProfileSummary::generated_avatar(&display_name));

		Ok(Some(ProfileSummary {
			display_name,
			avatar,
			age: age.and_then(|a| u32::try_from(a).ok()),
			location: location.filter(|s| !s.trim().is_empty()),
			gender: gender.filter(|s| !s.trim().is_empty()),
		}))
	}
}

fn assemble_display_name(first: Option<&str>, last: Option<&str>, user: &UserId) -> String {
	let name = format!("{} {}", first.unwrap_or(""), last.unwrap_or(""));
	let name = name.trim();
	if name.is_empty() {
		format!("User {}", user.short_tag())
	} else {
		name.to_string()
	}
}

fn encode_reactions(reactions: &[Reaction]) -> Result<Option<String>, StoreError> {
	if reactions.is_empty() {
		return Ok(None);
	}
	let json = serde_json::to_string(reactions).context("encode reactions")?;
	Ok(Some(json))
}

fn decode_room(identifier: &str, a: &str, b: &str) -> Result<Room, StoreError> {
	Ok(Room {
		identifier: identifier.parse().map_err(|e| anyhow!("room_identifier: {e}"))?,
		user_a: a.parse().map_err(|e| anyhow!("user_a: {e}"))?,
		user_b: b.parse().map_err(|e| anyhow!("user_b: {e}"))?,
	})
}

fn decode_message(row: MessageRow) -> Result<Message, StoreError> {
	let (id, room_id, sender, recipient, content, ts, client_id, deleted, edited, reply_to, reactions) = row;

	let sender: UserId = sender.parse().map_err(|e| anyhow!("sender_id: {e}"))?;
	let recipient: UserId = recipient.parse().map_err(|e| anyhow!("recipient_id: {e}"))?;

	// Legacy rows predate the room_id column; derive the id from the pair.
	let room = match room_id.filter(|r| !r.trim().is_empty()) {
		Some(r) => r.parse().map_err(|e| anyhow!("room_id: {e}"))?,
		None => RoomId::for_pair(&sender, &recipient),
	};

	let timestamp = time::decode_ts(&ts).ok_or_else(|| anyhow!("invalid timestamp: {ts}"))?;

	let client_id = match client_id.filter(|c| !c.trim().is_empty()) {
		Some(c) => Some(ClientId::new(c).map_err(|e| anyhow!("client_id: {e}"))?),
		None => None,
	};

	let reactions = match reactions.filter(|r| !r.trim().is_empty()) {
		Some(json) => serde_json::from_str(&json).context("decode reactions")?,
		None => Vec::new(),
	};

	Ok(Message {
		id: Some(MessageId(id)),
		room,
		sender,
		recipient,
		content,
		timestamp,
		client_id,
		deleted,
		edited,
		reply_to: reply_to.map(MessageId),
		reactions,
	})
}
