#![forbid(unsafe_code)]

use circle_domain::{Message, MessageId, ProfileSummary, Reaction, RoomId, UserId};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A persisted two-party room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
	pub identifier: RoomId,
	pub user_a: UserId,
	pub user_b: UserId,
}

/// Store contract errors.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("record not found")]
	NotFound,

	/// Unique-identifier race lost; callers reread the winning row.
	#[error("unique identifier conflict")]
	Conflict,

	#[error(transparent)]
	Backend(#[from] anyhow::Error),
}

/// Partial update applied to a persisted message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
	pub content: Option<String>,
	pub deleted: Option<bool>,
	pub edited: Option<bool>,
	pub reactions: Option<Vec<Reaction>>,
}

impl MessagePatch {
	/// Soft-delete: content replaced by the deletion marker, row retained.
	pub fn tombstone() -> Self {
		Self {
			content: Some(circle_domain::DELETED_MARKER.to_string()),
			deleted: Some(true),
			..Self::default()
		}
	}

	pub fn edit(content: impl Into<String>) -> Self {
		Self {
			content: Some(content.into()),
			edited: Some(true),
			..Self::default()
		}
	}

	pub fn with_reactions(reactions: Vec<Reaction>) -> Self {
		Self {
			reactions: Some(reactions),
			..Self::default()
		}
	}
}

/// Durable persistence contract consumed by the session core.
///
/// Message sequences are ordered by timestamp ascending. Room creation is
/// idempotent under concurrent first contact: the identifier carries a
/// unique constraint and racing creators converge on the winning row (see
/// [`ensure_room`]).
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	async fn find_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError>;

	async fn create_room(&self, id: &RoomId, a: &UserId, b: &UserId) -> Result<Room, StoreError>;

	/// Persist a message and return it with the assigned id.
	async fn insert_message(&self, msg: &Message) -> Result<Message, StoreError>;

	async fn update_message(&self, id: MessageId, patch: MessagePatch) -> Result<(), StoreError>;

	async fn messages_for_user(&self, user: &UserId) -> Result<Vec<Message>, StoreError>;

	async fn messages_for_room(&self, room: &RoomId) -> Result<Vec<Message>, StoreError>;

	async fn profile_summary(&self, user: &UserId) -> Result<Option<ProfileSummary>, StoreError>;
}

/// Find-or-create a room, converging on the winner when two peers race the
/// first contact. A `Conflict` from `create_room` is resolved by rereading
/// the row that won; it is never surfaced to callers.
pub async fn ensure_room(store: &dyn MessageStore, id: &RoomId, a: &UserId, b: &UserId) -> Result<Room, StoreError> {
	if let Some(room) = store.find_room(id).await? {
		return Ok(room);
	}

	match store.create_room(id, a, b).await {
		Ok(room) => Ok(room),
		Err(StoreError::Conflict) => store.find_room(id).await?.ok_or(StoreError::NotFound),
		Err(e) => Err(e),
	}
}

/// Apply a patch to an in-memory message copy, mirroring what the store
/// backends persist.
pub(crate) fn apply_patch(msg: &mut Message, patch: &MessagePatch) {
	if let Some(content) = &patch.content {
		msg.content = content.clone();
	}
	if let Some(deleted) = patch.deleted {
		msg.deleted = deleted;
	}
	if let Some(edited) = patch.edited {
		msg.edited = edited;
	}
	if let Some(reactions) = &patch.reactions {
		msg.reactions = reactions.clone();
	}
}
