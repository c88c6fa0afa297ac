#![forbid(unsafe_code)]

use std::collections::HashMap;

use circle_domain::{Message, MessageId, ProfileSummary, RoomId, UserId};
use tokio::sync::Mutex;

use super::{MessagePatch, MessageStore, Room, StoreError, apply_patch};

/// In-memory [`MessageStore`] for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
	rooms: HashMap<RoomId, Room>,
	messages: Vec<Message>,
	next_id: i64,
	profiles: HashMap<UserId, ProfileSummary>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed a profile row.
	pub async fn put_profile(&self, user: UserId, profile: ProfileSummary) {
		let mut st = self.inner.lock().await;
		st.profiles.insert(user, profile);
	}

	/// Snapshot of all persisted messages, insertion order.
	pub async fn all_messages(&self) -> Vec<Message> {
		self.inner.lock().await.messages.clone()
	}
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
	async fn find_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
		let st = self.inner.lock().await;
		Ok(st.rooms.get(id).cloned())
	}

	async fn create_room(&self, id: &RoomId, a: &UserId, b: &UserId) -> Result<Room, StoreError> {
		let mut st = self.inner.lock().await;
		if st.rooms.contains_key(id) {
			return Err(StoreError::Conflict);
		}

		let room = Room {
			identifier: id.clone(),
			user_a: a.clone(),
			user_b: b.clone(),
		};
		st.rooms.insert(id.clone(), room.clone());
		Ok(room)
	}

	async fn insert_message(&self, msg: &Message) -> Result<Message, StoreError> {
		let mut st = self.inner.lock().await;
		st.next_id += 1;

		let mut persisted = msg.clone();
		persisted.id = Some(MessageId(st.next_id));
		st.messages.push(persisted.clone());
		Ok(persisted)
	}

	async fn update_message(&self, id: MessageId, patch: MessagePatch) -> Result<(), StoreError> {
		let mut st = self.inner.lock().await;
		let Some(msg) = st.messages.iter_mut().find(|m| m.id == Some(id)) else {
			return Err(StoreError::NotFound);
		};
		apply_patch(msg, &patch);
		Ok(())
	}

	async fn messages_for_user(&self, user: &UserId) -> Result<Vec<Message>, StoreError> {
		let st = self.inner.lock().await;
		let mut out: Vec<Message> = st
			.messages
			.iter()
			.filter(|m| &m.sender == user || &m.recipient == user)
			.cloned()
			.collect();
		out.sort_by_key(|m| m.timestamp);
		Ok(out)
	}

	async fn messages_for_room(&self, room: &RoomId) -> Result<Vec<Message>, StoreError> {
		let st = self.inner.lock().await;
		let mut out: Vec<Message> = st.messages.iter().filter(|m| &m.room == room).cloned().collect();
		out.sort_by_key(|m| m.timestamp);
		Ok(out)
	}

	async fn profile_summary(&self, user: &UserId) -> Result<Option<ProfileSummary>, StoreError> {
		let st = self.inner.lock().await;
		Ok(st.profiles.get(user).cloned())
	}
}
