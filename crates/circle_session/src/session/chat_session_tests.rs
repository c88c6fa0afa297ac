use std::sync::Arc;
use std::time::Duration;

use circle_domain::{ClientId, DELETED_MARKER, MatchStatus, Message, RoomId, UserId};

use crate::channel::{DeliveryChannel, MatchCandidate, PushEvent};
use crate::config::SessionConfig;
use crate::session::chat_session::{CONNECTED_MESSAGE, ChatSession, SessionUpdate, spawn_pump};
use crate::session::registry::{LocalChannel, SessionRegistry};
use crate::store::memory::MemoryStore;
use crate::store::{MessagePatch, MessageStore, Room, StoreError};

fn uid(s: &str) -> UserId {
	s.parse().expect("valid UserId")
}

fn cfg() -> SessionConfig {
	SessionConfig {
		match_accept_timeout: Duration::from_millis(40),
		..SessionConfig::default()
	}
}

fn mk_world() -> (Arc<MemoryStore>, Arc<LocalChannel>) {
	let store = Arc::new(MemoryStore::new());
	let channel = Arc::new(LocalChannel::new(SessionRegistry::new(8)));
	(store, channel)
}

fn mk_session(name: &str, store: &Arc<MemoryStore>, channel: &Arc<LocalChannel>) -> ChatSession {
	ChatSession::new(uid(name), cfg(), store.clone(), channel.clone())
}

/// Persist a message dated `age_secs` seconds in the past.
async fn seed_message(store: &MemoryStore, from: &str, to: &str, text: &str, age_secs: i64) -> Message {
	let (from, to) = (uid(from), uid(to));
	let room = RoomId::for_pair(&from, &to);
	let mut msg = Message::new(room, from, to, text, Some(ClientId::generate()));
	msg.timestamp = msg.timestamp - chrono::Duration::seconds(age_secs);
	store.insert_message(&msg).await.unwrap()
}

fn push_from(sender: &str, content: &str, client_id: Option<ClientId>) -> PushEvent {
	PushEvent::PrivateMessage {
		sender: uid(sender),
		content: content.into(),
		timestamp: None,
		client_id,
	}
}

#[tokio::test]
async fn start_groups_history_most_recent_first() {
	let (store, channel) = mk_world();
	seed_message(&store, "bob", "alice", "old thread", 120).await;
	seed_message(&store, "alice", "bob", "reply", 90).await;
	seed_message(&store, "carol", "alice", "newer thread", 10).await;

	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	let chats = session.chats().await;
	assert_eq!(chats.len(), 2);
	assert_eq!(chats[0].partner, uid("carol"));
	assert_eq!(chats[1].partner, uid("bob"));
	assert_eq!(chats[1].messages.len(), 2);
	assert_eq!(chats[0].unread, 0, "persisted history starts read");

	// The freshest chat is selected automatically.
	assert_eq!(session.active_room().await, Some(RoomId::for_pair(&uid("alice"), &uid("carol"))));
	assert_eq!(session.active_messages().await.len(), 1);
}

#[tokio::test]
async fn start_with_empty_store_yields_no_chats() {
	let (store, channel) = mk_world();
	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	assert!(session.chats().await.is_empty());
	assert!(session.active_room().await.is_none());
}

#[tokio::test]
async fn send_without_active_chat_is_a_no_op() {
	let (store, channel) = mk_world();
	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	assert!(session.send("into the void").await.is_none());
	assert!(store.all_messages().await.is_empty());
}

#[tokio::test]
async fn send_applies_optimistically_and_backfills_store_id() {
	let (store, channel) = mk_world();
	seed_message(&store, "bob", "alice", "hey", 60).await;

	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	let sent = session.send("hi bob").await.unwrap();
	assert!(sent.id.is_some(), "store id is stamped after the insert");
	assert!(sent.client_id.is_some());

	let buffer = session.active_messages().await;
	assert_eq!(buffer.len(), 2);
	assert_eq!(buffer[1].content, "hi bob");
	assert_eq!(buffer[1].id, sent.id, "optimistic copy carries the back-filled id");

	let chats = session.chats().await;
	assert_eq!(chats[0].last_message.as_ref().unwrap().id, sent.id);
	assert_eq!(store.all_messages().await.len(), 2);
}

/// Store wrapper whose writes fail on demand.
struct FlakyStore {
	inner: MemoryStore,
	fail_writes: std::sync::atomic::AtomicBool,
}

impl FlakyStore {
	fn new(inner: MemoryStore) -> Self {
		Self {
			inner,
			fail_writes: std::sync::atomic::AtomicBool::new(false),
		}
	}

	fn fail_writes(&self) {
		self.fail_writes.store(true, std::sync::atomic::Ordering::SeqCst);
	}

	fn writes_failing(&self) -> bool {
		self.fail_writes.load(std::sync::atomic::Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl MessageStore for FlakyStore {
	async fn find_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
		self.inner.find_room(id).await
	}

	async fn create_room(&self, id: &RoomId, a: &UserId, b: &UserId) -> Result<Room, StoreError> {
		self.inner.create_room(id, a, b).await
	}

	async fn insert_message(&self, msg: &Message) -> Result<Message, StoreError> {
		if self.writes_failing() {
			return Err(StoreError::Backend(anyhow::anyhow!("disk on fire")));
		}
		self.inner.insert_message(msg).await
	}

	async fn update_message(&self, id: circle_domain::MessageId, patch: MessagePatch) -> Result<(), StoreError> {
		self.inner.update_message(id, patch).await
	}

	async fn messages_for_user(&self, user: &UserId) -> Result<Vec<Message>, StoreError> {
		self.inner.messages_for_user(user).await
	}

	async fn messages_for_room(&self, room: &RoomId) -> Result<Vec<Message>, StoreError> {
		self.inner.messages_for_room(room).await
	}

	async fn profile_summary(&self, user: &UserId) -> Result<Option<circle_domain::ProfileSummary>, StoreError> {
		self.inner.profile_summary(user).await
	}
}

#[tokio::test]
async fn failed_persistence_keeps_the_optimistic_copy() {
	let channel = Arc::new(LocalChannel::new(SessionRegistry::new(8)));
	let store = Arc::new(FlakyStore::new(MemoryStore::new()));
	seed_message(&store.inner, "bob", "alice", "hey", 60).await;

	let session = ChatSession::new(uid("alice"), cfg(), store.clone(), channel.clone());
	let _rx = session.start().await.unwrap();

	store.fail_writes();
	let sent = session.send("lost to the store, not to the eye").await.unwrap();
	assert!(sent.id.is_none(), "no store id was ever assigned");

	let buffer = session.active_messages().await;
	assert_eq!(buffer.last().unwrap().content, "lost to the store, not to the eye");
	assert_eq!(store.inner.all_messages().await.len(), 1, "only the seed row persisted");
}

#[tokio::test]
async fn incoming_push_creates_chat_with_unread() {
	let (store, channel) = mk_world();
	seed_message(&store, "bob", "alice", "hey", 60).await;

	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	session.handle_push(push_from("carol", "hello stranger", Some(ClientId::generate()))).await;

	let chats = session.chats().await;
	assert_eq!(chats.len(), 2);
	assert_eq!(chats[0].partner, uid("carol"), "new chat lands on top");
	assert_eq!(chats[0].unread, 1);
	assert_eq!(chats[0].profile.display_name, format!("User {}", uid("carol").short_tag()));

	// The active chat stays where it was.
	assert_eq!(session.active_room().await, Some(RoomId::for_pair(&uid("alice"), &uid("bob"))));
}

#[tokio::test]
async fn incoming_push_for_active_chat_lands_in_buffer_read() {
	let (store, channel) = mk_world();
	seed_message(&store, "bob", "alice", "hey", 60).await;

	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	session.handle_push(push_from("bob", "you there?", Some(ClientId::generate()))).await;

	let buffer = session.active_messages().await;
	assert_eq!(buffer.len(), 2);
	assert_eq!(buffer[1].content, "you there?");
	let room = session.active_room().await.unwrap();
	assert_eq!(session.unread_for(&room).await, Some(0));
}

#[tokio::test]
async fn duplicate_push_is_suppressed() {
	let (store, channel) = mk_world();
	seed_message(&store, "bob", "alice", "hey", 60).await;

	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	let key = ClientId::generate();
	session.handle_push(push_from("bob", "once", Some(key.clone()))).await;
	session.handle_push(push_from("bob", "once", Some(key))).await;

	assert_eq!(session.active_messages().await.len(), 2);
}

#[tokio::test]
async fn own_echo_is_ignored() {
	let (store, channel) = mk_world();
	seed_message(&store, "bob", "alice", "hey", 60).await;

	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	session.handle_push(push_from("alice", "echo of my own send", Some(ClientId::generate()))).await;
	assert_eq!(session.active_messages().await.len(), 1);
}

#[tokio::test]
async fn select_switches_buffer_and_clears_unread() {
	let (store, channel) = mk_world();
	seed_message(&store, "bob", "alice", "hey", 60).await;

	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	session.handle_push(push_from("carol", "hello", Some(ClientId::generate()))).await;
	let carol_room = RoomId::for_pair(&uid("alice"), &uid("carol"));
	assert_eq!(session.unread_for(&carol_room).await, Some(1));

	assert!(session.select(&carol_room).await);
	assert_eq!(session.unread_for(&carol_room).await, Some(0));
	assert_eq!(session.active_room().await, Some(carol_room));
	assert_eq!(session.active_messages().await.len(), 1);

	assert!(!session.select(&RoomId::for_pair(&uid("alice"), &uid("nobody"))).await);
}

#[tokio::test]
async fn delete_tombstones_every_local_copy() {
	let (store, channel) = mk_world();
	let seeded = seed_message(&store, "alice", "bob", "regret this", 60).await;

	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	session.delete(seeded.id.unwrap()).await.unwrap();

	let buffer = session.active_messages().await;
	assert_eq!(buffer[0].content, DELETED_MARKER);
	assert!(buffer[0].deleted);

	let chats = session.chats().await;
	let last = chats[0].last_message.as_ref().unwrap();
	assert_eq!(last.content, DELETED_MARKER);
	assert!(last.deleted);

	let persisted = &store.all_messages().await[0];
	assert_eq!(persisted.content, DELETED_MARKER);
	assert!(persisted.deleted);
}

#[tokio::test]
async fn edit_updates_content_and_flags() {
	let (store, channel) = mk_world();
	let seeded = seed_message(&store, "alice", "bob", "typo", 60).await;

	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	session.edit(seeded.id.unwrap(), "fixed").await.unwrap();

	let buffer = session.active_messages().await;
	assert_eq!(buffer[0].content, "fixed");
	assert!(buffer[0].edited);

	// All three holders agree: buffer, chat message list, last_message.
	let chats = session.chats().await;
	assert_eq!(chats[0].messages[0].content, "fixed");
	assert_eq!(chats[0].last_message.as_ref().unwrap().content, "fixed");

	let persisted = &store.all_messages().await[0];
	assert_eq!(persisted.content, "fixed");
	assert!(persisted.edited);
}

#[tokio::test]
async fn reactions_accumulate_without_dedup() {
	let (store, channel) = mk_world();
	let seeded = seed_message(&store, "bob", "alice", "great news", 60).await;

	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	session.react(seeded.id.unwrap(), "🎉").await.unwrap();
	session.react(seeded.id.unwrap(), "🎉").await.unwrap();

	let buffer = session.active_messages().await;
	assert_eq!(buffer[0].reactions.len(), 2);
	assert!(buffer[0].reactions.iter().all(|r| r.emoji == "🎉" && r.user == uid("alice")));

	assert_eq!(store.all_messages().await[0].reactions.len(), 2);
}

#[tokio::test]
async fn react_to_unknown_message_is_ignored() {
	let (store, channel) = mk_world();
	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	session.react(circle_domain::MessageId(999), "👍").await.unwrap();
	assert!(store.all_messages().await.is_empty());
}

#[tokio::test]
async fn messages_flow_between_two_live_sessions() {
	let (store, channel) = mk_world();
	seed_message(&store, "alice", "bob", "start of thread", 60).await;

	let alice = mk_session("alice", &store, &channel);
	let bob = mk_session("bob", &store, &channel);
	let _rx_a = alice.start().await.unwrap();
	let mut rx_b = bob.start().await.unwrap();

	alice.send("ping").await.unwrap();

	let event = rx_b.recv().await.unwrap();
	bob.handle_push(event).await;

	let buffer = bob.active_messages().await;
	assert_eq!(buffer.last().unwrap().content, "ping");
	assert_eq!(buffer.last().unwrap().sender, uid("alice"));

	// Only the sender persists; no double write from the receiving side.
	assert_eq!(store.all_messages().await.len(), 2);
}

#[tokio::test]
async fn accepted_match_connects_after_the_wait() {
	let (store, channel) = mk_world();
	let session = mk_session("alice", &store, &channel);
	let mut rx = session.start().await.unwrap();

	session.start_match().await;
	// Drain the waiting echo if the broker produced one.
	while let Ok(event) = rx.try_recv() {
		session.handle_push(event).await;
	}

	session
		.handle_push(PushEvent::MatchStatusChanged {
			status: MatchStatus::Pending,
			room: Some(RoomId::for_pair(&uid("alice"), &uid("bob"))),
			matched_user: Some(MatchCandidate {
				user: uid("bob"),
				profile: None,
			}),
		})
		.await;

	session.accept_match().await;
	assert_eq!(session.match_snapshot().await.status, Some(MatchStatus::Pending));

	// No peer confirmation arrives; the bounded wait resolves it.
	tokio::time::sleep(Duration::from_millis(150)).await;

	let room = RoomId::for_pair(&uid("alice"), &uid("bob"));
	assert_eq!(session.active_room().await, Some(room.clone()));

	let chats = session.chats().await;
	assert_eq!(chats[0].partner, uid("bob"));
	assert_eq!(chats[0].unread, 1, "the connect notice stays unread until selected");
	assert_eq!(chats[0].messages.len(), 1);
	assert_eq!(chats[0].messages[0].content, CONNECTED_MESSAGE);
	assert!(chats[0].messages[0].sender.is_system());

	// The engine is spent; nothing connects twice.
	assert_eq!(session.match_snapshot().await.status, None);
}

#[tokio::test]
async fn peer_rejection_restarts_the_search() {
	let (store, channel) = mk_world();
	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();

	session.start_match().await;
	session
		.handle_push(PushEvent::MatchStatusChanged {
			status: MatchStatus::Pending,
			room: Some(RoomId::for_pair(&uid("alice"), &uid("bob"))),
			matched_user: Some(MatchCandidate {
				user: uid("bob"),
				profile: None,
			}),
		})
		.await;

	session.reject_match().await;

	let snap = session.match_snapshot().await;
	assert_eq!(snap.status, Some(MatchStatus::Waiting));
	assert!(snap.matched.is_none());
	assert!(session.chats().await.is_empty(), "no chat materializes from a rejection");
}

#[tokio::test]
async fn subscribers_hear_about_new_messages() {
	let (store, channel) = mk_world();
	seed_message(&store, "bob", "alice", "hey", 60).await;

	let session = mk_session("alice", &store, &channel);
	let _rx = session.start().await.unwrap();
	let mut updates = session.subscribe().await;

	session.handle_push(push_from("bob", "fresh", Some(ClientId::generate()))).await;

	let mut seen = Vec::new();
	while let Ok(update) = updates.try_recv() {
		seen.push(update);
	}
	assert!(seen.contains(&SessionUpdate::ChatListChanged));
	assert!(seen.contains(&SessionUpdate::ActiveChatChanged));
}

#[tokio::test]
async fn pump_drains_events_into_the_session() {
	let (store, channel) = mk_world();
	seed_message(&store, "alice", "bob", "start", 60).await;

	let alice = mk_session("alice", &store, &channel);
	let bob = mk_session("bob", &store, &channel);
	let _rx_a = alice.start().await.unwrap();
	let rx_b = bob.start().await.unwrap();
	let pump = spawn_pump(bob.clone(), rx_b);

	alice.send("over the pump").await.unwrap();

	// Give the pump task a moment to drain.
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(bob.active_messages().await.last().unwrap().content, "over the pump");

	drop(alice);
	channel.disconnect(&uid("bob")).await;
	let _ = tokio::time::timeout(Duration::from_millis(200), pump).await;
}
